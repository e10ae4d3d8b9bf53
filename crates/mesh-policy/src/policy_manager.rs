//! The in-memory policy registry and its per-policy agreement slot accounting.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::error::PolicyError;
use crate::metrics::{self, SlotTransition};
use crate::policy::{self, Policy};
use crate::policy_file::PolicyFileError;
use crate::watcher::{PolicyEventHandler, PolicyWatcher, WatcherHandle};

/// Errors for registry and accounting operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManagerError {
    #[error("Policy has no name")]
    MissingName,

    #[error("Policy {0} is already registered")]
    DuplicatePolicy(String),

    #[error("Policy {0} is not known")]
    UnknownPolicy(String),

    #[error("Contract id is empty")]
    EmptyContractId,

    #[error("Contract {contract} is already tracked for policy {policy}")]
    DuplicateContract { policy: String, contract: String },

    #[error("Contract {contract} is not tracked for policy {policy}")]
    UnknownContract { policy: String, contract: String },

    #[error("Contract {contract} for policy {policy} is not pending")]
    NotPending { policy: String, contract: String },

    #[error("Policy {policy} has reached its maximum of {max} agreements")]
    MaxAgreementsReached { policy: String, max: u32 },

    #[error("Unable to load policies: {0}")]
    Load(String),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

/// Where a counterparty contract stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgreementStatus {
    Pending,
    Final,
}

/// Agreement slots in use by one policy
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContractCountEntry {
    /// Number of tracked contracts
    pub count: usize,

    /// Status per counterparty contract id
    pub contracts: HashMap<String, AgreementStatus>,
}

/// Owns the loaded policies and their agreement counts.
///
/// The policy list and the count map have independent locks and no operation holds both.
#[derive(Default)]
pub struct PolicyManager {
    policies: Mutex<Vec<Policy>>,
    counts: Mutex<HashMap<String, ContractCountEntry>>,
    watcher: Mutex<Option<WatcherHandle>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>, ManagerError> {
    mutex.lock().map_err(|_| ManagerError::LockPoisoned(what))
}

/// Collects the result of the startup scan
#[derive(Default)]
struct InitialLoad {
    found: Mutex<Vec<Policy>>,
    duplicates: Mutex<Vec<String>>,
}

impl PolicyEventHandler for InitialLoad {
    fn policy_changed(&self, file: &Path, policy: &Policy) {
        info!("Loading policy {} from {}", policy.header.name, file.display());
        if let Ok(mut found) = self.found.lock() {
            found.push(policy.clone());
        }
    }

    fn policy_deleted(&self, file: &Path, policy: &Policy) {
        debug!("Policy {} in {} went away during startup", policy.header.name, file.display());
        if let Ok(mut found) = self.found.lock() {
            found.retain(|p| p.header.name != policy.header.name);
        }
    }

    fn policy_error(&self, file: &Path, error: &PolicyFileError) {
        match error {
            PolicyFileError::DuplicateName { name, .. } => {
                if let Ok(mut duplicates) = self.duplicates.lock() {
                    duplicates.push(name.clone());
                }
            }
            _ => warn!("Skipping policy file {}: {}", file.display(), error),
        }
    }
}

impl PolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every policy in `dir` with one synchronous pass
    pub fn initialize(dir: &Path) -> Result<Self, ManagerError> {
        Self::initialize_from(&mut PolicyWatcher::new(dir))
    }

    /// Load policies with one pass of `watcher`, which can later be spawned for continuous mode.
    ///
    /// Two files declaring the same policy name fail the whole load; other bad files are skipped.
    pub fn initialize_from(watcher: &mut PolicyWatcher) -> Result<Self, ManagerError> {
        let load = InitialLoad::default();
        watcher
            .scan_once(&load)
            .map_err(|e| ManagerError::Load(e.to_string()))?;

        let duplicates = load.duplicates.into_inner().map_err(|_| ManagerError::LockPoisoned("startup"))?;
        if let Some(name) = duplicates.into_iter().next() {
            return Err(ManagerError::DuplicatePolicy(name));
        }

        let mut found = load.found.into_inner().map_err(|_| ManagerError::LockPoisoned("startup"))?;
        found.sort_by(|a, b| a.header.name.cmp(&b.header.name));

        let manager = Self::new();
        for policy in found {
            manager.add_policy(policy)?;
        }
        info!("Policy manager initialized with {} policies", manager.number_policies());
        Ok(manager)
    }

    /// Register a policy and give it an empty agreement count
    pub fn add_policy(&self, policy: Policy) -> Result<(), ManagerError> {
        if policy.header.name.is_empty() {
            return Err(ManagerError::MissingName);
        }
        let name = policy.header.name.clone();

        // Counts are only touched under the policy lock so a registered policy always has an entry
        let mut policies = lock(&self.policies, "policy")?;
        if policies.iter().any(|p| p.header.name == name) {
            return Err(ManagerError::DuplicatePolicy(name));
        }
        lock(&self.counts, "count")?.entry(name.clone()).or_default();
        policies.push(policy);
        debug!("Added policy {}", name);
        Ok(())
    }

    /// Replace a registered policy of the same name, keeping its agreement count
    pub fn update_policy(&self, policy: Policy) -> Result<(), ManagerError> {
        let mut policies = lock(&self.policies, "policy")?;
        let existing = policies
            .iter_mut()
            .find(|p| p.header.name == policy.header.name)
            .ok_or_else(|| ManagerError::UnknownPolicy(policy.header.name.clone()))?;
        debug!("Updated policy {}", policy.header.name);
        *existing = policy;
        Ok(())
    }

    /// Unregister a policy, dropping its agreement count
    pub fn delete_policy(&self, name: &str) -> Result<Policy, ManagerError> {
        let mut policies = lock(&self.policies, "policy")?;
        let index = policies
            .iter()
            .position(|p| p.header.name == name)
            .ok_or_else(|| ManagerError::UnknownPolicy(name.to_string()))?;
        lock(&self.counts, "count")?.remove(name);
        let removed = policies.remove(index);
        debug!("Deleted policy {}", name);
        Ok(removed)
    }

    /// Copy of the named policy
    pub fn get_policy(&self, name: &str) -> Option<Policy> {
        lock(&self.policies, "policy")
            .ok()?
            .iter()
            .find(|p| p.header.name == name)
            .cloned()
    }

    pub fn get_all_policies(&self) -> Vec<Policy> {
        lock(&self.policies, "policy").map(|p| p.clone()).unwrap_or_default()
    }

    pub fn number_policies(&self) -> usize {
        lock(&self.policies, "policy").map(|p| p.len()).unwrap_or(0)
    }

    /// Policies that can still take another agreement
    pub fn get_all_available_policies(&self) -> Vec<Policy> {
        let policies = self.get_all_policies();
        policies
            .into_iter()
            .filter(|p| !self.reached_max_agreements(p).unwrap_or(true))
            .collect()
    }

    /// Merge every registered policy into one producer policy, starting from `previously_merged`
    pub fn merge_all_producers(&self, previously_merged: Option<&Policy>) -> Result<Policy, ManagerError> {
        let mut policies: Vec<Policy> = previously_merged.into_iter().cloned().collect();
        policies.extend(self.get_all_policies());
        Ok(policy::merge_all_producers(&policies)?)
    }

    /// Snapshot of the agreement counts
    pub fn get_counts(&self) -> Result<HashMap<String, ContractCountEntry>, ManagerError> {
        Ok(lock(&self.counts, "count")?.clone())
    }

    /// Record an agreement attempt with `contract_id` under `policy`
    pub fn attempting_agreement(&self, policy: &Policy, contract_id: &str) -> Result<(), ManagerError> {
        if contract_id.is_empty() {
            return Err(ManagerError::EmptyContractId);
        }
        let name = &policy.header.name;

        let mut counts = lock(&self.counts, "count")?;
        let entry = counts
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownPolicy(name.clone()))?;

        if entry.contracts.contains_key(contract_id) {
            return Err(ManagerError::DuplicateContract {
                policy: name.clone(),
                contract: contract_id.to_string(),
            });
        }
        if policy.max_agreements != 0 && entry.count >= policy.max_agreements as usize {
            return Err(ManagerError::MaxAgreementsReached {
                policy: name.clone(),
                max: policy.max_agreements,
            });
        }

        entry.contracts.insert(contract_id.to_string(), AgreementStatus::Pending);
        entry.count = entry.contracts.len();
        debug!("Policy {} now has {} agreements, added {}", name, entry.count, contract_id);
        metrics::record_slot_transition(SlotTransition::Attempt);
        Ok(())
    }

    /// Mark a pending contract as final
    pub fn final_agreement(&self, policy: &Policy, contract_id: &str) -> Result<(), ManagerError> {
        let name = &policy.header.name;
        let mut counts = lock(&self.counts, "count")?;
        let entry = counts
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownPolicy(name.clone()))?;

        match entry.contracts.get_mut(contract_id) {
            Some(status) if *status == AgreementStatus::Pending => *status = AgreementStatus::Final,
            Some(_) => {
                return Err(ManagerError::NotPending {
                    policy: name.clone(),
                    contract: contract_id.to_string(),
                })
            }
            None => {
                return Err(ManagerError::UnknownContract {
                    policy: name.clone(),
                    contract: contract_id.to_string(),
                })
            }
        }

        debug!("Agreement {} under policy {} is final", contract_id, name);
        metrics::record_slot_transition(SlotTransition::Final);
        Ok(())
    }

    /// Stop tracking a contract, freeing its slot
    pub fn cancel_agreement(&self, policy: &Policy, contract_id: &str) -> Result<(), ManagerError> {
        let name = &policy.header.name;
        let mut counts = lock(&self.counts, "count")?;
        let entry = counts
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownPolicy(name.clone()))?;

        if entry.contracts.remove(contract_id).is_none() {
            return Err(ManagerError::UnknownContract {
                policy: name.clone(),
                contract: contract_id.to_string(),
            });
        }
        entry.count = entry.contracts.len();

        debug!("Policy {} now has {} agreements, cancelled {}", name, entry.count, contract_id);
        metrics::record_slot_transition(SlotTransition::Cancel);
        Ok(())
    }

    /// Whether `policy` has used all its agreement slots. Never true for an unlimited policy.
    pub fn reached_max_agreements(&self, policy: &Policy) -> Result<bool, ManagerError> {
        let name = &policy.header.name;
        let counts = lock(&self.counts, "count")?;
        let entry = counts
            .get(name)
            .ok_or_else(|| ManagerError::UnknownPolicy(name.clone()))?;
        Ok(policy.max_agreements != 0 && entry.count >= policy.max_agreements as usize)
    }

    /// Keep a continuously running watcher for shutdown. A previously attached one is returned.
    pub fn attach_watcher(&self, handle: WatcherHandle) -> Result<Option<WatcherHandle>, ManagerError> {
        Ok(lock(&self.watcher, "watcher")?.replace(handle))
    }

    /// Stop the attached watcher, if any
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let handle = lock(&self.watcher, "watcher")?.take();
        if let Some(handle) = handle {
            handle
                .stop()
                .await
                .map_err(|e| ManagerError::Load(format!("policy watcher did not stop cleanly: {}", e)))?;
        }
        Ok(())
    }
}

/// Keeps the registry in step with a continuously running watcher
impl PolicyEventHandler for PolicyManager {
    fn policy_changed(&self, file: &Path, policy: &Policy) {
        let result = if self.get_policy(&policy.header.name).is_some() {
            self.update_policy(policy.clone())
        } else {
            self.add_policy(policy.clone())
        };
        match result {
            Ok(()) => info!("Policy {} from {} is active", policy.header.name, file.display()),
            Err(e) => warn!("Unable to apply policy file {}: {}", file.display(), e),
        }
    }

    fn policy_deleted(&self, file: &Path, policy: &Policy) {
        match self.delete_policy(&policy.header.name) {
            Ok(_) => info!("Policy {} removed with {}", policy.header.name, file.display()),
            Err(e) => warn!("Unable to remove policy of {}: {}", file.display(), e),
        }
    }

    fn policy_error(&self, file: &Path, error: &PolicyFileError) {
        warn!("Policy file {} not loaded: {}", file.display(), error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy_file::{create_policy_file, write_policy_file};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn create_test_policy(name: &str, max_agreements: u32) -> Policy {
        let mut policy = Policy::new(name);
        policy.max_agreements = max_agreements;
        policy
    }

    fn create_test_manager(policies: &[Policy]) -> PolicyManager {
        let manager = PolicyManager::new();
        for policy in policies {
            manager.add_policy(policy.clone()).unwrap();
        }
        manager
    }

    #[test]
    fn test_slot_accounting() {
        let policy = create_test_policy("gps", 3);
        let manager = create_test_manager(&[policy.clone()]);

        for contract in ["c1", "c2", "c3"] {
            manager.attempting_agreement(&policy, contract).unwrap();
        }
        assert!(manager.reached_max_agreements(&policy).unwrap());
        assert!(matches!(
            manager.attempting_agreement(&policy, "c4"),
            Err(ManagerError::MaxAgreementsReached { max: 3, .. })
        ));

        manager.final_agreement(&policy, "c1").unwrap();
        assert!(matches!(manager.final_agreement(&policy, "c1"), Err(ManagerError::NotPending { .. })));

        manager.cancel_agreement(&policy, "c2").unwrap();
        assert!(!manager.reached_max_agreements(&policy).unwrap());
        manager.attempting_agreement(&policy, "c4").unwrap();

        let counts = manager.get_counts().unwrap();
        let entry = &counts["gps"];
        assert_eq!(entry.count, 3);
        assert_eq!(entry.contracts["c1"], AgreementStatus::Final);
        assert_eq!(entry.contracts["c4"], AgreementStatus::Pending);
    }

    #[test]
    fn test_accounting_errors_leave_state_alone() {
        let policy = create_test_policy("gps", 0);
        let manager = create_test_manager(&[policy.clone()]);

        assert_eq!(manager.attempting_agreement(&policy, ""), Err(ManagerError::EmptyContractId));
        assert!(matches!(
            manager.attempting_agreement(&create_test_policy("unknown", 0), "c1"),
            Err(ManagerError::UnknownPolicy(_))
        ));

        manager.attempting_agreement(&policy, "c1").unwrap();
        assert!(matches!(
            manager.attempting_agreement(&policy, "c1"),
            Err(ManagerError::DuplicateContract { .. })
        ));
        assert!(matches!(manager.final_agreement(&policy, "c9"), Err(ManagerError::UnknownContract { .. })));
        assert!(matches!(manager.cancel_agreement(&policy, "c9"), Err(ManagerError::UnknownContract { .. })));

        assert_eq!(manager.get_counts().unwrap()["gps"].count, 1);
        assert!(!manager.reached_max_agreements(&policy).unwrap());
    }

    #[test]
    fn test_concurrent_attempts_respect_max() {
        let policy = create_test_policy("gps", 3);
        let manager = Arc::new(create_test_manager(&[policy.clone()]));

        let successes: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let manager = manager.clone();
                    let policy = policy.clone();
                    scope.spawn(move || manager.attempting_agreement(&policy, &format!("c{}", i)).is_ok())
                })
                .collect();
            handles.into_iter().map(|h| usize::from(h.join().unwrap())).sum()
        });

        assert_eq!(successes, 3);
        assert_eq!(manager.get_counts().unwrap()["gps"].count, 3);
    }

    #[test]
    fn test_registry_operations() {
        let manager = create_test_manager(&[create_test_policy("gps", 1), create_test_policy("cpu", 0)]);
        assert_eq!(manager.number_policies(), 2);
        assert!(matches!(
            manager.add_policy(create_test_policy("gps", 5)),
            Err(ManagerError::DuplicatePolicy(_))
        ));
        assert_eq!(manager.add_policy(Policy::default()), Err(ManagerError::MissingName));

        manager.update_policy(create_test_policy("gps", 5)).unwrap();
        assert_eq!(manager.get_policy("gps").unwrap().max_agreements, 5);
        assert!(manager.update_policy(create_test_policy("other", 1)).is_err());

        let gps = manager.get_policy("gps").unwrap();
        for i in 0..5 {
            manager.attempting_agreement(&gps, &format!("c{}", i)).unwrap();
        }
        let available = manager.get_all_available_policies();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].header.name, "cpu");

        manager.delete_policy("gps").unwrap();
        assert!(manager.get_policy("gps").is_none());
        assert!(!manager.get_counts().unwrap().contains_key("gps"));
        assert!(manager.delete_policy("gps").is_err());
    }

    #[test]
    fn test_merge_all_registered_producers() {
        let manager = create_test_manager(&[create_test_policy("gps", 0), create_test_policy("cpu", 0)]);
        let merged = manager.merge_all_producers(None).unwrap();
        assert_eq!(merged.header.name, "gps merged with cpu");

        let base = create_test_policy("base", 0);
        let merged = manager.merge_all_producers(Some(&base)).unwrap();
        assert_eq!(merged.header.name, "base merged with gps merged with cpu");

        assert!(matches!(
            PolicyManager::new().merge_all_producers(None),
            Err(ManagerError::Policy(PolicyError::NothingToMerge))
        ));
    }

    #[test]
    fn test_initialize_from_directory() {
        let dir = tempdir().unwrap();
        create_policy_file(dir.path(), &create_test_policy("gps", 2)).unwrap();
        create_policy_file(dir.path(), &create_test_policy("cpu", 0)).unwrap();
        std::fs::write(dir.path().join("broken.policy"), "{").unwrap();

        let manager = PolicyManager::initialize(dir.path()).unwrap();
        assert_eq!(manager.number_policies(), 2);
        assert_eq!(manager.get_counts().unwrap().len(), 2);
    }

    #[test]
    fn test_initialize_rejects_duplicate_names() {
        let dir = tempdir().unwrap();
        write_policy_file(&dir.path().join("a.policy"), &create_test_policy("gps", 2)).unwrap();
        write_policy_file(&dir.path().join("b.policy"), &create_test_policy("gps", 3)).unwrap();

        assert!(matches!(
            PolicyManager::initialize(dir.path()),
            Err(ManagerError::DuplicatePolicy(name)) if name == "gps"
        ));
        assert!(PolicyManager::initialize(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_registry_follows_moved_and_renamed_files() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("a.policy");
        write_policy_file(&original, &create_test_policy("gps", 1)).unwrap();

        let mut watcher = PolicyWatcher::new(dir.path());
        let manager = PolicyManager::initialize_from(&mut watcher).unwrap();
        let gps = manager.get_policy("gps").unwrap();
        manager.attempting_agreement(&gps, "c1").unwrap();

        // Moving the file keeps the policy and its agreements
        let moved = dir.path().join("c.policy");
        std::fs::rename(&original, &moved).unwrap();
        watcher.scan_once(&manager).unwrap();
        assert_eq!(manager.get_counts().unwrap()["gps"].count, 1);

        // A file that lost the name takes over when the holder goes away
        write_policy_file(&dir.path().join("b.policy"), &create_test_policy("gps", 9)).unwrap();
        watcher.scan_once(&manager).unwrap();
        assert_eq!(manager.get_policy("gps").unwrap().max_agreements, 1);
        std::fs::remove_file(&moved).unwrap();
        watcher.scan_once(&manager).unwrap();
        assert_eq!(manager.get_policy("gps").unwrap().max_agreements, 9);

        // Renaming the policy inside its file leaves no entry behind
        write_policy_file(&dir.path().join("b.policy"), &create_test_policy("gps-v2", 9)).unwrap();
        watcher.scan_once(&manager).unwrap();
        let names: Vec<String> = manager.get_all_policies().into_iter().map(|p| p.header.name).collect();
        assert_eq!(names, vec!["gps-v2".to_string()]);
        let counts = manager.get_counts().unwrap();
        assert_eq!(counts.keys().collect::<Vec<_>>(), vec!["gps-v2"]);
    }

    #[test]
    fn test_add_and_delete_keep_counts_in_step() {
        let manager = PolicyManager::new();
        let policy = create_test_policy("gps", 0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        let _ = manager.add_policy(policy.clone());
                        let _ = manager.delete_policy("gps");
                    }
                });
            }
        });

        let _ = manager.add_policy(policy.clone());
        assert_eq!(manager.number_policies(), 1);
        manager.attempting_agreement(&policy, "c1").unwrap();
        assert_eq!(manager.get_counts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watcher_keeps_registry_current() {
        let dir = tempdir().unwrap();
        create_policy_file(dir.path(), &create_test_policy("gps", 1)).unwrap();

        let mut watcher = PolicyWatcher::new(dir.path());
        let manager = Arc::new(PolicyManager::initialize_from(&mut watcher).unwrap());
        let handle = watcher.spawn(Duration::from_millis(20), manager.clone());
        assert!(manager.attach_watcher(handle).unwrap().is_none());

        let cpu = create_policy_file(dir.path(), &create_test_policy("cpu", 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.number_policies(), 2);

        std::fs::remove_file(&cpu).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.number_policies(), 1);

        manager.shutdown().await.unwrap();
    }
}

//! Policy file discovery.
//!
//! [`PolicyWatcher::scan_once`] makes one synchronous pass over a directory. [`PolicyWatcher::spawn`]
//! repeats that pass on a timer in a tokio task until the returned [`WatcherHandle`] is stopped.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::policy::Policy;
use crate::policy_file::{list_policy_files, read_policy_file, PolicyFileError};
use crate::workload::SignatureVerifier;

/// Shortest interval accepted by [`PolicyWatcher::spawn`]
pub const MIN_WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Receives discovery events
pub trait PolicyEventHandler: Send + Sync {
    /// A policy file was added or modified
    fn policy_changed(&self, file: &Path, policy: &Policy);

    /// A previously reported policy file disappeared
    fn policy_deleted(&self, file: &Path, policy: &Policy);

    /// A policy file could not be loaded
    fn policy_error(&self, file: &Path, error: &PolicyFileError);
}

/// What a single pass found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub changed: usize,
    pub deleted: usize,
    pub errors: usize,
}

/// File fingerprint used to notice modifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Self, PolicyFileError> {
        let metadata = fs::metadata(path).map_err(|e| PolicyFileError::Io(path.to_path_buf(), e))?;
        let modified = metadata
            .modified()
            .map_err(|e| PolicyFileError::Io(path.to_path_buf(), e))?;
        Ok(Self {
            modified,
            len: metadata.len(),
        })
    }
}

struct TrackedFile {
    stamp: FileStamp,
    policy: Policy,
}

struct FailedFile {
    stamp: FileStamp,

    /// Policy name already held by another file, when that was the reason
    conflict: Option<String>,
}

/// Tracks the policy files of one directory
pub struct PolicyWatcher {
    directory: PathBuf,

    /// Verifier and key path for workload signature checks
    signatures: Option<(Arc<dyn SignatureVerifier>, PathBuf)>,

    /// Successfully loaded files
    tracked: HashMap<PathBuf, TrackedFile>,

    /// Files that failed to load, so an unchanged bad file is reported once
    failed: HashMap<PathBuf, FailedFile>,
}

impl PolicyWatcher {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            signatures: None,
            tracked: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    /// Verify workload signatures of every loaded policy against the keys at `key_path`
    pub fn with_signature_check(mut self, verifier: Arc<dyn SignatureVerifier>, key_path: impl Into<PathBuf>) -> Self {
        self.signatures = Some((verifier, key_path.into()));
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Policies currently tracked, keyed by file
    pub fn policies(&self) -> impl Iterator<Item = (&Path, &Policy)> {
        self.tracked.iter().map(|(path, file)| (path.as_path(), &file.policy))
    }

    /// One discovery pass. Fails only when the directory itself cannot be listed.
    ///
    /// Vanished files stop holding their names before anything loads. Their deletion is reported
    /// after the pass, and only when no other file now holds the same policy name, so a renamed
    /// file shows up as a single change. A file rejected for reusing another file's policy name is
    /// retried once that name is free.
    pub fn scan_once(&mut self, handler: &dyn PolicyEventHandler) -> Result<ScanSummary, PolicyFileError> {
        let files = list_policy_files(&self.directory)?;
        let mut summary = ScanSummary::default();

        let gone: Vec<PathBuf> = self.tracked.keys().filter(|path| !files.contains(path)).cloned().collect();
        let vanished: Vec<(PathBuf, TrackedFile)> = gone
            .into_iter()
            .filter_map(|path| self.tracked.remove(&path).map(|tracked| (path, tracked)))
            .collect();
        self.failed.retain(|path, _| files.contains(path));

        for file in &files {
            let stamp = match FileStamp::of(file) {
                Ok(stamp) => stamp,
                Err(e) => {
                    summary.errors += 1;
                    handler.policy_error(file, &e);
                    continue;
                }
            };

            if self.tracked.get(file).map_or(false, |t| t.stamp == stamp) {
                continue;
            }
            if let Some(failed) = self.failed.get(file) {
                if failed.stamp == stamp && !self.conflict_cleared(failed) {
                    continue;
                }
            }

            match self.load(file) {
                Ok(policy) => {
                    self.failed.remove(file);
                    if let Some(previous) = self.tracked.remove(file) {
                        if previous.policy.header.name != policy.header.name {
                            info!(
                                "Policy file {} now holds {} instead of {}",
                                file.display(),
                                policy.header.name,
                                previous.policy.header.name
                            );
                            handler.policy_deleted(file, &previous.policy);
                            summary.deleted += 1;
                        }
                    }
                    debug!("Found policy {} in {}", policy.header.name, file.display());
                    handler.policy_changed(file, &policy);
                    self.tracked.insert(file.clone(), TrackedFile { stamp, policy });
                    summary.changed += 1;
                }
                Err(e) => {
                    warn!("Unable to load policy file {}: {}", file.display(), e);
                    let conflict = match &e {
                        PolicyFileError::DuplicateName { name, .. } => Some(name.clone()),
                        _ => None,
                    };
                    self.failed.insert(file.clone(), FailedFile { stamp, conflict });
                    // A modified file that no longer loads is no longer tracked
                    if let Some(previous) = self.tracked.remove(file) {
                        handler.policy_deleted(file, &previous.policy);
                        summary.deleted += 1;
                    }
                    handler.policy_error(file, &e);
                    summary.errors += 1;
                }
            }
        }

        for (path, previous) in vanished {
            let name = &previous.policy.header.name;
            if let Some((moved_to, _)) = self.tracked.iter().find(|(_, t)| t.policy.header.name == *name) {
                info!("Policy {} moved from {} to {}", name, path.display(), moved_to.display());
                continue;
            }
            info!("Policy file {} was deleted", path.display());
            handler.policy_deleted(&path, &previous.policy);
            summary.deleted += 1;
        }

        Ok(summary)
    }

    /// Whether the name a failed file lost to is no longer held by any tracked file
    fn conflict_cleared(&self, failed: &FailedFile) -> bool {
        failed
            .conflict
            .as_ref()
            .map_or(false, |name| !self.tracked.values().any(|t| t.policy.header.name == *name))
    }

    fn load(&self, file: &Path) -> Result<Policy, PolicyFileError> {
        let policy = read_policy_file(file)?;
        if policy.header.name.is_empty() {
            return Err(PolicyFileError::MissingName);
        }

        let signatures = self
            .signatures
            .as_ref()
            .map(|(verifier, key_path)| (verifier.as_ref(), key_path.as_path()));
        policy
            .is_self_consistent(signatures)
            .map_err(|e| PolicyFileError::Invalid(file.to_path_buf(), e))?;

        let existing = self
            .tracked
            .iter()
            .find(|(path, tracked)| path.as_path() != file && tracked.policy.header.name == policy.header.name);
        if let Some((existing, _)) = existing {
            return Err(PolicyFileError::DuplicateName {
                name: policy.header.name,
                file: file.to_path_buf(),
                existing: existing.clone(),
            });
        }
        Ok(policy)
    }

    /// Rescan on every `interval` tick in a background task until the handle is stopped.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(mut self, interval: Duration, handler: Arc<dyn PolicyEventHandler>) -> WatcherHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let period = interval.max(MIN_WATCH_INTERVAL);

        let task = tokio::spawn(async move {
            info!("Watching {} for policy changes every {:?}", self.directory.display(), period);
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan_once(handler.as_ref()) {
                            warn!("Policy scan of {} failed: {}", self.directory.display(), e);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Stopped watching {}", self.directory.display());
            self
        });

        WatcherHandle { stop: stop_tx, task }
    }
}

/// Controls a watcher started with [`PolicyWatcher::spawn`]
pub struct WatcherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<PolicyWatcher>,
}

impl WatcherHandle {
    /// Signal the task to stop and wait for it, getting the watcher and its state back
    pub async fn stop(self) -> Result<PolicyWatcher, JoinError> {
        // The task may already be gone, in which case the join below reports why
        let _ = self.stop.send(true);
        self.task.await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

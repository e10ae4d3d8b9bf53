// Integration test for agreement slot accounting on policies loaded from a directory.

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tempfile::tempdir;

use mesh_policy::policy_file::create_policy_file;
use mesh_policy::{AgreementStatus, ManagerError, Policy, PolicyManager};

fn create_test_policy(name: &str, max_agreements: u32) -> Policy {
    let mut policy = Policy::new(name);
    policy.max_agreements = max_agreements;
    policy
}

fn create_test_manager(policies: &[Policy]) -> Result<(tempfile::TempDir, PolicyManager)> {
    let dir = tempdir()?;
    for policy in policies {
        create_policy_file(dir.path(), policy)?;
    }
    let manager = PolicyManager::initialize(dir.path())?;
    Ok((dir, manager))
}

#[test]
fn test_agreement_lifecycle() -> Result<()> {
    let (_dir, manager) = create_test_manager(&[create_test_policy("gps", 3), create_test_policy("cpu", 0)])?;
    assert_eq!(manager.number_policies(), 2);

    let gps = manager.get_policy("gps").expect("gps is loaded");
    for contract in ["c1", "c2", "c3"] {
        manager.attempting_agreement(&gps, contract)?;
    }
    assert!(manager.reached_max_agreements(&gps)?);
    assert_eq!(
        manager.attempting_agreement(&gps, "c4"),
        Err(ManagerError::MaxAgreementsReached {
            policy: "gps".to_string(),
            max: 3
        })
    );

    let available: Vec<String> = manager
        .get_all_available_policies()
        .into_iter()
        .map(|p| p.header.name)
        .collect();
    assert_eq!(available, vec!["cpu".to_string()]);

    manager.final_agreement(&gps, "c1")?;
    assert!(matches!(
        manager.final_agreement(&gps, "c1"),
        Err(ManagerError::NotPending { .. })
    ));

    manager.cancel_agreement(&gps, "c2")?;
    assert!(!manager.reached_max_agreements(&gps)?);
    manager.attempting_agreement(&gps, "c4")?;

    let counts = manager.get_counts()?;
    let entry = &counts["gps"];
    assert_eq!(entry.count, 3);
    assert_eq!(entry.contracts["c1"], AgreementStatus::Final);
    assert_eq!(entry.contracts["c3"], AgreementStatus::Pending);
    assert!(!entry.contracts.contains_key("c2"));
    assert_eq!(counts["cpu"].count, 0);

    Ok(())
}

#[test]
fn test_deleted_policy_drops_counts() -> Result<()> {
    let (_dir, manager) = create_test_manager(&[create_test_policy("gps", 2)])?;
    let gps = manager.get_policy("gps").expect("gps is loaded");
    manager.attempting_agreement(&gps, "c1")?;

    manager.delete_policy("gps")?;
    assert!(manager.get_counts()?.is_empty());
    assert!(matches!(
        manager.attempting_agreement(&gps, "c2"),
        Err(ManagerError::UnknownPolicy(_))
    ));

    manager.add_policy(gps.clone())?;
    assert_eq!(manager.get_counts()?["gps"].count, 0);
    Ok(())
}

#[test]
fn test_concurrent_attempts_respect_limit() -> Result<()> {
    let (_dir, manager) = create_test_manager(&[create_test_policy("gps", 5)])?;
    let manager = Arc::new(manager);
    let gps = manager.get_policy("gps").expect("gps is loaded");

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let manager = manager.clone();
            let gps = gps.clone();
            thread::spawn(move || manager.attempting_agreement(&gps, &format!("contract-{}", i)).is_ok())
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        if handle.join().expect("worker thread panicked") {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 5);
    assert_eq!(manager.get_counts()?["gps"].count, 5);
    Ok(())
}

#[test]
fn test_merge_registered_producers() -> Result<()> {
    let (_dir, manager) = create_test_manager(&[create_test_policy("a", 4), create_test_policy("b", 2)])?;

    let merged = manager.merge_all_producers(None)?;
    assert_eq!(merged.header.name, "a merged with b");
    assert_eq!(merged.max_agreements, 2);

    let previous = create_test_policy("z", 0);
    let merged = manager.merge_all_producers(Some(&previous))?;
    assert_eq!(merged.header.name, "z merged with a merged with b");

    let empty = PolicyManager::new();
    assert!(matches!(empty.merge_all_producers(None), Err(ManagerError::Policy(_))));
    Ok(())
}

// Integration test for continuous policy discovery feeding a running policy manager.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tempfile::tempdir;

use mesh_policy::policy_file::{create_policy_file, policy_file_name};
use mesh_policy::{write_policy_file, Policy, PolicyManager, PolicyWatcher};

const SCAN_INTERVAL: Duration = Duration::from_millis(20);

fn create_test_policy(name: &str, max_agreements: u32) -> Policy {
    let mut policy = Policy::new(name);
    policy.max_agreements = max_agreements;
    policy
}

/// Poll until `condition` holds or a few seconds have passed
async fn wait_for(what: &str, condition: impl Fn() -> bool) -> Result<()> {
    for _ in 0..250 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(SCAN_INTERVAL).await;
    }
    bail!("timed out waiting for {}", what)
}

#[tokio::test]
async fn test_manager_follows_directory() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir()?;
    create_policy_file(dir.path(), &create_test_policy("gps", 1))?;

    let mut watcher = PolicyWatcher::new(dir.path());
    let manager = Arc::new(PolicyManager::initialize_from(&mut watcher)?);
    assert_eq!(manager.number_policies(), 1);

    let handle = watcher.spawn(SCAN_INTERVAL, manager.clone());
    assert!(manager.attach_watcher(handle)?.is_none());

    // New file
    let cpu_file = create_policy_file(dir.path(), &create_test_policy("cpu", 2))?;
    wait_for("cpu to load", || manager.get_policy("cpu").is_some()).await?;

    // Updated file keeps the agreement count
    let gps = manager.get_policy("gps").expect("gps is loaded");
    manager.attempting_agreement(&gps, "c1")?;
    let gps_file = dir.path().join(policy_file_name("gps"));
    write_policy_file(&gps_file, &create_test_policy("gps", 1000))?;
    wait_for("gps update", || {
        manager.get_policy("gps").map_or(false, |p| p.max_agreements == 1000)
    })
    .await?;
    assert_eq!(manager.get_counts()?["gps"].count, 1);

    // A file that stops parsing is dropped
    fs::write(&gps_file, "{ not json")?;
    wait_for("gps removal", || manager.get_policy("gps").is_none()).await?;

    // Deleted file
    fs::remove_file(&cpu_file)?;
    wait_for("cpu removal", || manager.get_policy("cpu").is_none()).await?;
    assert_eq!(manager.number_policies(), 0);

    manager.shutdown().await?;

    // Nothing changes once the watcher has stopped
    create_policy_file(dir.path(), &create_test_policy("late", 0))?;
    tokio::time::sleep(SCAN_INTERVAL * 5).await;
    assert!(manager.get_policy("late").is_none());

    Ok(())
}

#[tokio::test]
async fn test_duplicate_name_is_not_applied() -> Result<()> {
    let dir = tempdir()?;
    create_policy_file(dir.path(), &create_test_policy("gps", 1))?;

    let mut watcher = PolicyWatcher::new(dir.path());
    let manager = Arc::new(PolicyManager::initialize_from(&mut watcher)?);
    manager.attach_watcher(watcher.spawn(SCAN_INTERVAL, manager.clone()))?;

    write_policy_file(&dir.path().join("copy.policy"), &create_test_policy("gps", 9))?;
    create_policy_file(dir.path(), &create_test_policy("marker", 0))?;
    wait_for("marker to load", || manager.get_policy("marker").is_some()).await?;

    let gps = manager.get_policy("gps").expect("gps is still loaded");
    assert_eq!(gps.max_agreements, 1);

    manager.shutdown().await?;
    Ok(())
}

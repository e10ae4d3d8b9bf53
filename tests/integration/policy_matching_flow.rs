// Integration test for the producer/consumer matching flow: files on disk, constraint
// translation, compatibility, producer merging, agreement terms and signature checks.

use std::fs;
use std::path::Path;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tempfile::tempdir;

use mesh_policy::agreement_protocol::BASIC_PROTOCOL;
use mesh_policy::data_verification::OBSCURED_PASSWORD;
use mesh_policy::policy_file::create_policy_file;
use mesh_policy::{
    compatible, create_terms_and_conditions, merge_producers, read_policy_file, write_policy_file, AgreementProtocol,
    ApiSpecification, ConstraintExpression, DataVerification, KeyManager, PluginRegistry, Policy, PolicyError,
    Property, RequiredProperty, Workload,
};

const GPS_API: &str = "https://mesh.example/api/gps";
const CPU_API: &str = "https://mesh.example/api/cpu";

fn create_test_producer(name: &str, spec_ref: &str) -> Policy {
    let mut policy = Policy::new(name);
    policy.api_specs = vec![ApiSpecification::new(spec_ref, "coop", "[1.0,2.0)", "arm64")].into();
    policy.agreement_protocols = vec![AgreementProtocol::new(BASIC_PROTOCOL)].into();
    policy.properties = vec![
        Property::new("memory", 2048i64),
        Property::new("arch", "arm64"),
        Property::new("zones", vec!["north".to_string(), "east".to_string()]),
    ]
    .into();
    policy.resource_limits.memory = 2048;
    policy.resource_limits.cpus = 4;
    policy
}

fn create_test_consumer(name: &str) -> Result<Policy> {
    let mut policy = Policy::new(name);
    policy.api_specs = vec![
        ApiSpecification::new(GPS_API, "coop", "1.4.2", "arm64"),
        ApiSpecification::new(CPU_API, "coop", "1.0", "arm64"),
    ]
    .into();
    policy.agreement_protocols = vec![AgreementProtocol::new(BASIC_PROTOCOL)].into();
    policy.properties = vec![Property::new("purpose", "mapping")].into();

    let constraint = ConstraintExpression::from("memory >= 1024 && arch == arm64 || memory >= 8192");
    policy.counter_party_properties = RequiredProperty::from_constraint(&constraint, &PluginRegistry::with_defaults())?;
    policy.resource_limits.memory = 1024;
    policy.data_verification = DataVerification::new("https://verify.example", "agbot", "secret", 600);

    let mut best = Workload::new("https://mesh.example/workloads/mapper", "2.0.0", "arm64").with_priority(1, 2, 600);
    best.workload_password = "mapper-pw".to_string();
    let fallback = Workload::new("https://mesh.example/workloads/mapper", "1.0.0", "arm64").with_priority(2, 2, 600);
    policy.workloads = vec![best, fallback];
    Ok(policy)
}

fn sign(key: &SigningKey, payload: &str) -> String {
    STANDARD.encode(key.sign(&Sha256::digest(payload.as_bytes())).to_bytes())
}

fn write_key(dir: &Path, key: &SigningKey) {
    fs::write(dir.join("publisher.pub"), hex::encode(key.verifying_key().to_bytes())).unwrap();
}

#[test]
fn test_merged_producers_serve_consumer() -> Result<()> {
    let dir = tempdir()?;
    let gps_file = create_policy_file(dir.path(), &create_test_producer("gps", GPS_API))?;
    let cpu_file = create_policy_file(dir.path(), &create_test_producer("cpu", CPU_API))?;
    let consumer = create_test_consumer("mapper")?;
    consumer.is_self_consistent(None)?;

    let gps = read_policy_file(&gps_file)?;
    let cpu = read_policy_file(&cpu_file)?;

    // Neither producer alone offers both APIs
    assert!(matches!(compatible(&gps, &consumer), Err(PolicyError::ApiSpec(_))));
    assert!(matches!(compatible(&cpu, &consumer), Err(PolicyError::ApiSpec(_))));

    let node = merge_producers(&gps, &cpu)?;
    assert_eq!(node.api_specs.len(), 2);
    compatible(&node, &consumer)?;

    let workload = consumer
        .next_highest_priority_workload(0, 0, 0)
        .expect("consumer has workloads");
    let terms = create_terms_and_conditions(&node, &consumer, workload, "agreement-42", "")?;

    assert_eq!(terms.header.name, "merged gps merged with cpu & mapper");
    assert_eq!(terms.workloads.len(), 1);
    assert_eq!(terms.workloads[0].version, "2.0.0");
    assert_ne!(terms.workloads[0].workload_password, "mapper-pw");
    assert_eq!(terms.data_verification.url_password, OBSCURED_PASSWORD);
    assert_eq!(terms.agreement_protocols.len(), 1);

    // The agreement record survives a trip through the file format unchanged
    let record = dir.path().join("agreement-42.json");
    write_policy_file(&record, &terms)?;
    let stored = fs::read_to_string(&record)?;
    let reloaded = read_policy_file(&record)?;
    assert_eq!(reloaded, terms);
    write_policy_file(&record, &reloaded)?;
    assert_eq!(fs::read_to_string(&record)?, stored);

    Ok(())
}

#[test]
fn test_constraint_alternatives() -> Result<()> {
    let consumer = create_test_consumer("mapper")?;

    let mut big_amd = create_test_producer("big", GPS_API);
    big_amd.api_specs = vec![
        ApiSpecification::new(GPS_API, "coop", "1.0", "arm64"),
        ApiSpecification::new(CPU_API, "coop", "1.0", "arm64"),
    ]
    .into();
    big_amd.properties = vec![Property::new("memory", 16384i64), Property::new("arch", "amd64")].into();
    big_amd.resource_limits.memory = 0;
    compatible(&big_amd, &consumer)?;

    let mut small_amd = big_amd.clone();
    small_amd.properties = vec![Property::new("memory", 4096i64), Property::new("arch", "amd64")].into();
    assert!(matches!(compatible(&small_amd, &consumer), Err(PolicyError::Requirement(_))));

    // Producer requirements are checked against the consumer side
    let mut zoned = big_amd.clone();
    zoned.counter_party_properties = serde_json::from_value(serde_json::json!({
        "not": [{"name": "purpose", "value": "mining"}]
    }))?;
    compatible(&zoned, &consumer)?;

    let mut mining = consumer.clone();
    mining.properties = vec![Property::new("purpose", "mining")].into();
    assert!(matches!(compatible(&zoned, &mining), Err(PolicyError::Requirement(_))));

    Ok(())
}

#[test]
fn test_signed_workloads() -> Result<()> {
    let keys = tempdir()?;
    let publisher = SigningKey::generate(&mut OsRng);
    write_key(keys.path(), &publisher);
    let key_manager = KeyManager::new();

    let mut policy = create_test_consumer("mapper")?;
    for workload in policy.workloads.iter_mut() {
        workload.deployment = format!(r#"{{"services":{{"mapper":{{"image":"mapper:{}"}}}}}}"#, workload.version);
        workload.deployment_signature = sign(&publisher, &workload.deployment);
    }
    policy.is_self_consistent(Some((&key_manager, keys.path())))?;

    let impostor = SigningKey::generate(&mut OsRng);
    policy.workloads[1].deployment_signature = sign(&impostor, &policy.workloads[1].deployment);
    assert!(matches!(
        policy.is_self_consistent(Some((&key_manager, keys.path()))),
        Err(PolicyError::Workload(_))
    ));

    Ok(())
}

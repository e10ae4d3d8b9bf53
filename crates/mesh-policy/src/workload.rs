use std::fmt;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PolicyError;
use crate::key_manager::KeyError;

/// A container image and its signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image file name
    pub file: String,

    /// Signature of the image
    pub signature: String,
}

/// Where the images of a workload can be fetched from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Torrent {
    /// Torrent URL
    #[serde(default)]
    pub url: String,

    /// Images in the torrent
    #[serde(default)]
    pub images: Vec<Image>,
}

impl Torrent {
    pub fn is_empty(&self) -> bool {
        self.url.is_empty() && self.images.is_empty()
    }
}

/// Rank and retry budget of a workload choice. Priority 1 is tried first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadPriority {
    /// Priority, lower values are preferred
    #[serde(default)]
    pub priority_value: u32,

    /// Failures tolerated before moving to the next priority
    #[serde(default)]
    pub retries: u32,

    /// Window in seconds within which `retries` failures must occur
    #[serde(rename = "retry_durations", default)]
    pub retry_duration_secs: u64,

    /// Seconds of verified data after which failover is turned off
    #[serde(rename = "verified_durations", default)]
    pub verified_duration_secs: u64,
}

impl WorkloadPriority {
    pub fn is_empty(&self) -> bool {
        *self == WorkloadPriority::default()
    }
}

/// A deployable workload version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Opaque deployment description
    #[serde(default)]
    pub deployment: String,

    /// Signature over `deployment`
    #[serde(default)]
    pub deployment_signature: String,

    /// Extra information for the deployer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_user_info: String,

    /// Image locations
    #[serde(default, skip_serializing_if = "Torrent::is_empty")]
    pub torrent: Torrent,

    /// Password handed to the workload, hashed once an agreement exists
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload_password: String,

    /// Failover rank and retry budget
    #[serde(default, skip_serializing_if = "WorkloadPriority::is_empty")]
    pub priority: WorkloadPriority,

    /// Workload definition reference
    #[serde(rename = "workloadUrl", default, skip_serializing_if = "String::is_empty")]
    pub workload_url: String,

    /// Workload definition version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Hardware architecture of the workload
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,

    /// Environment overrides for the deployment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_overrides: String,

    /// Signature over `deployment_overrides`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_overrides_signature: String,
}

/// Checks deployment signatures against the keys found at a key path
pub trait SignatureVerifier: Send + Sync {
    /// Whether `signature` was made over `payload` by one of the keys under `key_path`
    fn verify(&self, key_path: &Path, payload: &str, signature: &str) -> Result<bool, KeyError>;
}

impl Workload {
    pub fn new(workload_url: impl Into<String>, version: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            workload_url: workload_url.into(),
            version: version.into(),
            arch: arch.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority_value: u32, retries: u32, retry_duration_secs: u64) -> Self {
        self.priority = WorkloadPriority {
            priority_value,
            retries,
            retry_duration_secs,
            verified_duration_secs: self.priority.verified_duration_secs,
        };
        self
    }

    /// Replace the password with a one-way hash of password and agreement id.
    ///
    /// A non-empty `default_password` takes the place of the workload's own. Nothing happens
    /// when neither is set.
    pub fn obscure(&mut self, agreement_id: &str, default_password: &str) {
        if self.workload_password.is_empty() && default_password.is_empty() {
            return;
        }
        if !default_password.is_empty() {
            self.workload_password = default_password.to_string();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.workload_password.as_bytes());
        hasher.update(agreement_id.as_bytes());
        self.workload_password = hex::encode(hasher.finalize());
    }

    /// Verify the deployment and any overrides against the keys at `key_path`
    pub fn has_valid_signature(&self, verifier: &dyn SignatureVerifier, key_path: &Path) -> Result<(), PolicyError> {
        let signed = [
            ("deployment", &self.deployment, &self.deployment_signature),
            ("deployment overrides", &self.deployment_overrides, &self.deployment_overrides_signature),
        ];

        for (what, payload, signature) in signed {
            if payload.is_empty() {
                continue;
            }
            if signature.is_empty() {
                return Err(PolicyError::Workload(format!("{} of {} is not signed", what, self)));
            }
            match verifier.verify(key_path, payload, signature) {
                Ok(true) => debug!("Verified {} signature of {}", what, self),
                Ok(false) => {
                    return Err(PolicyError::Workload(format!("{} signature of {} is not valid", what, self)))
                }
                Err(e) => {
                    return Err(PolicyError::Workload(format!(
                        "unable to verify {} signature of {}: {}",
                        what, self, e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Same workload definition and deployment, ignoring password and priority
    pub fn is_same(&self, other: &Workload) -> bool {
        self.deployment == other.deployment
            && self.deployment_signature == other.deployment_signature
            && self.deployment_user_info == other.deployment_user_info
            && self.torrent == other.torrent
            && self.workload_url == other.workload_url
            && self.version == other.version
            && self.arch == other.arch
            && self.deployment_overrides == other.deployment_overrides
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workload {} {} {} (priority {})",
            self.workload_url, self.version, self.arch, self.priority.priority_value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FixedVerifier(Result<bool, ()>);

    impl SignatureVerifier for FixedVerifier {
        fn verify(&self, _key_path: &Path, _payload: &str, _signature: &str) -> Result<bool, KeyError> {
            self.0.map_err(|_| KeyError::NoKeys(PathBuf::from("/keys")))
        }
    }

    fn create_test_workload() -> Workload {
        let mut workload = Workload::new("https://mesh.example/workloads/gps", "1.0.0", "amd64");
        workload.deployment = r#"{"services":{"gps":{"image":"gps:1.0"}}}"#.to_string();
        workload.deployment_signature = "c2lnbmF0dXJl".to_string();
        workload
    }

    #[test]
    fn test_obscure_is_one_way_and_salted() {
        let mut a = create_test_workload();
        a.workload_password = "secret".to_string();
        let mut b = a.clone();

        a.obscure("agreement-1", "");
        b.obscure("agreement-2", "");
        assert_ne!(a.workload_password, "secret");
        assert_eq!(a.workload_password.len(), 64);
        assert_ne!(a.workload_password, b.workload_password);
    }

    #[test]
    fn test_obscure_default_password() {
        let mut plain = create_test_workload();
        plain.obscure("agreement-1", "");
        assert!(plain.workload_password.is_empty());

        let mut with_default = create_test_workload();
        with_default.obscure("agreement-1", "fallback");

        let mut explicit = create_test_workload();
        explicit.workload_password = "fallback".to_string();
        explicit.obscure("agreement-1", "");
        assert_eq!(with_default.workload_password, explicit.workload_password);
    }

    #[test]
    fn test_signature_checks() {
        let workload = create_test_workload();
        let keys = Path::new("/keys");

        assert!(workload.has_valid_signature(&FixedVerifier(Ok(true)), keys).is_ok());
        assert!(workload.has_valid_signature(&FixedVerifier(Ok(false)), keys).is_err());
        assert!(workload.has_valid_signature(&FixedVerifier(Err(())), keys).is_err());

        let mut unsigned = create_test_workload();
        unsigned.deployment_signature.clear();
        assert!(unsigned.has_valid_signature(&FixedVerifier(Ok(true)), keys).is_err());

        let reference_only = Workload::new("https://mesh.example/workloads/gps", "1.0.0", "amd64");
        assert!(reference_only.has_valid_signature(&FixedVerifier(Ok(false)), keys).is_ok());
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let workload = Workload::new("https://mesh.example/workloads/gps", "1.0.0", "amd64").with_priority(1, 3, 600);
        let json = serde_json::to_value(&workload).unwrap();
        assert_eq!(json["priority"]["priority_value"], 1);
        assert_eq!(json["priority"]["retry_durations"], 600);
        assert!(json.get("torrent").is_none());
        assert!(json.get("workload_password").is_none());
    }
}

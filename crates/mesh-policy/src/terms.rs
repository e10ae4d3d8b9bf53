//! Smaller policy sections: resource limits, value exchange, proposal rejection and HA groups.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Resource caps, in caller-defined units. Zero means unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    /// Network upload cap
    #[serde(rename = "networkUpload", default)]
    pub network_upload: u64,

    /// Network download cap
    #[serde(rename = "networkDownload", default)]
    pub network_download: u64,

    /// Memory cap
    #[serde(default)]
    pub memory: u64,

    /// CPU cap
    #[serde(default)]
    pub cpus: u64,
}

impl ResourceLimit {
    pub fn is_empty(&self) -> bool {
        *self == ResourceLimit::default()
    }

    /// Check these (consumer) limits against what `producer` allows
    pub fn is_satisfied_by(&self, producer: &ResourceLimit) -> Result<(), PolicyError> {
        let checks = [
            ("networkUpload", self.network_upload, producer.network_upload),
            ("networkDownload", self.network_download, producer.network_download),
            ("memory", self.memory, producer.memory),
            ("cpus", self.cpus, producer.cpus),
        ];
        for (field, required, allowed) in checks {
            if required != 0 && allowed != 0 && required > allowed {
                return Err(PolicyError::ResourceLimit(format!(
                    "{} requires {} but only {} is allowed",
                    field, required, allowed
                )));
            }
        }
        Ok(())
    }

    /// Field-wise maximum
    pub fn max_with(&self, other: &ResourceLimit) -> ResourceLimit {
        ResourceLimit {
            network_upload: self.network_upload.max(other.network_upload),
            network_download: self.network_download.max(other.network_download),
            memory: self.memory.max(other.memory),
            cpus: self.cpus.max(other.cpus),
        }
    }
}

/// How value is exchanged for the work done
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueExchange {
    /// Kind of exchange
    #[serde(rename = "type", default)]
    pub exchange_type: String,

    /// Where the exchange is settled
    #[serde(default)]
    pub value: String,

    /// Seconds between payments
    #[serde(rename = "paymentRate", default)]
    pub payment_rate: u64,

    /// Token type used for payment
    #[serde(default)]
    pub token: String,
}

impl ValueExchange {
    pub fn is_empty(&self) -> bool {
        *self == ValueExchange::default()
    }
}

/// When to stop sending proposals to a counterparty that keeps rejecting them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRejection {
    /// Number of rejections tolerated
    #[serde(default)]
    pub number: u32,

    /// Seconds to wait before proposing again
    #[serde(default)]
    pub duration: u64,
}

impl ProposalRejection {
    pub fn is_empty(&self) -> bool {
        *self == ProposalRejection::default()
    }
}

/// Nodes considered interchangeable for high availability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighAvailabilityGroup {
    /// Node identifiers of the partners
    #[serde(default)]
    pub partners: Vec<String>,
}

impl HighAvailabilityGroup {
    pub fn new(partners: Vec<String>) -> Self {
        Self { partners }
    }

    pub fn is_empty(&self) -> bool {
        self.partners.is_empty()
    }

    /// Same partner set regardless of order
    pub fn is_same(&self, other: &HighAvailabilityGroup) -> bool {
        self.partners.len() == other.partners.len()
            && self.partners.iter().all(|p| other.partners.contains(p))
    }
}

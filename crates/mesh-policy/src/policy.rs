//! The policy document and the compatibility engine.
//!
//! A producer (an edge node) and a consumer (a workload deployer) each publish a [`Policy`].
//! [`compatible`] decides whether the two can form an agreement, [`merge_producers`] combines
//! two producer offers on the same node, and [`create_terms_and_conditions`] builds the merged
//! document that records an agreement.

use std::fmt;
use std::path::Path;

use chrono::Utc;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::agreement_protocol::AgreementProtocolList;
use crate::api_spec::ApiSpecList;
use crate::blockchain::BlockchainList;
use crate::data_verification::DataVerification;
use crate::error::PolicyError;
use crate::metrics;
use crate::property::PropertyList;
use crate::required_property::RequiredProperty;
use crate::terms::{HighAvailabilityGroup, ProposalRejection, ResourceLimit, ValueExchange};
use crate::workload::{SignatureVerifier, Workload};

/// Schema version written into every new policy
pub const CURRENT_VERSION: &str = "2.0";

/// Identifies a policy document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyHeader {
    /// Unique policy name
    pub name: String,

    /// Schema version
    pub version: String,
}

/// A producer offer, a consumer demand, or the merged terms of an agreement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub header: PolicyHeader,

    /// Deployment pattern the policy belongs to
    #[serde(rename = "patternId", default, skip_serializing_if = "String::is_empty")]
    pub pattern_id: String,

    /// APIs supported (producer) or required (consumer)
    #[serde(rename = "apiSpec", default)]
    pub api_specs: ApiSpecList,

    /// Acceptable agreement protocols
    #[serde(rename = "agreementProtocols", default)]
    pub agreement_protocols: AgreementProtocolList,

    /// Workload choices, ranked by priority
    #[serde(default)]
    pub workloads: Vec<Workload>,

    #[serde(rename = "valueExchange", default)]
    pub value_exchange: ValueExchange,

    #[serde(rename = "resourceLimits", default)]
    pub resource_limits: ResourceLimit,

    #[serde(rename = "dataVerification", default)]
    pub data_verification: DataVerification,

    #[serde(rename = "proposalRejection", default)]
    pub proposal_rejection: ProposalRejection,

    /// Simultaneous agreements allowed, 0 means unlimited
    #[serde(rename = "maxAgreements", default)]
    pub max_agreements: u32,

    /// Properties advertised to the counterparty
    #[serde(default)]
    pub properties: PropertyList,

    /// Requirements the counterparty's properties must satisfy
    #[serde(rename = "counterPartyProperties", default)]
    pub counter_party_properties: RequiredProperty,

    /// Acceptable settlement backends
    #[serde(default)]
    pub blockchains: BlockchainList,

    /// Workload that must run alongside this one
    #[serde(rename = "requiredWorkload", default, skip_serializing_if = "String::is_empty")]
    pub required_workload: String,

    /// Interchangeable partner nodes
    #[serde(rename = "ha_group", default)]
    pub ha_group: HighAvailabilityGroup,
}

impl Policy {
    /// An empty policy at the current schema version
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            header: PolicyHeader {
                name: name.into(),
                version: CURRENT_VERSION.to_string(),
            },
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn is_version(&self, version: &str) -> bool {
        self.header.version == version
    }

    /// Validate the parts of a policy that can be checked without a counterparty.
    ///
    /// With more than one workload choice, every choice needs a distinct non-zero priority.
    /// When a verifier and key path are given, workload deployment signatures are checked too.
    pub fn is_self_consistent(&self, signatures: Option<(&dyn SignatureVerifier, &Path)>) -> Result<(), PolicyError> {
        self.data_verification
            .is_valid()
            .map_err(|e| PolicyError::Inconsistent(format!("{}: {}", self.header.name, e)))?;
        self.properties.validate()?;
        self.counter_party_properties.is_valid()?;

        let mut used_priorities = Vec::with_capacity(self.workloads.len());
        for workload in &self.workloads {
            if let Some((verifier, key_path)) = signatures {
                workload.has_valid_signature(verifier, key_path)?;
            }

            if self.workloads.len() > 1 {
                let priority = workload.priority.priority_value;
                if priority == 0 {
                    return Err(PolicyError::Inconsistent(format!(
                        "{} is missing a priority, required when there is more than one workload",
                        workload
                    )));
                }
                if used_priorities.contains(&priority) {
                    return Err(PolicyError::Inconsistent(format!("duplicate workload priority {}", priority)));
                }
                used_priorities.push(priority);
            }
        }
        Ok(())
    }

    /// Hash every workload password, salted with the agreement id
    pub fn obscure_workload_passwords(&mut self, agreement_id: &str, default_password: &str) {
        for workload in self.workloads.iter_mut() {
            workload.obscure(agreement_id, default_password);
        }
    }

    /// Same workload choices in the same order
    pub fn is_same_workload(&self, other: &Policy) -> bool {
        self.workloads.len() == other.workloads.len()
            && self.workloads.iter().zip(other.workloads.iter()).all(|(a, b)| a.is_same(b))
    }

    /// Workload to deploy next, as of now.
    ///
    /// See [`Policy::next_highest_priority_workload_at`].
    pub fn next_highest_priority_workload(
        &self,
        current_priority: u32,
        retry_count: u32,
        retry_start_secs: u64,
    ) -> Option<&Workload> {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        self.next_highest_priority_workload_at(now, current_priority, retry_count, retry_start_secs)
    }

    /// Workload to deploy next given the failures seen at `current_priority`.
    ///
    /// Stays at the current priority while it has retries left or its retry window is still open.
    /// Otherwise moves to the numerically next priority, and when none is left falls back to the
    /// lowest ranked choice. A `current_priority` of 0 selects the best choice overall.
    pub fn next_highest_priority_workload_at(
        &self,
        now_secs: u64,
        current_priority: u32,
        retry_count: u32,
        retry_start_secs: u64,
    ) -> Option<&Workload> {
        if self.workloads.len() == 1 {
            return self.workloads.first();
        }

        let mut next: Option<&Workload> = None;
        for workload in &self.workloads {
            let priority = &workload.priority;

            if priority.priority_value == current_priority {
                let window_open = now_secs.saturating_sub(retry_start_secs) <= priority.retry_duration_secs;
                if priority.retries > retry_count || window_open {
                    trace!("Staying with {}", workload);
                    return Some(workload);
                }
                debug!(
                    "{} used up {} retries in {} seconds",
                    workload, priority.retries, priority.retry_duration_secs
                );
            }

            if priority.priority_value <= current_priority {
                continue;
            }
            if next.map_or(true, |n| priority.priority_value < n.priority.priority_value) {
                next = Some(workload);
            }
        }

        next.or_else(|| self.workloads.iter().max_by_key(|w| w.priority.priority_value))
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (version {})", self.header.name, self.header.version)
    }
}

/// Whether `producer` can serve `consumer`. Argument order matters.
///
/// Checks run in a fixed order and the first failure is returned.
pub fn compatible(producer: &Policy, consumer: &Policy) -> Result<(), PolicyError> {
    let result = check_compatible(producer, consumer);
    match &result {
        Ok(()) => debug!("{} is compatible with {}", producer, consumer),
        Err(e) => debug!("{} is not compatible with {}: {}", producer, consumer, e),
    }
    metrics::record_compatibility(result.is_ok());
    result
}

fn check_compatible(producer: &Policy, consumer: &Policy) -> Result<(), PolicyError> {
    if !consumer.is_version(&producer.header.version) {
        return Err(PolicyError::SchemaVersion(
            producer.header.version.clone(),
            consumer.header.version.clone(),
        ));
    }

    consumer.api_specs.is_subset_of(&producer.api_specs)?;

    consumer.counter_party_properties.is_satisfied_by(&producer.properties)?;
    producer.counter_party_properties.is_satisfied_by(&consumer.properties)?;

    producer.blockchains.intersects_with(&consumer.blockchains)?;
    producer.agreement_protocols.intersects_with(&consumer.agreement_protocols)?;

    consumer.resource_limits.is_satisfied_by(&producer.resource_limits)?;

    // Identical declared settings on both sides are treated as a conflict
    if producer.data_verification.is_declared() && producer.data_verification.is_same(&consumer.data_verification) {
        return Err(PolicyError::DataVerification(format!(
            "producer has {} and consumer has {}",
            producer.data_verification, consumer.data_verification
        )));
    }

    Ok(())
}

/// Name of the agreement protocol both sides would use
pub fn select_protocol(producer: &Policy, consumer: &Policy) -> Result<String, PolicyError> {
    let common = producer.agreement_protocols.intersects_with(&consumer.agreement_protocols)?;
    common
        .first()
        .map(|p| p.name.clone())
        .ok_or_else(|| PolicyError::AgreementProtocol(format!("{} and {} share no protocol", producer, consumer)))
}

/// Combine two producer policies a consumer wants to use in one agreement
pub fn merge_producers(first: &Policy, second: &Policy) -> Result<Policy, PolicyError> {
    if !first.is_version(&second.header.version) {
        return Err(PolicyError::SchemaVersion(
            first.header.version.clone(),
            second.header.version.clone(),
        ));
    }
    let blockchains = first.blockchains.intersects_with(&second.blockchains)?;
    let agreement_protocols = first.agreement_protocols.intersects_with(&second.agreement_protocols)?;
    first.properties.is_compatible_with(&second.properties)?;

    let mut merged = Policy::new(format!("{} merged with {}", first.header.name, second.header.name));

    merged.api_specs = first.api_specs.clone();
    merged.api_specs.concatenate(&second.api_specs);
    merged.blockchains = blockchains;
    merged.agreement_protocols = agreement_protocols;

    merged.properties = first.properties.clone();
    merged.properties.merge_with(&second.properties, false)?;
    merged.counter_party_properties = first.counter_party_properties.merge(&second.counter_party_properties);

    merged.resource_limits = first.resource_limits.max_with(&second.resource_limits);
    merged.max_agreements = match (first.max_agreements, second.max_agreements) {
        (0, other) | (other, 0) => other,
        (a, b) => a.min(b),
    };
    merged.data_verification = if first.data_verification.is_declared() {
        first.data_verification.clone()
    } else {
        second.data_verification.clone()
    };
    merged.ha_group = if first.ha_group.is_empty() {
        second.ha_group.clone()
    } else {
        first.ha_group.clone()
    };

    debug!("Merged producer policies into {}", merged);
    Ok(merged)
}

/// Fold [`merge_producers`] over a non-empty list of producer policies
pub fn merge_all_producers(policies: &[Policy]) -> Result<Policy, PolicyError> {
    let (first, rest) = policies.split_first().ok_or(PolicyError::NothingToMerge)?;
    rest.iter().try_fold(first.clone(), |merged, next| merge_producers(&merged, next))
}

/// Build the merged policy that records an agreement between `producer` and `consumer`
pub fn create_terms_and_conditions(
    producer: &Policy,
    consumer: &Policy,
    workload: &Workload,
    agreement_id: &str,
    default_password: &str,
) -> Result<Policy, PolicyError> {
    compatible(producer, consumer)?;

    let mut merged = Policy::new(format!("merged {} & {}", producer.header.name, consumer.header.name));
    merged.pattern_id = consumer.pattern_id.clone();
    merged.api_specs = consumer.api_specs.clone();

    merged.agreement_protocols = producer
        .agreement_protocols
        .intersects_with(&consumer.agreement_protocols)?
        .single_element();
    merged.blockchains = producer.blockchains.intersects_with(&consumer.blockchains)?.single_element();

    merged.workloads.push(workload.clone());
    merged.obscure_workload_passwords(agreement_id, default_password);

    merged.value_exchange = consumer.value_exchange.clone();
    merged.resource_limits = consumer.resource_limits;
    merged.data_verification = consumer.data_verification.clone();
    merged.data_verification.obscure();

    merged.properties = consumer.properties.clone();
    merged.properties.merge_with(&producer.properties, false)?;
    merged.counter_party_properties = consumer.counter_party_properties.clone();

    merged.required_workload = producer.required_workload.clone();
    merged.ha_group = producer.ha_group.clone();

    debug!("Created terms and conditions {} for agreement {}", merged, agreement_id);
    Ok(merged)
}

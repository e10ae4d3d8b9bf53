use thiserror::Error;

use crate::property::PropertyError;
use crate::required_property::ConstraintError;
use crate::version::VersionError;

/// Errors produced while validating, comparing or combining policies
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Schema version mismatch: {0} and {1}")]
    SchemaVersion(String, String),

    #[error("API spec incompatibility: {0}")]
    ApiSpec(String),

    #[error("Counterparty property requirement not met: {0}")]
    Requirement(#[source] ConstraintError),

    #[error("Property incompatibility: {0}")]
    Property(#[from] PropertyError),

    #[error("Blockchain intersection error: {0}")]
    Blockchain(String),

    #[error("Agreement protocol intersection error: {0}")]
    AgreementProtocol(String),

    #[error("Resource limits not satisfied: {0}")]
    ResourceLimit(String),

    #[error("Data verification incompatibility: {0}")]
    DataVerification(String),

    #[error("List already contains {0}")]
    Duplicate(String),

    #[error("Workload error: {0}")]
    Workload(String),

    #[error("Invalid version: {0}")]
    Version(#[from] VersionError),

    #[error("Policy is not self consistent: {0}")]
    Inconsistent(String),

    #[error("No policies to merge")]
    NothingToMerge,
}

impl From<ConstraintError> for PolicyError {
    fn from(err: ConstraintError) -> Self {
        PolicyError::Requirement(err)
    }
}

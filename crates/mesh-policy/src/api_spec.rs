use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::version::{is_version_string, VersionExpression};

/// A supported or required API, identified by reference and architecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSpecification {
    /// URL of the API definition
    #[serde(rename = "specRef")]
    pub spec_ref: String,

    /// Organization that owns the definition
    #[serde(default)]
    pub organization: String,

    /// Exact version (consumer) or version range (producer)
    pub version: String,

    /// Whether exclusive access to the API is required
    #[serde(rename = "exclusiveAccess", default)]
    pub exclusive_access: bool,

    /// Number of simultaneous agreements, 0 means unlimited
    #[serde(rename = "maxAgreements", default)]
    pub max_agreements: u32,

    /// Hardware architecture of the implementation
    #[serde(default)]
    pub arch: String,
}

impl ApiSpecification {
    pub fn new(spec_ref: impl Into<String>, organization: impl Into<String>, version: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            spec_ref: spec_ref.into(),
            organization: organization.into(),
            version: version.into(),
            exclusive_access: true,
            max_agreements: 0,
            arch: arch.into(),
        }
    }

    pub fn with_max_agreements(mut self, max_agreements: u32) -> Self {
        self.max_agreements = max_agreements;
        self
    }

    /// Same reference and architecture
    pub fn same_key(&self, other: &ApiSpecification) -> bool {
        self.spec_ref == other.spec_ref && self.arch == other.arch
    }

    pub fn is_same(&self, other: &ApiSpecification, check_version: bool) -> bool {
        self.same_key(other)
            && self.organization == other.organization
            && self.exclusive_access == other.exclusive_access
            && (!check_version || self.version == other.version)
    }

    /// Whether this producer entry can serve the `required` entry.
    ///
    /// A single required version must lie in the offered range. A required range must lie entirely inside it.
    fn serves(&self, required: &ApiSpecification) -> Result<bool, PolicyError> {
        if !self.same_key(required) {
            return Ok(false);
        }
        if self.max_agreements != 0 && self.max_agreements < required.max_agreements {
            return Ok(false);
        }
        let range = VersionExpression::parse(&self.version)?;
        if is_version_string(&required.version) {
            return Ok(range.is_within_range(&required.version)?);
        }
        Ok(range.contains_range(&VersionExpression::parse(&required.version)?))
    }
}

impl fmt::Display for ApiSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} ({})", self.organization, self.spec_ref, self.version, self.arch)
    }
}

/// API specifications offered by a producer or required by a consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiSpecList(Vec<ApiSpecification>);

impl ApiSpecList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add a specification, rejecting a second entry with the same reference and architecture
    pub fn add_api_spec(&mut self, spec: ApiSpecification) -> Result<(), PolicyError> {
        if self.0.iter().any(|existing| existing.same_key(&spec)) {
            return Err(PolicyError::Duplicate(spec.to_string()));
        }
        self.0.push(spec);
        Ok(())
    }

    /// Append the entries of `other` that are not already present
    pub fn concatenate(&mut self, other: &ApiSpecList) {
        for spec in other.iter() {
            if !self.0.iter().any(|existing| existing.same_key(spec)) {
                self.0.push(spec.clone());
            }
        }
    }

    /// Every entry of this (consumer) list is served by an entry of `producer`
    pub fn is_subset_of(&self, producer: &ApiSpecList) -> Result<(), PolicyError> {
        for required in self.iter() {
            let mut served = false;
            for offered in producer.iter() {
                if offered.serves(required)? {
                    served = true;
                    break;
                }
            }
            if !served {
                return Err(PolicyError::ApiSpec(format!(
                    "API spec {} is not supported by {}",
                    required, producer
                )));
            }
        }
        Ok(())
    }

    /// Producer view of `is_subset_of`
    pub fn supports(&self, required: &ApiSpecList) -> Result<(), PolicyError> {
        required.is_subset_of(self)
    }

    pub fn contains_spec_ref(&self, spec_ref: &str, organization: &str, version: &str) -> bool {
        self.iter()
            .any(|s| s.spec_ref == spec_ref && s.organization == organization && s.version == version)
    }

    pub fn is_same(&self, other: &ApiSpecList, check_version: bool) -> bool {
        self.len() == other.len() && self.iter().all(|s| other.iter().any(|o| s.is_same(o, check_version)))
    }
}

impl Deref for ApiSpecList {
    type Target = [ApiSpecification];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<ApiSpecification>> for ApiSpecList {
    fn from(specs: Vec<ApiSpecification>) -> Self {
        Self(specs)
    }
}

impl fmt::Display for ApiSpecList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.iter().map(|s| s.to_string()).collect();
        write!(f, "[{}]", items.join(", "))
    }
}

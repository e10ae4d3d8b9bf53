#![deny(unsafe_code)]
//! Mesh Policy - policy compatibility and agreement matching for the planetary mesh
//!
//! This crate provides the admission core of the compute marketplace:
//! - The policy document and its set-algebra over API specs, protocols and settlement backends
//! - Version ranges and counterparty property requirements
//! - Compatibility checks, producer merging and agreement terms
//! - A policy registry with per-policy agreement slot accounting
//! - Workload failover selection and policy file discovery

pub mod version;
pub mod property;
pub mod required_property;
pub mod constraint;
pub mod error;
pub mod api_spec;
pub mod blockchain;
pub mod agreement_protocol;
pub mod terms;
pub mod data_verification;
pub mod workload;
pub mod key_manager;
pub mod policy;
pub mod policy_file;
pub mod watcher;
pub mod policy_manager;
pub mod config;
pub mod metrics;

// Re-export common types
pub use error::PolicyError;
pub use version::{VersionError, VersionExpression};
pub use property::{Property, PropertyList, PropertyValue};
pub use required_property::{Comparison, ConstraintError, Expression, RequiredProperty};
pub use constraint::{ConstraintExpression, PluginRegistry, TextLanguagePlugin};
pub use api_spec::{ApiSpecList, ApiSpecification};
pub use blockchain::{Blockchain, BlockchainList};
pub use agreement_protocol::{AgreementProtocol, AgreementProtocolList};
pub use data_verification::DataVerification;
pub use workload::{SignatureVerifier, Workload};
pub use key_manager::{KeyError, KeyManager};
pub use policy::{compatible, create_terms_and_conditions, merge_all_producers, merge_producers, select_protocol, Policy};
pub use policy_file::{read_policy_file, write_policy_file, PolicyFileError};
pub use watcher::{PolicyEventHandler, PolicyWatcher, WatcherHandle};
pub use policy_manager::{AgreementStatus, ManagerError, PolicyManager};
pub use config::{load_engine_config, PolicyEngineConfig};

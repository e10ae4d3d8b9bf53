use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PolicyError;

/// The one settlement backend type with structured details
pub const ETHEREUM: &str = "ethereum";

/// Bootstrap details of an ethereum backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthereumDetails {
    /// Genesis block URLs
    #[serde(default)]
    pub genesis: Vec<String>,

    /// Bootnode list URLs
    #[serde(default)]
    pub bootnodes: Vec<String>,

    /// Directory contract URLs
    #[serde(default)]
    pub directory: Vec<String>,

    /// Network id URLs
    #[serde(default)]
    pub networkid: Vec<String>,
}

/// A settlement backend and its type-specific bootstrap details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blockchain {
    /// Backend type, e.g. `ethereum`
    #[serde(rename = "type")]
    pub bc_type: String,

    /// Opaque details, interpreted per type
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl Blockchain {
    pub fn new(bc_type: impl Into<String>, details: Value) -> Self {
        Self {
            bc_type: bc_type.into(),
            details,
        }
    }

    pub fn ethereum(details: &EthereumDetails) -> Self {
        Self {
            bc_type: ETHEREUM.to_string(),
            details: serde_json::to_value(details).unwrap_or(Value::Null),
        }
    }

    /// Structural, type-aware equality
    pub fn is_same(&self, other: &Blockchain) -> bool {
        if self.bc_type != other.bc_type {
            return false;
        }
        if self.bc_type != ETHEREUM {
            return self.details == other.details;
        }

        let mine = serde_json::from_value::<EthereumDetails>(self.details.clone());
        let theirs = serde_json::from_value::<EthereumDetails>(other.details.clone());
        match (mine, theirs) {
            // Vec equality is element-wise by index
            (Ok(a), Ok(b)) => a == b,
            _ => self.details == other.details,
        }
    }
}

impl fmt::Display for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.bc_type, self.details)
    }
}

/// Acceptable settlement backends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockchainList(Vec<Blockchain>);

impl BlockchainList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries present on both sides.
    ///
    /// Two empty lists intersect on the empty list. When only one side is empty the other
    /// side is returned.
    pub fn intersects_with(&self, other: &BlockchainList) -> Result<BlockchainList, PolicyError> {
        if self.is_empty() {
            return Ok(other.clone());
        }
        if other.is_empty() {
            return Ok(self.clone());
        }

        let common: Vec<Blockchain> = self
            .iter()
            .filter(|mine| other.iter().any(|theirs| mine.is_same(theirs)))
            .cloned()
            .collect();

        if common.is_empty() {
            return Err(PolicyError::Blockchain(format!("{} was not found in {}", self, other)));
        }
        Ok(BlockchainList(common))
    }

    pub fn concatenate(&mut self, other: &BlockchainList) {
        for bc in other.iter() {
            if !self.contains(bc) {
                self.0.push(bc.clone());
            }
        }
    }

    /// A list holding only the first entry
    pub fn single_element(&self) -> BlockchainList {
        BlockchainList(self.0.iter().take(1).cloned().collect())
    }

    pub fn add_blockchain(&mut self, bc: Blockchain) -> Result<(), PolicyError> {
        if self.contains(&bc) {
            return Err(PolicyError::Duplicate(bc.to_string()));
        }
        self.0.push(bc);
        Ok(())
    }

    pub fn contains(&self, bc: &Blockchain) -> bool {
        self.iter().any(|existing| existing.is_same(bc))
    }

    pub fn is_same(&self, other: &BlockchainList) -> bool {
        self.len() == other.len() && self.iter().all(|bc| other.contains(bc))
    }
}

impl Deref for BlockchainList {
    type Target = [Blockchain];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Blockchain>> for BlockchainList {
    fn from(list: Vec<Blockchain>) -> Self {
        Self(list)
    }
}

impl fmt::Display for BlockchainList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.iter().map(|b| b.to_string()).collect();
        write!(f, "[{}]", items.join(", "))
    }
}

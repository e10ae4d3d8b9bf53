use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::blockchain::BlockchainList;
use crate::error::PolicyError;

/// Default protocol, used when neither side names one
pub const BASIC_PROTOCOL: &str = "Basic";

/// Protocol settled through a blockchain
pub const CITIZEN_SCIENTIST: &str = "Citizen Scientist";

/// An agreement protocol and the settlement backends acceptable with it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementProtocol {
    /// Protocol name, unique within a list
    pub name: String,

    /// Backends acceptable for this protocol
    #[serde(default, skip_serializing_if = "BlockchainList::is_empty")]
    pub blockchains: BlockchainList,
}

impl AgreementProtocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blockchains: BlockchainList::new(),
        }
    }

    pub fn with_blockchains(mut self, blockchains: BlockchainList) -> Self {
        self.blockchains = blockchains;
        self
    }
}

impl fmt::Display for AgreementProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Agreement protocols supported by a policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgreementProtocolList(Vec<AgreementProtocol>);

impl AgreementProtocolList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Protocols named on both sides, each with the intersection of its backends.
    ///
    /// Two empty lists agree on the basic protocol; one empty side yields the other.
    pub fn intersects_with(&self, other: &AgreementProtocolList) -> Result<AgreementProtocolList, PolicyError> {
        if self.is_empty() && other.is_empty() {
            return Ok(AgreementProtocolList(vec![AgreementProtocol::new(BASIC_PROTOCOL)]));
        }
        if self.is_empty() {
            return Ok(other.clone());
        }
        if other.is_empty() {
            return Ok(self.clone());
        }

        let mut common = Vec::new();
        for mine in self.iter() {
            let Some(theirs) = other.iter().find(|p| p.name == mine.name) else {
                continue;
            };
            // A protocol whose backends do not overlap is not usable
            if let Ok(blockchains) = mine.blockchains.intersects_with(&theirs.blockchains) {
                common.push(AgreementProtocol {
                    name: mine.name.clone(),
                    blockchains,
                });
            }
        }

        if common.is_empty() {
            return Err(PolicyError::AgreementProtocol(format!(
                "{} was not found in {}",
                self, other
            )));
        }
        Ok(AgreementProtocolList(common))
    }

    pub fn concatenate(&mut self, other: &AgreementProtocolList) {
        for protocol in other.iter() {
            if !self.contains(&protocol.name) {
                self.0.push(protocol.clone());
            }
        }
    }

    /// A list holding only the first entry
    pub fn single_element(&self) -> AgreementProtocolList {
        AgreementProtocolList(self.0.iter().take(1).cloned().collect())
    }

    pub fn add_agreement_protocol(&mut self, protocol: AgreementProtocol) -> Result<(), PolicyError> {
        if self.contains(&protocol.name) {
            return Err(PolicyError::Duplicate(protocol.name));
        }
        self.0.push(protocol);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|p| p.name == name)
    }
}

impl Deref for AgreementProtocolList {
    type Target = [AgreementProtocol];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<AgreementProtocol>> for AgreementProtocolList {
    fn from(list: Vec<AgreementProtocol>) -> Self {
        Self(list)
    }
}

impl fmt::Display for AgreementProtocolList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|p| p.name.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Blockchain;
    use serde_json::json;

    fn list(names: &[&str]) -> AgreementProtocolList {
        names.iter().map(|n| AgreementProtocol::new(*n)).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_empty_lists_default_to_basic() {
        let result = AgreementProtocolList::new().intersects_with(&AgreementProtocolList::new()).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, BASIC_PROTOCOL);

        let one = list(&[CITIZEN_SCIENTIST]);
        assert_eq!(AgreementProtocolList::new().intersects_with(&one).unwrap(), one);
    }

    #[test]
    fn test_intersection_is_symmetric_by_name() {
        let a = list(&[BASIC_PROTOCOL, CITIZEN_SCIENTIST]);
        let b = list(&[CITIZEN_SCIENTIST, "Other"]);

        let ab = a.intersects_with(&b).unwrap();
        let ba = b.intersects_with(&a).unwrap();
        assert_eq!(ab.len(), 1);
        assert!(ab.iter().all(|p| ba.contains(&p.name)));

        assert!(matches!(
            list(&[BASIC_PROTOCOL]).intersects_with(&list(&["Other"])),
            Err(PolicyError::AgreementProtocol(_))
        ));
    }

    #[test]
    fn test_blockchains_must_overlap() {
        let bc1: BlockchainList = vec![Blockchain::new("hyperledger", json!({"peer":"a"}))].into();
        let bc2: BlockchainList = vec![Blockchain::new("hyperledger", json!({"peer":"b"}))].into();

        let a: AgreementProtocolList = vec![AgreementProtocol::new(CITIZEN_SCIENTIST).with_blockchains(bc1.clone())].into();
        let b: AgreementProtocolList = vec![AgreementProtocol::new(CITIZEN_SCIENTIST).with_blockchains(bc2)].into();
        assert!(a.intersects_with(&b).is_err());

        let open: AgreementProtocolList = vec![AgreementProtocol::new(CITIZEN_SCIENTIST)].into();
        let result = a.intersects_with(&open).unwrap();
        assert_eq!(result[0].blockchains, bc1);
    }

    #[test]
    fn test_add_concatenate_single() {
        let mut protocols = list(&[BASIC_PROTOCOL]);
        assert!(protocols.add_agreement_protocol(AgreementProtocol::new(BASIC_PROTOCOL)).is_err());
        protocols.concatenate(&list(&[BASIC_PROTOCOL, CITIZEN_SCIENTIST]));
        assert_eq!(protocols.len(), 2);

        let single = protocols.single_element();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].name, BASIC_PROTOCOL);
    }
}

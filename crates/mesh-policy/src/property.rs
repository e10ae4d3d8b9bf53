//! Advertised properties and property lists.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::is_version_string;

/// Errors for property validation and list manipulation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropertyError {
    #[error("Property must include a name: {0}")]
    MissingName(String),

    #[error("Property {name} has value {value}, expected type {expected}")]
    TypeMismatch {
        name: String,
        value: String,
        expected: PropertyType,
    },

    #[error("Property {0} with value {1} is not a valid version string")]
    InvalidVersion(String, String),

    #[error("Property list already has an element named {0}")]
    Duplicate(String),

    #[error("Property {0} not found")]
    NotFound(String),

    #[error("Property {name} has value {left} and {right}")]
    Conflict {
        name: String,
        left: String,
        right: String,
    },
}

/// Declared type of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    #[serde(rename = "string")]
    String,

    #[serde(rename = "version")]
    Version,

    #[serde(rename = "boolean")]
    Boolean,

    #[serde(rename = "int")]
    Integer,

    #[serde(rename = "float")]
    Float,

    #[serde(rename = "list of string")]
    ListOfString,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::String => "string",
            PropertyType::Version => "version",
            PropertyType::Boolean => "boolean",
            PropertyType::Integer => "int",
            PropertyType::Float => "float",
            PropertyType::ListOfString => "list of string",
        };
        write!(f, "{}", name)
    }
}

/// The value of a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<String>),
}

impl PropertyValue {
    pub fn is_numeric(&self) -> bool {
        matches!(self, PropertyValue::Integer(_) | PropertyValue::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(i) => Some(*i as f64),
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Type-aware equality: numbers compare numerically, lists compare as sets
    pub fn is_same(&self, other: &PropertyValue) -> bool {
        match (self, other) {
            (PropertyValue::List(a), PropertyValue::List(b)) => {
                a.iter().all(|x| b.contains(x)) && b.iter().all(|x| a.contains(x))
            }
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_f64() == b.as_f64(),
            (a, b) => a == b,
        }
    }

    fn matches_type(&self, declared: PropertyType) -> bool {
        match (declared, self) {
            (PropertyType::Boolean, PropertyValue::Boolean(_)) => true,
            (PropertyType::Integer, PropertyValue::Integer(_)) => true,
            (PropertyType::Integer, PropertyValue::Float(f)) => f.fract() == 0.0,
            (PropertyType::Float, v) => v.is_numeric(),
            (PropertyType::String, PropertyValue::String(_)) => true,
            (PropertyType::Version, PropertyValue::String(_)) => true,
            (PropertyType::ListOfString, PropertyValue::List(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Boolean(b) => write!(f, "{}", b),
            PropertyValue::Integer(i) => write!(f, "{}", i),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::String(s) => write!(f, "{}", s),
            PropertyValue::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Integer(i)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Boolean(b)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(items: Vec<String>) -> Self {
        PropertyValue::List(items)
    }
}

/// A named value advertised by a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Property name
    pub name: String,

    /// Property value
    pub value: PropertyValue,

    /// Optional declared type, checked by `PropertyList::validate`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<PropertyType>,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            property_type: None,
        }
    }

    pub fn with_type(mut self, property_type: PropertyType) -> Self {
        self.property_type = Some(property_type);
        self
    }

    /// Same name and same value. Declared types must agree when both are present.
    pub fn is_same(&self, other: &Property) -> bool {
        if self.name != other.name {
            return false;
        }
        if let (Some(a), Some(b)) = (self.property_type, other.property_type) {
            if a != b {
                return false;
            }
        }
        self.value.is_same(&other.value)
    }

    pub fn validate(&self) -> Result<(), PropertyError> {
        if self.name.is_empty() {
            return Err(PropertyError::MissingName(self.to_string()));
        }

        let Some(declared) = self.property_type else {
            return Ok(());
        };

        if !self.value.matches_type(declared) {
            return Err(PropertyError::TypeMismatch {
                name: self.name.clone(),
                value: self.value.to_string(),
                expected: declared,
            });
        }

        if declared == PropertyType::Version {
            if let PropertyValue::String(v) = &self.value {
                if !is_version_string(v) {
                    return Err(PropertyError::InvalidVersion(self.name.clone(), v.clone()));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// An ordered list of properties, unique by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyList(Vec<Property>);

impl PropertyList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add a property, replacing an existing one of the same name only when asked to
    pub fn add_property(&mut self, property: Property, replace_existing: bool) -> Result<(), PropertyError> {
        property.validate()?;

        if let Some(existing) = self.0.iter_mut().find(|p| p.name == property.name) {
            if replace_existing {
                *existing = property;
                return Ok(());
            }
            return Err(PropertyError::Duplicate(property.name));
        }

        self.0.push(property);
        Ok(())
    }

    /// Union with `other`. Properties already present are kept unless `replace_existing` is set.
    ///
    /// Both lists are validated first and `self` is left untouched when either is invalid.
    pub fn merge_with(&mut self, other: &PropertyList, replace_existing: bool) -> Result<(), PropertyError> {
        self.validate()?;
        other.validate()?;
        for property in other.iter() {
            if self.has_property(&property.name) && !replace_existing {
                continue;
            }
            self.add_property(property.clone(), replace_existing)?;
        }
        Ok(())
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.0.iter().any(|p| p.name == name)
    }

    pub fn get_property(&self, name: &str) -> Result<&Property, PropertyError> {
        self.0
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PropertyError::NotFound(name.to_string()))
    }

    /// Two lists are compatible when they never give the same name two different values
    pub fn is_compatible_with(&self, other: &PropertyList) -> Result<(), PropertyError> {
        for mine in self.iter() {
            for theirs in other.iter() {
                if mine.name == theirs.name && !mine.is_same(theirs) {
                    return Err(PropertyError::Conflict {
                        name: mine.name.clone(),
                        left: mine.value.to_string(),
                        right: theirs.value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Every property in this list has an equal counterpart in `other`
    pub fn is_same(&self, other: &PropertyList) -> bool {
        self.iter().all(|p| other.iter().any(|o| p.is_same(o)))
    }

    pub fn validate(&self) -> Result<(), PropertyError> {
        for (i, property) in self.iter().enumerate() {
            property.validate()?;
            if self.0[..i].iter().any(|p| p.name == property.name) {
                return Err(PropertyError::Duplicate(property.name.clone()));
            }
        }
        Ok(())
    }
}

impl Deref for PropertyList {
    type Target = [Property];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Property>> for PropertyList {
    fn from(properties: Vec<Property>) -> Self {
        Self(properties)
    }
}

impl FromIterator<Property> for PropertyList {
    fn from_iter<T: IntoIterator<Item = Property>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for PropertyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.iter().map(|p| p.to_string()).collect();
        write!(f, "[{}]", items.join(", "))
    }
}

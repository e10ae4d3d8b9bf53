//! Counterparty requirements: a boolean tree of property comparisons.
//!
//! On disk the tree keeps its map shape, e.g.
//! `{"and":[{"name":"gpu","value":true},{"or":[{"name":"memory","value":2048,"op":">="}]}]}`.
//! In memory it is an [`Expression`], so malformed trees are rejected when they are parsed
//! instead of when they are evaluated.

use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::constraint::{BooleanJoiner, ConstraintExpression, PluginRegistry, DANGLING_JOINER};
use crate::property::{Property, PropertyList, PropertyValue};

const AND: &str = "and";
const OR: &str = "or";
const NOT: &str = "not";

/// Errors raised while building, validating or evaluating requirements
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("Required property expression not valid: {0}")]
    InvalidExpression(String),

    #[error("Unsupported comparison operator {0}")]
    InvalidOperator(String),

    #[error("Operator {op} cannot be applied to non-numeric value {value}")]
    OperatorTypeMismatch { op: Comparison, value: String },

    #[error("Property {name} with value {value} not in {properties}")]
    Unsatisfied {
        name: String,
        value: String,
        properties: String,
    },

    #[error("One of Required Properties {expression} not in {properties}")]
    NoAlternativeSatisfied {
        expression: String,
        properties: String,
    },

    #[error("Negated requirement {expression} is satisfied by {properties}")]
    NegationSatisfied {
        expression: String,
        properties: String,
    },

    #[error("No constraint language plugin claims {0}")]
    NoPlugin(String),

    #[error("Constraint {0} is claimed by more than one plugin: {1}")]
    AmbiguousPlugin(String, String),

    #[error("Unable to convert constraint {0}: {1}")]
    Translation(String, String),
}

/// Comparison operator of a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    LessThan,
    GreaterThan,
    Equal,
    LessOrEqual,
    GreaterOrEqual,
    NotEqual,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::LessThan => "<",
            Comparison::GreaterThan => ">",
            Comparison::Equal => "==",
            Comparison::LessOrEqual => "<=",
            Comparison::GreaterOrEqual => ">=",
            Comparison::NotEqual => "!=",
        }
    }

    /// Ordering operators only make sense for numeric values
    pub fn is_ordering(&self) -> bool {
        !matches!(self, Comparison::Equal | Comparison::NotEqual)
    }

    fn apply_f64(&self, actual: f64, required: f64) -> bool {
        match self {
            Comparison::LessThan => actual < required,
            Comparison::GreaterThan => actual > required,
            Comparison::Equal => actual == required,
            Comparison::LessOrEqual => actual <= required,
            Comparison::GreaterOrEqual => actual >= required,
            Comparison::NotEqual => actual != required,
        }
    }
}

impl FromStr for Comparison {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(Comparison::LessThan),
            ">" => Ok(Comparison::GreaterThan),
            "==" => Ok(Comparison::Equal),
            "<=" => Ok(Comparison::LessOrEqual),
            ">=" => Ok(Comparison::GreaterOrEqual),
            "!=" => Ok(Comparison::NotEqual),
            other => Err(ConstraintError::InvalidOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single `name op value` comparison
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyExpression {
    name: String,
    value: PropertyValue,
    op: Option<Comparison>,
}

impl PropertyExpression {
    /// Build a leaf. Ordering operators are rejected for non-numeric values.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
        op: Option<Comparison>,
    ) -> Result<Self, ConstraintError> {
        let name = name.into();
        let value = value.into();

        if name.is_empty() {
            return Err(ConstraintError::InvalidExpression(format!(
                "property expression with value {} has no name",
                value
            )));
        }
        if let Some(op) = op {
            if op.is_ordering() && !value.is_numeric() {
                return Err(ConstraintError::OperatorTypeMismatch {
                    op,
                    value: value.to_string(),
                });
            }
        }

        Ok(Self { name, value, op })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    /// The effective operator, equality when none was given
    pub fn operator(&self) -> Comparison {
        self.op.unwrap_or(Comparison::Equal)
    }

    /// The first property with a matching name decides the outcome
    pub fn is_satisfied_by(&self, properties: &[Property]) -> bool {
        let op = self.operator();
        for property in properties.iter().filter(|p| p.name == self.name) {
            match (&property.value, &self.value) {
                (actual, required) if actual.is_numeric() && required.is_numeric() => {
                    if let (Some(a), Some(r)) = (actual.as_f64(), required.as_f64()) {
                        return op.apply_f64(a, r);
                    }
                }
                (PropertyValue::List(items), PropertyValue::String(required)) => {
                    let contained = items.iter().any(|item| item == required);
                    return match op {
                        Comparison::Equal => contained,
                        Comparison::NotEqual => !contained,
                        _ => false,
                    };
                }
                (PropertyValue::Boolean(_), PropertyValue::Boolean(_))
                | (PropertyValue::String(_), PropertyValue::String(_))
                | (PropertyValue::List(_), PropertyValue::List(_)) => {
                    let same = property.value.is_same(&self.value);
                    return match op {
                        Comparison::Equal => same,
                        Comparison::NotEqual => !same,
                        _ => false,
                    };
                }
                // Mismatched types never compare, keep looking
                _ => continue,
            }
        }
        false
    }

    fn from_value(map: &Map<String, Value>) -> Result<Self, ConstraintError> {
        let name = match map.get("name") {
            Some(Value::String(name)) => name.clone(),
            _ => {
                return Err(ConstraintError::InvalidExpression(format!(
                    "property expression {} has no string name",
                    Value::Object(map.clone())
                )))
            }
        };
        let value: PropertyValue = match map.get("value") {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                ConstraintError::InvalidExpression(format!("property {} has unsupported value {}: {}", name, raw, e))
            })?,
            None => {
                return Err(ConstraintError::InvalidExpression(format!(
                    "property expression {} has no value",
                    name
                )))
            }
        };
        let op = match map.get("op") {
            None => None,
            Some(Value::String(op)) if op.is_empty() => None,
            Some(Value::String(op)) => Some(op.parse()?),
            Some(other) => return Err(ConstraintError::InvalidOperator(other.to_string())),
        };

        PropertyExpression::new(name, value, op)
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert(
            "value".to_string(),
            serde_json::to_value(&self.value).unwrap_or(Value::Null),
        );
        if let Some(op) = self.op {
            map.insert("op".to_string(), Value::String(op.as_str().to_string()));
        }
        Value::Object(map)
    }
}

impl fmt::Display for PropertyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.operator(), self.value)
    }
}

/// A node of the requirement tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Leaf(PropertyExpression),
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    pub fn leaf(
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
        op: Option<Comparison>,
    ) -> Result<Self, ConstraintError> {
        Ok(Expression::Leaf(PropertyExpression::new(name, value, op)?))
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Expression::Leaf(_))
    }

    /// Evaluate against `properties`, explaining the first unmet requirement
    pub fn is_satisfied_by(&self, properties: &[Property]) -> Result<(), ConstraintError> {
        match self {
            Expression::Leaf(leaf) => {
                if leaf.is_satisfied_by(properties) {
                    Ok(())
                } else {
                    Err(ConstraintError::Unsatisfied {
                        name: leaf.name.clone(),
                        value: leaf.value.to_string(),
                        properties: describe(properties),
                    })
                }
            }
            Expression::And(children) => {
                for child in children {
                    child.is_satisfied_by(properties)?;
                }
                Ok(())
            }
            Expression::Or(children) => {
                if children.iter().any(|child| child.is_satisfied_by(properties).is_ok()) {
                    return Ok(());
                }
                Err(ConstraintError::NoAlternativeSatisfied {
                    expression: self.to_string(),
                    properties: describe(properties),
                })
            }
            Expression::Not(child) => match child.is_satisfied_by(properties) {
                Ok(()) => Err(ConstraintError::NegationSatisfied {
                    expression: child.to_string(),
                    properties: describe(properties),
                }),
                Err(_) => Ok(()),
            },
        }
    }

    /// Parse a JSON node, either a leaf or a single-key control map
    pub fn from_value(value: &Value) -> Result<Self, ConstraintError> {
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(ConstraintError::InvalidExpression(format!(
                    "{} is not a property expression or control operator",
                    other
                )))
            }
        };

        if map.contains_key("name") || map.contains_key("value") {
            return Ok(Expression::Leaf(PropertyExpression::from_value(map)?));
        }

        if map.len() != 1 {
            return Err(ConstraintError::InvalidExpression(format!(
                "{} should have 1 top level key, has {}",
                value,
                map.len()
            )));
        }

        let Some((key, body)) = map.iter().next() else {
            return Err(ConstraintError::InvalidExpression(value.to_string()));
        };
        let elements = match body {
            Value::Array(elements) => elements,
            other => {
                return Err(ConstraintError::InvalidExpression(format!(
                    "control operator {} value is not an array, is {}",
                    key, other
                )))
            }
        };
        let children = elements
            .iter()
            .map(Expression::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        match key.as_str() {
            AND => Ok(Expression::And(children)),
            OR => Ok(Expression::Or(children)),
            NOT => {
                let mut children = children;
                if children.len() != 1 {
                    return Err(ConstraintError::InvalidExpression(format!(
                        "not operator takes exactly 1 element, has {}",
                        children.len()
                    )));
                }
                Ok(Expression::Not(Box::new(children.remove(0))))
            }
            other => Err(ConstraintError::InvalidExpression(format!(
                "top level key has to be one of and, or, not, is {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        let (key, children) = match self {
            Expression::Leaf(leaf) => return leaf.to_value(),
            Expression::And(children) => (AND, children.iter().map(Expression::to_value).collect()),
            Expression::Or(children) => (OR, children.iter().map(Expression::to_value).collect()),
            Expression::Not(child) => (NOT, vec![child.to_value()]),
        };
        let mut map = Map::new();
        map.insert(key.to_string(), Value::Array(children));
        Value::Object(map)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

fn describe(properties: &[Property]) -> String {
    let items: Vec<String> = properties.iter().map(|p| p.to_string()).collect();
    format!("[{}]", items.join(", "))
}

/// Requirements a counterparty's properties must satisfy. Empty means no requirement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct RequiredProperty {
    root: Option<Expression>,
}

impl RequiredProperty {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a control node as the root of a requirement
    pub fn from_expression(expression: Expression) -> Result<Self, ConstraintError> {
        if !expression.is_control() {
            return Err(ConstraintError::InvalidExpression(format!(
                "top level element {} must be a control operator",
                expression
            )));
        }
        Ok(Self { root: Some(expression) })
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<&Expression> {
        self.root.as_ref()
    }

    /// Children of the root node
    pub fn top_level_elements(&self) -> Vec<&Expression> {
        match &self.root {
            Some(Expression::And(children)) | Some(Expression::Or(children)) => children.iter().collect(),
            Some(Expression::Not(child)) => vec![child.as_ref()],
            _ => Vec::new(),
        }
    }

    /// Structural check. Trees built through this module are always valid; this walks the
    /// tree and reports the first node that would not survive a round trip through the file format.
    pub fn is_valid(&self) -> Result<(), ConstraintError> {
        match &self.root {
            None => Ok(()),
            Some(root) => {
                let reparsed = Expression::from_value(&root.to_value())?;
                if !reparsed.is_control() {
                    return Err(ConstraintError::InvalidExpression(format!(
                        "top level element {} must be a control operator",
                        root
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn is_satisfied_by(&self, properties: &PropertyList) -> Result<(), ConstraintError> {
        self.is_valid()?;
        match &self.root {
            None => Ok(()),
            Some(root) => root.is_satisfied_by(properties),
        }
    }

    /// AND two requirements together. An empty side leaves the other unchanged.
    pub fn merge(&self, other: &RequiredProperty) -> RequiredProperty {
        match (&self.root, &other.root) {
            (None, None) => RequiredProperty::default(),
            (Some(_), None) => self.clone(),
            (None, Some(_)) => other.clone(),
            (Some(mine), Some(theirs)) => RequiredProperty {
                root: Some(Expression::And(vec![mine.clone(), theirs.clone()])),
            },
        }
    }

    /// Translate an external constraint expression into a requirement tree.
    ///
    /// Terms joined by AND are grouped together and every OR starts a new group, giving
    /// `{"or":[{"and":[...]},...]}`. Several constraint strings are ANDed together.
    pub fn from_constraint(
        constraint: &ConstraintExpression,
        registry: &PluginRegistry,
    ) -> Result<Self, ConstraintError> {
        let handler = registry.handler_for(constraint)?;
        debug!("Translating constraint {} with plugin {}", constraint, handler.name());

        let mut result = RequiredProperty::default();
        for text in constraint.iter() {
            let mut remainder = text.clone();
            let mut groups = Vec::new();
            let mut current = Vec::new();
            let mut after_joiner = false;

            loop {
                let Some((term, rest)) = handler.next_expression(&remainder)? else {
                    if after_joiner {
                        return Err(ConstraintError::Translation(text.clone(), DANGLING_JOINER.to_string()));
                    }
                    break;
                };
                let op: Comparison = term.op.parse()?;
                current.push(Expression::leaf(term.name, term.value, Some(op))?);

                let (joiner, rest) = handler.next_operator(&rest)?;
                remainder = rest;
                match joiner {
                    None => break,
                    Some(BooleanJoiner::And) => {}
                    Some(BooleanJoiner::Or) => groups.push(Expression::And(std::mem::take(&mut current))),
                }
                after_joiner = true;
            }
            if current.is_empty() {
                debug!("Constraint {:?} has no terms", text);
                continue;
            }
            groups.push(Expression::And(current));

            let translated = RequiredProperty::from_expression(Expression::Or(groups))?;
            result = result.merge(&translated);
        }

        Ok(result)
    }
}

impl TryFrom<Value> for RequiredProperty {
    type Error = ConstraintError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Null => Ok(RequiredProperty::default()),
            Value::Object(map) if map.is_empty() => Ok(RequiredProperty::default()),
            _ => RequiredProperty::from_expression(Expression::from_value(&value)?),
        }
    }
}

impl From<RequiredProperty> for Value {
    fn from(required: RequiredProperty) -> Self {
        match required.root {
            Some(root) => root.to_value(),
            None => Value::Object(Map::new()),
        }
    }
}

impl fmt::Display for RequiredProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            Some(root) => write!(f, "{}", root),
            None => write!(f, "{{}}"),
        }
    }
}

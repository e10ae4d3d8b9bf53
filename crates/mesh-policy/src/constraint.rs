//! External constraint languages.
//!
//! A constraint expression is a list of strings in some external syntax. A
//! [`ConstraintLanguagePlugin`] claims the syntax and hands out one comparison term and one
//! boolean joiner at a time; [`crate::RequiredProperty::from_constraint`] assembles them into a
//! requirement tree.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::property::PropertyValue;
use crate::required_property::ConstraintError;

/// Name of the built-in text constraint language
pub const TEXT_LANGUAGE: &str = "text";

/// A constraint written in an external language
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintExpression(Vec<String>);

impl ConstraintExpression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(&mut self, constraint: impl Into<String>) {
        self.0.push(constraint.into());
    }
}

impl Deref for ConstraintExpression {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<String>> for ConstraintExpression {
    fn from(constraints: Vec<String>) -> Self {
        Self(constraints)
    }
}

impl From<&str> for ConstraintExpression {
    fn from(constraint: &str) -> Self {
        Self(vec![constraint.to_string()])
    }
}

impl fmt::Display for ConstraintExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Boolean operator between two terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanJoiner {
    And,
    Or,
}

/// One tokenized `name op value` term
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintTerm {
    /// Property name
    pub name: String,

    /// Comparison operator as written by the plugin, one of `<`, `>`, `==`, `<=`, `>=`, `!=`
    pub op: String,

    /// Typed value
    pub value: PropertyValue,
}

/// A constraint syntax that can be translated into requirement trees
pub trait ConstraintLanguagePlugin: Send + Sync {
    /// Registry name of the plugin
    fn name(&self) -> &str;

    /// Whether this plugin understands the syntax of `constraint`
    fn claims(&self, constraint: &ConstraintExpression) -> bool;

    /// Next term and the unconsumed remainder, `None` once the input is exhausted
    fn next_expression(&self, remainder: &str) -> Result<Option<(ConstraintTerm, String)>, ConstraintError>;

    /// Next joiner and the unconsumed remainder, `None` at the end of the input
    fn next_operator(&self, remainder: &str) -> Result<(Option<BooleanJoiner>, String), ConstraintError>;
}

/// Constraint language plugins keyed by name
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn ConstraintLanguagePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in text language
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TextLanguagePlugin::new()));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn ConstraintLanguagePlugin>) {
        debug!("Registering constraint language plugin {}", plugin.name());
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ConstraintLanguagePlugin>> {
        self.plugins.get(name).cloned()
    }

    /// The single plugin claiming `constraint`
    pub fn handler_for(
        &self,
        constraint: &ConstraintExpression,
    ) -> Result<Arc<dyn ConstraintLanguagePlugin>, ConstraintError> {
        let claimants: Vec<&Arc<dyn ConstraintLanguagePlugin>> =
            self.plugins.values().filter(|p| p.claims(constraint)).collect();

        match claimants.as_slice() {
            [] => Err(ConstraintError::NoPlugin(constraint.to_string())),
            [only] => Ok(Arc::clone(only)),
            many => {
                let names: Vec<&str> = many.iter().map(|p| p.name()).collect();
                Err(ConstraintError::AmbiguousPlugin(constraint.to_string(), names.join(", ")))
            }
        }
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Plain text constraints such as `memory >= 1024 && zone == "east" || gpu == true`.
///
/// Values may be double-quoted strings, booleans, integers, floats or bare words.
/// Parentheses are not supported.
#[derive(Debug, Clone, Default)]
pub struct TextLanguagePlugin;

impl TextLanguagePlugin {
    pub fn new() -> Self {
        Self
    }

    fn tokenize(&self, text: &str) -> Result<(), ConstraintError> {
        let mut remainder = text.to_string();
        let mut after_joiner = false;
        loop {
            let Some((_, rest)) = self.next_expression(&remainder)? else {
                if after_joiner {
                    return Err(translation_error(text, DANGLING_JOINER));
                }
                return Ok(());
            };
            let (joiner, rest) = self.next_operator(&rest)?;
            if joiner.is_none() {
                return Ok(());
            }
            remainder = rest;
            after_joiner = true;
        }
    }
}

/// A joiner must be followed by another term
pub(crate) const DANGLING_JOINER: &str = "dangling boolean operator";

const OPERATORS: [&str; 7] = ["<=", ">=", "==", "!=", "<", ">", "="];

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':')
}

fn translation_error(input: &str, reason: &str) -> ConstraintError {
    ConstraintError::Translation(input.to_string(), reason.to_string())
}

fn parse_bare_value(token: &str) -> PropertyValue {
    match token {
        "true" => PropertyValue::Boolean(true),
        "false" => PropertyValue::Boolean(false),
        _ => {
            if let Ok(i) = token.parse::<i64>() {
                PropertyValue::Integer(i)
            } else if let Ok(f) = token.parse::<f64>() {
                PropertyValue::Float(f)
            } else {
                PropertyValue::String(token.to_string())
            }
        }
    }
}

impl ConstraintLanguagePlugin for TextLanguagePlugin {
    fn name(&self) -> &str {
        TEXT_LANGUAGE
    }

    fn claims(&self, constraint: &ConstraintExpression) -> bool {
        !constraint.is_empty() && constraint.iter().all(|text| self.tokenize(text).is_ok())
    }

    fn next_expression(&self, remainder: &str) -> Result<Option<(ConstraintTerm, String)>, ConstraintError> {
        let input = remainder.trim_start();
        if input.is_empty() {
            return Ok(None);
        }

        let name_end = input.find(|c: char| !is_name_char(c)).unwrap_or(input.len());
        if name_end == 0 {
            return Err(translation_error(remainder, "expected a property name"));
        }
        let name = &input[..name_end];

        let after_name = input[name_end..].trim_start();
        let Some(op) = OPERATORS.iter().find(|op| after_name.starts_with(*op)) else {
            return Err(translation_error(remainder, "expected a comparison operator"));
        };
        let after_op = after_name[op.len()..].trim_start();
        let op = if *op == "=" { "==" } else { *op };

        let (value, rest) = if let Some(quoted) = after_op.strip_prefix('"') {
            let Some(close) = quoted.find('"') else {
                return Err(translation_error(remainder, "unterminated string value"));
            };
            (PropertyValue::String(quoted[..close].to_string()), &quoted[close + 1..])
        } else {
            let end = after_op.find(char::is_whitespace).unwrap_or(after_op.len());
            if end == 0 {
                return Err(translation_error(remainder, "expected a value"));
            }
            (parse_bare_value(&after_op[..end]), &after_op[end..])
        };

        let term = ConstraintTerm {
            name: name.to_string(),
            op: op.to_string(),
            value,
        };
        Ok(Some((term, rest.to_string())))
    }

    fn next_operator(&self, remainder: &str) -> Result<(Option<BooleanJoiner>, String), ConstraintError> {
        let input = remainder.trim_start();
        if input.is_empty() {
            return Ok((None, String::new()));
        }

        let word_end = input.find(char::is_whitespace).unwrap_or(input.len());
        let (joiner, consumed) = if input.starts_with("&&") {
            (BooleanJoiner::And, 2)
        } else if input.starts_with("||") {
            (BooleanJoiner::Or, 2)
        } else if input[..word_end].eq_ignore_ascii_case("and") {
            (BooleanJoiner::And, word_end)
        } else if input[..word_end].eq_ignore_ascii_case("or") {
            (BooleanJoiner::Or, word_end)
        } else {
            return Err(translation_error(
                remainder,
                "no control operator found, expecting one of AND, &&, OR, ||",
            ));
        };

        Ok((Some(joiner), input[consumed..].to_string()))
    }
}

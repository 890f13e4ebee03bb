//! Rollout strategy definitions.
//!
//! Strategies are immutable once decoded from a server message. Evaluation
//! lives in [`crate::evaluator`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A rule set plus optional percentage split that selects a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutStrategy {
    /// Server-assigned identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Rules that must all hold for the strategy to match.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Percentage boundary (0-100) applied after the rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    /// Variant served when the strategy matches. Absent means the record's
    /// base value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl RolloutStrategy {
    /// Create a strategy serving `value` with no rules and no percentage.
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            id: None,
            name: None,
            rules: Vec::new(),
            percentage: None,
            value: Some(value.into()),
        }
    }

    /// Set the strategy identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Append a rule.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Set the percentage boundary.
    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = Some(percentage);
        self
    }
}

/// A single attribute condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Context attribute the rule reads.
    pub attribute: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Operand set.
    #[serde(default)]
    pub values: Vec<Value>,
    /// Semantic type used for comparisons.
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
}

impl Rule {
    /// Create a string-typed rule.
    pub fn new(
        attribute: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
            field_type: FieldType::String,
        }
    }

    /// Override the semantic type of the operands.
    pub fn with_field_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }
}

/// Rule comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equals,
    NotEquals,
    Includes,
    Excludes,
    GreaterThan,
    GreaterEquals,
    LessThan,
    LessEquals,
    StartsWith,
    EndsWith,
    RegexMatch,
    /// An operator this client does not know. Never matches.
    #[serde(other)]
    Unknown,
}

/// Semantic type of a rule's operands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    /// Lexical comparison.
    #[default]
    String,
    /// Numeric comparison.
    Number,
    /// Dotted version comparison (`1.2.3`, `v2`, `1.10.0-beta.1`).
    SemanticVersion,
    /// Boolean equality.
    Boolean,
    /// A type this client does not know. Rules using it never match.
    #[serde(other)]
    Unknown,
}

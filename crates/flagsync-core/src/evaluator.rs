//! Client-side rollout strategy evaluation.
//!
//! Strategies are evaluated in declared order. A strategy matches when every
//! rule holds for the context and, if it carries a percentage, the caller's
//! bucket falls inside it. The first match wins; otherwise the record's base
//! value applies.
//!
//! # Percentage buckets
//!
//! The bucket is `murmur3_x86_32("{identity_key}{feature_key}", seed 0) %
//! 1_000_000`. A strategy with percentage `p` applies when the bucket is
//! below `round(p * 10_000)`. The result depends only on the two keys, so a
//! caller sees the same rollout decision across processes and restarts.

use std::cmp::Ordering;
use std::io::Cursor;

use murmur3::murmur3_32;
use regex::Regex;
use serde_json::Value;
use tracing::{trace, warn};

use crate::context::{AttributeValue, EvaluationContext};
use crate::feature::FeatureRecord;
use crate::strategy::{FieldType, Operator, RolloutStrategy, Rule};

/// Number of percentage buckets (four decimal places of a percent).
pub const PERCENTAGE_BUCKETS: u32 = 1_000_000;

/// Outcome of evaluating a record against a context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation<'a> {
    /// The strategy at `index` applies.
    Strategy {
        index: usize,
        strategy: &'a RolloutStrategy,
    },
    /// No strategy applies; the base value is served.
    Default,
}

impl<'a> Evaluation<'a> {
    /// Value served for this outcome.
    pub fn value(&self, record: &'a FeatureRecord) -> &'a Value {
        match self {
            Evaluation::Strategy { strategy, .. } => strategy.value.as_ref().unwrap_or(&record.value),
            Evaluation::Default => &record.value,
        }
    }
}

/// Evaluate a record's strategies against a context.
pub fn evaluate<'a>(record: &'a FeatureRecord, context: &EvaluationContext) -> Evaluation<'a> {
    for (index, strategy) in record.strategies.iter().enumerate() {
        if strategy_matches(&record.key, strategy, context) {
            trace!(key = %record.key, index, "strategy matched");
            return Evaluation::Strategy { index, strategy };
        }
    }
    Evaluation::Default
}

/// Resolve the value served for a record.
///
/// Without a context strategies cannot be meaningfully evaluated and the
/// base value is returned.
pub fn resolve_value<'a>(record: &'a FeatureRecord, context: Option<&EvaluationContext>) -> &'a Value {
    match context {
        Some(context) if record.has_strategies() => evaluate(record, context).value(record),
        _ => &record.value,
    }
}

/// Whether a single strategy applies to the context.
pub fn strategy_matches(
    feature_key: &str,
    strategy: &RolloutStrategy,
    context: &EvaluationContext,
) -> bool {
    if !strategy.rules.iter().all(|rule| rule_matches(rule, context)) {
        return false;
    }

    match strategy.percentage {
        None => true,
        Some(percentage) => match context.identity_key.as_deref() {
            Some(identity) => {
                within_percentage(percentage_bucket(feature_key, identity), percentage)
            }
            // Every bucket qualifies, so no identity is needed
            None if threshold(percentage) >= PERCENTAGE_BUCKETS => true,
            None => {
                trace!(key = %feature_key, "percentage strategy skipped, no identity key");
                false
            }
        },
    }
}

/// Deterministic bucket in `0..PERCENTAGE_BUCKETS` for a feature and identity.
pub fn percentage_bucket(feature_key: &str, identity_key: &str) -> u32 {
    let input = format!("{}{}", identity_key, feature_key);
    let hash = murmur3_32(&mut Cursor::new(input.as_bytes()), 0).unwrap_or(0);
    hash % PERCENTAGE_BUCKETS
}

fn threshold(percentage: f64) -> u32 {
    (percentage.clamp(0.0, 100.0) * 10_000.0).round() as u32
}

fn within_percentage(bucket: u32, percentage: f64) -> bool {
    bucket < threshold(percentage)
}

/// Whether a rule holds for the context. A missing attribute fails the rule.
pub fn rule_matches(rule: &Rule, context: &EvaluationContext) -> bool {
    let Some(actual) = context.attribute(&rule.attribute) else {
        return false;
    };

    match rule.operator {
        Operator::Equals => any_ordering(rule, &actual, |o| o == Ordering::Equal),
        Operator::NotEquals => {
            typed(rule.field_type, &actual).is_some()
                && !any_ordering(rule, &actual, |o| o == Ordering::Equal)
        }
        Operator::GreaterThan => any_ordering(rule, &actual, |o| o == Ordering::Greater),
        Operator::GreaterEquals => any_ordering(rule, &actual, |o| o != Ordering::Less),
        Operator::LessThan => any_ordering(rule, &actual, |o| o == Ordering::Less),
        Operator::LessEquals => any_ordering(rule, &actual, |o| o != Ordering::Greater),
        Operator::Includes => any_text(rule, &actual, |a, b| a.contains(b)),
        Operator::Excludes => !any_text(rule, &actual, |a, b| a.contains(b)),
        Operator::StartsWith => any_text(rule, &actual, |a, b| a.starts_with(b)),
        Operator::EndsWith => any_text(rule, &actual, |a, b| a.ends_with(b)),
        Operator::RegexMatch => any_text(rule, &actual, regex_matches),
        Operator::Unknown => false,
    }
}

fn any_ordering(rule: &Rule, actual: &AttributeValue, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(actual) = typed(rule.field_type, actual) else {
        return false;
    };
    rule.values
        .iter()
        .filter_map(|operand| typed_operand(rule.field_type, operand))
        .filter_map(|operand| actual.compare(&operand))
        .any(accept)
}

fn any_text(rule: &Rule, actual: &AttributeValue, accept: impl Fn(&str, &str) -> bool) -> bool {
    let actual = actual.to_string();
    rule.values
        .iter()
        .filter_map(operand_text)
        .any(|operand| accept(&actual, &operand))
}

fn regex_matches(actual: &str, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(actual),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid rule regex");
            false
        }
    }
}

fn operand_text(operand: &Value) -> Option<String> {
    match operand {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A value interpreted under a rule's declared field type.
#[derive(Debug, Clone, PartialEq)]
enum Typed {
    Text(String),
    Number(f64),
    Version(semver::Version),
    Boolean(bool),
}

impl Typed {
    fn compare(&self, other: &Typed) -> Option<Ordering> {
        match (self, other) {
            (Typed::Text(a), Typed::Text(b)) => Some(a.cmp(b)),
            (Typed::Number(a), Typed::Number(b)) => a.partial_cmp(b),
            (Typed::Version(a), Typed::Version(b)) => Some(a.cmp(b)),
            (Typed::Boolean(a), Typed::Boolean(b)) => (a == b).then_some(Ordering::Equal),
            _ => None,
        }
    }
}

fn typed(field_type: FieldType, value: &AttributeValue) -> Option<Typed> {
    match (field_type, value) {
        (FieldType::String, v) => Some(Typed::Text(v.to_string())),
        (FieldType::Number, AttributeValue::Number(n)) => Some(Typed::Number(*n)),
        (FieldType::Number, AttributeValue::String(s)) => parse_number(s),
        (FieldType::SemanticVersion, AttributeValue::String(s)) => parse_version(s),
        (FieldType::Boolean, AttributeValue::Boolean(b)) => Some(Typed::Boolean(*b)),
        (FieldType::Boolean, AttributeValue::String(s)) => parse_bool(s),
        _ => None,
    }
}

fn typed_operand(field_type: FieldType, operand: &Value) -> Option<Typed> {
    match (field_type, operand) {
        (FieldType::String, v) => operand_text(v).map(Typed::Text),
        (FieldType::Number, Value::Number(n)) => n.as_f64().map(Typed::Number),
        (FieldType::Number, Value::String(s)) => parse_number(s),
        (FieldType::SemanticVersion, Value::String(s)) => parse_version(s),
        (FieldType::Boolean, Value::Bool(b)) => Some(Typed::Boolean(*b)),
        (FieldType::Boolean, Value::String(s)) => parse_bool(s),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<Typed> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(Typed::Number)
}

fn parse_bool(s: &str) -> Option<Typed> {
    match s {
        "true" => Some(Typed::Boolean(true)),
        "false" => Some(Typed::Boolean(false)),
        _ => None,
    }
}

/// Parse a dotted version, padding missing minor/patch components.
fn parse_version(s: &str) -> Option<Typed> {
    let s = s.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    let (core, rest) = match s.find(['-', '+']) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let padded = match core.split('.').count() {
        1 => format!("{}.0.0{}", core, rest),
        2 => format!("{}.0{}", core, rest),
        _ => s.to_string(),
    };
    semver::Version::parse(&padded).ok().map(Typed::Version)
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use crate::feature::FeatureType;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn bucket_is_deterministic(identity in "[a-zA-Z0-9-]{1,40}", key in "[a-z][a-z0-9_.]{1,40}") {
            prop_assert_eq!(percentage_bucket(&key, &identity), percentage_bucket(&key, &identity));
            prop_assert!(percentage_bucket(&key, &identity) < PERCENTAGE_BUCKETS);
        }

        #[test]
        fn percentage_is_monotonic(identity in "[a-zA-Z0-9-]{1,40}", key in "[a-z][a-z0-9_.]{1,40}") {
            let bucket = percentage_bucket(&key, &identity);
            let mut included = false;
            for pct in 0..=100 {
                let now = within_percentage(bucket, pct as f64);
                prop_assert!(!included || now, "excluded at {}% after inclusion", pct);
                included = now;
            }
        }

        #[test]
        fn evaluation_ignores_attribute_insertion_order(
            attrs in prop::collection::vec(("[a-z]{1,8}", "[a-z0-9]{1,8}"), 0..8),
            identity in "[a-zA-Z0-9]{1,20}",
            pct in 0.0f64..=100.0,
        ) {
            let record = FeatureRecord::new("rollout", FeatureType::Boolean, false, 1)
                .with_strategy(RolloutStrategy::new(true).with_percentage(pct));

            let mut forward = EvaluationContext::new().with_identity_key(identity.clone());
            for (name, value) in &attrs {
                forward.set_attribute(name.clone(), value.as_str());
            }
            let mut backward = EvaluationContext::new().with_identity_key(identity);
            for (name, value) in forward.custom.iter().rev() {
                backward.set_attribute(name.clone(), value.clone());
            }

            prop_assert_eq!(
                resolve_value(&record, Some(&forward)),
                resolve_value(&record, Some(&backward))
            );
        }
    }
}

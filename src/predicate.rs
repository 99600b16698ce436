//! Identifier predicate evaluation
//!
//! Decides dimension membership from a lookup of live group property
//! values. Evaluation never fails: a value of the wrong shape simply
//! does not match.

use serde_json::Value;

use crate::schema::{Condition, DimensionDefinition, IdentifierNode, IdentifierRule};

/// Evaluate an identifier tree against group property values
///
/// `lookup(group, property)` returns the current value, or `None` when
/// the property is unset. An empty `AND` is vacuously true and an empty
/// `OR` is false; the resolver rejects both inside dimensions.
pub fn evaluate<F>(node: &IdentifierNode, lookup: &F) -> bool
where
    F: Fn(&str, &str) -> Option<Value>,
{
    match node {
        IdentifierNode::And(children) => children.iter().all(|child| evaluate(child, lookup)),
        IdentifierNode::Or(children) => children.iter().any(|child| evaluate(child, lookup)),
        IdentifierNode::Rule(rule) => evaluate_rule(rule, lookup),
    }
}

/// Evaluate a single leaf
pub fn evaluate_rule<F>(rule: &IdentifierRule, lookup: &F) -> bool
where
    F: Fn(&str, &str) -> Option<Value>,
{
    let value = lookup(&rule.group, &rule.property).unwrap_or(Value::Null);
    matches_condition(&rule.condition, &value)
}

/// Apply one condition to a concrete value
pub fn matches_condition(condition: &Condition, value: &Value) -> bool {
    match condition {
        Condition::Equals(operand) => strict_equals(value, operand),
        Condition::Not(operand) => !strict_equals(value, operand),
        Condition::Contains(needle) => value.as_str().is_some_and(|s| s.contains(needle.as_str())),
        Condition::StartsWith(prefix) => value
            .as_str()
            .is_some_and(|s| s.starts_with(prefix.as_str())),
        Condition::EndsWith(suffix) => value.as_str().is_some_and(|s| s.ends_with(suffix.as_str())),
        Condition::In(set) => set.iter().any(|item| strict_equals(value, item)),
        Condition::NotIn(set) => !set.iter().any(|item| strict_equals(value, item)),
        Condition::Lt(bound) => numeric(value).map(|n| n < *bound).unwrap_or(false),
        Condition::Lte(bound) => numeric(value).map(|n| n <= *bound).unwrap_or(false),
        Condition::Gt(bound) => numeric(value).map(|n| n > *bound).unwrap_or(false),
        Condition::Gte(bound) => numeric(value).map(|n| n >= *bound).unwrap_or(false),
    }
}

/// Type-and-value equality; `1` and `1.0` are the same number
fn strict_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => left == right,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

impl DimensionDefinition {
    /// Whether the current group state places the caller in this dimension
    pub fn matches<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str, &str) -> Option<Value>,
    {
        evaluate(&self.identifiers, lookup)
    }
}

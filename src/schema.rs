//! Tracking plan types and structures
//!
//! Two layers live here. Document types mirror what authors write in
//! events, groups, dimensions and meta files (and the generation config
//! that bundles them). Resolved types are what the resolver hands to
//! generators and the runtime tracker.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// =============================================================================
// Property Types
// =============================================================================

/// Primitive property type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    String,
    Number,
    Boolean,
}

impl PrimitiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveType::String => "string",
            PrimitiveType::Number => "number",
            PrimitiveType::Boolean => "boolean",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(PrimitiveType::String),
            "number" => Some(PrimitiveType::Number),
            "boolean" => Some(PrimitiveType::Boolean),
            _ => None,
        }
    }
}

/// Declared type of a property or meta rule
///
/// Either a primitive, or a fixed set of string literals acting as an enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyType {
    Primitive(PrimitiveType),
    Enum(Vec<String>),
}

impl PropertyType {
    /// Whether a concrete value satisfies this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PropertyType::Primitive(PrimitiveType::String) => value.is_string(),
            PropertyType::Primitive(PrimitiveType::Number) => value.is_number(),
            PropertyType::Primitive(PrimitiveType::Boolean) => value.is_boolean(),
            PropertyType::Enum(allowed) => value
                .as_str()
                .map(|s| allowed.iter().any(|a| a == s))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyType::Primitive(p) => write!(f, "{}", p.as_str()),
            PropertyType::Enum(values) => {
                let quoted: Vec<String> = values.iter().map(|v| format!("\"{}\"", v)).collect();
                write!(f, "one of [{}]", quoted.join(", "))
            }
        }
    }
}

/// Human-readable description of a runtime value, used in type mismatch reports
pub fn describe_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string \"{}\"", s),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

/// A single declared property of an event or group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            optional: false,
            default_value: None,
            description: String::new(),
        }
    }

    /// Mark the property optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Attach a default value
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// A property with a default never needs caller input
    pub fn is_required(&self) -> bool {
        !self.optional && self.default_value.is_none()
    }
}

// =============================================================================
// Events
// =============================================================================

/// Raw `dimensions` field of an event: a bare list means "included"
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DimensionRefs {
    Included(Vec<String>),
    Split {
        #[serde(default)]
        included: Vec<String>,
        #[serde(default)]
        excluded: Vec<String>,
    },
}

/// Normalized dimension selection of an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DimensionRefs")]
pub struct DimensionSelection {
    pub included: Vec<String>,
    pub excluded: Vec<String>,
}

impl From<DimensionRefs> for DimensionSelection {
    fn from(refs: DimensionRefs) -> Self {
        match refs {
            DimensionRefs::Included(included) => Self { included, excluded: Vec::new() },
            DimensionRefs::Split { included, excluded } => Self { included, excluded },
        }
    }
}

impl DimensionSelection {
    /// All referenced dimension names, included first
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.included.iter().chain(self.excluded.iter()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty() && self.excluded.is_empty()
    }
}

/// A trackable event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    /// Stable identifier; filled from the events map key when omitted
    #[serde(default)]
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    #[serde(default, skip_serializing_if = "DimensionSelection::is_empty")]
    pub dimensions: DimensionSelection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
    #[serde(default)]
    pub passthrough: bool,
}

impl EventDefinition {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: String::new(),
            properties: Vec::new(),
            dimensions: DimensionSelection::default(),
            meta: BTreeMap::new(),
            passthrough: false,
        }
    }

    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Contents of an events file
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventsDocument {
    pub events: BTreeMap<String, EventDefinition>,
}

impl<'de> Deserialize<'de> for EventsDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            events: BTreeMap<String, EventDefinition>,
        }

        let mut raw = Raw::deserialize(deserializer)?;
        for (key, event) in raw.events.iter_mut() {
            if event.key.is_empty() {
                event.key = key.clone();
            }
        }
        Ok(Self { events: raw.events })
    }
}

// =============================================================================
// Groups
// =============================================================================

/// A named entity type such as User or Team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDefinition {
    pub name: String,
    pub identified_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl GroupDefinition {
    pub fn new(name: impl Into<String>, identified_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identified_by: identified_by.into(),
            description: String::new(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Contents of a groups file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupsDocument {
    pub groups: Vec<GroupDefinition>,
}

// =============================================================================
// Meta Rules
// =============================================================================

/// Constraint on an event-level metadata field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRuleDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: PropertyType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl MetaRuleDefinition {
    pub fn is_required(&self) -> bool {
        !self.optional && self.default_value.is_none()
    }
}

/// Contents of a meta file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaDocument {
    pub meta: Vec<MetaRuleDefinition>,
}

// =============================================================================
// Dimensions
// =============================================================================

/// Evaluation operator of an identifier leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    Not,
    Contains,
    In,
    NotIn,
    StartsWith,
    EndsWith,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Operator {
    pub const ALL: [Operator; 11] = [
        Operator::Equals,
        Operator::Not,
        Operator::Contains,
        Operator::In,
        Operator::NotIn,
        Operator::StartsWith,
        Operator::EndsWith,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
    ];

    /// Document key of this operator
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::Not => "not",
            Operator::Contains => "contains",
            Operator::In => "in",
            Operator::NotIn => "notIn",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == key)
    }

    /// What the operand must look like, for error reporting
    pub fn expected_operand(&self) -> &'static str {
        match self {
            Operator::Equals | Operator::Not => "a literal value",
            Operator::Contains | Operator::StartsWith | Operator::EndsWith => "a string",
            Operator::In | Operator::NotIn => "an array of literals",
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => "a number",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator together with its typed operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    Equals(Value),
    Not(Value),
    Contains(String),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    StartsWith(String),
    EndsWith(String),
    Lt(f64),
    Lte(f64),
    Gt(f64),
    Gte(f64),
}

impl Condition {
    /// Build a condition, returning `None` when the operand has the wrong shape
    pub fn from_operand(operator: Operator, operand: &Value) -> Option<Self> {
        let condition = match operator {
            Operator::Equals => Condition::Equals(operand.clone()),
            Operator::Not => Condition::Not(operand.clone()),
            Operator::Contains => Condition::Contains(operand.as_str()?.to_string()),
            Operator::StartsWith => Condition::StartsWith(operand.as_str()?.to_string()),
            Operator::EndsWith => Condition::EndsWith(operand.as_str()?.to_string()),
            Operator::In => Condition::In(operand.as_array()?.clone()),
            Operator::NotIn => Condition::NotIn(operand.as_array()?.clone()),
            Operator::Lt => Condition::Lt(operand.as_f64()?),
            Operator::Lte => Condition::Lte(operand.as_f64()?),
            Operator::Gt => Condition::Gt(operand.as_f64()?),
            Operator::Gte => Condition::Gte(operand.as_f64()?),
        };
        Some(condition)
    }

    pub fn operator(&self) -> Operator {
        match self {
            Condition::Equals(_) => Operator::Equals,
            Condition::Not(_) => Operator::Not,
            Condition::Contains(_) => Operator::Contains,
            Condition::In(_) => Operator::In,
            Condition::NotIn(_) => Operator::NotIn,
            Condition::StartsWith(_) => Operator::StartsWith,
            Condition::EndsWith(_) => Operator::EndsWith,
            Condition::Lt(_) => Operator::Lt,
            Condition::Lte(_) => Operator::Lte,
            Condition::Gt(_) => Operator::Gt,
            Condition::Gte(_) => Operator::Gte,
        }
    }
}

/// Resolved identifier leaf: exactly one operator by construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierRule {
    pub property: String,
    pub group: String,
    #[serde(flatten)]
    pub condition: Condition,
}

/// Resolved identifier predicate tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IdentifierNode {
    #[serde(rename = "AND")]
    And(Vec<IdentifierNode>),
    #[serde(rename = "OR")]
    Or(Vec<IdentifierNode>),
    #[serde(untagged)]
    Rule(IdentifierRule),
}

impl IdentifierNode {
    /// Visit every leaf rule in the tree
    pub fn rules(&self) -> Vec<&IdentifierRule> {
        let mut out = Vec::new();
        self.collect_rules(&mut out);
        out
    }

    fn collect_rules<'a>(&'a self, out: &mut Vec<&'a IdentifierRule>) {
        match self {
            IdentifierNode::And(children) | IdentifierNode::Or(children) => {
                for child in children {
                    child.collect_rules(out);
                }
            }
            IdentifierNode::Rule(rule) => out.push(rule),
        }
    }
}

/// Identifier leaf as written in a dimensions file
///
/// Operator keys are kept as a loose map so the resolver can report
/// missing or ambiguous operators instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentifierRuleSpec {
    #[serde(default)]
    pub property: String,
    #[serde(default)]
    pub group: String,
    #[serde(flatten)]
    pub operators: BTreeMap<String, Value>,
}

/// Identifier tree as written in a dimensions file
///
/// A bare array is sugar for a single implicit `AND`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdentifierSpec {
    All(Vec<IdentifierSpec>),
    And {
        #[serde(rename = "AND")]
        and: Vec<IdentifierSpec>,
    },
    Or {
        #[serde(rename = "OR")]
        or: Vec<IdentifierSpec>,
    },
    Rule(IdentifierRuleSpec),
}

/// Dimension as written in a dimensions file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub identifiers: IdentifierSpec,
}

/// Contents of a dimensions file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionsDocument {
    pub dimensions: Vec<DimensionSpec>,
}

/// Resolved audience segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub identifiers: IdentifierNode,
}

// =============================================================================
// Generation Config
// =============================================================================

/// One bundle of files resolved together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTarget {
    pub events: PathBuf,
    #[serde(default, deserialize_with = "one_or_many")]
    pub groups: Vec<PathBuf>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub dimensions: Vec<PathBuf>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub meta: Vec<PathBuf>,
    /// Output destination, opaque to this crate
    pub output: String,
}

/// Top-level generation config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub generates: Vec<GenerationTarget>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PathBuf),
        Many(Vec<PathBuf>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

//! Error types for schema validation, resolution and tracking

use std::path::PathBuf;

use thiserror::Error;

/// Result type for loading operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Fail-fast errors: the input could not be read at all
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Required schema file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("Invalid document format in {}: {reason}", path.display())]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Generation target {index} does not exist (config has {count})")]
    UnknownTarget { index: usize, count: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),
}

/// Every recoverable defect found while validating documents, resolving
/// a target or enforcing the model at runtime.
///
/// These are accumulated and reported together, never thrown.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{document}: {path}: {message}")]
    Structural {
        document: String,
        path: String,
        message: String,
    },

    #[error("{owner}: duplicate property name '{property}'")]
    DuplicatePropertyName { owner: String, property: String },

    #[error("{kind} '{name}' is defined more than once")]
    DuplicateDefinition { kind: &'static str, name: String },

    #[error("dimension '{dimension}': identifier at {path} has no evaluation operator")]
    MissingEvaluationOperator { dimension: String, path: String },

    #[error(
        "dimension '{dimension}': identifier at {path} has several evaluation operators: {}",
        operators.join(", ")
    )]
    AmbiguousEvaluationOperator {
        dimension: String,
        path: String,
        operators: Vec<String>,
    },

    #[error("dimension '{dimension}': operator '{operator}' at {path} expects {expected}")]
    InvalidOperand {
        dimension: String,
        path: String,
        operator: String,
        expected: &'static str,
    },

    #[error("dimension '{dimension}': empty combinator at {path}")]
    EmptyIdentifier { dimension: String, path: String },

    #[error("event '{event}' references unknown dimension '{dimension}'")]
    UnknownDimension { event: String, dimension: String },

    #[error("event '{event}' sets unknown meta field '{field}'")]
    UnknownMetaField { event: String, field: String },

    #[error("event '{event}' is missing required meta field '{field}'")]
    MissingMetaField { event: String, field: String },

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error(
        "unknown group '{group}'{}",
        referenced_by.as_ref().map(|r| format!(" (referenced by {r})")).unwrap_or_default()
    )]
    UnknownGroup {
        group: String,
        referenced_by: Option<String>,
    },

    #[error(
        "dimension '{dimension}' references property '{property}' not declared on group '{group}'"
    )]
    UnknownGroupProperty {
        dimension: String,
        group: String,
        property: String,
    },

    #[error("{owner}: unknown property '{property}'")]
    UnknownProperty { owner: String, property: String },

    #[error("{owner}: missing required property '{property}'")]
    MissingRequiredProperty { owner: String, property: String },

    #[error("{owner}: property '{property}' expected {expected}, got {actual}")]
    TypeMismatch {
        owner: String,
        property: String,
        expected: String,
        actual: String,
    },

    #[error("{callback} callback failed: {message}")]
    SinkCallbackFailure {
        callback: &'static str,
        message: String,
    },

    #[error("{owner}: lazy value for property '{property}' failed: {message}")]
    LazyValueFailure {
        owner: String,
        property: String,
        message: String,
    },
}

impl ValidationError {
    /// Short stable code for reporting
    pub fn code(&self) -> &'static str {
        match self {
            Self::Structural { .. } => "STRUCTURAL",
            Self::DuplicatePropertyName { .. } => "DUPLICATE_PROPERTY_NAME",
            Self::DuplicateDefinition { .. } => "DUPLICATE_DEFINITION",
            Self::MissingEvaluationOperator { .. } => "MISSING_EVALUATION_OPERATOR",
            Self::AmbiguousEvaluationOperator { .. } => "AMBIGUOUS_EVALUATION_OPERATOR",
            Self::InvalidOperand { .. } => "INVALID_OPERAND",
            Self::EmptyIdentifier { .. } => "EMPTY_IDENTIFIER",
            Self::UnknownDimension { .. } => "UNKNOWN_DIMENSION",
            Self::UnknownMetaField { .. } => "UNKNOWN_META_FIELD",
            Self::MissingMetaField { .. } => "MISSING_META_FIELD",
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
            Self::UnknownGroup { .. } => "UNKNOWN_GROUP",
            Self::UnknownGroupProperty { .. } => "UNKNOWN_GROUP_PROPERTY",
            Self::UnknownProperty { .. } => "UNKNOWN_PROPERTY",
            Self::MissingRequiredProperty { .. } => "MISSING_REQUIRED_PROPERTY",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::SinkCallbackFailure { .. } => "SINK_CALLBACK_FAILURE",
            Self::LazyValueFailure { .. } => "LAZY_VALUE_FAILURE",
        }
    }
}

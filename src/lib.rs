//! Tracking Schemas
//!
//! Declarative analytics tracking plans: events, shared entity groups,
//! audience dimensions and event meta rules are authored as separate
//! documents, checked on their own and against each other, and then
//! enforced at runtime on every tracked event and group update.
//!
//! ## Pipeline
//!
//! ```text
//! raw documents ──► validate (per document) ──► resolve (per target) ──► ResolvedSchemaModel
//!                                                                            │
//!                                          ┌─────────────────────────────────┤
//!                                          ▼                                 ▼
//!                                 external generators                  Tracker (runtime)
//! ```
//!
//! - **Validation** reports every structural defect of a document at once.
//! - **Resolution** merges all files of a target and checks dimension,
//!   group and meta references.
//! - **Predicates** evaluate a dimension's identifier tree against live
//!   group property values.
//! - **Tracker** type-checks `track` / `set_properties` calls, fills
//!   defaults, resolves lazy values and dispatches to sinks.

pub mod checksum;
pub mod config;
pub mod error;
pub mod loader;
pub mod predicate;
pub mod resolve;
pub mod schema;
pub mod tracker;
pub mod validate;

pub use checksum::Checksum;
pub use config::SchemaConfig;
pub use error::{Result, SchemaError, ValidationError};
pub use loader::{check_config, load_config, load_target, LoadOptions, TargetOutcome, TargetReport};
pub use predicate::evaluate;
pub use resolve::{resolve, ResolvedSchemaModel};
pub use schema::{
    Condition, DimensionDefinition, EventDefinition, GenerationConfig, GenerationTarget,
    GroupDefinition, IdentifierNode, IdentifierRule, MetaRuleDefinition, Operator,
    PropertyDefinition, PropertyType,
};
pub use tracker::{
    create_tracker, property_map, EventPayload, PropertyMap, PropertyValue, Tracker, TrackerOptions,
};
pub use validate::{validate, Document, DocumentKind, ValidationResult};

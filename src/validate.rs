//! Structural validation of tracking plan documents
//!
//! Each document kind is checked on its raw JSON form so that every
//! defect in a file is reported in one pass. A document is only turned
//! into its typed form when the walk found nothing wrong; there is no
//! partial acceptance.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::schema::{
    describe_value, DimensionsDocument, EventsDocument, GenerationConfig, GroupsDocument,
    MetaDocument, PrimitiveType, PropertyType,
};

/// Event keys become generated method names downstream
const EVENT_KEY_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn event_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(EVENT_KEY_PATTERN).expect("event key pattern is valid"))
}

/// Kind of document being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Events,
    Groups,
    Dimensions,
    Meta,
    Config,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Events => "events",
            DocumentKind::Groups => "groups",
            DocumentKind::Dimensions => "dimensions",
            DocumentKind::Meta => "meta",
            DocumentKind::Config => "config",
        }
    }

    /// Top-level key every document of this kind must carry
    pub fn root_key(&self) -> &'static str {
        match self {
            DocumentKind::Config => "generates",
            other => other.as_str(),
        }
    }
}

/// A structurally valid document of any kind
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Events(EventsDocument),
    Groups(GroupsDocument),
    Dimensions(DimensionsDocument),
    Meta(MetaDocument),
    Config(GenerationConfig),
}

/// Outcome of validating one document
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult<T> {
    /// Present only when `errors` is empty
    pub data: Option<T>,
    pub errors: Vec<ValidationError>,
}

impl<T> ValidationResult<T> {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.data.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ValidationResult<U> {
        ValidationResult {
            data: self.data.map(f),
            errors: self.errors,
        }
    }

    pub fn into_result(self) -> Result<T, Vec<ValidationError>> {
        match self.data {
            Some(data) if self.errors.is_empty() => Ok(data),
            _ => Err(self.errors),
        }
    }
}

/// Validate a raw document of the given kind
pub fn validate(kind: DocumentKind, raw: &Value) -> ValidationResult<Document> {
    validate_named(kind, kind.as_str(), raw)
}

/// Validate a raw document, labelling errors with `document` (usually its file path)
pub fn validate_named(
    kind: DocumentKind,
    document: &str,
    raw: &Value,
) -> ValidationResult<Document> {
    match kind {
        DocumentKind::Events => validate_events(document, raw).map(Document::Events),
        DocumentKind::Groups => validate_groups(document, raw).map(Document::Groups),
        DocumentKind::Dimensions => validate_dimensions(document, raw).map(Document::Dimensions),
        DocumentKind::Meta => validate_meta(document, raw).map(Document::Meta),
        DocumentKind::Config => validate_config(document, raw).map(Document::Config),
    }
}

pub fn validate_events(document: &str, raw: &Value) -> ValidationResult<EventsDocument> {
    let mut checker = Checker::new(document);
    if let Some(events) = checker.root_object(raw, DocumentKind::Events) {
        for (key, event) in events {
            checker.event(key, event);
        }
    }
    checker.finish(raw)
}

pub fn validate_groups(document: &str, raw: &Value) -> ValidationResult<GroupsDocument> {
    let mut checker = Checker::new(document);
    if let Some(groups) = checker.root_array(raw, DocumentKind::Groups) {
        for (i, group) in groups.iter().enumerate() {
            checker.group(&format!("groups[{}]", i), group);
        }
    }
    checker.finish(raw)
}

pub fn validate_dimensions(document: &str, raw: &Value) -> ValidationResult<DimensionsDocument> {
    let mut checker = Checker::new(document);
    if let Some(dimensions) = checker.root_array(raw, DocumentKind::Dimensions) {
        for (i, dimension) in dimensions.iter().enumerate() {
            checker.dimension(&format!("dimensions[{}]", i), dimension);
        }
    }
    checker.finish(raw)
}

pub fn validate_meta(document: &str, raw: &Value) -> ValidationResult<MetaDocument> {
    let mut checker = Checker::new(document);
    if let Some(rules) = checker.root_array(raw, DocumentKind::Meta) {
        for (i, rule) in rules.iter().enumerate() {
            checker.meta_rule(&format!("meta[{}]", i), rule);
        }
    }
    checker.finish(raw)
}

pub fn validate_config(document: &str, raw: &Value) -> ValidationResult<GenerationConfig> {
    let mut checker = Checker::new(document);
    if let Some(targets) = checker.root_array(raw, DocumentKind::Config) {
        if targets.is_empty() {
            checker.error("generates", "at least one generation target is required");
        }
        for (i, target) in targets.iter().enumerate() {
            checker.target(&format!("generates[{}]", i), target);
        }
    }
    checker.finish(raw)
}

/// Accumulates structural errors for one document
struct Checker<'a> {
    document: &'a str,
    errors: Vec<ValidationError>,
}

impl<'a> Checker<'a> {
    fn new(document: &'a str) -> Self {
        Self {
            document,
            errors: Vec::new(),
        }
    }

    fn error(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(ValidationError::Structural {
            document: self.document.to_string(),
            path: path.to_string(),
            message: message.into(),
        });
    }

    fn finish<T: DeserializeOwned>(mut self, raw: &Value) -> ValidationResult<T> {
        if !self.errors.is_empty() {
            return ValidationResult {
                data: None,
                errors: self.errors,
            };
        }
        match serde_json::from_value::<T>(raw.clone()) {
            Ok(data) => ValidationResult {
                data: Some(data),
                errors: Vec::new(),
            },
            Err(e) => {
                self.error("(root)", e.to_string());
                ValidationResult {
                    data: None,
                    errors: self.errors,
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Primitive field checks
    // -------------------------------------------------------------------------

    fn root<'v>(&mut self, raw: &'v Value, kind: DocumentKind) -> Option<&'v Value> {
        let Some(obj) = raw.as_object() else {
            self.error("(root)", format!("{} document must be an object", kind.as_str()));
            return None;
        };
        let value = obj.get(kind.root_key());
        if value.is_none() {
            self.error("(root)", format!("missing required field '{}'", kind.root_key()));
        }
        value
    }

    fn root_array<'v>(&mut self, raw: &'v Value, kind: DocumentKind) -> Option<&'v Vec<Value>> {
        let value = self.root(raw, kind)?;
        let array = value.as_array();
        if array.is_none() {
            self.error(kind.root_key(), "expected a list");
        }
        array
    }

    fn root_object<'v>(
        &mut self,
        raw: &'v Value,
        kind: DocumentKind,
    ) -> Option<&'v Map<String, Value>> {
        let value = self.root(raw, kind)?;
        let obj = value.as_object();
        if obj.is_none() {
            self.error(kind.root_key(), "expected a mapping of event key to definition");
        }
        obj
    }

    fn object<'v>(&mut self, value: &'v Value, path: &str) -> Option<&'v Map<String, Value>> {
        let obj = value.as_object();
        if obj.is_none() {
            self.error(path, "expected an object");
        }
        obj
    }

    fn required_string<'v>(
        &mut self,
        obj: &'v Map<String, Value>,
        key: &str,
        path: &str,
    ) -> Option<&'v str> {
        match obj.get(key) {
            None => {
                self.error(path, format!("missing required field '{}'", key));
                None
            }
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
            Some(Value::String(_)) => {
                self.error(&format!("{}.{}", path, key), "must not be empty");
                None
            }
            Some(other) => {
                self.error(
                    &format!("{}.{}", path, key),
                    format!("expected a string, got {}", describe_value(other)),
                );
                None
            }
        }
    }

    fn optional_string(&mut self, obj: &Map<String, Value>, key: &str, path: &str) {
        if let Some(value) = obj.get(key) {
            if !value.is_string() {
                self.error(
                    &format!("{}.{}", path, key),
                    format!("expected a string, got {}", describe_value(value)),
                );
            }
        }
    }

    fn optional_bool(&mut self, obj: &Map<String, Value>, key: &str, path: &str) {
        if let Some(value) = obj.get(key) {
            if !value.is_boolean() {
                self.error(
                    &format!("{}.{}", path, key),
                    format!("expected a boolean, got {}", describe_value(value)),
                );
            }
        }
    }

    fn string_list(&mut self, value: &Value, path: &str) {
        match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        self.error(&format!("{}[{}]", path, i), "expected a string");
                    }
                }
            }
            None => self.error(path, "expected a list of strings"),
        }
    }

    // -------------------------------------------------------------------------
    // Types and properties
    // -------------------------------------------------------------------------

    fn property_type(&mut self, obj: &Map<String, Value>, path: &str) -> Option<PropertyType> {
        let type_path = format!("{}.type", path);
        match obj.get("type") {
            None => {
                self.error(path, "missing required field 'type'");
                None
            }
            Some(Value::String(name)) => match PrimitiveType::parse(name) {
                Some(primitive) => Some(PropertyType::Primitive(primitive)),
                None => {
                    self.error(
                        &type_path,
                        format!(
                            "unknown type '{}' (expected string, number, boolean or a list of literals)",
                            name
                        ),
                    );
                    None
                }
            },
            Some(Value::Array(items)) => {
                if items.is_empty() {
                    self.error(&type_path, "literal list must not be empty");
                    return None;
                }
                let literals: Vec<String> = items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect();
                if literals.len() != items.len() {
                    self.error(&type_path, "literal list may only contain strings");
                    return None;
                }
                Some(PropertyType::Enum(literals))
            }
            Some(other) => {
                self.error(
                    &type_path,
                    format!(
                        "expected a type name or list of literals, got {}",
                        describe_value(other)
                    ),
                );
                None
            }
        }
    }

    fn default_value(
        &mut self,
        obj: &Map<String, Value>,
        declared: Option<&PropertyType>,
        path: &str,
    ) {
        let (Some(default), Some(declared)) = (obj.get("defaultValue"), declared) else {
            return;
        };
        if !default.is_null() && !declared.accepts(default) {
            self.error(
                &format!("{}.defaultValue", path),
                format!("{} does not satisfy declared type {}", describe_value(default), declared),
            );
        }
    }

    /// Check one property list, returning the names declared in it
    fn properties(&mut self, value: Option<&Value>, path: &str, owner: &str) -> Vec<String> {
        let Some(value) = value else {
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            self.error(path, "expected a list of properties");
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let item_path = format!("{}[{}]", path, i);
            let Some(obj) = self.object(item, &item_path) else {
                continue;
            };
            let name = self.required_string(obj, "name", &item_path);
            let declared = self.property_type(obj, &item_path);
            self.optional_bool(obj, "optional", &item_path);
            self.optional_string(obj, "description", &item_path);
            self.default_value(obj, declared.as_ref(), &item_path);

            if let Some(name) = name {
                if !seen.insert(name) {
                    self.errors.push(ValidationError::DuplicatePropertyName {
                        owner: format!("{} ({})", owner, self.document),
                        property: name.to_string(),
                    });
                }
                names.push(name.to_string());
            }
        }
        names
    }

    // -------------------------------------------------------------------------
    // Per-kind entries
    // -------------------------------------------------------------------------

    fn event(&mut self, key: &str, value: &Value) {
        let path = format!("events.{}", key);
        let Some(obj) = self.object(value, &path) else {
            return;
        };

        let effective_key = match obj.get("key") {
            Some(Value::String(k)) if !k.is_empty() => k.as_str(),
            Some(Value::String(_)) | None => key,
            Some(other) => {
                self.error(
                    &format!("{}.key", path),
                    format!("expected a string, got {}", describe_value(other)),
                );
                key
            }
        };
        if !event_key_regex().is_match(effective_key) {
            self.error(
                &path,
                format!(
                    "event key '{}' must start with a letter or underscore and contain only \
                     letters, digits and underscores",
                    effective_key
                ),
            );
        }

        self.required_string(obj, "name", &path);
        self.optional_string(obj, "description", &path);
        self.optional_bool(obj, "passthrough", &path);
        self.properties(
            obj.get("properties"),
            &format!("{}.properties", path),
            &format!("event '{}'", key),
        );

        if let Some(dimensions) = obj.get("dimensions") {
            let dim_path = format!("{}.dimensions", path);
            match dimensions {
                Value::Array(_) => self.string_list(dimensions, &dim_path),
                Value::Object(split) => {
                    for (field, list) in split {
                        match field.as_str() {
                            "included" | "excluded" => {
                                self.string_list(list, &format!("{}.{}", dim_path, field))
                            }
                            other => self.error(
                                &dim_path,
                                format!(
                                    "unexpected field '{}' (expected included or excluded)",
                                    other
                                ),
                            ),
                        }
                    }
                }
                _ => self.error(
                    &dim_path,
                    "expected a list of dimension names or an {included, excluded} object",
                ),
            }
        }

        if let Some(meta) = obj.get("meta") {
            if !meta.is_object() {
                self.error(&format!("{}.meta", path), "expected a mapping of meta field to value");
            }
        }
    }

    fn group(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(value, path) else {
            return;
        };
        let name = self.required_string(obj, "name", path).unwrap_or("?").to_string();
        let identified_by = self.required_string(obj, "identifiedBy", path);
        self.optional_string(obj, "description", path);

        let names = self.properties(
            obj.get("properties"),
            &format!("{}.properties", path),
            &format!("group '{}'", name),
        );
        if let Some(identified_by) = identified_by {
            if !names.iter().any(|n| n == identified_by) {
                self.error(
                    &format!("{}.identifiedBy", path),
                    format!("'{}' is not one of group '{}' properties", identified_by, name),
                );
            }
        }
    }

    fn dimension(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(value, path) else {
            return;
        };
        self.required_string(obj, "name", path);
        self.optional_string(obj, "description", path);

        let Some(identifiers) = obj.get("identifiers") else {
            self.error(path, "missing required field 'identifiers'");
            return;
        };
        let identifiers_path = format!("{}.identifiers", path);
        if identifier_list_is_empty(identifiers) {
            self.error(&identifiers_path, "at least one identifier is required");
            return;
        }
        self.identifier(identifiers, &identifiers_path);
    }

    fn identifier(&mut self, value: &Value, path: &str) {
        match value {
            Value::Array(children) => {
                for (i, child) in children.iter().enumerate() {
                    self.identifier(child, &format!("{}[{}]", path, i));
                }
            }
            Value::Object(obj) => {
                let combinators: Vec<&str> = ["AND", "OR"]
                    .into_iter()
                    .filter(|k| obj.contains_key(*k))
                    .collect();
                match combinators.as_slice() {
                    [] => {
                        self.required_string(obj, "property", path);
                        self.required_string(obj, "group", path);
                    }
                    [combinator] => {
                        if obj.len() > 1 {
                            self.error(
                                path,
                                format!("{} combinator must not carry other fields", combinator),
                            );
                        }
                        let child_path = format!("{}.{}", path, combinator);
                        match obj.get(*combinator) {
                            Some(Value::Array(children)) => {
                                for (i, child) in children.iter().enumerate() {
                                    self.identifier(child, &format!("{}[{}]", child_path, i));
                                }
                            }
                            _ => self.error(&child_path, "expected a list of identifiers"),
                        }
                    }
                    _ => self.error(path, "an identifier node may use AND or OR, not both"),
                }
            }
            other => self.error(
                path,
                format!("expected an identifier object or list, got {}", describe_value(other)),
            ),
        }
    }

    fn meta_rule(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(value, path) else {
            return;
        };
        self.required_string(obj, "name", path);
        let declared = self.property_type(obj, path);
        self.optional_bool(obj, "optional", path);
        self.optional_string(obj, "description", path);
        self.default_value(obj, declared.as_ref(), path);
    }

    fn target(&mut self, path: &str, value: &Value) {
        let Some(obj) = self.object(value, path) else {
            return;
        };
        self.required_string(obj, "events", path);
        self.required_string(obj, "output", path);
        for key in ["groups", "dimensions", "meta"] {
            match obj.get(key) {
                None | Some(Value::String(_)) => {}
                Some(list @ Value::Array(_)) => {
                    self.string_list(list, &format!("{}.{}", path, key))
                }
                Some(other) => self.error(
                    &format!("{}.{}", path, key),
                    format!(
                        "expected a file path or list of file paths, got {}",
                        describe_value(other)
                    ),
                ),
            }
        }
    }
}

/// A dimension needs at least one identifier at its root
fn identifier_list_is_empty(identifiers: &Value) -> bool {
    match identifiers {
        Value::Array(items) => items.is_empty(),
        Value::Object(obj) if obj.len() == 1 => ["AND", "OR"]
            .iter()
            .any(|k| obj.get(*k).and_then(Value::as_array).map(|a| a.is_empty()).unwrap_or(false)),
        Value::Object(obj) => obj.is_empty(),
        _ => false,
    }
}

//! Runtime tracker
//!
//! Enforces a [`ResolvedSchemaModel`] on live `track` and `set_properties`
//! calls, fills in defaults, resolves lazy values at dispatch time and
//! hands the result to consumer-supplied sinks.
//!
//! The tracker owns its per-group property state. Nothing is shared
//! between instances, so unrelated sessions that need isolation should
//! each get their own tracker. Calls take `&mut self`; a tracker used
//! from several threads must sit behind a lock.
//!
//! Neither public entry point ever fails or panics towards its caller.
//! Every validation failure, unknown name and sink failure is routed to
//! the `on_error` sink, which by default logs through `tracing`.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::resolve::ResolvedSchemaModel;
use crate::schema::{describe_value, PropertyDefinition};

/// Error type sinks may return
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Result type of sink callbacks
pub type SinkResult = std::result::Result<(), SinkError>;

type EventSink = Box<dyn FnMut(&str, &EventPayload) -> SinkResult + Send>;
type GroupSink = Box<dyn FnMut(&str, &BTreeMap<String, Value>) -> SinkResult + Send>;
type ErrorSink = Box<dyn FnMut(&ValidationError) + Send>;

// =============================================================================
// Property Values
// =============================================================================

/// A value computed when the event is sent rather than when it is recorded
#[derive(Clone)]
pub struct LazyValue(Arc<dyn Fn() -> Value + Send + Sync>);

impl LazyValue {
    pub fn evaluate(&self) -> Value {
        (self.0)()
    }
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LazyValue(..)")
    }
}

/// A supplied property value, either concrete or deferred
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Value(Value),
    Lazy(LazyValue),
}

impl PropertyValue {
    /// Defer a value until dispatch
    pub fn lazy(f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        PropertyValue::Lazy(LazyValue(Arc::new(f)))
    }

    /// Concrete value, invoking a lazy one
    ///
    /// A panicking lazy value unwinds into the caller here; the tracker
    /// itself evaluates lazies behind `catch_unwind`.
    pub fn resolve(&self) -> Value {
        match self {
            PropertyValue::Value(v) => v.clone(),
            PropertyValue::Lazy(lazy) => lazy.evaluate(),
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, PropertyValue::Lazy(_))
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Value(a), PropertyValue::Value(b)) => a == b,
            (PropertyValue::Lazy(a), PropertyValue::Lazy(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        PropertyValue::Value(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Value(Value::from(value))
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Value(Value::from(value))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Value(Value::from(value))
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Value(Value::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Value(Value::from(value))
    }
}

/// Supplied properties keyed by property name
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Accumulated, unresolved properties per group name
pub type GroupState = BTreeMap<String, PropertyMap>;

/// Build a [`PropertyMap`] from name/value pairs
pub fn property_map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> PropertyMap
where
    K: Into<String>,
    V: Into<PropertyValue>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// What `on_event_tracked` receives
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventPayload {
    pub properties: BTreeMap<String, Value>,
    pub meta: BTreeMap<String, Value>,
    pub groups: BTreeMap<String, BTreeMap<String, Value>>,
}

// =============================================================================
// Options
// =============================================================================

/// Sinks a tracker dispatches to
#[derive(Default)]
pub struct TrackerOptions {
    on_event_tracked: Option<EventSink>,
    on_group_updated: Option<GroupSink>,
    on_error: Option<ErrorSink>,
}

impl TrackerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event_tracked<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&str, &EventPayload) -> SinkResult + Send + 'static,
    {
        self.on_event_tracked = Some(Box::new(sink));
        self
    }

    pub fn on_group_updated<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&str, &BTreeMap<String, Value>) -> SinkResult + Send + 'static,
    {
        self.on_group_updated = Some(Box::new(sink));
        self
    }

    /// Replace the default logging error sink
    pub fn on_error<F>(mut self, sink: F) -> Self
    where
        F: FnMut(&ValidationError) + Send + 'static,
    {
        self.on_error = Some(Box::new(sink));
        self
    }
}

impl fmt::Debug for TrackerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerOptions")
            .field("on_event_tracked", &self.on_event_tracked.is_some())
            .field("on_group_updated", &self.on_group_updated.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Enforces a resolved model on live tracking calls
pub struct Tracker {
    model: Arc<ResolvedSchemaModel>,
    groups: GroupState,
    options: TrackerOptions,
}

/// Create a tracker over a resolved model
pub fn create_tracker(model: Arc<ResolvedSchemaModel>, options: TrackerOptions) -> Tracker {
    Tracker::new(model, options)
}

impl Tracker {
    pub fn new(model: Arc<ResolvedSchemaModel>, options: TrackerOptions) -> Self {
        Self {
            model,
            groups: GroupState::new(),
            options,
        }
    }

    pub fn model(&self) -> &ResolvedSchemaModel {
        &self.model
    }

    /// Validate and dispatch one event; pass an empty map when there are no properties
    pub fn track(&mut self, event_key: &str, properties: PropertyMap) {
        if let Err(errors) = self.try_track(event_key, properties) {
            self.report(errors);
        }
    }

    /// Validate and merge properties into a group's accumulated state
    pub fn set_properties(&mut self, group: &str, properties: PropertyMap) {
        if let Err(errors) = self.try_set_properties(group, properties) {
            self.report(errors);
        }
    }

    /// Accumulated group state exactly as stored, lazy values unresolved
    pub fn get_properties(&self) -> &GroupState {
        &self.groups
    }

    fn try_track(
        &mut self,
        event_key: &str,
        supplied: PropertyMap,
    ) -> Result<(), Vec<ValidationError>> {
        let model = Arc::clone(&self.model);
        let event = model
            .event(event_key)
            .ok_or_else(|| vec![ValidationError::UnknownEvent(event_key.to_string())])?;

        let owner = format!("event '{}'", event_key);
        check_properties(&owner, &event.properties, &supplied, None)?;

        let merged = with_defaults(&event.properties, supplied);
        let properties = resolve_values(&owner, &event.properties, &merged)?;
        let groups = self.snapshot_groups()?;

        let payload = EventPayload {
            properties,
            meta: model.resolved_meta(event),
            groups,
        };

        debug!(event = %event.name, properties = payload.properties.len(), "dispatching event");
        let Some(sink) = self.options.on_event_tracked.as_mut() else {
            return Ok(());
        };
        call_sink("onEventTracked", || sink(&event.name, &payload)).map_err(|e| vec![e])
    }

    fn try_set_properties(
        &mut self,
        group_name: &str,
        supplied: PropertyMap,
    ) -> Result<(), Vec<ValidationError>> {
        let model = Arc::clone(&self.model);
        let group = model.group(group_name).ok_or_else(|| {
            vec![ValidationError::UnknownGroup {
                group: group_name.to_string(),
                referenced_by: None,
            }]
        })?;

        let owner = format!("group '{}'", group_name);
        let existing = self.groups.get(group_name);
        check_properties(&owner, &group.properties, &supplied, existing)?;

        // Stored only once every value, lazy ones included, has resolved
        let mut state = existing.cloned().unwrap_or_default();
        state.extend(supplied);
        let merged = with_defaults(&group.properties, state.clone());
        let resolved = resolve_values(&owner, &group.properties, &merged)?;
        self.groups.insert(group_name.to_string(), state);

        debug!(group = %group_name, properties = resolved.len(), "dispatching group update");
        let Some(sink) = self.options.on_group_updated.as_mut() else {
            return Ok(());
        };
        call_sink("onGroupUpdated", || sink(group_name, &resolved)).map_err(|e| vec![e])
    }

    /// Resolved copy of every group's accumulated state
    fn snapshot_groups(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, Value>>, Vec<ValidationError>> {
        let mut snapshot = BTreeMap::new();
        let mut errors = Vec::new();
        for (name, state) in &self.groups {
            let Some(group) = self.model.group(name) else {
                continue;
            };
            let merged = with_defaults(&group.properties, state.clone());
            match resolve_values(&format!("group '{}'", name), &group.properties, &merged) {
                Ok(values) => {
                    snapshot.insert(name.clone(), values);
                }
                Err(mut e) => errors.append(&mut e),
            }
        }
        if errors.is_empty() {
            Ok(snapshot)
        } else {
            Err(errors)
        }
    }

    fn report(&mut self, errors: Vec<ValidationError>) {
        for error in errors {
            match self.options.on_error.as_mut() {
                Some(sink) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| sink(&error))).is_err() {
                        warn!(
                            code = error.code(),
                            "onError callback panicked while reporting: {}", error
                        );
                    }
                }
                None => warn!(code = error.code(), "{}", error),
            }
        }
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("groups", &self.groups)
            .field("options", &self.options)
            .finish()
    }
}

// =============================================================================
// Validation helpers
// =============================================================================

/// Required and type rules for supplied values
///
/// Lazy values are checked once resolved, in [`resolve_values`].
/// `existing` is accumulated group state that also satisfies required
/// properties.
fn check_properties(
    owner: &str,
    definitions: &[PropertyDefinition],
    supplied: &PropertyMap,
    existing: Option<&PropertyMap>,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (name, value) in supplied {
        let Some(definition) = definitions.iter().find(|d| &d.name == name) else {
            errors.push(ValidationError::UnknownProperty {
                owner: owner.to_string(),
                property: name.clone(),
            });
            continue;
        };
        if let PropertyValue::Value(value) = value {
            if let Some(mismatch) = type_mismatch(owner, definition, value) {
                errors.push(mismatch);
            }
        }
    }

    for definition in definitions.iter().filter(|d| d.is_required()) {
        let present = supplied.contains_key(&definition.name)
            || existing.map(|e| e.contains_key(&definition.name)).unwrap_or(false);
        if !present {
            errors.push(ValidationError::MissingRequiredProperty {
                owner: owner.to_string(),
                property: definition.name.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn type_mismatch(
    owner: &str,
    definition: &PropertyDefinition,
    value: &Value,
) -> Option<ValidationError> {
    if definition.property_type.accepts(value) {
        return None;
    }
    Some(ValidationError::TypeMismatch {
        owner: owner.to_string(),
        property: definition.name.clone(),
        expected: definition.property_type.to_string(),
        actual: describe_value(value),
    })
}

/// Declared defaults overlaid with supplied values; supplied wins
fn with_defaults(definitions: &[PropertyDefinition], supplied: PropertyMap) -> PropertyMap {
    let mut merged: PropertyMap = definitions
        .iter()
        .filter_map(|d| d.default_value.clone().map(|v| (d.name.clone(), PropertyValue::Value(v))))
        .collect();
    merged.extend(supplied);
    merged
}

/// Invoke lazy values and type-check what they produced
fn resolve_values(
    owner: &str,
    definitions: &[PropertyDefinition],
    merged: &PropertyMap,
) -> Result<BTreeMap<String, Value>, Vec<ValidationError>> {
    let mut resolved = BTreeMap::new();
    let mut errors = Vec::new();
    for (name, value) in merged {
        let concrete = match value {
            PropertyValue::Value(v) => v.clone(),
            PropertyValue::Lazy(lazy) => {
                let concrete = match panic::catch_unwind(AssertUnwindSafe(|| lazy.evaluate())) {
                    Ok(concrete) => concrete,
                    Err(panic) => {
                        errors.push(ValidationError::LazyValueFailure {
                            owner: owner.to_string(),
                            property: name.clone(),
                            message: panic_message(panic),
                        });
                        continue;
                    }
                };
                let definition = definitions.iter().find(|d| &d.name == name);
                if let Some(mismatch) =
                    definition.and_then(|d| type_mismatch(owner, d, &concrete))
                {
                    errors.push(mismatch);
                }
                concrete
            }
        };
        resolved.insert(name.clone(), concrete);
    }
    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(errors)
    }
}

/// Run a consumer callback, turning errors and panics into a reportable failure
fn call_sink(
    callback: &'static str,
    f: impl FnOnce() -> SinkResult,
) -> Result<(), ValidationError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ValidationError::SinkCallbackFailure {
            callback,
            message: e.to_string(),
        }),
        Err(panic) => Err(ValidationError::SinkCallbackFailure {
            callback,
            message: panic_message(panic),
        }),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "callback panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        EventDefinition, GroupDefinition, MetaRuleDefinition, PrimitiveType, PropertyType,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    fn model() -> Arc<ResolvedSchemaModel> {
        let mut model = ResolvedSchemaModel::default();

        let methods = PropertyType::Enum(vec!["email".into(), "google".into(), "github".into()]);
        let boolean = PropertyType::Primitive(PrimitiveType::Boolean);
        let number = PropertyType::Primitive(PrimitiveType::Number);
        let string = PropertyType::Primitive(PrimitiveType::String);
        let plans = PropertyType::Enum(vec!["FREE".into(), "PAID".into()]);

        model.events.insert(
            "user_signup".into(),
            EventDefinition::new("user_signup", "User Signup")
                .with_property(PropertyDefinition::new("Registration Method", methods))
                .with_property(
                    PropertyDefinition::new("Is Trial", boolean)
                        .optional()
                        .with_default(json!(false)),
                ),
        );
        model.events.insert(
            "page_viewed".into(),
            EventDefinition::new("page_viewed", "Page Viewed")
                .with_property(PropertyDefinition::new("Timestamp", number.clone()).optional()),
        );
        model.groups.insert(
            "Team".into(),
            GroupDefinition::new("Team", "Team ID")
                .with_property(PropertyDefinition::new("Team ID", string.clone()).optional())
                .with_property(PropertyDefinition::new("Plan", plans))
                .with_property(
                    PropertyDefinition::new("Seats", number)
                        .optional()
                        .with_default(json!(1)),
                ),
        );
        model.meta_rules.insert(
            "Source".into(),
            MetaRuleDefinition {
                name: "Source".into(),
                rule_type: string,
                optional: true,
                default_value: Some(json!("web")),
                description: String::new(),
            },
        );
        Arc::new(model)
    }

    type Recorded<T> = Arc<Mutex<Vec<T>>>;

    struct Harness {
        tracker: Tracker,
        events: Recorded<(String, EventPayload)>,
        groups: Recorded<(String, BTreeMap<String, Value>)>,
        errors: Recorded<ValidationError>,
    }

    fn harness() -> Harness {
        let events: Recorded<(String, EventPayload)> = Arc::default();
        let groups: Recorded<(String, BTreeMap<String, Value>)> = Arc::default();
        let errors: Recorded<ValidationError> = Arc::default();

        let (e, g, err) = (events.clone(), groups.clone(), errors.clone());
        let options = TrackerOptions::new()
            .on_event_tracked(move |name, payload| {
                e.lock().unwrap().push((name.to_string(), payload.clone()));
                Ok(())
            })
            .on_group_updated(move |name, properties| {
                g.lock().unwrap().push((name.to_string(), properties.clone()));
                Ok(())
            })
            .on_error(move |error| err.lock().unwrap().push(error.clone()));

        Harness {
            tracker: create_tracker(model(), options),
            events,
            groups,
            errors,
        }
    }

    #[test]
    fn test_track_fills_defaults() {
        let mut h = harness();
        h.tracker.track("user_signup", property_map([("Registration Method", "email")]));

        assert!(h.errors.lock().unwrap().is_empty());
        let events = h.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "User Signup");
        assert_eq!(
            events[0].1.properties,
            BTreeMap::from([
                ("Is Trial".to_string(), json!(false)),
                ("Registration Method".to_string(), json!("email")),
            ])
        );
        assert_eq!(events[0].1.meta["Source"], json!("web"));
    }

    #[test]
    fn test_missing_required_property_suppresses_dispatch() {
        let mut h = harness();
        h.tracker.track("user_signup", PropertyMap::new());

        assert!(h.events.lock().unwrap().is_empty());
        assert_eq!(
            *h.errors.lock().unwrap(),
            vec![ValidationError::MissingRequiredProperty {
                owner: "event 'user_signup'".into(),
                property: "Registration Method".into(),
            }]
        );
    }

    #[test]
    fn test_literal_outside_enum_is_type_mismatch() {
        let mut h = harness();
        h.tracker.track("user_signup", property_map([("Registration Method", "fax")]));

        assert!(h.events.lock().unwrap().is_empty());
        let errors = h.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), "TYPE_MISMATCH");
    }

    #[test]
    fn test_unknown_event_and_property() {
        let mut h = harness();
        h.tracker.track("nope", PropertyMap::new());
        h.tracker.track("page_viewed", property_map([("Referrer", "x")]));

        let codes: Vec<_> = h.errors.lock().unwrap().iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["UNKNOWN_EVENT", "UNKNOWN_PROPERTY"]);
        assert!(h.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_lazy_values_resolve_at_dispatch() {
        let clock = Arc::new(AtomicU64::new(100));
        let mut h = harness();

        let c = clock.clone();
        let props = PropertyMap::from([(
            "Timestamp".to_string(),
            PropertyValue::lazy(move || json!(c.load(Ordering::SeqCst))),
        )]);
        clock.store(250, Ordering::SeqCst);
        h.tracker.track("page_viewed", props);

        let events = h.events.lock().unwrap();
        assert_eq!(events[0].1.properties["Timestamp"], json!(250));
    }

    #[test]
    fn test_lazy_value_of_wrong_type() {
        let mut h = harness();
        let props = PropertyMap::from([(
            "Timestamp".to_string(),
            PropertyValue::lazy(|| json!("now")),
        )]);
        h.tracker.track("page_viewed", props);

        assert!(h.events.lock().unwrap().is_empty());
        assert_eq!(h.errors.lock().unwrap()[0].code(), "TYPE_MISMATCH");
    }

    #[test]
    fn test_set_properties_is_idempotent() {
        let mut h = harness();
        h.tracker.set_properties("Team", property_map([("Plan", "PAID")]));
        let once = h.tracker.get_properties().clone();
        h.tracker.set_properties("Team", property_map([("Plan", "PAID")]));

        assert_eq!(h.tracker.get_properties(), &once);
        assert_eq!(once["Team"].len(), 1);

        let groups = h.groups.lock().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].1["Plan"], json!("PAID"));
        assert_eq!(groups[1].1["Seats"], json!(1));
    }

    #[test]
    fn test_group_state_is_visible_to_track() {
        let mut h = harness();
        h.tracker.set_properties("Team", property_map([("Plan", "FREE")]));
        h.tracker.set_properties("Team", property_map([("Seats", 4i64)]));
        h.tracker.set_properties("Team", property_map([("Plan", "PAID")]));
        h.tracker.track("page_viewed", PropertyMap::new());

        assert!(h.errors.lock().unwrap().is_empty());
        let events = h.events.lock().unwrap();
        assert_eq!(
            events[0].1.groups["Team"],
            BTreeMap::from([("Plan".to_string(), json!("PAID")), ("Seats".to_string(), json!(4))])
        );
    }

    #[test]
    fn test_get_properties_keeps_lazy_values_unresolved() {
        let mut h = harness();
        let lazy = PropertyValue::lazy(|| json!(7));
        h.tracker.set_properties(
            "Team",
            PropertyMap::from([
                ("Plan".to_string(), "FREE".into()),
                ("Seats".to_string(), lazy.clone()),
            ]),
        );
        assert_eq!(h.tracker.get_properties()["Team"]["Seats"], lazy);
        assert_eq!(h.groups.lock().unwrap()[0].1["Seats"], json!(7));
    }

    #[test]
    fn test_group_validation() {
        let mut h = harness();
        h.tracker.set_properties("Org", property_map([("Plan", "FREE")]));
        h.tracker.set_properties("Team", property_map([("Seats", 2i64)]));
        h.tracker.set_properties("Team", property_map([("Plan", "GOLD")]));

        let codes: Vec<_> = h.errors.lock().unwrap().iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["UNKNOWN_GROUP", "MISSING_REQUIRED_PROPERTY", "TYPE_MISMATCH"]);
        assert!(h.tracker.get_properties().is_empty());
        assert!(h.groups.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sink_failures_are_routed() {
        let errors: Recorded<ValidationError> = Arc::default();
        let err = errors.clone();
        let options = TrackerOptions::new()
            .on_event_tracked(|_, _| Err("backend unavailable".into()))
            .on_group_updated(|_, _| panic!("sink exploded"))
            .on_error(move |error| err.lock().unwrap().push(error.clone()));
        let mut tracker = Tracker::new(model(), options);

        tracker.track("page_viewed", PropertyMap::new());
        tracker.set_properties("Team", property_map([("Plan", "FREE")]));

        let errors = errors.lock().unwrap();
        assert_eq!(
            errors[0],
            ValidationError::SinkCallbackFailure {
                callback: "onEventTracked",
                message: "backend unavailable".into(),
            }
        );
        assert_eq!(
            errors[1],
            ValidationError::SinkCallbackFailure {
                callback: "onGroupUpdated",
                message: "sink exploded".into(),
            }
        );
        // state was merged before the sink failed
        assert!(tracker.get_properties().contains_key("Team"));
    }

    #[test]
    fn test_rejected_lazy_group_update_leaves_state_untouched() {
        let mut h = harness();
        h.tracker.set_properties("Team", property_map([("Plan", "FREE")]));
        let before = h.tracker.get_properties().clone();

        let bad_seats = PropertyMap::from([(
            "Seats".to_string(),
            PropertyValue::lazy(|| json!("many")),
        )]);
        h.tracker.set_properties("Team", bad_seats);
        assert_eq!(h.tracker.get_properties(), &before);

        h.tracker.track("page_viewed", PropertyMap::new());
        h.tracker.track("page_viewed", PropertyMap::new());

        let codes: Vec<_> = h.errors.lock().unwrap().iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["TYPE_MISMATCH"]);
        let events = h.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1.groups["Team"]["Seats"], json!(1));
        assert_eq!(h.groups.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_first_group_update_stores_nothing() {
        let mut h = harness();
        h.tracker.set_properties(
            "Team",
            PropertyMap::from([
                ("Plan".to_string(), "FREE".into()),
                ("Seats".to_string(), PropertyValue::lazy(|| json!("many"))),
            ]),
        );

        assert!(h.tracker.get_properties().is_empty());
        h.tracker.track("page_viewed", PropertyMap::new());
        assert_eq!(h.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_panicking_lazy_value_is_routed() {
        let mut h = harness();
        let props = PropertyMap::from([(
            "Timestamp".to_string(),
            PropertyValue::lazy(|| panic!("clock failed")),
        )]);

        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| h.tracker.track("page_viewed", props)));
        assert!(outcome.is_ok());
        assert!(h.events.lock().unwrap().is_empty());
        assert_eq!(
            *h.errors.lock().unwrap(),
            vec![ValidationError::LazyValueFailure {
                owner: "event 'page_viewed'".into(),
                property: "Timestamp".into(),
                message: "clock failed".into(),
            }]
        );
    }

    #[test]
    fn test_panicking_lazy_group_value_is_not_stored() {
        let mut h = harness();
        h.tracker.set_properties(
            "Team",
            PropertyMap::from([
                ("Plan".to_string(), "FREE".into()),
                ("Seats".to_string(), PropertyValue::lazy(|| panic!("seat count unavailable"))),
            ]),
        );

        assert!(h.tracker.get_properties().is_empty());
        assert!(h.groups.lock().unwrap().is_empty());
        assert_eq!(h.errors.lock().unwrap()[0].code(), "LAZY_VALUE_FAILURE");
    }

    #[test]
    fn test_default_error_sink_does_not_panic() {
        let mut tracker = Tracker::new(model(), TrackerOptions::default());
        tracker.track("nope", PropertyMap::new());
        tracker.set_properties("Team", property_map([("Plan", "FREE")]));
        assert!(tracker.get_properties().contains_key("Team"));
    }
}

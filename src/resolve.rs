//! Cross-reference resolution
//!
//! Merges the structurally valid documents of one generation target into
//! a single [`ResolvedSchemaModel`] and checks every reference between
//! them. All defects are collected; the model is only produced when
//! there are none.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::checksum::Checksum;
use crate::error::ValidationError;
use crate::schema::{
    describe_value, Condition, DimensionDefinition, DimensionSpec, DimensionsDocument,
    EventDefinition, EventsDocument, GroupDefinition, GroupsDocument, IdentifierNode,
    IdentifierRule, IdentifierRuleSpec, IdentifierSpec, MetaDocument, MetaRuleDefinition,
    Operator, PropertyDefinition,
};

/// The merged, cross-checked tracking plan of one generation target
///
/// Immutable once built; share it behind an `Arc` between trackers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSchemaModel {
    pub events: BTreeMap<String, EventDefinition>,
    pub groups: BTreeMap<String, GroupDefinition>,
    pub dimensions: BTreeMap<String, DimensionDefinition>,
    pub meta_rules: BTreeMap<String, MetaRuleDefinition>,
}

impl ResolvedSchemaModel {
    pub fn event(&self, key: &str) -> Option<&EventDefinition> {
        self.events.get(key)
    }

    pub fn group(&self, name: &str) -> Option<&GroupDefinition> {
        self.groups.get(name)
    }

    pub fn dimension(&self, name: &str) -> Option<&DimensionDefinition> {
        self.dimensions.get(name)
    }

    /// Event meta with meta-rule defaults filled in
    pub fn resolved_meta(&self, event: &EventDefinition) -> BTreeMap<String, Value> {
        let mut meta: BTreeMap<String, Value> = self
            .meta_rules
            .values()
            .filter_map(|rule| rule.default_value.clone().map(|v| (rule.name.clone(), v)))
            .collect();
        meta.extend(event.meta.iter().map(|(k, v)| (k.clone(), v.clone())));
        meta
    }

    /// Whether the audience described by an event's dimensions contains
    /// the caller whose group state `lookup` exposes.
    ///
    /// With no included dimensions everyone is included; any matching
    /// excluded dimension removes the caller. `None` for unknown events.
    pub fn event_in_audience<F>(&self, key: &str, lookup: &F) -> Option<bool>
    where
        F: Fn(&str, &str) -> Option<Value>,
    {
        let event = self.event(key)?;
        let selection = &event.dimensions;
        let included = selection.included.is_empty()
            || selection
                .included
                .iter()
                .filter_map(|name| self.dimension(name))
                .any(|d| d.matches(lookup));
        let excluded = selection
            .excluded
            .iter()
            .filter_map(|name| self.dimension(name))
            .any(|d| d.matches(lookup));
        Some(included && !excluded)
    }

    /// Content fingerprint; equal models have equal fingerprints
    pub fn fingerprint(&self) -> crate::error::Result<Checksum> {
        Ok(Checksum::from_serializable(self)?)
    }
}

/// Resolve one generation target
pub fn resolve(
    events: &EventsDocument,
    groups: &[GroupsDocument],
    dimensions: &[DimensionsDocument],
    meta: &[MetaDocument],
) -> Result<ResolvedSchemaModel, Vec<ValidationError>> {
    let mut resolver = Resolver::default();

    let groups = resolver.merge_groups(groups);
    let meta_rules = resolver.merge_meta(meta);
    let (dimensions, dimension_names) = resolver.merge_dimensions(dimensions, &groups);
    let events = resolver.resolve_events(events, &dimension_names, &meta_rules);

    for group in groups.values() {
        resolver.check_unique_properties(&format!("group '{}'", group.name), &group.properties);
    }

    if !resolver.errors.is_empty() {
        debug!(errors = resolver.errors.len(), "resolution failed");
        return Err(resolver.errors);
    }

    debug!(
        events = events.len(),
        groups = groups.len(),
        dimensions = dimensions.len(),
        meta_rules = meta_rules.len(),
        "resolved tracking plan"
    );

    Ok(ResolvedSchemaModel {
        events,
        groups,
        dimensions,
        meta_rules,
    })
}

#[derive(Default)]
struct Resolver {
    errors: Vec<ValidationError>,
}

impl Resolver {
    fn duplicate(&mut self, kind: &'static str, name: &str) {
        self.errors.push(ValidationError::DuplicateDefinition {
            kind,
            name: name.to_string(),
        });
    }

    // =========================================================================
    // Namespaces
    // =========================================================================

    fn merge_groups(&mut self, documents: &[GroupsDocument]) -> BTreeMap<String, GroupDefinition> {
        let mut merged = BTreeMap::new();
        for group in documents.iter().flat_map(|doc| doc.groups.iter()) {
            if merged.contains_key(&group.name) {
                self.duplicate("group", &group.name);
                continue;
            }
            merged.insert(group.name.clone(), group.clone());
        }
        merged
    }

    fn merge_meta(&mut self, documents: &[MetaDocument]) -> BTreeMap<String, MetaRuleDefinition> {
        let mut merged = BTreeMap::new();
        for rule in documents.iter().flat_map(|doc| doc.meta.iter()) {
            if merged.contains_key(&rule.name) {
                self.duplicate("meta rule", &rule.name);
                continue;
            }
            merged.insert(rule.name.clone(), rule.clone());
        }
        merged
    }

    /// Returns resolved dimensions plus every declared dimension name, so a
    /// dimension with a broken identifier does not also surface as unknown.
    fn merge_dimensions(
        &mut self,
        documents: &[DimensionsDocument],
        groups: &BTreeMap<String, GroupDefinition>,
    ) -> (BTreeMap<String, DimensionDefinition>, BTreeSet<String>) {
        let mut resolved = BTreeMap::new();
        let mut names = BTreeSet::new();
        for spec in documents.iter().flat_map(|doc| doc.dimensions.iter()) {
            if !names.insert(spec.name.clone()) {
                self.duplicate("dimension", &spec.name);
                continue;
            }
            if let Some(dimension) = self.resolve_dimension(spec, groups) {
                resolved.insert(dimension.name.clone(), dimension);
            }
        }
        (resolved, names)
    }

    // =========================================================================
    // Identifiers
    // =========================================================================

    fn resolve_dimension(
        &mut self,
        spec: &DimensionSpec,
        groups: &BTreeMap<String, GroupDefinition>,
    ) -> Option<DimensionDefinition> {
        let identifiers = IdentifierWalk {
            dimension: &spec.name,
            groups,
        }
        .node(&spec.identifiers, "identifiers", &mut self.errors)?;

        Some(DimensionDefinition {
            name: spec.name.clone(),
            description: spec.description.clone(),
            identifiers,
        })
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn resolve_events(
        &mut self,
        document: &EventsDocument,
        dimension_names: &BTreeSet<String>,
        meta_rules: &BTreeMap<String, MetaRuleDefinition>,
    ) -> BTreeMap<String, EventDefinition> {
        let mut resolved = BTreeMap::new();
        for (map_key, event) in &document.events {
            let key = if event.key.is_empty() { map_key } else { &event.key };
            if resolved.contains_key(key) {
                self.duplicate("event", key);
                continue;
            }

            for dimension in event.dimensions.names() {
                if !dimension_names.contains(dimension) {
                    self.errors.push(ValidationError::UnknownDimension {
                        event: key.clone(),
                        dimension: dimension.to_string(),
                    });
                }
            }

            self.check_meta(key, event, meta_rules);
            self.check_unique_properties(&format!("event '{}'", key), &event.properties);

            let mut event = event.clone();
            event.key = key.clone();
            resolved.insert(key.clone(), event);
        }
        resolved
    }

    fn check_meta(
        &mut self,
        key: &str,
        event: &EventDefinition,
        rules: &BTreeMap<String, MetaRuleDefinition>,
    ) {
        for (field, value) in &event.meta {
            match rules.get(field) {
                Some(rule) if !rule.rule_type.accepts(value) => {
                    self.errors.push(ValidationError::TypeMismatch {
                        owner: format!("event '{}' meta", key),
                        property: field.clone(),
                        expected: rule.rule_type.to_string(),
                        actual: describe_value(value),
                    });
                }
                Some(_) => {}
                None if event.passthrough => {}
                None => self.errors.push(ValidationError::UnknownMetaField {
                    event: key.to_string(),
                    field: field.clone(),
                }),
            }
        }

        for rule in rules.values() {
            if rule.is_required() && !event.meta.contains_key(&rule.name) {
                self.errors.push(ValidationError::MissingMetaField {
                    event: key.to_string(),
                    field: rule.name.clone(),
                });
            }
        }
    }

    /// Property names are unique across the merged, final definition
    fn check_unique_properties(&mut self, owner: &str, properties: &[PropertyDefinition]) {
        let mut seen = HashSet::new();
        for property in properties {
            if !seen.insert(property.name.as_str()) {
                self.errors.push(ValidationError::DuplicatePropertyName {
                    owner: owner.to_string(),
                    property: property.name.clone(),
                });
            }
        }
    }
}

/// Converts a document identifier tree into its typed form for one dimension
struct IdentifierWalk<'a> {
    dimension: &'a str,
    groups: &'a BTreeMap<String, GroupDefinition>,
}

impl IdentifierWalk<'_> {
    fn node(
        &self,
        spec: &IdentifierSpec,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) -> Option<IdentifierNode> {
        match spec {
            IdentifierSpec::All(children) => self
                .children(children, path, errors)
                .map(IdentifierNode::And),
            IdentifierSpec::And { and } => self
                .children(and, &format!("{}.AND", path), errors)
                .map(IdentifierNode::And),
            IdentifierSpec::Or { or } => self
                .children(or, &format!("{}.OR", path), errors)
                .map(IdentifierNode::Or),
            IdentifierSpec::Rule(rule) => self.rule(rule, path, errors).map(IdentifierNode::Rule),
        }
    }

    fn children(
        &self,
        children: &[IdentifierSpec],
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) -> Option<Vec<IdentifierNode>> {
        if children.is_empty() {
            errors.push(ValidationError::EmptyIdentifier {
                dimension: self.dimension.to_string(),
                path: path.to_string(),
            });
            return None;
        }

        // Walk every child even after a failure so all leaves get reported
        let resolved: Vec<Option<IdentifierNode>> = children
            .iter()
            .enumerate()
            .map(|(i, child)| self.node(child, &format!("{}[{}]", path, i), errors))
            .collect();
        resolved.into_iter().collect()
    }

    fn rule(
        &self,
        spec: &IdentifierRuleSpec,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) -> Option<IdentifierRule> {
        let before = errors.len();
        let structural = |message: &str| ValidationError::Structural {
            document: format!("dimension '{}'", self.dimension),
            path: path.to_string(),
            message: message.to_string(),
        };

        if spec.property.trim().is_empty() {
            errors.push(structural("identifier property must not be empty"));
        }
        if spec.group.trim().is_empty() {
            errors.push(structural("identifier group must not be empty"));
        }

        let operators: Vec<(Operator, &Value)> = spec
            .operators
            .iter()
            .filter_map(|(key, operand)| Operator::from_key(key).map(|op| (op, operand)))
            .collect();

        let condition = match operators.as_slice() {
            [] => {
                errors.push(ValidationError::MissingEvaluationOperator {
                    dimension: self.dimension.to_string(),
                    path: path.to_string(),
                });
                None
            }
            [(operator, operand)] => {
                let condition = Condition::from_operand(*operator, operand);
                if condition.is_none() {
                    errors.push(ValidationError::InvalidOperand {
                        dimension: self.dimension.to_string(),
                        path: path.to_string(),
                        operator: operator.to_string(),
                        expected: operator.expected_operand(),
                    });
                }
                condition
            }
            many => {
                errors.push(ValidationError::AmbiguousEvaluationOperator {
                    dimension: self.dimension.to_string(),
                    path: path.to_string(),
                    operators: many.iter().map(|(op, _)| op.to_string()).collect(),
                });
                None
            }
        };

        if !spec.group.trim().is_empty() {
            match self.groups.get(&spec.group) {
                None => errors.push(ValidationError::UnknownGroup {
                    group: spec.group.clone(),
                    referenced_by: Some(format!("dimension '{}'", self.dimension)),
                }),
                Some(group)
                    if !spec.property.trim().is_empty()
                        && group.property(&spec.property).is_none() =>
                {
                    errors.push(ValidationError::UnknownGroupProperty {
                        dimension: self.dimension.to_string(),
                        group: spec.group.clone(),
                        property: spec.property.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        if errors.len() > before {
            return None;
        }
        Some(IdentifierRule {
            property: spec.property.clone(),
            group: spec.group.clone(),
            condition: condition?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PrimitiveType, PropertyType};
    use serde_json::json;

    fn groups() -> GroupsDocument {
        serde_json::from_value(json!({
            "groups": [{
                "name": "Team",
                "identifiedBy": "Team ID",
                "properties": [
                    { "name": "Team ID", "type": "string" },
                    { "name": "Plan", "type": ["FREE", "PAID"] },
                    { "name": "Seats", "type": "number", "optional": true }
                ]
            }]
        }))
        .unwrap()
    }

    fn dimensions(identifiers: Value) -> DimensionsDocument {
        serde_json::from_value(json!({
            "dimensions": [{ "name": "Free", "identifiers": identifiers }]
        }))
        .unwrap()
    }

    fn events(value: Value) -> EventsDocument {
        serde_json::from_value(json!({ "events": value })).unwrap()
    }

    fn free_dimension() -> DimensionsDocument {
        dimensions(json!({ "AND": [{ "property": "Plan", "group": "Team", "equals": "FREE" }] }))
    }

    #[test]
    fn test_resolves_valid_target() {
        let events = events(json!({
            "team_created": { "name": "Team Created", "dimensions": ["Free"] }
        }));
        let model = resolve(&events, &[groups()], &[free_dimension()], &[]).unwrap();

        assert_eq!(model.events["team_created"].key, "team_created");
        assert!(model.group("Team").is_some());
        match &model.dimensions["Free"].identifiers {
            IdentifierNode::And(children) => assert_eq!(children.len(), 1),
            other => panic!("expected AND, got {:?}", other),
        }
    }

    #[test]
    fn test_ambiguous_operator() {
        let dims = dimensions(json!([
            { "property": "Plan", "group": "Team", "equals": "FREE", "in": ["FREE"] }
        ]));
        let errors = resolve(&EventsDocument::default(), &[groups()], &[dims], &[]).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::AmbiguousEvaluationOperator {
                dimension: "Free".to_string(),
                path: "identifiers[0]".to_string(),
                operators: vec!["equals".to_string(), "in".to_string()],
            }]
        );
    }

    #[test]
    fn test_missing_operator_and_bad_operand_are_all_reported() {
        let dims = dimensions(json!({ "OR": [
            { "property": "Plan", "group": "Team" },
            { "property": "Seats", "group": "Team", "gt": "ten" }
        ]}));
        let errors = resolve(&EventsDocument::default(), &[groups()], &[dims], &[]).unwrap_err();
        let codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["MISSING_EVALUATION_OPERATOR", "INVALID_OPERAND"]);
    }

    #[test]
    fn test_identifier_references() {
        let dims = dimensions(json!([
            { "property": "Plan", "group": "Org", "equals": "FREE" },
            { "property": "Tier", "group": "Team", "equals": "FREE" }
        ]));
        let errors = resolve(&EventsDocument::default(), &[groups()], &[dims], &[]).unwrap_err();
        let codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["UNKNOWN_GROUP", "UNKNOWN_GROUP_PROPERTY"]);
    }

    #[test]
    fn test_nested_empty_combinator() {
        let dims = dimensions(json!({ "AND": [{ "OR": [] }] }));
        let errors = resolve(&EventsDocument::default(), &[groups()], &[dims], &[]).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::EmptyIdentifier {
                dimension: "Free".to_string(),
                path: "identifiers.AND[0].OR".to_string(),
            }]
        );
    }

    #[test]
    fn test_unknown_dimension_names_event_and_dimension() {
        let events = events(json!({
            "team_created": { "name": "Team Created", "dimensions": { "excluded": ["Enterprise"] } }
        }));
        let errors = resolve(&events, &[groups()], &[free_dimension()], &[]).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::UnknownDimension {
                event: "team_created".to_string(),
                dimension: "Enterprise".to_string(),
            }]
        );
    }

    #[test]
    fn test_broken_dimension_is_not_also_unknown() {
        let dims = dimensions(json!([{ "property": "Plan", "group": "Team" }]));
        let events = events(json!({
            "team_created": { "name": "Team Created", "dimensions": ["Free"] }
        }));
        let errors = resolve(&events, &[groups()], &[dims], &[]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), "MISSING_EVALUATION_OPERATOR");
    }

    #[test]
    fn test_meta_fields() {
        let meta: MetaDocument = serde_json::from_value(json!({
            "meta": [
                { "name": "Owner", "type": "string" },
                { "name": "Priority", "type": ["low", "high"], "defaultValue": "low" }
            ]
        }))
        .unwrap();
        let events = events(json!({
            "a": { "name": "A", "meta": { "Owner": "growth", "Team Channel": "#growth" } },
            "b": {
                "name": "B",
                "meta": { "Owner": "growth", "Team Channel": "#growth" },
                "passthrough": true
            },
            "c": { "name": "C", "meta": { "Priority": "urgent" } }
        }));
        let errors = resolve(&events, &[], &[], &[meta]).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::UnknownMetaField {
                    event: "a".into(),
                    field: "Team Channel".into(),
                },
                ValidationError::TypeMismatch {
                    owner: "event 'c' meta".into(),
                    property: "Priority".into(),
                    expected: "one of [\"low\", \"high\"]".into(),
                    actual: "string \"urgent\"".into(),
                },
                ValidationError::MissingMetaField { event: "c".into(), field: "Owner".into() },
            ]
        );
    }

    #[test]
    fn test_resolved_meta_overlays_defaults() {
        let meta: MetaDocument = serde_json::from_value(json!({
            "meta": [{ "name": "Priority", "type": ["low", "high"], "defaultValue": "low" }]
        }))
        .unwrap();
        let events = events(json!({
            "a": { "name": "A" },
            "b": { "name": "B", "meta": { "Priority": "high" } }
        }));
        let model = resolve(&events, &[], &[], &[meta]).unwrap();
        assert_eq!(model.resolved_meta(&model.events["a"])["Priority"], json!("low"));
        assert_eq!(model.resolved_meta(&model.events["b"])["Priority"], json!("high"));
    }

    #[test]
    fn test_duplicate_definitions_across_files() {
        let errors = resolve(
            &EventsDocument::default(),
            &[groups(), groups()],
            &[free_dimension(), free_dimension()],
            &[],
        )
        .unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::DuplicateDefinition { kind: "group", name: "Team".into() },
                ValidationError::DuplicateDefinition { kind: "dimension", name: "Free".into() },
            ]
        );
    }

    #[test]
    fn test_duplicate_properties_in_typed_documents() {
        let mut events = EventsDocument::default();
        let string = PropertyType::Primitive(PrimitiveType::String);
        events.events.insert(
            "a".into(),
            EventDefinition::new("a", "A")
                .with_property(PropertyDefinition::new("X", string.clone()))
                .with_property(PropertyDefinition::new("X", string)),
        );
        let errors = resolve(&events, &[], &[], &[]).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DuplicatePropertyName {
                owner: "event 'a'".into(),
                property: "X".into(),
            }]
        );
    }

    #[test]
    fn test_event_audience() {
        let events = events(json!({
            "upgrade_clicked": { "name": "Upgrade Clicked", "dimensions": ["Free"] },
            "invoice_sent": { "name": "Invoice Sent", "dimensions": { "excluded": ["Free"] } }
        }));
        let model = resolve(&events, &[groups()], &[free_dimension()], &[]).unwrap();
        let free_team = |group: &str, property: &str| -> Option<Value> {
            (group == "Team" && property == "Plan").then(|| json!("FREE"))
        };

        assert_eq!(model.event_in_audience("upgrade_clicked", &free_team), Some(true));
        assert_eq!(model.event_in_audience("invoice_sent", &free_team), Some(false));
        assert_eq!(model.event_in_audience("missing", &free_team), None);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let events = events(json!({
            "team_created": { "name": "Team Created", "dimensions": ["Free"] }
        }));
        let first = resolve(&events, &[groups()], &[free_dimension()], &[]).unwrap();
        let second = resolve(&events, &[groups()], &[free_dimension()], &[]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
    }
}

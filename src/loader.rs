//! Document Loading
//!
//! Reads the generation config and the files each target references,
//! validates them structurally and resolves every target. A missing file
//! aborts its own target only; the remaining targets are still checked.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, SchemaError, ValidationError};
use crate::resolve::{resolve, ResolvedSchemaModel};
use crate::schema::{
    DimensionsDocument, EventsDocument, GenerationConfig, GenerationTarget, GroupsDocument,
    MetaDocument,
};
use crate::validate::{
    validate_config, validate_dimensions, validate_events, validate_groups, validate_meta,
    ValidationResult,
};

/// Options for loading targets
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Run cross-reference resolution on the documents that did pass even
    /// when another document of the target failed structurally. Off by
    /// default, since missing documents cascade into unknown-name errors.
    pub resolve_despite_structural_errors: bool,
}

/// Outcome for one generation target
#[derive(Debug)]
pub enum TargetOutcome {
    Resolved(ResolvedSchemaModel),
    Invalid(Vec<ValidationError>),
    /// A referenced file could not be read at all
    Aborted(SchemaError),
}

/// Report for one generation target
#[derive(Debug)]
pub struct TargetReport {
    pub index: usize,
    pub output: String,
    pub outcome: TargetOutcome,
}

impl TargetReport {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, TargetOutcome::Resolved(_))
    }
}

/// Read a JSON or YAML document (by extension)
pub fn read_document(path: &Path) -> Result<Value> {
    if !path.is_file() {
        return Err(SchemaError::MissingFile { path: path.to_path_buf() });
    }
    let content = fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false);

    let value: Value = if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| SchemaError::InvalidFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    } else {
        serde_json::from_str(&content).map_err(|e| SchemaError::InvalidFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };
    debug!(path = %path.display(), "read document");
    Ok(value)
}

/// Load and structurally validate a generation config
pub fn load_config(path: &Path) -> Result<GenerationConfig> {
    let raw = read_document(path)?;
    validate_config(&path.display().to_string(), &raw)
        .into_result()
        .map_err(|errors| SchemaError::InvalidFormat {
            path: path.to_path_buf(),
            reason: errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "),
        })
}

/// Read, validate and resolve one target; paths are relative to `base_dir`
///
/// The outer error is the fail-fast case (a file could not be read); the
/// inner one carries every structural and cross-reference defect.
pub fn load_target(
    base_dir: &Path,
    target: &GenerationTarget,
    options: &LoadOptions,
) -> Result<std::result::Result<ResolvedSchemaModel, Vec<ValidationError>>> {
    let events_raw = read_document(&base_dir.join(&target.events))?;
    let groups_raw = read_all(base_dir, &target.groups)?;
    let dimensions_raw = read_all(base_dir, &target.dimensions)?;
    let meta_raw = read_all(base_dir, &target.meta)?;

    let mut errors = Vec::new();
    let events_name = target.events.display().to_string();
    let events = accept(validate_events(&events_name, &events_raw), &mut errors);
    let groups: Vec<GroupsDocument> = groups_raw
        .iter()
        .filter_map(|(path, raw)| accept(validate_groups(&name(path), raw), &mut errors))
        .collect();
    let dimensions: Vec<DimensionsDocument> = dimensions_raw
        .iter()
        .filter_map(|(path, raw)| accept(validate_dimensions(&name(path), raw), &mut errors))
        .collect();
    let meta: Vec<MetaDocument> = meta_raw
        .iter()
        .filter_map(|(path, raw)| accept(validate_meta(&name(path), raw), &mut errors))
        .collect();

    if !errors.is_empty() && !options.resolve_despite_structural_errors {
        return Ok(Err(errors));
    }

    let events = events.unwrap_or_else(EventsDocument::default);
    match resolve(&events, &groups, &dimensions, &meta) {
        Ok(model) if errors.is_empty() => Ok(Ok(model)),
        Ok(_) => Ok(Err(errors)),
        Err(mut resolution_errors) => {
            errors.append(&mut resolution_errors);
            Ok(Err(errors))
        }
    }
}

/// Check every target of a generation config
///
/// Target paths are relative to the config file's directory.
pub fn check_config(config_path: &Path, options: &LoadOptions) -> Result<Vec<TargetReport>> {
    let config = load_config(config_path)?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let reports: Vec<TargetReport> = config
        .generates
        .iter()
        .enumerate()
        .map(|(index, target)| {
            let outcome = match load_target(base_dir, target, options) {
                Ok(Ok(model)) => TargetOutcome::Resolved(model),
                Ok(Err(errors)) => TargetOutcome::Invalid(errors),
                Err(e) => TargetOutcome::Aborted(e),
            };
            TargetReport {
                index,
                output: target.output.clone(),
                outcome,
            }
        })
        .collect();

    info!(
        targets = reports.len(),
        failed = reports.iter().filter(|r| !r.is_ok()).count(),
        "checked generation config"
    );
    Ok(reports)
}

fn read_all(base_dir: &Path, paths: &[PathBuf]) -> Result<Vec<(PathBuf, Value)>> {
    paths
        .iter()
        .map(|path| Ok((path.clone(), read_document(&base_dir.join(path))?)))
        .collect()
}

fn name(path: &Path) -> String {
    path.display().to_string()
}

fn accept<T>(result: ValidationResult<T>, errors: &mut Vec<ValidationError>) -> Option<T> {
    errors.extend(result.errors);
    result.data
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    fn target(groups: &[&str]) -> GenerationTarget {
        GenerationTarget {
            events: PathBuf::from("events.json"),
            groups: groups.iter().map(PathBuf::from).collect(),
            dimensions: Vec::new(),
            meta: Vec::new(),
            output: "out.ts".to_string(),
        }
    }

    #[test]
    fn test_missing_file_is_fail_fast() {
        let dir = TempDir::new().unwrap();
        write(&dir, "events.json", r#"{"events": {}}"#);

        let err = load_target(dir.path(), &target(&["groups.json"]), &LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingFile { .. }));
    }

    #[test]
    fn test_yaml_documents() {
        let dir = TempDir::new().unwrap();
        write(&dir, "events.json", r#"{"events": {"team_created": {"name": "Team Created"}}}"#);
        write(
            &dir,
            "groups.yaml",
            concat!(
                "groups:\n",
                "  - name: Team\n",
                "    identifiedBy: Team ID\n",
                "    properties:\n",
                "      - name: Team ID\n",
                "        type: string\n",
            ),
        );

        let model = load_target(dir.path(), &target(&["groups.yaml"]), &LoadOptions::default())
            .unwrap()
            .unwrap();
        assert!(model.group("Team").is_some());
    }

    #[test]
    fn test_structural_errors_skip_resolution() {
        let dir = TempDir::new().unwrap();
        write(&dir, "events.json", r#"{"events": {"a": {"name": "A", "dimensions": ["Free"]}}}"#);
        write(&dir, "groups.json", r#"{"groups": [{"name": "Team"}]}"#);

        let errors = load_target(dir.path(), &target(&["groups.json"]), &LoadOptions::default())
            .unwrap()
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().starts_with("groups.json:"));

        let options = LoadOptions {
            resolve_despite_structural_errors: true,
        };
        let errors = load_target(dir.path(), &target(&["groups.json"]), &options)
            .unwrap()
            .unwrap_err();
        let codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["STRUCTURAL", "UNKNOWN_DIMENSION"]);
    }

    #[test]
    fn test_invalid_json_is_reported_with_path() {
        let dir = TempDir::new().unwrap();
        write(&dir, "events.json", "{ not json");
        let err = read_document(&dir.path().join("events.json")).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFormat { .. }));
    }

    #[test]
    fn test_check_config_isolates_targets() {
        let dir = TempDir::new().unwrap();
        write(&dir, "events.json", r#"{"events": {"a": {"name": "A"}}}"#);
        write(
            &dir,
            "tracking.config.json",
            r#"{"generates": [
                {"events": "events.json", "output": "a.ts"},
                {"events": "missing.json", "output": "b.ts"}
            ]}"#,
        );

        let config = dir.path().join("tracking.config.json");
        let reports = check_config(&config, &LoadOptions::default()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].is_ok());
        assert!(matches!(
            reports[1].outcome,
            TargetOutcome::Aborted(SchemaError::MissingFile { .. })
        ));
    }
}

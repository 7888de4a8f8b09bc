//! Provenance model and workflow export pipeline.
//!
//! Activities are recorded executions of a [`Plan`]. Exporting a set of
//! project paths walks the recorded activities back to the ones that produced
//! the current file contents, orders them and hands a [`CompositePlan`] to a
//! [`WorkflowConverter`] selected from a [`ConverterRegistry`].

use std::fmt::{Display, Formatter};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod export;
mod lineage;

pub use export::{
    export_workflow, ActivityGateway, CompositePlan, ConverterRegistry, ExportReport,
    ExportRequest, RenderedWorkflow, WorkflowConverter, DEFAULT_FORMAT,
};
pub use lineage::{
    filter_overridden_activities, select_downstream_activities, sort_activities, trace_lineage,
    ActivityIndex,
};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("path does not exist: {}", .0.display())]
    MissingPath(PathBuf),
    #[error("path {} is not inside project {}", .path.display(), .root.display())]
    PathOutsideProject { path: PathBuf, root: PathBuf },
    #[error("unsupported workflow format `{format}` (supported: {})", .supported.join(", "))]
    UnsupportedFormat {
        format: String,
        supported: Vec<String>,
    },
    #[error("dependency cycle detected among activities: {}", join_ids(.0))]
    DependencyCycle(Vec<ActivityId>),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(anyhow::Error),
    #[error(transparent)]
    Conversion(anyhow::Error),
}

fn join_ids(ids: &[ActivityId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActivityId(pub Ulid);

impl ActivityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ActivityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PlanId(pub Ulid);

impl PlanId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PlanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CompositePlanId(pub Ulid);

impl Display for CompositePlanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Parameter,
    Input,
    Output,
}

impl ParameterKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parameter => "parameter",
            Self::Input => "input",
            Self::Output => "output",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parameter" => Some(Self::Parameter),
            "input" => Some(Self::Input),
            "output" => Some(Self::Output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamMapping {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamMapping {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdin" => Some(Self::Stdin),
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One slot of a plan's command line.
///
/// For `input` and `output` parameters `default_value` is a project-relative
/// path; for plain parameters it is the literal argument.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommandParameter {
    pub name: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub position: Option<u32>,
    pub default_value: String,
    #[serde(default)]
    pub mapped_to: Option<StreamMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<CommandParameter>,
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

impl Plan {
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&CommandParameter> {
        self.parameters.iter().find(|parameter| parameter.name == name)
    }

    /// Checks that the template is usable for recording activities.
    ///
    /// # Errors
    /// Returns [`ExportError::Validation`] when the plan is unnamed, has an
    /// empty command, duplicate parameter names or invalid path defaults.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.name.trim().is_empty() {
            return Err(ExportError::Validation(
                "plan name MUST be provided".to_string(),
            ));
        }

        if self.command.trim().is_empty() {
            return Err(ExportError::Validation(format!(
                "plan {} MUST have a non-empty command",
                self.name
            )));
        }

        let mut seen = std::collections::BTreeSet::new();
        for parameter in &self.parameters {
            if parameter.name.trim().is_empty() {
                return Err(ExportError::Validation(format!(
                    "plan {} has a parameter without a name",
                    self.name
                )));
            }
            if !seen.insert(parameter.name.as_str()) {
                return Err(ExportError::Validation(format!(
                    "plan {} has duplicate parameter {}",
                    self.name, parameter.name
                )));
            }
            if matches!(parameter.kind, ParameterKind::Input | ParameterKind::Output) {
                validate_relative_path(Path::new(&parameter.default_value))?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParameterValue {
    pub parameter_name: String,
    pub value: String,
}

/// A recorded execution of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: ActivityId,
    pub activity_seq: i64,
    pub plan: Plan,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
    pub usages: Vec<PathBuf>,
    pub generations: Vec<PathBuf>,
    pub parameter_values: Vec<ParameterValue>,
}

impl Activity {
    /// Snapshot of the executed plan with the values bound for this run.
    #[must_use]
    pub fn plan_with_values(&self) -> Plan {
        let mut plan = self.plan.clone();
        for parameter in &mut plan.parameters {
            if let Some(bound) = self
                .parameter_values
                .iter()
                .find(|value| value.parameter_name == parameter.name)
            {
                parameter.default_value.clone_from(&bound.value);
            }
        }
        plan
    }

    /// Whether this activity finished before `other` started.
    ///
    /// Equal instants fall back to recording order so the relation stays
    /// acyclic for activities with well-formed timestamps.
    #[must_use]
    pub fn precedes(&self, other: &Activity) -> bool {
        if self.id == other.id {
            return false;
        }
        self.ended_at < other.started_at
            || (self.ended_at == other.started_at && self.activity_seq < other.activity_seq)
    }

    #[must_use]
    pub fn ordering_key(&self) -> (OffsetDateTime, i64) {
        (self.ended_at, self.activity_seq)
    }

    #[must_use]
    pub fn generates(&self, path: &Path) -> bool {
        let wanted = clean_relative_path(path);
        self.generations
            .iter()
            .any(|generated| clean_relative_path(generated) == wanted)
    }
}

/// Write-side payload for recording an activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityInput {
    pub activity_id: Option<ActivityId>,
    pub plan: Plan,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
    pub usages: Vec<PathBuf>,
    pub generations: Vec<PathBuf>,
    pub parameter_values: Vec<ParameterValue>,
}

impl ActivityInput {
    /// Validates an activity payload before it is recorded.
    ///
    /// # Errors
    /// Returns [`ExportError::Validation`] when the plan is invalid, the
    /// timestamps are not UTC or out of order, a path is not project-relative,
    /// or a value is bound to a parameter the plan does not declare.
    pub fn validate(&self) -> Result<(), ExportError> {
        self.plan.validate()?;

        if self.started_at.offset() != UtcOffset::UTC || self.ended_at.offset() != UtcOffset::UTC
        {
            return Err(ExportError::Validation(
                "activity timestamps MUST be UTC (offset Z)".to_string(),
            ));
        }

        if self.ended_at < self.started_at {
            return Err(ExportError::Validation(
                "ended_at MUST NOT be earlier than started_at".to_string(),
            ));
        }

        for path in self.usages.iter().chain(&self.generations) {
            validate_relative_path(path)?;
        }

        for value in &self.parameter_values {
            if self.plan.parameter(&value.parameter_name).is_none() {
                return Err(ExportError::Validation(format!(
                    "plan {} has no parameter named {}",
                    self.plan.name, value.parameter_name
                )));
            }
        }

        Ok(())
    }
}

/// Rejects empty, absolute or escaping paths.
///
/// # Errors
/// Returns [`ExportError::Validation`] describing the offending path.
pub fn validate_relative_path(path: &Path) -> Result<(), ExportError> {
    if path.as_os_str().is_empty() {
        return Err(ExportError::Validation(
            "recorded paths MUST NOT be empty".to_string(),
        ));
    }

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExportError::Validation(format!(
                    "recorded path MUST be project-relative: {}",
                    path.display()
                )));
            }
        }
    }

    if clean_relative_path(path).as_os_str().is_empty() {
        return Err(ExportError::Validation(format!(
            "recorded path MUST name something inside the project: {}",
            path.display()
        )));
    }

    Ok(())
}

/// Drops `.` components, so `./out/a.txt` and `out/a.txt` compare equal.
#[must_use]
pub fn clean_relative_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

/// Resolves the project root to an absolute, symlink-free path.
///
/// # Errors
/// Returns [`ExportError::MissingPath`] when the root does not exist.
pub fn canonical_project_root(root: &Path) -> Result<PathBuf, ExportError> {
    root.canonicalize()
        .map_err(|_| ExportError::MissingPath(root.to_path_buf()))
}

/// Rewrites `paths` relative to an already canonical project root.
///
/// Relative inputs are resolved against the working directory first.
///
/// # Errors
/// Returns [`ExportError::MissingPath`] for paths that do not exist and
/// [`ExportError::PathOutsideProject`] for paths outside `root`.
pub fn normalize_paths(root: &Path, paths: &[PathBuf]) -> Result<Vec<PathBuf>, ExportError> {
    paths
        .iter()
        .map(|path| {
            let absolute = path
                .canonicalize()
                .map_err(|_| ExportError::MissingPath(path.clone()))?;
            absolute
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .map_err(|_| ExportError::PathOutsideProject {
                    path: path.clone(),
                    root: root.to_path_buf(),
                })
        })
        .collect()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ExportError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ExportError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ExportError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ExportError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ExportError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ExportError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ExportError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}


#[cfg(test)]
mod tests {
    use super::fixtures::{activity, must, must_utc};
    use super::*;

    fn fixture_input() -> ActivityInput {
        let recorded = activity(1, &["data/raw.csv"], &["data/clean.csv"]);
        ActivityInput {
            activity_id: None,
            plan: recorded.plan,
            started_at: recorded.started_at,
            ended_at: recorded.ended_at,
            usages: recorded.usages,
            generations: recorded.generations,
            parameter_values: vec![ParameterValue {
                parameter_name: "input-1".to_string(),
                value: "data/raw.csv".to_string(),
            }],
        }
    }

    #[test]
    fn plan_with_values_binds_recorded_values() {
        let mut recorded = activity(1, &["data/raw-2026.csv"], &["data/clean.csv"]);
        recorded.plan.parameters[0].default_value = "data/raw.csv".to_string();
        recorded.parameter_values.push(ParameterValue {
            parameter_name: "input-1".to_string(),
            value: "data/raw-2026.csv".to_string(),
        });

        let plan = recorded.plan_with_values();

        assert_eq!(plan.id, recorded.plan.id);
        assert_eq!(plan.parameters[0].default_value, "data/raw-2026.csv");
        assert_eq!(plan.parameters[1].default_value, "data/clean.csv");
        assert_eq!(recorded.plan.parameters[0].default_value, "data/raw.csv");
    }

    #[test]
    fn precedes_uses_timestamps_then_recording_order() {
        let first = activity(1, &[], &["a.txt"]);
        let second = activity(2, &["a.txt"], &["b.txt"]);
        assert!(first.precedes(&second));
        assert!(!second.precedes(&first));
        assert!(!first.precedes(&first));

        let mut tied = activity(3, &["a.txt"], &["c.txt"]);
        tied.started_at = first.ended_at;
        assert!(first.precedes(&tied));
    }

    #[test]
    fn activity_input_validation_accepts_fixture() {
        must(fixture_input().validate());
    }

    #[test]
    fn activity_input_rejects_reversed_timestamps() {
        let mut input = fixture_input();
        input.ended_at = must_utc("2026-02-01T00:00:00Z");
        assert!(matches!(input.validate(), Err(ExportError::Validation(_))));
    }

    #[test]
    fn activity_input_rejects_escaping_paths() {
        let mut input = fixture_input();
        input.generations = vec![PathBuf::from("../outside.csv")];
        assert!(input.validate().is_err());

        let mut input = fixture_input();
        input.usages = vec![PathBuf::from("/abs/raw.csv")];
        assert!(input.validate().is_err());
    }

    #[test]
    fn activity_input_rejects_unknown_parameter_binding() {
        let mut input = fixture_input();
        input.parameter_values.push(ParameterValue {
            parameter_name: "missing".to_string(),
            value: "1".to_string(),
        });
        let err = match input.validate() {
            Ok(()) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn plan_validation_rejects_duplicate_parameters() {
        let mut plan = fixture_input().plan;
        let duplicate = plan.parameters[0].clone();
        plan.parameters.push(duplicate);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn normalize_paths_rewrites_relative_to_root() {
        let root = std::env::temp_dir().join(format!("prov-export-root-{}", Ulid::new()));
        must(std::fs::create_dir_all(root.join("data")));
        must(std::fs::write(root.join("data/result.txt"), "42"));
        let root = must(canonical_project_root(&root));

        let normalized = must(normalize_paths(&root, &[root.join("data/result.txt")]));
        assert_eq!(normalized, vec![PathBuf::from("data/result.txt")]);

        let missing = normalize_paths(&root, &[root.join("data/missing.txt")]);
        assert!(matches!(missing, Err(ExportError::MissingPath(_))));

        let outside = normalize_paths(&root, &[std::env::temp_dir()]);
        assert!(matches!(
            outside,
            Err(ExportError::PathOutsideProject { .. })
        ));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        let parsed = must_utc("2026-02-07T12:00:00Z");
        assert_eq!(must(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }

    #[test]
    fn enum_codes_round_trip() {
        for kind in [
            ParameterKind::Parameter,
            ParameterKind::Input,
            ParameterKind::Output,
        ] {
            assert_eq!(ParameterKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(StreamMapping::parse("stdout"), Some(StreamMapping::Stdout));
        assert_eq!(StreamMapping::parse("tty"), None);
    }

    #[test]
    fn plan_json_defaults_optional_fields() {
        let plan: Plan = must(serde_json::from_str(
            r#"{
                "id": "01J0SQQP7M70P6Y3R4T8D8G8M2",
                "name": "count",
                "command": "wc -l"
            }"#,
        ));
        assert_eq!(plan.success_codes, vec![0]);
        assert!(plan.parameters.is_empty());
        assert!(plan.description.is_none());
    }

    #[test]
    fn activity_timestamps_serialize_as_rfc3339() {
        let recorded = activity(1, &["a.csv"], &["b.csv"]);
        let value = must(serde_json::to_value(&recorded));
        assert_eq!(value["started_at"], "2026-02-07T12:02:00Z");
        assert_eq!(value["ended_at"], "2026-02-07T12:03:00Z");
    }

    #[test]
    fn dot_components_are_cleaned_but_bare_dot_is_rejected() {
        assert_eq!(
            clean_relative_path(Path::new("./out/./a.txt")),
            PathBuf::from("out/a.txt")
        );
        assert!(validate_relative_path(Path::new("./out/a.txt")).is_ok());
        assert!(validate_relative_path(Path::new(".")).is_err());
        assert!(validate_relative_path(Path::new("./")).is_err());
    }

    #[test]
    fn generates_ignores_leading_dot_segments() {
        let recorded = activity(1, &[], &["./result.txt"]);
        assert!(recorded.generates(Path::new("result.txt")));
        assert!(recorded.generates(Path::new("./result.txt")));
        assert!(!recorded.generates(Path::new("other.txt")));
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::lineage::trace_lineage;
use crate::{
    canonical_project_root, normalize_paths, now_utc, Activity, CompositePlanId, ExportError,
    Plan,
};

pub const DEFAULT_FORMAT: &str = "cwl";

/// Read access to the recorded activity history.
pub trait ActivityGateway {
    #[allow(clippy::missing_errors_doc)]
    fn get_all_activities(&self) -> anyhow::Result<Vec<Activity>>;
}

impl ActivityGateway for Vec<Activity> {
    fn get_all_activities(&self) -> anyhow::Result<Vec<Activity>> {
        Ok(self.clone())
    }
}

/// Renders a composite plan into one workflow language.
///
/// A converter serves exactly the format named by [`format_name`], so
/// `convert` takes no format argument; the registry picks the converter
/// and the name travels back in [`RenderedWorkflow::format`].
///
/// [`format_name`]: WorkflowConverter::format_name
pub trait WorkflowConverter {
    fn format_name(&self) -> &'static str;

    /// Renders `workflow`, resolving relative file references against
    /// `basedir`. With `output` set the document is written there as well.
    #[allow(clippy::missing_errors_doc)]
    fn convert(
        &self,
        workflow: &CompositePlan,
        basedir: &Path,
        output: Option<&Path>,
    ) -> anyhow::Result<RenderedWorkflow>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedWorkflow {
    pub format: String,
    pub text: String,
    pub written_to: Option<PathBuf>,
}

/// Explicit format name to converter mapping. Names are matched
/// case-insensitively.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: BTreeMap<String, Box<dyn WorkflowConverter>>,
}

impl ConverterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a converter, replacing any previous one with the same name.
    pub fn register(&mut self, converter: Box<dyn WorkflowConverter>) {
        self.converters
            .insert(converter.format_name().to_ascii_lowercase(), converter);
    }

    #[must_use]
    pub fn with(mut self, converter: Box<dyn WorkflowConverter>) -> Self {
        self.register(converter);
        self
    }

    /// Looks up the converter for `format`.
    ///
    /// # Errors
    /// Returns [`ExportError::UnsupportedFormat`] listing the registered names
    /// when `format` is unknown.
    pub fn resolve(&self, format: &str) -> Result<&dyn WorkflowConverter, ExportError> {
        self.converters
            .get(&format.to_ascii_lowercase())
            .map(AsRef::as_ref)
            .ok_or_else(|| ExportError::UnsupportedFormat {
                format: format.to_string(),
                supported: self.supported_formats(),
            })
    }

    #[must_use]
    pub fn supported_formats(&self) -> Vec<String> {
        self.converters.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("formats", &self.supported_formats())
            .finish()
    }
}

/// Ordered collection of value-bound plans forming one exported workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositePlan {
    pub id: CompositePlanId,
    pub name: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub plans: Vec<Plan>,
}

impl CompositePlan {
    #[must_use]
    pub fn generate_id() -> CompositePlanId {
        CompositePlanId(Ulid::new())
    }

    /// `plan-collection-<ulid>`: millisecond timestamp plus 80 random bits.
    #[must_use]
    pub fn generate_name() -> String {
        format!("plan-collection-{}", Ulid::new().to_string().to_lowercase())
    }

    /// Builds a fresh composite from activities already in execution order.
    #[must_use]
    pub fn from_activities<'a, I>(activities: I) -> Self
    where
        I: IntoIterator<Item = &'a Activity>,
    {
        Self {
            id: Self::generate_id(),
            name: Self::generate_name(),
            description: None,
            created_at: now_utc(),
            plans: activities
                .into_iter()
                .map(Activity::plan_with_values)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub paths: Vec<PathBuf>,
    pub format: String,
    pub output: Option<PathBuf>,
}

impl ExportRequest {
    #[must_use]
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            format: DEFAULT_FORMAT.to_string(),
            output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub workflow: CompositePlan,
    pub rendered: RenderedWorkflow,
}

/// Exports the workflow that produced `request.paths`.
///
/// The converter is resolved before the history is read, so an unknown
/// format never touches the store.
///
/// # Errors
/// Returns [`ExportError::UnsupportedFormat`], [`ExportError::MissingPath`]
/// or [`ExportError::PathOutsideProject`] for bad requests,
/// [`ExportError::Store`] and [`ExportError::Conversion`] for collaborator
/// failures, and [`ExportError::DependencyCycle`] for inconsistent history.
pub fn export_workflow(
    gateway: &dyn ActivityGateway,
    registry: &ConverterRegistry,
    project_root: &Path,
    request: &ExportRequest,
) -> Result<ExportReport, ExportError> {
    let converter = registry.resolve(&request.format)?;

    let root = canonical_project_root(project_root)?;
    let targets = normalize_paths(&root, &request.paths)?;

    let history = gateway.get_all_activities().map_err(ExportError::Store)?;
    let lineage = trace_lineage(&history, &targets)?;
    let workflow = CompositePlan::from_activities(lineage);

    tracing::debug!(
        workflow = %workflow.name,
        plans = workflow.plans.len(),
        format = converter.format_name(),
        "assembled composite plan"
    );

    let rendered = converter
        .convert(&workflow, &root, request.output.as_deref())
        .map_err(ExportError::Conversion)?;

    tracing::info!(
        workflow = %workflow.name,
        plans = workflow.plans.len(),
        written_to = ?rendered.written_to,
        "exported workflow"
    );

    Ok(ExportReport { workflow, rendered })
}

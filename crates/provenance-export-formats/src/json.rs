use std::path::Path;

use anyhow::{Context, Result};
use provenance_export_core::{CompositePlan, RenderedWorkflow, WorkflowConverter};

/// Pretty-printed JSON dump of the composite plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl WorkflowConverter for JsonConverter {
    fn format_name(&self) -> &'static str {
        "json"
    }

    fn convert(
        &self,
        workflow: &CompositePlan,
        _basedir: &Path,
        output: Option<&Path>,
    ) -> Result<RenderedWorkflow> {
        let mut text = serde_json::to_string_pretty(workflow)
            .with_context(|| format!("failed to serialize workflow {}", workflow.name))?;
        text.push('\n');
        crate::emit(self.format_name(), text, output)
    }
}

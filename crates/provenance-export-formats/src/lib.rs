//! Built-in workflow converters.
//!
//! Each converter renders a [`provenance_export_core::CompositePlan`] into a single document and,
//! when given an output path, writes it there as well.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use provenance_export_core::{ConverterRegistry, RenderedWorkflow};

mod cwl;
mod json;

pub use cwl::CwlConverter;
pub use json::JsonConverter;

/// Registry holding every converter shipped with this crate.
#[must_use]
pub fn builtin_registry() -> ConverterRegistry {
    ConverterRegistry::new()
        .with(Box::new(CwlConverter))
        .with(Box::new(JsonConverter))
}

/// Returns the rendered document, writing it to `output` first when set.
fn emit(format: &str, text: String, output: Option<&Path>) -> Result<RenderedWorkflow> {
    let written_to = match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create output directory {}", parent.display())
                })?;
            }
            fs::write(path, &text)
                .with_context(|| format!("failed to write workflow to {}", path.display()))?;
            tracing::debug!(format, path = %path.display(), "wrote workflow document");
            Some(path.to_path_buf())
        }
        None => None,
    };

    Ok(RenderedWorkflow {
        format: format.to_string(),
        text,
        written_to,
    })
}

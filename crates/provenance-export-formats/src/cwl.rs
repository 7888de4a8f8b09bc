use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use provenance_export_core::{
    CommandParameter, CompositePlan, ParameterKind, Plan, RenderedWorkflow, StreamMapping,
    WorkflowConverter,
};
use serde::Serialize;

const CWL_VERSION: &str = "v1.0";
const SHEBANG: &str = "#!/usr/bin/env cwl-runner\n\n";

/// Renders a composite plan as a single CWL `Workflow` document.
///
/// Every plan becomes one step running an inline `CommandLineTool`. Files a
/// step reads that an earlier step wrote are wired to that step's output;
/// everything else is lifted to a workflow input pointing into `basedir`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CwlConverter;

impl WorkflowConverter for CwlConverter {
    fn format_name(&self) -> &'static str {
        "cwl"
    }

    fn convert(
        &self,
        workflow: &CompositePlan,
        basedir: &Path,
        output: Option<&Path>,
    ) -> Result<RenderedWorkflow> {
        let document = build_workflow(workflow, basedir);
        let yaml = serde_yaml::to_string(&document)
            .with_context(|| format!("failed to serialize CWL workflow {}", workflow.name))?;
        crate::emit(self.format_name(), format!("{SHEBANG}{yaml}"), output)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Workflow {
    cwl_version: &'static str,
    class: &'static str,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    doc: Option<String>,
    inputs: Vec<WorkflowInput>,
    outputs: Vec<WorkflowOutput>,
    steps: Vec<WorkflowStep>,
}

#[derive(Debug, Serialize)]
struct WorkflowInput {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    default: FileLiteral,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowOutput {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    output_source: String,
}

#[derive(Debug, Serialize)]
struct WorkflowStep {
    id: String,
    label: String,
    run: CommandLineTool,
    #[serde(rename = "in")]
    inputs: Vec<StepInput>,
    out: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StepInput {
    id: String,
    source: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandLineTool {
    class: &'static str,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    doc: Option<String>,
    base_command: Vec<String>,
    inputs: Vec<ToolInput>,
    outputs: Vec<ToolOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
    success_codes: Vec<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolInput {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    default: DefaultValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_binding: Option<InputBinding>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum DefaultValue {
    Literal(String),
    File(FileLiteral),
}

#[derive(Debug, Clone, Serialize)]
struct FileLiteral {
    class: &'static str,
    location: String,
}

#[derive(Debug, Serialize)]
struct InputBinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolOutput {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    output_binding: OutputBinding,
}

#[derive(Debug, Serialize)]
struct OutputBinding {
    glob: String,
}

/// Step output that currently holds a project path.
#[derive(Debug)]
struct Producer {
    step: String,
    output: String,
    consumed: bool,
}

fn build_workflow(workflow: &CompositePlan, basedir: &Path) -> Workflow {
    let mut inputs = Vec::new();
    let mut steps = Vec::new();
    let mut producers: BTreeMap<String, Producer> = BTreeMap::new();

    for (index, plan) in workflow.plans.iter().enumerate() {
        let step_id = format!("step_{index}_{}", sanitize_id(&plan.name));
        let tool = command_line_tool(&step_id, plan, basedir);

        let mut step_inputs = Vec::new();
        for parameter in plan.parameters.iter().filter(|p| p.kind == ParameterKind::Input) {
            let source = match producers.get_mut(&parameter.default_value) {
                Some(producer) => {
                    producer.consumed = true;
                    format!("{}/{}", producer.step, producer.output)
                }
                None => {
                    let workflow_input = format!("{step_id}_{}", parameter.name);
                    inputs.push(WorkflowInput {
                        id: workflow_input.clone(),
                        kind: "File",
                        default: file_literal(basedir, &parameter.default_value),
                    });
                    workflow_input
                }
            };
            step_inputs.push(StepInput {
                id: parameter.name.clone(),
                source,
            });
        }

        let mut out = Vec::new();
        for parameter in plan.parameters.iter().filter(|p| p.kind == ParameterKind::Output) {
            out.push(parameter.name.clone());
            producers.insert(
                parameter.default_value.clone(),
                Producer {
                    step: step_id.clone(),
                    output: parameter.name.clone(),
                    consumed: false,
                },
            );
        }

        steps.push(WorkflowStep {
            id: step_id,
            label: plan.name.clone(),
            run: tool,
            inputs: step_inputs,
            out,
        });
    }

    let mut outputs: Vec<WorkflowOutput> = producers
        .values()
        .filter(|producer| !producer.consumed)
        .map(|producer| WorkflowOutput {
            id: format!("{}_{}", producer.step, producer.output),
            kind: "File",
            output_source: format!("{}/{}", producer.step, producer.output),
        })
        .collect();
    outputs.sort_by(|left, right| left.id.cmp(&right.id));

    tracing::debug!(
        workflow = %workflow.name,
        steps = steps.len(),
        inputs = inputs.len(),
        outputs = outputs.len(),
        "built CWL workflow"
    );

    Workflow {
        cwl_version: CWL_VERSION,
        class: "Workflow",
        id: sanitize_id(&workflow.name),
        doc: workflow.description.clone(),
        inputs,
        outputs,
        steps,
    }
}

fn command_line_tool(step_id: &str, plan: &Plan, basedir: &Path) -> CommandLineTool {
    let mut tool = CommandLineTool {
        class: "CommandLineTool",
        id: format!("{step_id}_tool"),
        doc: plan.description.clone(),
        base_command: plan.command.split_whitespace().map(str::to_string).collect(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        stdin: None,
        stdout: None,
        stderr: None,
        success_codes: plan.success_codes.clone(),
    };

    for parameter in &plan.parameters {
        match parameter.kind {
            ParameterKind::Parameter => tool.inputs.push(ToolInput {
                id: parameter.name.clone(),
                kind: "string",
                default: DefaultValue::Literal(parameter.default_value.clone()),
                input_binding: binding(parameter),
            }),
            ParameterKind::Input => {
                if parameter.mapped_to == Some(StreamMapping::Stdin) {
                    tool.stdin = Some(format!("$(inputs.{}.path)", parameter.name));
                }
                tool.inputs.push(ToolInput {
                    id: parameter.name.clone(),
                    kind: "File",
                    default: DefaultValue::File(file_literal(basedir, &parameter.default_value)),
                    input_binding: binding(parameter),
                });
            }
            ParameterKind::Output => {
                let argument = format!("{}_arg", parameter.name);
                let reference = format!("$(inputs.{argument})");
                match parameter.mapped_to {
                    Some(StreamMapping::Stdout) => tool.stdout = Some(reference.clone()),
                    Some(StreamMapping::Stderr) => tool.stderr = Some(reference.clone()),
                    Some(StreamMapping::Stdin) | None => {}
                }
                tool.inputs.push(ToolInput {
                    id: argument,
                    kind: "string",
                    default: DefaultValue::Literal(parameter.default_value.clone()),
                    input_binding: binding(parameter),
                });
                tool.outputs.push(ToolOutput {
                    id: parameter.name.clone(),
                    kind: "File",
                    output_binding: OutputBinding { glob: reference },
                });
            }
        }
    }

    tool
}

/// Command-line binding, omitted for stream-mapped slots.
fn binding(parameter: &CommandParameter) -> Option<InputBinding> {
    if parameter.mapped_to.is_some() {
        return None;
    }
    Some(InputBinding {
        prefix: parameter.prefix.clone(),
        position: parameter.position,
    })
}

fn file_literal(basedir: &Path, relative: &str) -> FileLiteral {
    FileLiteral {
        class: "File",
        location: basedir.join(relative).display().to_string(),
    }
}

fn sanitize_id(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if sanitized.is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}

//! `prov-export` command surface.
//!
//! [`run_cli`] executes a parsed [`Cli`]; `main` only parses arguments and
//! installs the log subscriber. Rendered workflows go to stdout, logs to
//! stderr.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use provenance_export_core::{
    export_workflow, format_rfc3339, Activity, ConverterRegistry, ExportReport, ExportRequest,
    DEFAULT_FORMAT,
};
use provenance_export_formats::builtin_registry;
use provenance_export_store_sqlite::SqliteActivityStore;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "prov-export")]
#[command(about = "Export the recorded workflow behind project files")]
pub struct Cli {
    /// Activity store to read.
    #[arg(long, default_value = "./provenance.sqlite3")]
    db: PathBuf,

    /// Project root the recorded paths are relative to.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Export the workflow that produced PATHS.
    Export(ExportArgs),
    /// List the available workflow formats.
    Formats,
    Activities {
        #[command(subcommand)]
        command: ActivitiesCommand,
    },
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Files or directories whose lineage is exported.
    paths: Vec<PathBuf>,

    #[arg(long, default_value = DEFAULT_FORMAT)]
    format: String,

    /// Write the workflow here instead of stdout.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ActivitiesCommand {
    /// List recorded activities in recording order.
    List {
        #[arg(long)]
        json: bool,
    },
}

/// Runs a parsed command line.
///
/// # Errors
/// Returns an error when a path is missing, the store cannot be read, the
/// format is unknown or the export fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Export(args) => {
            let report = run_export(&cli.db, &cli.root, args)?;
            if report.rendered.written_to.is_none() {
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(report.rendered.text.as_bytes())
                    .context("failed to write workflow to stdout")?;
            }
            Ok(())
        }
        Command::Formats => {
            print!("{}", render_formats(&builtin_registry()));
            Ok(())
        }
        Command::Activities { command } => match command {
            ActivitiesCommand::List { json } => {
                let store = SqliteActivityStore::open_read_only(&cli.db)?;
                let activities = store.list_activities()?;
                if json {
                    let rows = activities
                        .iter()
                        .map(ActivityRow::from_activity)
                        .collect::<Result<Vec<_>>>()?;
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                } else {
                    print!("{}", render_activity_table(&activities)?);
                }
                Ok(())
            }
        },
    }
}

/// Exports the lineage of `args.paths` from the store at `db_path`.
///
/// # Errors
/// Returns an error when any path does not exist or the format is unknown
/// (both checked before the store is opened), the store cannot be opened
/// read-only or the export fails.
pub fn run_export(db_path: &Path, root: &Path, args: ExportArgs) -> Result<ExportReport> {
    for path in &args.paths {
        if !path.exists() {
            bail!("path does not exist: {}", path.display());
        }
    }

    let registry = builtin_registry();
    registry.resolve(&args.format)?;

    let store = SqliteActivityStore::open_read_only(db_path)?;
    tracing::debug!(
        db = %db_path.display(),
        paths = args.paths.len(),
        format = %args.format,
        "starting export"
    );

    let mut request = ExportRequest::new(args.paths);
    request.format = args.format;
    request.output = args.output;

    let report = export_workflow(&store, &registry, root, &request)
        .with_context(|| format!("failed to export workflow in {} format", request.format))?;
    Ok(report)
}

fn render_formats(registry: &ConverterRegistry) -> String {
    registry
        .supported_formats()
        .into_iter()
        .map(|name| {
            if name == DEFAULT_FORMAT {
                format!("{name} (default)\n")
            } else {
                format!("{name}\n")
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct ActivityRow {
    activity_seq: i64,
    activity_id: String,
    plan: String,
    started_at: String,
    ended_at: String,
    usages: Vec<String>,
    generations: Vec<String>,
}

impl ActivityRow {
    fn from_activity(activity: &Activity) -> Result<Self> {
        Ok(Self {
            activity_seq: activity.activity_seq,
            activity_id: activity.id.to_string(),
            plan: activity.plan.name.clone(),
            started_at: format_rfc3339(activity.started_at)?,
            ended_at: format_rfc3339(activity.ended_at)?,
            usages: display_paths(&activity.usages),
            generations: display_paths(&activity.generations),
        })
    }
}

fn display_paths(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|path| path.display().to_string()).collect()
}

fn render_activity_table(activities: &[Activity]) -> Result<String> {
    let mut out = format!(
        "{:<5} {:<26} {:<20} {:<20} GENERATES\n",
        "SEQ", "ACTIVITY", "PLAN", "ENDED"
    );
    for activity in activities {
        let row = ActivityRow::from_activity(activity)?;
        out.push_str(&format!(
            "{:<5} {:<26} {:<20} {:<20} {}\n",
            row.activity_seq,
            row.activity_id,
            row.plan,
            row.ended_at,
            row.generations.join(",")
        ));
    }
    Ok(out)
}

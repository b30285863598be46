//! Command definitions and handlers for the `brickflow` binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};

use brickflow_core::brick::BrickRegistry;
use brickflow_core::workflow::loader::{
    WriterConflict, check_bricks, parse_workflow_value, validate_document, writer_conflicts,
};
use brickflow_infra::discover_workflows;
use brickflow_types::brick::BuiltinBrickType;

/// Inspect and validate brickflow workflows.
#[derive(Parser)]
#[command(name = "brickflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (defaults to $BRICKFLOW_DATA_DIR or ~/.brickflow).
    #[arg(long, global = true, env = "BRICKFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow document and report every problem found.
    Validate {
        /// Path to the workflow JSON file.
        file: PathBuf,
    },

    /// List the registered brick types.
    Types,

    /// List the valid workflows in a directory.
    #[command(alias = "ls")]
    List {
        /// Directory to scan (defaults to the configured workflow directory).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// Everything `validate` found in one document.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Structural problems and brick config rejections. Any entry fails
    /// validation.
    pub errors: Vec<String>,
    /// Keys written by more than one brick. Reported, not fatal.
    pub conflicts: Vec<WriterConflict>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn build_report(content: &str, registry: &BrickRegistry) -> ValidationReport {
    let doc: serde_json::Value = match serde_json::from_str(content) {
        Ok(doc) => doc,
        Err(e) => {
            return ValidationReport {
                errors: vec![format!("not valid JSON: {e}")],
                ..ValidationReport::default()
            };
        }
    };

    let errors = validate_document(&doc);
    if !errors.is_empty() {
        return ValidationReport {
            errors,
            ..ValidationReport::default()
        };
    }

    match parse_workflow_value(doc) {
        Ok(workflow) => ValidationReport {
            errors: check_bricks(&workflow, registry)
                .iter()
                .map(ToString::to_string)
                .collect(),
            conflicts: writer_conflicts(&workflow),
        },
        Err(e) => ValidationReport {
            errors: vec![e.to_string()],
            ..ValidationReport::default()
        },
    }
}

pub async fn validate(file: &Path, json: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let report = build_report(&content, &BrickRegistry::new());

    if json {
        let out = serde_json::json!({
            "file": file.display().to_string(),
            "valid": report.is_valid(),
            "errors": report.errors,
            "writerConflicts": report
                .conflicts
                .iter()
                .map(|c| serde_json::json!({ "key": c.key, "bricks": c.brick_ids }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(file, &report);
    }

    if !report.is_valid() {
        bail!("{} has {} problem(s)", file.display(), report.errors.len());
    }
    Ok(())
}

fn print_report(file: &Path, report: &ValidationReport) {
    println!();
    if report.is_valid() {
        println!("  {} is valid.", file.display());
    } else {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![Cell::new("#"), Cell::new("Problem").fg(Color::Red)]);
        for (index, error) in report.errors.iter().enumerate() {
            table.add_row(vec![Cell::new(index + 1), Cell::new(error)]);
        }
        println!("{table}");
    }

    if !report.conflicts.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Data key").fg(Color::Yellow),
                Cell::new("Written by"),
            ]);
        for conflict in &report.conflicts {
            table.add_row(vec![
                Cell::new(&conflict.key),
                Cell::new(conflict.brick_ids.join(", ")),
            ]);
        }
        println!();
        println!("  Keys with more than one writer:");
        println!("{table}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// types
// ---------------------------------------------------------------------------

pub fn list_types(json: bool) -> Result<()> {
    let registry = BrickRegistry::new();
    let types = registry.supported_types();

    if json {
        println!("{}", serde_json::to_string_pretty(&types)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Type").fg(Color::Cyan), Cell::new("Origin")]);
    for brick_type in &types {
        let origin = if brick_type.parse::<BuiltinBrickType>().is_ok() {
            "built-in"
        } else {
            "custom"
        };
        table.add_row(vec![Cell::new(brick_type), Cell::new(origin)]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

pub async fn list_workflows(dir: &Path, json: bool) -> Result<()> {
    let workflows = discover_workflows(dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?;

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|(path, w)| {
                serde_json::json!({
                    "id": w.id,
                    "name": w.name,
                    "steps": w.steps.len(),
                    "path": path.display().to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows found in {}.", dir.display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Steps"),
            Cell::new("Initial step"),
        ]);
    for (_, workflow) in &workflows {
        table.add_row(vec![
            Cell::new(&workflow.id),
            Cell::new(&workflow.name),
            Cell::new(workflow.steps.len()),
            Cell::new(&workflow.initial_step),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cli_parses_validate_with_global_flags() {
        let cli = Cli::try_parse_from(["brickflow", "validate", "wf.json", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Validate { ref file } if file == Path::new("wf.json")));
    }

    #[test]
    fn report_collects_structural_errors() {
        let doc = json!({
            "id": "wf", "name": "Wf",
            "steps": { "a": { "id": "a", "bricks": [{ "id": "x" }] } }
        });
        let report = build_report(&doc.to_string(), &BrickRegistry::new());
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
        assert!(report.errors.iter().any(|e| e.contains("initialStep")));
    }

    #[test]
    fn report_flags_unknown_types_and_writer_conflicts() {
        let doc = json!({
            "id": "wf", "name": "Wf", "initialStep": "a",
            "steps": { "a": { "id": "a", "bricks": [
                { "id": "one", "type": "user_input", "saveConfig": { "key": "email" } },
                { "id": "two", "type": "user_input", "saveConfig": { "key": "email" } },
                { "id": "three", "type": "hologram" }
            ] } }
        });
        let report = build_report(&doc.to_string(), &BrickRegistry::new());

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("hologram"));
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].key, "email");
    }

    #[test]
    fn invalid_json_is_reported_not_raised() {
        let report = build_report("{", &BrickRegistry::new());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("not valid JSON"));
    }

    #[tokio::test]
    async fn validate_fails_on_an_invalid_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("wf.json");
        tokio::fs::write(&path, r#"{"id": "wf"}"#).await.unwrap();

        assert!(validate(&path, true).await.is_err());
    }
}

//! `metrolake run` - plan and run partition jobs for a date range

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Args;
use comfy_table::{Cell, Color};
use metrolake_core::ProgressContext;
use metrolake_pipeline::{Orchestrator, PlanStatus, PlannedJob, RunReport, RunRequest, build_datasets};
use metrolake_store::Layer;

use super::{new_table, open_store};
use crate::config::Config;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// First service date (YYYY-MM-DD)
    #[arg(long)]
    pub start: NaiveDate,

    /// Last service date, inclusive (default: --start)
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Only these datasets (repeatable; default: all configured)
    #[arg(long = "dataset")]
    pub datasets: Vec<String>,

    /// Only this layer: raw, processed or cleaned
    #[arg(long)]
    pub layer: Option<Layer>,

    /// Re-run materialized processed/cleaned partitions
    #[arg(long)]
    pub force: bool,

    /// Show the plan without executing
    #[arg(long)]
    pub dry_run: bool,

    /// Number of parallel workers
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl RunArgs {
    fn request(&self) -> RunRequest {
        RunRequest {
            start: self.start,
            end: self.end.unwrap_or(self.start),
            datasets: self.datasets.clone(),
            layer: self.layer,
            force: self.force,
        }
    }
}

/// Returns `false` when any job failed.
pub fn run(args: RunArgs, config: &Config, progress: &ProgressContext) -> Result<bool> {
    let mut pipeline = config.pipeline.to_pipeline_config()?;
    if let Some(workers) = args.workers {
        pipeline.workers = workers.max(1);
    }

    let datasets =
        build_datasets(&config.datasets, &pipeline).context("invalid dataset configuration")?;
    let client = open_store(config)?;
    let orchestrator = Orchestrator::new(client, datasets, pipeline)
        .context("failed to load the manifest")?;

    let request = args.request();
    let plan = orchestrator.plan(&request)?;
    print_plan(&plan);

    if args.dry_run {
        eprintln!("(dry-run mode, no execution)");
        return Ok(true);
    }

    let report = orchestrator.run(&request, progress)?;
    print_changes(&report);
    Ok(!report.has_failures())
}

fn print_plan(plan: &[PlannedJob]) {
    if plan.is_empty() {
        eprintln!("Nothing planned.");
        return;
    }

    let mut table = new_table(&["Partition", "Manifest", "Status"]);
    for p in plan {
        let existing = p.existing.map_or_else(|| "-".to_string(), |s| s.to_string());
        let status = match p.status {
            PlanStatus::Cached => Cell::new(p.status).fg(Color::Green),
            PlanStatus::NeedsRun => Cell::new(p.status).fg(Color::Yellow),
        };
        table.add_row(vec![Cell::new(p.job.label()), Cell::new(existing), status]);
    }

    let to_run = plan
        .iter()
        .filter(|p| p.status == PlanStatus::NeedsRun)
        .count();
    eprintln!("\n=== Pipeline Plan ===");
    eprintln!("{table}");
    eprintln!("{to_run} of {} partitions need a run", plan.len());
}

fn print_changes(report: &RunReport) {
    if report.changes.is_empty() {
        eprintln!("Manifest unchanged.");
        return;
    }

    let mut table = new_table(&["Object", "Before", "After"]);
    let show = |s: Option<metrolake_store::PartitionStatus>| {
        s.map_or_else(|| "-".to_string(), |s| s.to_string())
    };
    for change in &report.changes {
        table.add_row(vec![
            Cell::new(&change.object_key),
            Cell::new(show(change.before)),
            Cell::new(show(change.after)),
        ]);
    }
    eprintln!("\n{table}");
    eprintln!("{} manifest entries changed", report.changes.len());
}

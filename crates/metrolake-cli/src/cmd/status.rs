//! `metrolake status` - manifest entries and source watermarks

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color};
use metrolake_core::fmt_num;
use metrolake_store::{ManifestEntry, PartitionStatus};

use super::{new_table, open_manifest, short};
use crate::config::Config;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only this dataset
    #[arg(long)]
    pub dataset: Option<String>,

    /// Only entries with this status: in_progress, materialized, empty, failed
    #[arg(long)]
    pub status: Option<PartitionStatus>,
}

fn keep(args: &StatusArgs, entry: &ManifestEntry) -> bool {
    args.dataset.as_ref().map_or(true, |d| *d == entry.dataset)
        && args.status.map_or(true, |s| s == entry.status)
}

fn status_cell(status: PartitionStatus) -> Cell {
    let color = match status {
        PartitionStatus::Materialized => Color::Green,
        PartitionStatus::Empty => Color::DarkGrey,
        PartitionStatus::InProgress => Color::Yellow,
        PartitionStatus::Failed => Color::Red,
    };
    Cell::new(status).fg(color)
}

pub fn run(args: StatusArgs, config: &Config) -> Result<()> {
    let (_, manifest) = open_manifest(config)?;
    let state = manifest.snapshot();

    let entries: Vec<&ManifestEntry> = state.entries.values().filter(|e| keep(&args, e)).collect();
    if entries.is_empty() {
        eprintln!("No manifest entries.");
    } else {
        let mut table = new_table(&[
            "Partition", "Status", "Records", "Hash", "Attempts", "Updated", "Error",
        ]);
        for entry in &entries {
            let hash = entry.content_hash.as_deref().map_or("-", short);
            table.add_row(vec![
                Cell::new(entry.partition_key().label()),
                status_cell(entry.status),
                Cell::new(fmt_num(entry.record_count)),
                Cell::new(hash),
                Cell::new(entry.attempts),
                Cell::new(entry.updated_at.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(entry.last_error.as_deref().unwrap_or("")),
            ]);
        }
        eprintln!("\n{table}");

        let count = |s: PartitionStatus| entries.iter().filter(|e| e.status == s).count();
        eprintln!(
            "{} entries: {} materialized, {} empty, {} failed, {} in progress",
            entries.len(),
            count(PartitionStatus::Materialized),
            count(PartitionStatus::Empty),
            count(PartitionStatus::Failed),
            count(PartitionStatus::InProgress)
        );
    }

    let watermarks: Vec<_> = state
        .watermarks
        .iter()
        .filter(|(name, _)| {
            args.dataset
                .as_ref()
                .map_or(true, |d| name.split('/').next() == Some(d.as_str()))
        })
        .collect();
    if !watermarks.is_empty() {
        let mut table = new_table(&["Source", "Watermark"]);
        for (name, ts) in watermarks {
            table.add_row(vec![Cell::new(name), Cell::new(ts.to_rfc3339())]);
        }
        eprintln!("\n{table}");
    }
    Ok(())
}

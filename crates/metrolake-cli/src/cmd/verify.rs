//! `metrolake verify` - recompute content hashes against the manifest

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color};
use metrolake_store::{VerifyResult, verify, verify_all};

use super::{new_table, open_manifest, short};
use crate::config::Config;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Object key of one partition (default: every materialized partition)
    pub key: Option<String>,
}

/// Returns `false` when any partition does not match.
pub fn run(args: VerifyArgs, config: &Config) -> Result<bool> {
    let (client, manifest) = open_manifest(config)?;

    if let Some(key) = args.key {
        let result = verify(client.as_ref(), &manifest, &key)
            .with_context(|| format!("failed to verify {key}"))?;
        let status = if result.ok { "OK" } else { "FAIL" };
        eprintln!("[{status}] {key}");
        print_mismatch(&result);
        return Ok(result.ok);
    }

    let all = verify_all(client.as_ref(), &manifest)?;
    if all.is_empty() {
        eprintln!("No materialized partitions to verify.");
        return Ok(true);
    }

    let mut table = new_table(&["Object", "Hash", "Status"]);
    for (key, result) in &all {
        let status_cell = if result.ok {
            Cell::new("OK").fg(Color::Green)
        } else {
            Cell::new("FAIL").fg(Color::Red)
        };
        table.add_row(vec![Cell::new(key), Cell::new(short(&result.expected)), status_cell]);
    }
    eprintln!("\n{table}");

    // Mismatch details after the summary table
    for result in all.values() {
        print_mismatch(result);
    }

    let all_ok = all.values().all(|r| r.ok);
    if all_ok {
        eprintln!("All {} partitions verified OK.", all.len());
    } else {
        eprintln!("Some partitions have integrity issues!");
    }
    Ok(all_ok)
}

fn print_mismatch(result: &VerifyResult) {
    if !result.ok {
        eprintln!("  MISMATCH: {}", result.key);
        eprintln!("    expected: {}", short(&result.expected));
        eprintln!("    actual:   {}", short(&result.actual));
    }
}

//! `metrolake gc` - remove staging objects left by interrupted writes

use anyhow::Result;
use clap::Args;
use comfy_table::Cell;
use metrolake_store::{cleanup_tmp, stale_tmp_objects};

use super::{new_table, open_store};
use crate::config::Config;

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Actually delete (otherwise dry-run)
    #[arg(long)]
    pub confirm: bool,
}

pub fn run(args: GcArgs, config: &Config) -> Result<()> {
    let client = open_store(config)?;

    if !args.confirm {
        let stale = stale_tmp_objects(client.as_ref())?;
        if stale.is_empty() {
            eprintln!("No stale staging objects.");
        } else {
            let mut table = new_table(&["Object"]);
            for key in &stale {
                table.add_row(vec![Cell::new(key)]);
            }
            eprintln!("\nWould remove {} staging objects:", stale.len());
            eprintln!("{table}");
            eprintln!("Run with --confirm to actually delete.");
        }
        return Ok(());
    }

    let removed = cleanup_tmp(client.as_ref())?;
    if removed.is_empty() {
        eprintln!("Nothing to clean up.");
    } else {
        eprintln!("Removed {} staging objects:", removed.len());
        for key in &removed {
            eprintln!("  {key}");
        }
    }
    Ok(())
}

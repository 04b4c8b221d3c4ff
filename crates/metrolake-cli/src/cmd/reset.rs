//! `metrolake reset` - forget a failed partition

use anyhow::{Context, Result};
use clap::Args;
use metrolake_store::{make_key, parse_key};

use super::open_manifest;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Object key of the partition, e.g.
    /// grupo5/raw/clima/date=2025-03-10/clima_2025-03-10.parquet
    pub key: String,
}

pub fn run(args: ResetArgs, config: &Config) -> Result<()> {
    let partition = parse_key(&args.key)?;
    let object_key = make_key(&partition)?;
    let (_, manifest) = open_manifest(config)?;

    let removed = manifest
        .reset(&object_key)
        .with_context(|| format!("cannot reset {}", partition.label()))?;
    if removed {
        eprintln!("Reset {}: the next run retries it.", partition.label());
    } else {
        eprintln!("No manifest entry for {}.", partition.label());
    }
    Ok(())
}

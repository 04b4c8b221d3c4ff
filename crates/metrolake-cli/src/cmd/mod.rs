pub mod gc;
pub mod reset;
pub mod run;
pub mod status;
pub mod verify;

use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use metrolake_store::{LakeStore, ManifestStore, ObjectStoreClient, StoreKind};

use crate::config::Config;

/// Object store named by `[store]`.
pub fn open_store(config: &Config) -> Result<Arc<dyn ObjectStoreClient>> {
    let store = LakeStore::from_settings(&config.store)
        .with_context(|| format!("failed to open {:?} store", config.store.kind))?;
    log::debug!("store: {store:?}");
    Ok(Arc::new(store))
}

pub fn open_manifest(config: &Config) -> Result<(Arc<dyn ObjectStoreClient>, ManifestStore)> {
    let client = open_store(config)?;
    let manifest =
        ManifestStore::load(Arc::clone(&client)).context("failed to load the manifest")?;
    Ok((client, manifest))
}

/// Table with the house style: rounded UTF-8 borders, cyan headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

pub fn short(hash: &str) -> &str {
    &hash[..std::cmp::min(8, hash.len())]
}

fn mask(secret: Option<&str>) -> &'static str {
    if secret.is_some() { "configured" } else { "not set" }
}

pub fn show_config(config: &Config) {
    let mut table = new_table(&["Setting", "Value"]);

    let store = &config.store;
    table.add_row(vec!["Store", &format!("{:?}", store.kind).to_lowercase()]);
    match store.kind {
        StoreKind::S3 => {
            table.add_row(vec![
                "Endpoint",
                store.endpoint.as_deref().unwrap_or("AWS (default)"),
            ]);
            table.add_row(vec!["Bucket", &store.bucket]);
            table.add_row(vec!["Region", &store.region]);
            table.add_row(vec!["Access key", mask(store.access_key.as_deref())]);
            table.add_row(vec!["Secret key", mask(store.secret_key.as_deref())]);
            table.add_row(vec!["Allow HTTP", &store.allow_http.to_string()]);
        }
        StoreKind::Local => {
            let path = store
                .path
                .as_ref()
                .map_or_else(|| "(unset)".to_string(), |p| p.display().to_string());
            table.add_row(vec!["Path", &path]);
        }
        StoreKind::Memory => {}
    }
    table.add_row(vec!["Store timeout", &format!("{}s", store.timeout_secs)]);

    let p = &config.pipeline;
    table.add_row(vec!["Workers", &p.workers.to_string()]);
    table.add_row(vec!["Max retries", &p.max_retries.to_string()]);
    table.add_row(vec!["Backoff", &format!("{}ms", p.backoff_ms)]);
    table.add_row(vec!["Fetch timeout", &format!("{}s", p.fetch_timeout_secs)]);
    table.add_row(vec![
        "Max coercion failures",
        &format!("{:.0}%", p.max_coercion_failure_ratio * 100.0),
    ]);
    table.add_row(vec!["Timezone", &p.timezone]);

    for dataset in &config.datasets {
        let sources: Vec<String> = dataset
            .sources
            .iter()
            .map(|s| {
                let kind = s.kind.map_or("?", |k| k.as_str());
                let token = if s.token.is_some() { ", token" } else { "" };
                format!("{} ({kind}{token})", s.display_name(&dataset.name))
            })
            .collect();
        table.add_row(vec![
            format!("Dataset {}", dataset.name),
            sources.join("\n"),
        ]);
    }

    eprintln!("\n{table}");
}

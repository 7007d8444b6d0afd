//! Subcommand implementations and the helpers they share.

pub mod assignments;
pub mod condition;
pub mod config;
pub mod experiment;
pub mod overrides;
pub mod partition;
pub mod preview;
pub mod resolve;

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use upgrade_core::Services;

use crate::config::ConfigLoader;

/// Wire the services over the configured store.
pub async fn services() -> Result<Services> {
    let config = ConfigLoader::load()?;
    debug!(
        seed = ?config.resolution.seed,
        mark_visited = config.resolution.mark_visited,
        "configuration loaded"
    );
    Ok(Services::from_config(&config).await?)
}

/// Read a JSON document from `path`, or stdin when the path is `-`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?
    };
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Empty table with a highlighted header row.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    table
}

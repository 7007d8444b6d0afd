use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Subcommand};
use upgrade_core::{StorageConfig, UpgradeConfig};

use super::{print_json, table};
use crate::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration after layering
    Show {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// List the files each configuration layer reads, and the database
    Path,
}

pub fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { json } => show_config(json),
        ConfigCommands::Path => show_paths(),
    }
}

fn show_config(json: bool) -> Result<()> {
    let config = redacted(ConfigLoader::load()?);
    if json {
        return print_json(&config);
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn show_paths() -> Result<()> {
    let config = ConfigLoader::load()?;
    let mut out = table(&["Layer", "Path", "Status"]);
    for (layer, path) in layers(&config) {
        let status = match &path {
            Some(p) if p.exists() => "present",
            Some(_) => "absent",
            None => "unavailable",
        };
        let shown = path
            .as_deref()
            .map(Path::display)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.add_row(vec![layer.to_string(), shown, status.to_string()]);
    }
    println!("{out}");
    Ok(())
}

/// Config layers in the order they are applied, then the local database.
fn layers(config: &UpgradeConfig) -> Vec<(&'static str, Option<PathBuf>)> {
    let mut rows = vec![
        ("user", ConfigLoader::user_config_path()),
        ("project (overrides user)", Some(ConfigLoader::project_config_path())),
    ];
    if let StorageConfig::Local { path } = &config.storage {
        rows.push(("database", Some(path.clone())));
    }
    rows
}

fn redacted(mut config: UpgradeConfig) -> UpgradeConfig {
    if let StorageConfig::Remote { token, .. } = &mut config.storage {
        *token = "<redacted>".to_string();
    }
    config
}

use serde::Deserialize;
use std::path::PathBuf;

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawUpgradeConfig {
    #[serde(default)]
    pub storage: RawStorageConfig,

    #[serde(default)]
    pub resolution: RawResolutionConfig,
}

/// Storage section as stored in TOML
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawStorageConfig {
    /// `local`, `remote` or `memory`
    pub backend: Option<String>,

    /// Database file for the local backend
    pub path: Option<PathBuf>,

    /// Database URL for the remote backend
    pub url: Option<String>,

    /// Auth token for the remote backend
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawResolutionConfig {
    pub seed: Option<u64>,
    pub mark_visited: Option<bool>,
}

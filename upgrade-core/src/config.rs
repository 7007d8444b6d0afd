//! Runtime configuration for the assignment services.
//!
//! ```toml
//! [storage]
//! backend = "local"
//! path = "/var/lib/upgrade/assignments.db"
//!
//! [resolution]
//! seed = 42
//! mark_visited = true
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UpgradeConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub resolution: ResolutionConfig,
}

/// Where experiments, overrides and assignment records live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// libSQL database file
    Local {
        #[serde(default = "default_db_path")]
        path: PathBuf,
    },
    /// Remote Turso database
    Remote { url: String, token: String },
    /// Process-local tables, lost on exit
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Fixed seed for the weighted draw. Unset uses thread entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Record a decision point visit for each listed assignment
    #[serde(default = "default_mark_visited")]
    pub mark_visited: bool,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            seed: None,
            mark_visited: default_mark_visited(),
        }
    }
}

fn default_mark_visited() -> bool {
    true
}

/// `$XDG_DATA_HOME/upgrade/assignments.db`, falling back to the platform
/// data directory and then `~/.local/share`.
pub fn default_db_path() -> PathBuf {
    data_dir().join("assignments.db")
}

fn data_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data).join("upgrade")
    } else if let Some(data) = dirs::data_dir() {
        data.join("upgrade")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".local/share/upgrade")
    } else {
        PathBuf::from(".local/share/upgrade")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: UpgradeConfig = toml::from_str("").unwrap();

        assert_eq!(config, UpgradeConfig::default());
        assert!(config.resolution.mark_visited);
        assert!(config.resolution.seed.is_none());
        match config.storage {
            StorageConfig::Local { path } => assert!(path.ends_with("upgrade/assignments.db")),
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn parses_each_backend() {
        let local: UpgradeConfig = toml::from_str(
            r#"
[storage]
backend = "local"
path = "/tmp/a.db"
"#,
        )
        .unwrap();
        assert_eq!(
            local.storage,
            StorageConfig::Local {
                path: PathBuf::from("/tmp/a.db")
            }
        );

        let remote: UpgradeConfig = toml::from_str(
            r#"
[storage]
backend = "remote"
url = "libsql://db.example.com"
token = "secret"
"#,
        )
        .unwrap();
        assert!(matches!(remote.storage, StorageConfig::Remote { .. }));

        let memory: UpgradeConfig = toml::from_str(
            r#"
[storage]
backend = "memory"

[resolution]
seed = 7
mark_visited = false
"#,
        )
        .unwrap();
        assert_eq!(memory.storage, StorageConfig::Memory);
        assert_eq!(memory.resolution.seed, Some(7));
        assert!(!memory.resolution.mark_visited);
    }

    #[test]
    fn remote_requires_credentials() {
        let result: Result<UpgradeConfig, _> = toml::from_str(
            r#"
[storage]
backend = "remote"
url = "libsql://db.example.com"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = UpgradeConfig {
            storage: StorageConfig::Memory,
            resolution: ResolutionConfig {
                seed: Some(3),
                mark_visited: false,
            },
        };

        let text = toml::to_string(&config).unwrap();
        let parsed: UpgradeConfig = toml::from_str(&text).unwrap();

        assert_eq!(parsed, config);
    }
}

use super::types::{RawResolutionConfig, RawStorageConfig, RawUpgradeConfig};
use anyhow::{Result, bail};
use directories::ProjectDirs;
use std::path::PathBuf;
use upgrade_core::config::default_db_path;
use upgrade_core::{ResolutionConfig, StorageConfig, UpgradeConfig};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<UpgradeConfig> {
        let mut raw = RawUpgradeConfig::default();

        // Layer 1: User config
        if let Some(user_path) = Self::user_config_path()
            && user_path.exists()
        {
            let contents = std::fs::read_to_string(&user_path)?;
            let user_config: RawUpgradeConfig = toml::from_str(&contents)?;
            raw = Self::merge_raw(raw, user_config);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            let contents = std::fs::read_to_string(&project_path)?;
            let project_config: RawUpgradeConfig = toml::from_str(&contents)?;
            raw = Self::merge_raw(raw, project_config);
        }

        Self::finalize(raw)
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "upgrade").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with UPGRADE_PROJECT_CONFIG_DIR env var
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("UPGRADE_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".upgrade/config.toml")
        }
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawUpgradeConfig, overlay: RawUpgradeConfig) -> RawUpgradeConfig {
        RawUpgradeConfig {
            storage: RawStorageConfig {
                backend: overlay.storage.backend.or(base.storage.backend),
                path: overlay.storage.path.or(base.storage.path),
                url: overlay.storage.url.or(base.storage.url),
                token: overlay.storage.token.or(base.storage.token),
            },
            resolution: RawResolutionConfig {
                seed: overlay.resolution.seed.or(base.resolution.seed),
                mark_visited: overlay
                    .resolution
                    .mark_visited
                    .or(base.resolution.mark_visited),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawUpgradeConfig) -> Result<UpgradeConfig> {
        let storage = match raw.storage.backend.as_deref().unwrap_or("local") {
            "local" => StorageConfig::Local {
                path: raw.storage.path.unwrap_or_else(default_db_path),
            },
            "remote" => {
                let (Some(url), Some(token)) = (raw.storage.url, raw.storage.token) else {
                    bail!("remote storage needs both storage.url and storage.token");
                };
                StorageConfig::Remote { url, token }
            }
            "memory" => StorageConfig::Memory,
            other => bail!("unknown storage backend {other:?}"),
        };
        let defaults = ResolutionConfig::default();
        Ok(UpgradeConfig {
            storage,
            resolution: ResolutionConfig {
                seed: raw.resolution.seed,
                mark_visited: raw.resolution.mark_visited.unwrap_or(defaults.mark_visited),
            },
        })
    }

    /// Load config from a specific path (for testing)
    #[cfg(test)]
    pub fn load_from_path(path: &std::path::Path) -> Result<UpgradeConfig> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::finalize(toml::from_str(&contents)?)
        } else {
            Self::finalize(RawUpgradeConfig::default())
        }
    }
}

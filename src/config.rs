use crate::{detection::DetectionSettings, matcher::MatchWeights, restore::RestoreOptions};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mod_root: PathBuf,
    #[serde(default)]
    pub backup_root: PathBuf,
    #[serde(default = "default_fresh_for_secs")]
    pub fresh_for_secs: u64,
    #[serde(default = "default_forced_scan_window_secs")]
    pub forced_scan_window_secs: u64,
    #[serde(default = "default_echo_prefixes")]
    pub restore_echo_prefixes: Vec<String>,
    #[serde(default = "default_true")]
    pub delete_consumed_backups: bool,
    #[serde(default)]
    pub match_weights: MatchWeights,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mod_root: PathBuf::new(),
            backup_root: PathBuf::new(),
            fresh_for_secs: default_fresh_for_secs(),
            forced_scan_window_secs: default_forced_scan_window_secs(),
            restore_echo_prefixes: default_echo_prefixes(),
            delete_consumed_backups: true,
            match_weights: MatchWeights::default(),
        }
    }
}

impl AppConfig {
    /// Loads the per-user config, writing a default one on first run.
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join(CONFIG_FILE);
        if path.exists() {
            let mut config = Self::load_from(&path)?;
            if config.backup_root.as_os_str().is_empty() {
                config.backup_root = base_dir.join("backups");
                config.save_to(&path)?;
            }
            return Ok(config);
        }

        let config = AppConfig {
            backup_root: base_dir.join("backups"),
            ..AppConfig::default()
        };
        config.save_to(&path)?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).context("read app config")?;
        serde_json::from_str(&raw).context("parse app config")
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn detection_settings(&self) -> DetectionSettings {
        DetectionSettings {
            fresh_for: Duration::from_secs(self.fresh_for_secs),
            forced_scan_window: Duration::from_secs(self.forced_scan_window_secs),
        }
    }

    pub fn restore_options(&self) -> RestoreOptions {
        RestoreOptions {
            delete_consumed_backups: self.delete_consumed_backups,
            match_weights: self.match_weights.normalized(),
        }
    }
}

fn default_fresh_for_secs() -> u64 {
    5
}

fn default_forced_scan_window_secs() -> u64 {
    10
}

fn default_echo_prefixes() -> Vec<String> {
    vec!["restore".to_string(), "texture-restore".to_string()]
}

fn default_true() -> bool {
    true
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("texrestore"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{ "mod_root": "/games/mods" }"#).unwrap();

        let config = AppConfig::load_from(&path).unwrap();

        assert_eq!(config.mod_root, PathBuf::from("/games/mods"));
        assert_eq!(config.fresh_for_secs, 5);
        assert_eq!(config.forced_scan_window_secs, 10);
        assert_eq!(config.restore_echo_prefixes, vec!["restore", "texture-restore"]);
        assert!(config.delete_consumed_backups);
        assert_eq!(config.match_weights, MatchWeights::default());
    }

    #[test]
    fn save_then_load_keeps_tuning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let config = AppConfig {
            fresh_for_secs: 30,
            delete_consumed_backups: false,
            ..AppConfig::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").starts_with("parse app config"));
    }

    #[test]
    fn restore_options_keep_owning_mod_strongest() {
        let config = AppConfig {
            match_weights: MatchWeights {
                file_name: 3,
                folder_in_path: 1,
                owning_mod: 1,
                relative_name: 1,
            },
            ..AppConfig::default()
        };
        let options = config.restore_options();
        assert_eq!(options.match_weights.owning_mod, 4);
        assert_eq!(
            config.detection_settings().forced_scan_window,
            Duration::from_secs(10)
        );
    }
}

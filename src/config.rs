use crate::store;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const APP_DIR_NAME: &str = "profilesync";
pub const DATA_DIR_ENV: &str = "PROFILESYNC_DATA_DIR";
pub const CONFIG_FILE: &str = "settings.json";
const SERVER_DIR: &str = "c_ccp_eve_online_tq_tranquility";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_dir: Option<PathBuf>,
    /// Keys written by other tools are kept as they are.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppConfig {
    /// Missing or malformed config yields the default.
    pub fn load(data_dir: &Path) -> Self {
        store::read_json::<AppConfig>(&data_dir.join(CONFIG_FILE))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        store::write_json(&data_dir.join(CONFIG_FILE), self).context("write app config")
    }
}

/// Where the settings root comes from for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsRoot {
    Saved(PathBuf),
    Default(PathBuf),
    Unset,
}

impl SettingsRoot {
    pub fn resolve(config: &AppConfig) -> Self {
        if let Some(saved) = config
            .settings_dir
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
        {
            return SettingsRoot::Saved(saved.clone());
        }
        match default_settings_dir() {
            Some(path) if path.is_dir() => SettingsRoot::Default(path),
            _ => SettingsRoot::Unset,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SettingsRoot::Saved(path) | SettingsRoot::Default(path) => Some(path),
            SettingsRoot::Unset => None,
        }
    }
}

pub fn base_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join(APP_DIR_NAME))
}

pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = base_data_dir()?;
    fs::create_dir_all(&dir).context("create app data dir")?;
    Ok(dir)
}

/// The client's settings folder for this platform. Under WSL it points at
/// the Windows profile through `/mnt/c`.
pub fn default_settings_dir() -> Option<PathBuf> {
    if is_wsl() {
        let user = std::env::var("USER").ok().filter(|value| !value.is_empty())?;
        return Some(
            PathBuf::from("/mnt/c/Users")
                .join(user)
                .join("AppData/Local/CCP/EVE")
                .join(SERVER_DIR),
        );
    }
    let base = BaseDirs::new()?;
    Some(base.data_local_dir().join("CCP").join("EVE").join(SERVER_DIR))
}

pub fn is_default_dir(path: &Path) -> bool {
    default_settings_dir()
        .map(|default| default == path)
        .unwrap_or(false)
}

fn is_wsl() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    fs::read_to_string("/proc/version")
        .map(|version| version.to_ascii_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn saved_dir_round_trips_and_keeps_foreign_keys() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(CONFIG_FILE),
            r#"{"settingsDir": "/games/eve", "theme": "dark"}"#,
        )
        .unwrap();

        let mut config = AppConfig::load(temp.path());
        assert_eq!(config.settings_dir.as_deref(), Some(Path::new("/games/eve")));
        config.settings_dir = Some(PathBuf::from("/games/eve2"));
        config.save(temp.path()).unwrap();

        let raw = fs::read_to_string(temp.path().join(CONFIG_FILE)).unwrap();
        assert!(raw.contains("\"theme\": \"dark\""));
        assert!(raw.contains("\"settingsDir\": \"/games/eve2\""));
    }

    #[test]
    fn malformed_config_is_default() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(CONFIG_FILE), "[1, 2").unwrap();
        let config = AppConfig::load(temp.path());
        assert!(config.settings_dir.is_none());
    }

    #[test]
    fn saved_dir_takes_precedence() {
        let config = AppConfig {
            settings_dir: Some(PathBuf::from("/nowhere/eve")),
            extra: Map::new(),
        };
        let root = SettingsRoot::resolve(&config);
        assert_eq!(root, SettingsRoot::Saved(PathBuf::from("/nowhere/eve")));
        assert_eq!(root.path(), Some(Path::new("/nowhere/eve")));
    }
}

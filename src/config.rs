use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub game_root: Option<PathBuf>,
    #[serde(default)]
    pub skip_install_confirmation: bool,
    #[serde(default)]
    pub suppress_collision_prompt: bool,
    #[serde(default = "default_true")]
    pub backup_on_deploy: bool,
    #[serde(default)]
    pub enabled_mods: Vec<String>,
    /// Chosen option files per multi-payload mod, keyed by mod name.
    #[serde(default)]
    pub mod_options: HashMap<String, Vec<String>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            game_root: None,
            skip_install_confirmation: false,
            suppress_collision_prompt: false,
            backup_on_deploy: true,
            enabled_mods: Vec::new(),
            mod_options: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let dir = app_data_dir()?;
        Self::load_or_create_in(&dir)
    }

    pub fn load_or_create_in(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).context("create app data dir")?;
        let path = dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save_in(dir)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = app_data_dir()?;
        self.save_in(&dir)
    }

    pub fn save_in(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).context("create app data dir")?;
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(dir.join("config.json"), raw).context("write app config")?;
        Ok(())
    }

    pub fn is_enabled(&self, mod_name: &str) -> bool {
        self.enabled_mods.iter().any(|name| name == mod_name)
    }

    pub fn set_enabled(&mut self, mod_name: &str, enabled: bool) {
        if enabled {
            if !self.is_enabled(mod_name) {
                self.enabled_mods.push(mod_name.to_string());
            }
        } else {
            self.enabled_mods.retain(|name| name != mod_name);
        }
    }

    pub fn options_for(&self, mod_name: &str) -> Option<&[String]> {
        self.mod_options.get(mod_name).map(Vec::as_slice)
    }
}

pub fn app_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("paksmith"))
}

fn default_true() -> bool {
    true
}

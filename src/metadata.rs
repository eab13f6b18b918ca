use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const MOD_INFO_FILE: &str = "modinfo.json";
pub const ASSETS_DIR: &str = "assets";
pub const PAYLOAD_EXT: &str = "pak";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Skin,
    Voice,
    #[serde(rename = "UI")]
    Ui,
    Music,
    Other,
}

impl Default for Category {
    fn default() -> Self {
        Category::Other
    }
}

/// One selectable payload file of a multi-file mod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModOption {
    pub name: String,
    pub file: String,
}

/// Serialized as `modinfo.json` inside each library entry. `name` doubles
/// as the folder key; everything else tolerates absence on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_author")]
    pub author: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub source_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub has_options: bool,
    #[serde(default)]
    pub options: Vec<ModOption>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_author() -> String {
    "Unknown".to_string()
}

impl ModMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: default_version(),
            author: default_author(),
            category: Category::Other,
            url: None,
            source_urls: Vec::new(),
            screenshot: None,
            has_options: false,
            options: Vec::new(),
        }
    }

    /// Synthesized metadata for a payload file found without any
    /// accompanying structured mod layout.
    pub fn for_loose_payload(name: &str, origin: &str) -> Self {
        let mut meta = Self::named(name);
        meta.description = format!("Imported from {origin}");
        meta
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let meta =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(meta)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serialize modinfo")?;
        fs::write(dir.join(MOD_INFO_FILE), raw)
            .with_context(|| format!("write modinfo in {}", dir.display()))?;
        Ok(())
    }

    /// Records where a payload archive came from. The mod page URL is set
    /// once and never clobbered by later installs of the same mod.
    pub fn record_source(&mut self, file_url: &str, page_url: Option<&str>) {
        self.source_urls.push(file_url.to_string());
        if self.url.is_none() {
            self.url = page_url.map(|url| url.to_string());
        }
    }

    /// Rebuilds the options list from the stored payload filenames. More
    /// than one file means the user picks which to deploy.
    pub fn set_payloads(&mut self, files: &[String]) {
        if files.len() > 1 {
            self.has_options = true;
            self.options = files
                .iter()
                .map(|file| ModOption {
                    name: file_stem(file),
                    file: file.clone(),
                })
                .collect();
        } else {
            self.has_options = false;
            self.options = Vec::new();
        }
    }
}

fn file_stem(file: &str) -> String {
    Path::new(file)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file)
        .to_string()
}

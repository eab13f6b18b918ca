use crate::metadata::{ModMetadata, ASSETS_DIR, MOD_INFO_FILE, PAYLOAD_EXT};
use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// A mod folder under the library root. Valid iff both the metadata file
/// and the assets subfolder exist.
#[derive(Debug, Clone)]
pub struct ModEntry {
    pub metadata: ModMetadata,
    pub folder: PathBuf,
}

impl ModEntry {
    pub fn assets_dir(&self) -> PathBuf {
        self.folder.join(ASSETS_DIR)
    }

    /// Payload filenames currently stored under `assets/`.
    pub fn payload_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        let Ok(entries) = fs::read_dir(self.assets_dir()) else {
            return files;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if is_payload_file(&path) {
                if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        files
    }
}

pub fn mods_root(data_dir: &Path) -> PathBuf {
    data_dir.join("mods")
}

/// Scans the library root for valid entries. Folders with corrupt or
/// missing metadata are skipped, not fatal.
pub fn list_mods(root: &Path) -> Result<Vec<ModEntry>> {
    let mut mods = Vec::new();
    if !root.exists() {
        return Ok(mods);
    }
    for entry in fs::read_dir(root).context("read mod library")? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let folder = entry.path();
        if !folder.is_dir() {
            continue;
        }
        let info_path = folder.join(MOD_INFO_FILE);
        if !info_path.exists() || !folder.join(ASSETS_DIR).is_dir() {
            continue;
        }
        match ModMetadata::load(&info_path) {
            Ok(metadata) => mods.push(ModEntry { metadata, folder }),
            Err(err) => log::warn!("skipping {}: {err:#}", folder.display()),
        }
    }
    mods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(mods)
}

pub fn find_mod<'a>(mods: &'a [ModEntry], name: &str) -> Option<&'a ModEntry> {
    mods.iter().find(|entry| entry.metadata.name == name)
}

pub fn delete_mod(entry: &ModEntry) -> Result<()> {
    fs::remove_dir_all(&entry.folder)
        .with_context(|| format!("delete mod {}", entry.folder.display()))?;
    Ok(())
}

/// Wraps payload files dropped directly into the library root into proper
/// entries (folder + assets + synthesized metadata) so the rest of the
/// pipeline only ever sees valid entries.
pub fn adopt_loose_paks(root: &Path) -> Result<usize> {
    let mut adopted = 0;
    if !root.exists() {
        return Ok(adopted);
    }
    let loose: Vec<PathBuf> = fs::read_dir(root)
        .context("read mod library")?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_payload_file(path))
        .collect();

    for pak in loose {
        let Some(stem) = pak.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let base_name = strip_patch_suffix(stem);
        let folder = root.join(&base_name);
        let assets = folder.join(ASSETS_DIR);
        fs::create_dir_all(&assets).context("create adopted mod folders")?;

        let file_name = pak
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("payload.pak")
            .to_string();
        let dest = non_colliding_path(&assets, &file_name);
        fs::rename(&pak, &dest).or_else(|_| {
            fs::copy(&pak, &dest).and_then(|_| fs::remove_file(&pak))
        })
        .with_context(|| format!("move {} into library", pak.display()))?;

        let info_path = folder.join(MOD_INFO_FILE);
        if !info_path.exists() {
            let meta = ModMetadata::for_loose_payload(&base_name, &file_name);
            meta.save(&folder)?;
        }
        adopted += 1;
    }
    Ok(adopted)
}

fn non_colliding_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(PAYLOAD_EXT);
    let mut counter = 1;
    loop {
        let candidate = dir.join(format!("{stem}_{counter}.{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

pub fn is_payload_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(PAYLOAD_EXT))
        .unwrap_or(false)
}

/// The engine only loads payload files whose stem ends in `_P`. Inserts the
/// marker before the extension when missing; idempotent.
pub fn ensure_patch_suffix(file_name: &str) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name);
    if stem.ends_with("_P") {
        return file_name.to_string();
    }
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{stem}_P.{ext}"),
        None => format!("{stem}_P"),
    }
}

pub fn strip_patch_suffix(stem: &str) -> String {
    stem.strip_suffix("_P").unwrap_or(stem).to_string()
}

/// Replaces filesystem-illegal characters the same way for folder names
/// and downloaded filenames.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect()
}

/// Mod folder names drop illegal characters entirely so page titles make
/// clean folder keys. Names that are nothing but dots would resolve to
/// the current or parent directory, so they come back empty.
pub fn sanitize_mod_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|ch| !matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect::<String>()
        .trim()
        .to_string();
    if cleaned.chars().all(|ch| ch == '.') {
        return String::new();
    }
    cleaned
}

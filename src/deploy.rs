use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::library::{ensure_patch_suffix, is_payload_file, ModEntry};
use anyhow::{Context, Result};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use zip::{write::SimpleFileOptions, ZipWriter};

/// The engine loads loose payload files from this folder under the game
/// root; the leading tilde sorts it ahead of the shipped content.
pub const DEPLOY_DIR_NAME: &str = "~mods";

#[derive(Debug, Default)]
pub struct DeployReport {
    pub deployed: Vec<String>,
    pub cleared: usize,
    pub backup: Option<PathBuf>,
}

/// Rebuilds `<game root>/~mods` from the enabled library entries. The
/// folder is treated as wholly owned: every previously deployed payload
/// is removed first, so disabling a mod is just deploying without it.
pub fn deploy(
    game_root: &Path,
    entries: &[ModEntry],
    config: &AppConfig,
) -> PipelineResult<DeployReport> {
    let target = game_root.join(DEPLOY_DIR_NAME);
    fs::create_dir_all(&target)
        .map_err(|err| PipelineError::Installation(format!("create deploy dir: {err}")))?;

    let mut report = DeployReport::default();

    if config.backup_on_deploy {
        report.backup = backup_existing(&target)
            .map_err(|err| PipelineError::Installation(format!("backup deploy dir: {err:#}")))?;
    }
    report.cleared = clear_payloads(&target)
        .map_err(|err| PipelineError::Installation(format!("clear deploy dir: {err:#}")))?;

    for entry in entries {
        if !config.is_enabled(&entry.metadata.name) {
            continue;
        }
        let assets = entry.assets_dir();
        for source_name in selected_files(entry, config)? {
            // entries installed from loose payloads already carry the
            // marker; structured entries may not, so assert it here
            let deployed_name = ensure_patch_suffix(&source_name);
            fs::copy(assets.join(&source_name), target.join(&deployed_name)).map_err(|err| {
                PipelineError::Installation(format!("deploy {source_name}: {err}"))
            })?;
            report.deployed.push(deployed_name);
        }
    }

    report.deployed.sort();
    Ok(report)
}

/// Which of an entry's payload files go out: the configured option
/// selection when one exists, otherwise everything in assets.
fn selected_files(entry: &ModEntry, config: &AppConfig) -> PipelineResult<Vec<String>> {
    let assets = entry.assets_dir();
    if let Some(chosen) = config.options_for(&entry.metadata.name) {
        for name in chosen {
            if !assets.join(name).is_file() {
                return Err(PipelineError::Installation(format!(
                    "selected option {name} missing from {}",
                    entry.metadata.name
                )));
            }
        }
        return Ok(chosen.to_vec());
    }
    Ok(entry.payload_files())
}

fn clear_payloads(target: &Path) -> Result<usize> {
    let mut cleared = 0;
    for entry in fs::read_dir(target).context("read deploy dir")? {
        let entry = entry.context("read deploy entry")?;
        let path = entry.path();
        if path.is_file() && is_payload_file(&path) {
            fs::remove_file(&path)
                .with_context(|| format!("remove {}", path.display()))?;
            cleared += 1;
        }
    }
    Ok(cleared)
}

/// Zips whatever payloads are currently deployed before they get cleared.
/// Returns None when there is nothing to save.
fn backup_existing(target: &Path) -> Result<Option<PathBuf>> {
    let mut payloads: Vec<PathBuf> = fs::read_dir(target)
        .context("read deploy dir")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_payload_file(path))
        .collect();
    if payloads.is_empty() {
        return Ok(None);
    }
    payloads.sort();

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let backup_path = target.join(format!("backup_{stamp}.zip"));
    let file = fs::File::create(&backup_path).context("create backup archive")?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for path in payloads {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .context("backup entry name")?;
        writer.start_file(name, options).context("start backup entry")?;
        let mut source = fs::File::open(&path).context("open backup source")?;
        io::copy(&mut source, &mut writer).context("write backup entry")?;
    }
    writer.finish().context("finish backup archive")?;
    Ok(Some(backup_path))
}

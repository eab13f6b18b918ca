use crate::download::USER_AGENT;
use crate::error::{best_effort, PipelineError, PipelineResult};
use crate::extract::TempDirGuard;
use crate::layout::is_junk_path;
use crate::library::{ensure_patch_suffix, sanitize_mod_name};
use crate::metadata::{ModMetadata, ASSETS_DIR};
use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;

/// Per-attempt answer to "the target folder already exists". Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionDecision {
    Overwrite,
    CopyAsNew,
    Cancel,
}

/// Collaborator that decides collisions: a UI prompt in an interactive
/// shell, a standing policy in headless use.
pub trait CollisionPolicy {
    fn decide(&self, mod_name: &str) -> CollisionDecision;
}

pub struct AlwaysOverwrite;

impl CollisionPolicy for AlwaysOverwrite {
    fn decide(&self, _mod_name: &str) -> CollisionDecision {
        CollisionDecision::Overwrite
    }
}

pub struct AlwaysCopyAsNew;

impl CollisionPolicy for AlwaysCopyAsNew {
    fn decide(&self, _mod_name: &str) -> CollisionDecision {
        CollisionDecision::CopyAsNew
    }
}

pub struct AlwaysCancel;

impl CollisionPolicy for AlwaysCancel {
    fn decide(&self, _mod_name: &str) -> CollisionDecision {
        CollisionDecision::Cancel
    }
}

/// Collaborator gating each install behind a confirmation. Honors the
/// "skip confirmation" setting by always saying yes.
pub trait InstallGate {
    fn confirm(&self, metadata: &ModMetadata) -> bool;
}

pub struct AutoConfirm;

impl InstallGate for AutoConfirm {
    fn confirm(&self, _metadata: &ModMetadata) -> bool {
        true
    }
}

/// What the install stages into the new entry.
#[derive(Debug)]
pub enum InstallSource {
    /// A pre-structured tree (metadata marker + assets) copied as-is.
    Structured { root: PathBuf },
    /// Loose payload files gathered into one entry's assets folder, each
    /// renamed to carry the engine's `_P` marker.
    Payloads { files: Vec<PathBuf> },
}

/// Best-effort preview image inputs; failure to produce one never aborts
/// the install.
pub struct PreviewSource<'a> {
    pub agent: &'a ureq::Agent,
    pub image_url: Option<String>,
    pub page_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstalledMod {
    pub name: String,
    pub folder: PathBuf,
}

pub struct Installer<'a> {
    pub mods_root: &'a Path,
    pub policy: &'a dyn CollisionPolicy,
    pub gate: &'a dyn InstallGate,
}

impl Installer<'_> {
    /// Writes one complete library entry, or nothing. The entry is built
    /// in a scope-guarded staging folder and renamed into place after the
    /// collision decision, so a failure anywhere leaves the library
    /// untouched.
    pub fn install(
        &self,
        mut metadata: ModMetadata,
        source: InstallSource,
        preview: Option<PreviewSource<'_>>,
    ) -> PipelineResult<InstalledMod> {
        metadata.name = sanitize_mod_name(&metadata.name);
        if metadata.name.is_empty() {
            return Err(PipelineError::Installation(
                "mod name empty after sanitization".to_string(),
            ));
        }
        if !self.gate.confirm(&metadata) {
            return Err(PipelineError::InstallDeclined(metadata.name));
        }

        fs::create_dir_all(self.mods_root)
            .map_err(|err| PipelineError::Installation(err.to_string()))?;
        let mut guard = TempDirGuard::create(self.mods_root, "stage")
            .map_err(|err| PipelineError::Installation(err.to_string()))?;

        stage_entry(guard.path(), &mut metadata, &source)
            .map_err(|err| PipelineError::Installation(format!("{err:#}")))?;
        // a shipped modinfo.json can carry any name it likes; it picks the
        // target folder, so it gets the same sanitization as ours
        metadata.name = sanitize_mod_name(&metadata.name);
        if metadata.name.is_empty() {
            return Err(PipelineError::Installation(
                "mod name empty after sanitization".to_string(),
            ));
        }

        if let Some(preview) = preview {
            attach_preview(guard.path(), &mut metadata, preview);
        }
        metadata
            .save(guard.path())
            .map_err(|err| PipelineError::Installation(format!("{err:#}")))?;

        // Decide the final folder only now; the staging guard undoes
        // everything if the user cancels.
        let mut target = self.mods_root.join(&metadata.name);
        if target.exists() {
            match self.policy.decide(&metadata.name) {
                CollisionDecision::Cancel => {
                    return Err(PipelineError::CollisionCancelled(metadata.name));
                }
                CollisionDecision::Overwrite => {
                    fs::remove_dir_all(&target)
                        .map_err(|err| PipelineError::Installation(err.to_string()))?;
                }
                CollisionDecision::CopyAsNew => {
                    let renamed = disambiguate_name(self.mods_root, &metadata.name);
                    metadata.name = renamed.clone();
                    metadata
                        .save(guard.path())
                        .map_err(|err| PipelineError::Installation(format!("{err:#}")))?;
                    target = self.mods_root.join(renamed);
                }
            }
        }

        place_entry(guard.path(), &target)
            .map_err(|err| PipelineError::Installation(format!("{err:#}")))?;
        guard.disarm();
        // staging dir was renamed away; nothing left for the guard
        Ok(InstalledMod {
            name: metadata.name,
            folder: target,
        })
    }
}

fn stage_entry(stage: &Path, metadata: &mut ModMetadata, source: &InstallSource) -> Result<()> {
    match source {
        InstallSource::Structured { root } => {
            copy_tree(root, stage)?;
            // merge the shipped metadata onto ours, keeping our name if
            // the marker file lacks one
            let info_path = stage.join(crate::metadata::MOD_INFO_FILE);
            if let Ok(mut shipped) = ModMetadata::load(&info_path) {
                if shipped.name.is_empty() {
                    shipped.name = metadata.name.clone();
                }
                for url in metadata.source_urls.drain(..) {
                    if !shipped.source_urls.contains(&url) {
                        shipped.source_urls.push(url);
                    }
                }
                if shipped.url.is_none() {
                    shipped.url = metadata.url.take();
                }
                *metadata = shipped;
            }
        }
        InstallSource::Payloads { files } => {
            let assets = stage.join(ASSETS_DIR);
            fs::create_dir_all(&assets).context("create assets dir")?;
            let mut stored = Vec::with_capacity(files.len());
            for file in files {
                let name = file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .context("payload file name")?;
                let stored_name = ensure_patch_suffix(name);
                fs::copy(file, assets.join(&stored_name))
                    .with_context(|| format!("store payload {name}"))?;
                stored.push(stored_name);
            }
            stored.sort();
            metadata.set_payloads(&stored);
        }
    }
    Ok(())
}

fn place_entry(stage: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).context("create library root")?;
    }
    match fs::rename(stage, target) {
        Ok(()) => Ok(()),
        // cross-device staging falls back to a copy
        Err(_) => {
            copy_tree(stage, target)?;
            fs::remove_dir_all(stage).context("remove staging dir")?;
            Ok(())
        }
    }
}

/// Time-based disambiguator for CopyAsNew; the counter loop keeps two
/// installs within the same second from colliding.
fn disambiguate_name(mods_root: &Path, name: &str) -> String {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let candidate = format!("{name}_{stamp}");
    if !mods_root.join(&candidate).exists() {
        return candidate;
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{name}_{stamp}_{counter}");
        if !mods_root.join(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn attach_preview(stage: &Path, metadata: &mut ModMetadata, preview: PreviewSource<'_>) {
    let PreviewSource {
        agent,
        image_url,
        page_url,
    } = preview;
    let source = image_url.or_else(|| {
        page_url
            .as_deref()
            .and_then(|url| crate::resolver::scrape_page_image(agent, url))
    });
    let Some(source) = source else {
        return;
    };
    best_effort("preview image", || {
        let response = agent
            .get(&source)
            .set("User-Agent", USER_AGENT)
            .call()
            .context("fetch preview image")?;
        let mut reader = response.into_reader();
        let mut file =
            fs::File::create(stage.join("preview.png")).context("create preview file")?;
        io::copy(&mut reader, &mut file).context("write preview file")?;
        metadata.screenshot = Some("preview.png".to_string());
        Ok(())
    });
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_junk_path(entry.path()))
    {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source).context("rel path")?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).context("create dir")?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create file dir")?;
            }
            fs::copy(entry.path(), &target).context("copy file")?;
            preserve_mtime(entry.path(), &target);
        }
    }
    Ok(())
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let _ = set_file_mtime(dest, FileTime::from_unix_time(duration.as_secs() as i64, 0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{list_mods, mods_root};
    use crate::metadata::MOD_INFO_FILE;
    use tempfile::tempdir;

    fn write_payloads(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, name.as_bytes()).unwrap();
                path
            })
            .collect()
    }

    fn installer<'a>(root: &'a Path, policy: &'a dyn CollisionPolicy) -> Installer<'a> {
        Installer {
            mods_root: root,
            policy,
            gate: &AutoConfirm,
        }
    }

    #[test]
    fn single_payload_gets_suffix_and_no_options() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());
        let payloads = write_payloads(dir.path(), &["skin.pak"]);

        let installed = installer(&root, &AlwaysOverwrite)
            .install(
                ModMetadata::named("Skin Mod"),
                InstallSource::Payloads { files: payloads },
                None,
            )
            .unwrap();

        assert!(installed.folder.join(ASSETS_DIR).join("skin_P.pak").exists());
        let meta = ModMetadata::load(&installed.folder.join(MOD_INFO_FILE)).unwrap();
        assert!(!meta.has_options);
        assert!(meta.options.is_empty());
    }

    #[test]
    fn multiple_payloads_become_options() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());
        let payloads = write_payloads(dir.path(), &["red.pak", "blue_P.pak", "green.pak"]);

        let installed = installer(&root, &AlwaysOverwrite)
            .install(
                ModMetadata::named("Colors"),
                InstallSource::Payloads { files: payloads },
                None,
            )
            .unwrap();

        let meta = ModMetadata::load(&installed.folder.join(MOD_INFO_FILE)).unwrap();
        assert!(meta.has_options);
        assert_eq!(meta.options.len(), 3);
        for option in &meta.options {
            assert!(
                installed.folder.join(ASSETS_DIR).join(&option.file).exists(),
                "option file {} missing",
                option.file
            );
        }
    }

    #[test]
    fn overwrite_leaves_no_residue_from_previous_version() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());
        let installer = installer(&root, &AlwaysOverwrite);

        let old = write_payloads(dir.path(), &["old.pak", "stale.pak"]);
        installer
            .install(
                ModMetadata::named("Mod"),
                InstallSource::Payloads { files: old },
                None,
            )
            .unwrap();

        let new = write_payloads(dir.path(), &["new.pak"]);
        let installed = installer
            .install(
                ModMetadata::named("Mod"),
                InstallSource::Payloads { files: new },
                None,
            )
            .unwrap();

        let assets: Vec<String> = fs::read_dir(installed.folder.join(ASSETS_DIR))
            .unwrap()
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        assert_eq!(assets, vec!["new_P.pak".to_string()]);
    }

    #[test]
    fn copy_as_new_never_collides_even_within_one_second() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());
        let installer = installer(&root, &AlwaysCopyAsNew);

        let mut names = Vec::new();
        for _ in 0..3 {
            let payloads = write_payloads(dir.path(), &["x.pak"]);
            let installed = installer
                .install(
                    ModMetadata::named("Twin"),
                    InstallSource::Payloads { files: payloads },
                    None,
                )
                .unwrap();
            names.push(installed.name);
        }
        let unique: std::collections::HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), 3);
        assert_eq!(list_mods(&root).unwrap().len(), 3);
    }

    struct DeclineAll;

    impl InstallGate for DeclineAll {
        fn confirm(&self, _metadata: &ModMetadata) -> bool {
            false
        }
    }

    #[test]
    fn declined_confirmation_has_its_own_error() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());
        let payloads = write_payloads(dir.path(), &["a.pak"]);

        let err = Installer {
            mods_root: &root,
            policy: &AlwaysOverwrite,
            gate: &DeclineAll,
        }
        .install(
            ModMetadata::named("Declined"),
            InstallSource::Payloads { files: payloads },
            None,
        )
        .unwrap_err();

        assert!(matches!(err, PipelineError::InstallDeclined(_)));
        assert!(err.is_cancellation());
        assert!(list_mods(&root).unwrap().is_empty());
    }

    #[test]
    fn cancel_aborts_without_changes() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());

        let first = write_payloads(dir.path(), &["a.pak"]);
        installer(&root, &AlwaysOverwrite)
            .install(
                ModMetadata::named("Held"),
                InstallSource::Payloads { files: first },
                None,
            )
            .unwrap();

        let second = write_payloads(dir.path(), &["b.pak"]);
        let err = installer(&root, &AlwaysCancel)
            .install(
                ModMetadata::named("Held"),
                InstallSource::Payloads { files: second },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::CollisionCancelled(_)));

        // original entry untouched, no stray staging dirs
        let mods = list_mods(&root).unwrap();
        assert_eq!(mods.len(), 1);
        assert!(root.join("Held").join(ASSETS_DIR).join("a_P.pak").exists());
        let leftovers: Vec<_> = fs::read_dir(root.join("tmp"))
            .map(|entries| entries.filter_map(Result::ok).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn shipped_name_cannot_escape_library_root() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());

        let source = dir.path().join("payload/Sneaky");
        fs::create_dir_all(source.join(ASSETS_DIR)).unwrap();
        ModMetadata::named("../../escaped").save(&source).unwrap();
        fs::write(source.join(ASSETS_DIR).join("thing.pak"), b"x").unwrap();

        let installed = installer(&root, &AlwaysOverwrite)
            .install(
                ModMetadata::named("Fallback"),
                InstallSource::Structured { root: source },
                None,
            )
            .unwrap();

        assert!(installed.folder.starts_with(&root));
        assert!(!installed.name.contains('/'));
        assert!(!dir.path().join("escaped").exists());
        assert!(!dir.path().parent().unwrap().join("escaped").exists());
    }

    #[test]
    fn dot_only_shipped_name_is_rejected() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());

        let source = dir.path().join("payload/Dots");
        fs::create_dir_all(source.join(ASSETS_DIR)).unwrap();
        ModMetadata::named("..").save(&source).unwrap();

        let err = installer(&root, &AlwaysOverwrite)
            .install(
                ModMetadata::named("Fallback"),
                InstallSource::Structured { root: source },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Installation(_)));
        assert!(list_mods(&root).unwrap().is_empty());
    }

    #[test]
    fn structured_source_is_copied_as_is() {
        let dir = tempdir().unwrap();
        let root = mods_root(dir.path());

        let source = dir.path().join("payload/MyMod");
        fs::create_dir_all(source.join(ASSETS_DIR)).unwrap();
        let mut shipped = ModMetadata::named("Shipped Name");
        shipped.author = "Someone".to_string();
        shipped.save(&source).unwrap();
        fs::write(source.join(ASSETS_DIR).join("thing.pak"), b"x").unwrap();

        let mut carried = ModMetadata::named("Fallback");
        carried.record_source("https://cdn/a.zip", Some("https://page/1"));
        let installed = installer(&root, &AlwaysOverwrite)
            .install(carried, InstallSource::Structured { root: source }, None)
            .unwrap();

        assert_eq!(installed.name, "Shipped Name");
        let meta = ModMetadata::load(&installed.folder.join(MOD_INFO_FILE)).unwrap();
        assert_eq!(meta.author, "Someone");
        assert_eq!(meta.source_urls, vec!["https://cdn/a.zip".to_string()]);
        assert_eq!(meta.url.as_deref(), Some("https://page/1"));
        // stored file kept exactly as shipped; the suffix is asserted at
        // deploy time for structured entries
        assert!(installed.folder.join(ASSETS_DIR).join("thing.pak").exists());
    }
}

use crate::library::is_payload_file;
use crate::metadata::{ASSETS_DIR, MOD_INFO_FILE};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// What an extracted archive turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// A directory already shaped like a library entry: metadata marker
    /// next to an assets subfolder. Used as-is.
    Structured { root: PathBuf },
    /// No structured mod anywhere; every payload file found in the tree.
    LoosePaks(Vec<PathBuf>),
}

/// Walks the extracted tree for a pre-structured mod first; the first
/// directory holding both `modinfo.json` and `assets/` wins. Otherwise
/// collects every `.pak` in the tree.
pub fn detect_layout(extracted_root: &Path) -> Layout {
    for entry in WalkDir::new(extracted_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_junk_path(entry.path()))
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();
        if dir.join(MOD_INFO_FILE).is_file() && dir.join(ASSETS_DIR).is_dir() {
            return Layout::Structured {
                root: dir.to_path_buf(),
            };
        }
    }

    let mut paks: Vec<PathBuf> = WalkDir::new(extracted_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_junk_path(entry.path()))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_payload_file(path))
        .collect();
    paks.sort();
    Layout::LoosePaks(paks)
}

/// Archive cruft that must never influence layout detection.
pub fn is_junk_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ModMetadata;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn finds_structured_mod_nested_in_tree() {
        let dir = tempdir().unwrap();
        let mod_root = dir.path().join("wrapper/MyMod");
        fs::create_dir_all(mod_root.join(ASSETS_DIR)).unwrap();
        ModMetadata::named("MyMod").save(&mod_root).unwrap();
        fs::write(mod_root.join(ASSETS_DIR).join("a.pak"), b"x").unwrap();

        match detect_layout(dir.path()) {
            Layout::Structured { root } => assert_eq!(root, mod_root),
            other => panic!("expected structured layout, got {other:?}"),
        }
    }

    #[test]
    fn metadata_without_assets_is_not_structured() {
        let dir = tempdir().unwrap();
        let half = dir.path().join("Half");
        fs::create_dir_all(&half).unwrap();
        ModMetadata::named("Half").save(&half).unwrap();
        fs::write(dir.path().join("loose.pak"), b"x").unwrap();

        match detect_layout(dir.path()) {
            Layout::LoosePaks(paks) => assert_eq!(paks.len(), 1),
            other => panic!("expected loose paks, got {other:?}"),
        }
    }

    #[test]
    fn collects_loose_paks_recursively() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("one.pak"), b"x").unwrap();
        fs::write(dir.path().join("a/b/two.PAK"), b"x").unwrap();
        fs::write(dir.path().join("a/readme.txt"), b"x").unwrap();

        match detect_layout(dir.path()) {
            Layout::LoosePaks(paks) => assert_eq!(paks.len(), 2),
            other => panic!("expected loose paks, got {other:?}"),
        }
    }

    #[test]
    fn junk_dirs_are_ignored() {
        let dir = tempdir().unwrap();
        let junk = dir.path().join("__MACOSX");
        fs::create_dir_all(junk.join(ASSETS_DIR)).unwrap();
        ModMetadata::named("Junk").save(&junk).unwrap();
        fs::write(dir.path().join("real.pak"), b"x").unwrap();

        match detect_layout(dir.path()) {
            Layout::LoosePaks(paks) => assert_eq!(paks.len(), 1),
            other => panic!("expected loose paks, got {other:?}"),
        }
    }

    #[test]
    fn empty_tree_yields_no_paks() {
        let dir = tempdir().unwrap();
        assert_eq!(detect_layout(dir.path()), Layout::LoosePaks(Vec::new()));
    }
}

use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};

/// External extractor invocations tried in order once the native decoders
/// are out. Each is `(program, fixed install locations)`; the bare program
/// name also covers a PATH install. Absence of every tool is a normal
/// failure mode, not a crash.
const SEVEN_ZIP_LOCATIONS: &[&str] = &[
    "7z",
    "7zz",
    r"C:\Program Files\7-Zip\7z.exe",
    r"C:\Program Files (x86)\7-Zip\7z.exe",
];

const UNRAR_LOCATIONS: &[&str] = &[
    "unrar",
    r"C:\Program Files\WinRAR\UnRAR.exe",
    r"C:\Program Files (x86)\WinRAR\UnRAR.exe",
];

/// Extracts `archive` into `dest`. Tries the native decoder for recognized
/// container formats first, then every known external tool. The caller
/// owns `dest` and removes it if this fails.
pub fn extract(archive: &Path, dest: &Path) -> PipelineResult<()> {
    fs::create_dir_all(dest).map_err(|err| PipelineError::Installation(err.to_string()))?;

    let ext = archive
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let native = match ext.as_str() {
        "zip" => extract_zip(archive, dest).map(|_| true),
        "7z" => sevenz_rust::decompress_file(archive, dest)
            .map(|_| true)
            .map_err(anyhow::Error::from),
        _ => Ok(false),
    };

    match native {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(err) => {
            log::debug!("native extraction of {} failed: {err:#}", archive.display());
            // Downloaded archives are sometimes mislabeled; a zip named
            // .rar (or vice versa) still has to go through the tools.
        }
    }

    // Some downloads carry no useful extension at all. Sniff for zip before
    // resigning to external tools.
    if ext != "zip" && looks_like_zip(archive) {
        if extract_zip(archive, dest).is_ok() {
            return Ok(());
        }
    }

    if run_seven_zip(archive, dest) || run_unrar(archive, dest) {
        return Ok(());
    }

    Err(PipelineError::Extraction {
        archive: archive.to_path_buf(),
    })
}

fn looks_like_zip(path: &Path) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    io::Read::read_exact(&mut file, &mut magic).is_ok() && &magic[..2] == b"PK"
}

fn extract_zip(path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(path).context("open zip")?;
    let mut archive = zip::ZipArchive::new(file).context("read zip")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("zip entry")?;
        let Some(out_path) = file.enclosed_name() else {
            continue;
        };

        let out_path = dest.join(out_path);
        if file.is_dir() {
            fs::create_dir_all(&out_path).context("create zip dir")?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("create zip dir")?;
        }

        let mut out_file = fs::File::create(&out_path).context("write zip entry")?;
        io::copy(&mut file, &mut out_file).context("extract zip entry")?;
        if let Some(dt) = file.last_modified() {
            if let Some(mtime) = zip_time_to_unix(dt) {
                let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
            }
        }
    }

    Ok(())
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
}

fn run_seven_zip(archive: &Path, dest: &Path) -> bool {
    let out_flag = format!("-o{}", dest.display());
    for program in SEVEN_ZIP_LOCATIONS {
        let outcome = run_silent(
            Command::new(program)
                .args(["x", "-y"])
                .arg(&out_flag)
                .arg(archive),
        );
        match outcome {
            ToolOutcome::Success => return true,
            ToolOutcome::Failed => log::debug!("{program} could not extract {}", archive.display()),
            ToolOutcome::Missing => {}
        }
    }
    false
}

fn run_unrar(archive: &Path, dest: &Path) -> bool {
    // unrar wants a trailing separator on the output directory
    let out_dir = format!("{}{}", dest.display(), std::path::MAIN_SEPARATOR);
    for program in UNRAR_LOCATIONS {
        let outcome = run_silent(
            Command::new(program)
                .args(["x", "-y"])
                .arg(archive)
                .arg(&out_dir),
        );
        match outcome {
            ToolOutcome::Success => return true,
            ToolOutcome::Failed => log::debug!("{program} could not extract {}", archive.display()),
            ToolOutcome::Missing => {}
        }
    }
    false
}

enum ToolOutcome {
    Success,
    Failed,
    Missing,
}

fn run_silent(command: &mut Command) -> ToolOutcome {
    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => ToolOutcome::Success,
        Ok(_) => ToolOutcome::Failed,
        Err(err) if err.kind() == io::ErrorKind::NotFound => ToolOutcome::Missing,
        Err(_) => ToolOutcome::Failed,
    }
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Temporary directory removed on drop unless disarmed. Every extraction
/// flow owns exactly one of these, so partial state never outlives the
/// flow that produced it.
pub struct TempDirGuard {
    path: PathBuf,
    armed: bool,
}

impl TempDirGuard {
    pub fn create(parent: &Path, suffix: &str) -> Result<Self> {
        let temp_root = parent.join("tmp");
        fs::create_dir_all(&temp_root).context("create temp root")?;

        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = temp_root.join(format!("flow-{nanos}-{counter}-{suffix}"));
        fs::create_dir_all(&path).context("create temp dir")?;
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_zip_natively() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod.zip");
        write_zip(&archive, &[("inner/skin.pak", b"data"), ("readme.txt", b"hi")]);

        let dest = dir.path().join("out");
        extract(&archive, &dest).unwrap();
        assert!(dest.join("inner/skin.pak").exists());
        assert!(dest.join("readme.txt").exists());
    }

    #[test]
    fn sniffs_mislabeled_zip() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod.rar");
        write_zip(&archive, &[("skin.pak", b"data")]);

        let dest = dir.path().join("out");
        extract(&archive, &dest).unwrap();
        assert!(dest.join("skin.pak").exists());
    }

    #[test]
    fn unextractable_garbage_fails_with_extraction_error() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod.rar");
        fs::write(&archive, b"definitely not an archive").unwrap();

        let dest = dir.path().join("out");
        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { .. }));
    }

    #[test]
    fn temp_dir_guard_cleans_up() {
        let dir = tempdir().unwrap();
        let kept;
        {
            let guard = TempDirGuard::create(dir.path(), "test").unwrap();
            kept = guard.path().to_path_buf();
            assert!(kept.exists());
        }
        assert!(!kept.exists());
    }

    #[test]
    fn disarmed_guard_keeps_dir() {
        let dir = tempdir().unwrap();
        let kept;
        {
            let mut guard = TempDirGuard::create(dir.path(), "keep").unwrap();
            guard.disarm();
            kept = guard.path().to_path_buf();
        }
        assert!(kept.exists());
        fs::remove_dir_all(kept).unwrap();
    }
}

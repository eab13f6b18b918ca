use crate::error::{PipelineError, PipelineResult};
use crate::library::sanitize_file_name;
use crate::resolver::CandidateFile;
use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) paksmith";

const CHUNK_SIZE: usize = 8192;
const FALLBACK_FILE_NAME: &str = "download.archive";

/// Cooperative cancellation flag, polled at chunk boundaries only.
/// Extraction and installation run to completion once started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// `(bytes_downloaded, total_bytes)`; total is zero when the server sent
/// no content length.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(60))
        .timeout_write(Duration::from_secs(60))
        .build()
}

/// Streams one file into `dest_dir`, reporting per-chunk progress and
/// honoring the cancel token. The partial file never survives a failure.
pub fn download_file(
    agent: &ureq::Agent,
    url: &str,
    dest_dir: &Path,
    progress: Option<&ProgressCallback>,
    cancel: &CancelToken,
) -> PipelineResult<PathBuf> {
    let response = agent
        .get(url)
        .set("User-Agent", USER_AGENT)
        .call()
        .map_err(|err| PipelineError::download(url, err))?;

    let total: u64 = response
        .header("Content-Length")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let file_name = resolve_file_name(response.header("Content-Disposition"), url);
    let dest = dest_dir.join(&file_name);

    let mut reader = response.into_reader();
    let mut file =
        fs::File::create(&dest).map_err(|err| PipelineError::download(url, err))?;

    let mut buffer = [0u8; CHUNK_SIZE];
    let mut downloaded: u64 = 0;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&dest);
                return Err(PipelineError::download(url, err));
            }
        };
        if cancel.is_cancelled() {
            drop(file);
            let _ = fs::remove_file(&dest);
            return Err(PipelineError::Cancelled);
        }
        if let Err(err) = file.write_all(&buffer[..read]) {
            drop(file);
            let _ = fs::remove_file(&dest);
            return Err(PipelineError::download(url, err));
        }
        downloaded += read as u64;
        if let Some(progress) = progress {
            progress(downloaded, total);
        }
    }

    Ok(dest)
}

/// Combined fraction of a whole batch, reported after every chunk of the
/// in-flight file.
pub type BatchProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Downloads every candidate sequentially, folding per-file progress into
/// one combined fraction. The first failure aborts the whole batch; there
/// are no partial-success batches.
pub fn download_batch(
    agent: &ureq::Agent,
    files: &[CandidateFile],
    dest_dir: &Path,
    progress: Option<&BatchProgressCallback>,
    cancel: &CancelToken,
) -> PipelineResult<Vec<PathBuf>> {
    let count = files.len().max(1);
    let mut paths = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let combined: Option<ProgressCallback> = progress.map(|outer| {
            let outer = outer.clone();
            Arc::new(move |done: u64, total: u64| {
                outer(batch_fraction(index, count, done, total));
            }) as ProgressCallback
        });
        let path = download_file(agent, &file.download_url, dest_dir, combined.as_ref(), cancel)?;
        paths.push(path);
        if let Some(outer) = progress {
            outer((index + 1) as f64 / count as f64);
        }
    }
    Ok(paths)
}

/// `(completedFiles + currentFileFraction) / N`, clamped. Unknown totals
/// contribute a zero fraction for the in-flight file.
pub fn batch_fraction(completed: usize, count: usize, done: u64, total: u64) -> f64 {
    let current = if total > 0 {
        (done as f64 / total as f64).min(1.0)
    } else {
        0.0
    };
    ((completed as f64 + current) / count.max(1) as f64).clamp(0.0, 1.0)
}

/// Content-Disposition wins, then the URL's last path segment when it
/// carries an extension, then a generic fallback; always sanitized.
pub fn resolve_file_name(content_disposition: Option<&str>, url: &str) -> String {
    let mut name = content_disposition
        .and_then(parse_content_disposition)
        .unwrap_or_default();

    if name.is_empty() {
        let tail = url
            .rsplit('/')
            .next()
            .unwrap_or("")
            .split('?')
            .next()
            .unwrap_or("");
        if tail.contains('.') {
            name = tail.to_string();
        }
    }

    if name.is_empty() {
        name = FALLBACK_FILE_NAME.to_string();
    }
    sanitize_file_name(&name)
}

fn parse_content_disposition(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename=")?;
    let rest = rest.trim();
    let name = if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next().unwrap_or("")
    } else {
        rest.split(';').next().unwrap_or("").trim()
    };
    (!name.is_empty()).then(|| name.to_string())
}

use crate::download::{
    download_batch, download_file, http_agent, BatchProgressCallback, CancelToken,
    ProgressCallback,
};
use crate::error::{PipelineError, PipelineResult};
use crate::extract::{extract, TempDirGuard};
use crate::install::{
    AutoConfirm, CollisionPolicy, InstallGate, InstallSource, InstalledMod, Installer,
    PreviewSource,
};
use crate::layout::{detect_layout, Layout};
use crate::metadata::ModMetadata;
use crate::resolver::{resolve, CandidateFile};
use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread,
};

/// Progress and lifecycle notifications for whoever is watching the run;
/// the pipeline itself never talks to a terminal.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Resolving { url: String },
    Resolved { name: String, files: usize },
    Downloading { file: String },
    DownloadProgress { downloaded: u64, total: u64 },
    BatchProgress { fraction: f64 },
    Extracting { archive: PathBuf },
    Installing { name: String },
    Installed { name: String },
    Failed { url: String, error: String },
}

pub type EventSink = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Which of a mod page's files to acquire when it offers several.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSelection {
    First,
    All,
    Index(usize),
}

pub struct Pipeline<'a> {
    pub agent: ureq::Agent,
    pub mods_root: PathBuf,
    pub policy: &'a dyn CollisionPolicy,
    pub gate: &'a dyn InstallGate,
    pub selection: FileSelection,
    pub events: Option<EventSink>,
    pub cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(mods_root: PathBuf, policy: &'a dyn CollisionPolicy) -> Self {
        Pipeline {
            agent: http_agent(),
            mods_root,
            policy,
            gate: &AutoConfirm,
            selection: FileSelection::First,
            events: None,
            cancel: CancelToken::new(),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }

    /// The full acquisition path for one mod page URL. Every selected file
    /// is downloaded, extracted and installed as its own library entry.
    pub fn install_from_url(&self, url: &str) -> PipelineResult<Vec<InstalledMod>> {
        self.emit(PipelineEvent::Resolving {
            url: url.to_string(),
        });
        let resolution = resolve(&self.agent, url)?;
        self.emit(PipelineEvent::Resolved {
            name: resolution.metadata.name.clone(),
            files: resolution.files.len(),
        });

        let selected: Vec<CandidateFile> = self
            .select_files(&resolution.files, url)?
            .into_iter()
            .cloned()
            .collect();
        let work = TempDirGuard::create(&self.mods_root, "work")
            .map_err(|err| PipelineError::Installation(err.to_string()))?;

        for candidate in &selected {
            self.emit(PipelineEvent::Downloading {
                file: candidate.name.clone(),
            });
        }
        let archives = self.download_selected(&selected, work.path())?;

        let mut installed = Vec::new();
        for (archive, candidate) in archives.iter().zip(&selected) {
            let mut metadata = resolution.metadata.clone();
            metadata.record_source(&candidate.download_url, Some(url));
            let preview = PreviewSource {
                agent: &self.agent,
                image_url: resolution.image_url.clone(),
                page_url: Some(url.to_string()),
            };
            installed.push(self.install_archive(archive, metadata, Some(preview))?);
        }
        Ok(installed)
    }

    /// Archive-to-library-entry path, shared by URL installs and local
    /// file imports.
    pub fn install_archive(
        &self,
        archive: &Path,
        metadata: ModMetadata,
        preview: Option<PreviewSource<'_>>,
    ) -> PipelineResult<InstalledMod> {
        self.emit(PipelineEvent::Extracting {
            archive: archive.to_path_buf(),
        });
        let scratch = TempDirGuard::create(&self.mods_root, "extract")
            .map_err(|err| PipelineError::Installation(err.to_string()))?;
        extract(archive, scratch.path())?;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let source = match detect_layout(scratch.path()) {
            Layout::Structured { root } => InstallSource::Structured { root },
            Layout::LoosePaks(files) => {
                if files.is_empty() {
                    return Err(PipelineError::Installation(format!(
                        "archive {} contained no payload files",
                        archive.display()
                    )));
                }
                InstallSource::Payloads { files }
            }
        };

        self.emit(PipelineEvent::Installing {
            name: metadata.name.clone(),
        });
        let installer = Installer {
            mods_root: &self.mods_root,
            policy: self.policy,
            gate: self.gate,
        };
        let installed = installer.install(metadata, source, preview)?;
        self.emit(PipelineEvent::Installed {
            name: installed.name.clone(),
        });
        Ok(installed)
    }

    /// Every selected file gets downloaded whether or not anyone is
    /// listening for progress; the sink only decides reporting.
    fn download_selected(
        &self,
        selected: &[CandidateFile],
        dest: &Path,
    ) -> PipelineResult<Vec<PathBuf>> {
        if selected.len() > 1 {
            let progress = self.batch_progress();
            return download_batch(&self.agent, selected, dest, progress.as_ref(), &self.cancel);
        }
        let progress = self.download_progress();
        Ok(vec![download_file(
            &self.agent,
            &selected[0].download_url,
            dest,
            progress.as_ref(),
            &self.cancel,
        )?])
    }

    fn select_files<'f>(
        &self,
        files: &'f [CandidateFile],
        url: &str,
    ) -> PipelineResult<Vec<&'f CandidateFile>> {
        match self.selection {
            FileSelection::First => Ok(vec![&files[0]]),
            FileSelection::All => Ok(files.iter().collect()),
            FileSelection::Index(index) => files.get(index).map(|file| vec![file]).ok_or_else(|| {
                PipelineError::NoFilesFound {
                    url: format!("{url} (file #{index})"),
                }
            }),
        }
    }

    fn download_progress(&self) -> Option<ProgressCallback> {
        self.events.as_ref().map(|sink| {
            let sink = sink.clone();
            Arc::new(move |downloaded: u64, total: u64| {
                sink(PipelineEvent::DownloadProgress { downloaded, total });
            }) as ProgressCallback
        })
    }

    fn batch_progress(&self) -> Option<BatchProgressCallback> {
        self.events.as_ref().map(|sink| {
            let sink = sink.clone();
            Arc::new(move |fraction: f64| {
                sink(PipelineEvent::BatchProgress { fraction });
            }) as BatchProgressCallback
        })
    }

    /// Runs a list of page URLs back to back. Individual failures are
    /// tallied and the batch moves on; a cancellation stops it cold.
    pub fn install_batch(&self, urls: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        let batch_progress = self.batch_progress();
        for (index, url) in urls.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.install_from_url(url) {
                Ok(mods) => {
                    report.installed.extend(mods.into_iter().map(|m| m.name));
                }
                Err(err) if err.is_cancellation() => {
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    log::warn!("batch entry {url} failed: {err}");
                    self.emit(PipelineEvent::Failed {
                        url: url.clone(),
                        error: err.to_string(),
                    });
                    report.failures.push((url.clone(), err.to_string()));
                }
            }
            if let Some(progress) = &batch_progress {
                progress((index + 1) as f64 / urls.len().max(1) as f64);
            }
        }
        report
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub installed: Vec<String>,
    pub failures: Vec<(String, String)>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} installed, {} failed",
            self.installed.len(),
            self.failures.len()
        );
        if self.cancelled {
            line.push_str(", cancelled");
        }
        line
    }
}

/// Runs a batch on a worker thread, forwarding events over a channel so a
/// frontend can drain them without blocking the downloads.
pub fn spawn_batch(
    mods_root: PathBuf,
    urls: Vec<String>,
    selection: FileSelection,
    suppress_collision_prompt: bool,
    sender: mpsc::Sender<PipelineEvent>,
    cancel: CancelToken,
) -> thread::JoinHandle<BatchReport> {
    thread::spawn(move || {
        let events: EventSink = Arc::new(move |event| {
            let _ = sender.send(event);
        });
        let policy: Box<dyn CollisionPolicy> = if suppress_collision_prompt {
            Box::new(crate::install::AlwaysOverwrite)
        } else {
            Box::new(crate::install::AlwaysCopyAsNew)
        };
        let pipeline = Pipeline {
            agent: http_agent(),
            mods_root,
            policy: policy.as_ref(),
            gate: &AutoConfirm,
            selection,
            events: Some(events),
            cancel,
        };
        pipeline.install_batch(&urls)
    })
}

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the acquisition pipeline. Each stage fails fast with
/// its own variant; soft absences (missing preview image, unknown content
/// length, optional metadata fields) never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not a recognized mod page URL: {0}")]
    InvalidUrl(String),

    #[error("no downloadable files found for {url}")]
    NoFilesFound { url: String },

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("could not extract {archive}: all extraction strategies failed")]
    Extraction { archive: PathBuf },

    #[error("installation failed: {0}")]
    Installation(String),

    #[error("installation cancelled by collision policy for '{0}'")]
    CollisionCancelled(String),

    #[error("installation of '{0}' declined")]
    InstallDeclined(String),
}

impl PipelineError {
    pub fn download(url: &str, reason: impl ToString) -> Self {
        Self::Download {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the failure came from the cooperative cancel token rather
    /// than an actual fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::CollisionCancelled(_)
                | PipelineError::InstallDeclined(_)
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Runs a non-critical step, logging and discarding its failure. The
/// critical path must never abort because a preview image or similar
/// nicety could not be fetched.
pub fn best_effort<T>(label: &str, op: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
    match op() {
        Ok(value) => Some(value),
        Err(err) => {
            log::debug!("best-effort step '{label}' skipped: {err:#}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_effort_swallows_errors() {
        let value = best_effort("fail", || anyhow::bail!("nope"));
        assert_eq!(value, None::<()>);
        let value = best_effort("ok", || Ok(7));
        assert_eq!(value, Some(7));
    }

    #[test]
    fn cancellation_is_distinguished() {
        assert!(PipelineError::Cancelled.is_cancellation());
        assert!(PipelineError::CollisionCancelled("x".into()).is_cancellation());
        assert!(PipelineError::InstallDeclined("x".into()).is_cancellation());
        assert!(!PipelineError::download("u", "boom").is_cancellation());
    }
}

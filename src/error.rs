//! Error taxonomy for a summarization run.
//!
//! Only [`PipelineError`] ever escapes a run. Everything else is a per-segment
//! failure that gets recorded on the [`SegmentResult`](crate::pipeline::SegmentResult)
//! and skipped.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The source duration could not be determined. Fatal, raised before any
/// remote resource exists.
#[derive(Debug, Error)]
#[error("could not determine duration of '{}'", path.display())]
pub struct ProbeError {
    pub path: PathBuf,
    #[source]
    pub source: anyhow::Error,
}

/// The splitter failed to materialize one window.
#[derive(Debug, Error)]
#[error("extracting segment {index} failed: {message}")]
pub struct ExtractionError {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("uploading '{}' failed", path.display())]
pub struct UploadError {
    pub path: PathBuf,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum FailureReason {
    #[error("service reported processing FAILED")]
    ReportedFailed,
    #[error("polling state failed")]
    Transport(#[source] anyhow::Error),
    #[error("not ACTIVE after {0:?}")]
    TimedOut(Duration),
}

/// A remote resource never became ACTIVE.
#[derive(Debug, Error)]
#[error("remote resource {name} did not become ACTIVE")]
pub struct ResourceFailedError {
    pub name: String,
    #[source]
    pub reason: FailureReason,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{target} is {state}, not ACTIVE")]
    NotActive { target: String, state: String },
    #[error("generation for {target} failed after {attempts} attempt(s)")]
    Exhausted {
        target: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// Why a window produced no text.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    ResourceFailed(#[from] ResourceFailedError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("run cancelled after cleaning up {cleaned} remote resource(s)")]
    Cancelled { cleaned: usize },
}

/// Renders an error and all of its causes on one line, `outer: inner: ...`.
pub fn chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut s = e.to_string();
    let mut cause = e.source();
    while let Some(c) = cause {
        s.push_str(": ");
        s.push_str(&c.to_string());
        cause = c.source();
    }
    s
}

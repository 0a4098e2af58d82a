//! Lifecycle of uploaded artifacts on the remote service.
//!
//! An upload starts out `Uploading`, is driven to `Active` or `Failed` by
//! polling, and only ever reaches `Deleted` through an explicit delete.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{FailureReason, ResourceFailedError, UploadError};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Uploading,
    Active,
    Failed,
    Deleted,
}

impl ResourceState {
    /// Whether `self -> next` is a legal move. Repeated `Uploading` is a poll
    /// that saw no progress.
    pub fn can_become(self, next: ResourceState) -> bool {
        use ResourceState::*;
        match (self, next) {
            (Uploading, Uploading | Active | Failed) => true,
            (Active | Failed, Deleted) => true,
            (Uploading, Deleted) => false,
            (Active | Failed, Uploading | Active | Failed) => false,
            (Deleted, _) => false,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceState::Uploading => "UPLOADING",
            ResourceState::Active => "ACTIVE",
            ResourceState::Failed => "FAILED",
            ResourceState::Deleted => "DELETED",
        })
    }
}

/// What the service hands back for a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub name: String,
    pub uri: String,
    pub mime_type: String,
}

/// One element of a generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    File { uri: String, mime_type: String },
}

/// The remote generative service, as far as a run needs it.
///
/// Responses from [`generate`](RemoteService::generate) are returned as raw JSON
/// and are not trusted to have any particular shape.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn upload(&self, path: &Path, mime_type: &str) -> anyhow::Result<UploadedFile>;

    /// Current processing state. Never `Deleted`.
    async fn get_state(&self, name: &str) -> anyhow::Result<ResourceState>;

    async fn delete(&self, name: &str) -> anyhow::Result<()>;

    async fn generate(&self, model: &str, contents: &[Content])
        -> anyhow::Result<serde_json::Value>;
}

/// Service-side handle for one uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    pub name: String,
    pub uri: String,
    pub mime_type: String,
    state: ResourceState,
}

impl RemoteResource {
    fn uploading(file: UploadedFile) -> Self {
        Self {
            name: file.name,
            uri: file.uri,
            mime_type: file.mime_type,
            state: ResourceState::Uploading,
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    fn transition(&mut self, next: ResourceState) {
        assert!(
            self.state.can_become(next),
            "invalid transition {} -> {next} for {}",
            self.state,
            self.name
        );
        self.state = next;
    }

    #[cfg(test)]
    pub(crate) fn in_state(name: &str, state: ResourceState) -> Self {
        Self {
            name: name.to_string(),
            uri: format!("https://fake.invalid/{name}"),
            mime_type: "video/mp4".to_string(),
            state,
        }
    }
}

/// MIME type announced for an upload, from the file extension.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("mpg" | "mpeg") => "video/mpeg",
        Some("flv") => "video/x-flv",
        Some("3gp") => "video/3gpp",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("ogg" | "oga") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// Uploads files and drives them through the readiness state machine.
#[derive(Clone)]
pub struct ResourceManager {
    service: Arc<dyn RemoteService>,
    poll_interval: Duration,
    max_wait: Duration,
    poll_retry: RetryPolicy,
}

impl ResourceManager {
    pub fn new(service: Arc<dyn RemoteService>, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            service,
            poll_interval,
            max_wait,
            poll_retry: RetryPolicy::once(),
        }
    }

    /// Retry transport errors on individual state polls.
    pub fn with_poll_retry(mut self, poll_retry: RetryPolicy) -> Self {
        self.poll_retry = poll_retry;
        self
    }

    pub async fn upload(&self, path: &Path) -> Result<RemoteResource, UploadError> {
        let mime_type = mime_type_for(path);
        info!(path = %path.display(), mime_type, "uploading");
        let file = self
            .service
            .upload(path, mime_type)
            .await
            .map_err(|source| UploadError {
                path: path.to_path_buf(),
                source,
            })?;
        info!(resource = %file.name, uri = %file.uri, "upload initiated");
        Ok(RemoteResource::uploading(file))
    }

    /// Polls until `resource` is `Active`.
    ///
    /// On a reported failure, a poll transport error, or exceeding the maximum
    /// wait, the resource is marked `Failed`, one best-effort delete is issued,
    /// and the error is returned.
    ///
    /// # Panics
    ///
    /// If `resource` has already been deleted.
    pub async fn await_active(
        &self,
        resource: &mut RemoteResource,
    ) -> Result<(), ResourceFailedError> {
        assert_ne!(
            resource.state,
            ResourceState::Deleted,
            "polled deleted resource {}",
            resource.name
        );
        let deadline = Instant::now() + self.max_wait;
        debug!(resource = %resource.name, "waiting for ACTIVE");

        let reason = loop {
            match resource.state {
                ResourceState::Active => {
                    info!(resource = %resource.name, "resource is ACTIVE");
                    return Ok(());
                }
                ResourceState::Failed => break FailureReason::ReportedFailed,
                ResourceState::Uploading => {}
                ResourceState::Deleted => unreachable!("checked on entry"),
            }
            if Instant::now() >= deadline {
                break FailureReason::TimedOut(self.max_wait);
            }

            let name = resource.name.clone();
            // waiting, polling and any poll retries all count against the deadline
            let polled = tokio::time::timeout_at(deadline, async {
                tokio::time::sleep(self.poll_interval).await;
                self.poll_retry
                    .run("state poll", |_| self.service.get_state(&name))
                    .await
            })
            .await;
            let Ok(polled) = polled else {
                break FailureReason::TimedOut(self.max_wait);
            };
            match polled {
                Ok(ResourceState::Deleted) => {
                    break FailureReason::Transport(anyhow::anyhow!(
                        "service reported {name} as deleted while processing"
                    ));
                }
                Ok(state) => {
                    debug!(resource = %name, %state, "polled");
                    resource.transition(state);
                }
                Err(e) => break FailureReason::Transport(e),
            }
        };

        warn!(resource = %resource.name, "resource did not become ACTIVE: {reason}");
        if resource.state == ResourceState::Uploading {
            resource.transition(ResourceState::Failed);
        }
        self.delete(resource).await;
        Err(ResourceFailedError {
            name: resource.name.clone(),
            reason,
        })
    }

    /// Best-effort, idempotent delete. Returns whether the resource is gone.
    ///
    /// A resource abandoned mid-upload is marked `Failed` first. Errors are
    /// logged, never returned. A delete left unanswered for the maximum wait
    /// counts as failed.
    pub async fn delete(&self, resource: &mut RemoteResource) -> bool {
        match resource.state {
            ResourceState::Deleted => {
                debug!(resource = %resource.name, "already deleted");
                return true;
            }
            ResourceState::Uploading => resource.transition(ResourceState::Failed),
            ResourceState::Active | ResourceState::Failed => {}
        }
        let deleted = tokio::time::timeout(self.max_wait, self.service.delete(&resource.name))
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("no answer within {:?}", self.max_wait)));
        match deleted {
            Ok(()) => {
                resource.transition(ResourceState::Deleted);
                info!(resource = %resource.name, "deleted remote resource");
                true
            }
            Err(e) => {
                warn!(resource = %resource.name, "could not delete remote resource: {e:#}");
                false
            }
        }
    }
}

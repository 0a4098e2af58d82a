//! The whole run: plan, then per window extract, upload, wait, and generate,
//! then merge and refine.
//!
//! Windows are processed strictly one at a time. Every remote resource created
//! along the way is recorded in a [`ResourceLedger`] that is swept once the run
//! ends, however it ends.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{chain, GenerationError, PipelineError, SegmentError};
use crate::media::{Extractor, MediaTool, SourceMedia};
use crate::planner::{plan, Window};
use crate::remote::{RemoteResource, RemoteService, ResourceManager};
use crate::synthesis::{SynthesisClient, SEGMENT_PROMPT};

/// What happened to one window.
#[derive(Debug)]
pub struct SegmentResult {
    pub window: Window,
    pub outcome: Result<String, SegmentError>,
}

impl SegmentResult {
    pub fn summary_text(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }
}

/// The text a run ends with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    Refined(String),
    /// Tagged segment texts, unrefined.
    Merged(String),
    NothingProduced,
}

impl Document {
    pub fn text(&self) -> Option<&str> {
        match self {
            Document::Refined(t) | Document::Merged(t) => Some(t),
            Document::NothingProduced => None,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub source: SourceMedia,
    pub segments: Vec<SegmentResult>,
    pub document: Document,
    /// Set when refinement was attempted and the merged text was kept instead.
    pub refine_error: Option<GenerationError>,
    pub resources_created: usize,
    /// Names the cleanup sweep could not delete.
    pub resources_undeleted: Vec<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.summary_text().is_some())
            .count()
    }
}

/// Joins the successful segments in window order, each under its time range.
pub fn merge(segments: &[SegmentResult]) -> Option<String> {
    let parts: Vec<String> = segments
        .iter()
        .filter_map(|s| {
            let text = s.summary_text()?;
            Some(format!(
                "Segment {} ({}):\n{}",
                s.window.index,
                s.window.time_range(),
                text
            ))
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Every remote resource created during a run.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    resources: Vec<RemoteResource>,
}

impl ResourceLedger {
    pub fn register(&mut self, resource: RemoteResource) -> &mut RemoteResource {
        let at = self.resources.len();
        self.resources.push(resource);
        &mut self.resources[at]
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Deletes everything not yet deleted. Returns the names that could not be.
    pub async fn sweep(&mut self, manager: &ResourceManager) -> Vec<String> {
        if self.resources.is_empty() {
            debug!("no remote resources to clean up");
            return Vec::new();
        }
        info!(count = self.resources.len(), "cleaning up remote resources");
        let mut undeleted = Vec::new();
        for resource in &mut self.resources {
            if !manager.delete(resource).await {
                undeleted.push(resource.name.clone());
            }
        }
        undeleted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub max_window: f64,
    pub overlap: f64,
    pub model: String,
    pub pacing: Duration,
    pub refine: bool,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_window: config.max_window_secs,
            overlap: config.overlap_secs,
            model: config.model.clone(),
            pacing: config.pacing(),
            refine: config.refine,
        }
    }
}

pub struct Pipeline {
    media: Arc<dyn MediaTool>,
    extractor: Extractor,
    resources: ResourceManager,
    synthesis: SynthesisClient,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(media: Arc<dyn MediaTool>, service: Arc<dyn RemoteService>, config: &Config) -> Self {
        Self {
            extractor: Extractor::new(Arc::clone(&media), config.work_dir()),
            resources: ResourceManager::new(
                Arc::clone(&service),
                config.poll_interval(),
                config.max_wait(),
            ),
            synthesis: SynthesisClient::new(service, config.generate_retry()),
            settings: PipelineSettings::from(config),
            media,
        }
    }

    /// Summarizes the media at `path`.
    ///
    /// Once the source has been probed, the cleanup sweep runs before this
    /// returns, including when `cancel` resolves first.
    pub async fn run(
        &self,
        path: &Path,
        cancel: impl Future<Output = ()>,
    ) -> Result<RunReport, PipelineError> {
        let source = SourceMedia::probe(self.media.as_ref(), path).await?;
        let windows = plan(
            source.duration,
            self.settings.max_window,
            self.settings.overlap,
        );
        info!(
            path = %source.path.display(),
            duration = source.duration,
            windows = windows.len(),
            "planned run"
        );

        let mut ledger = ResourceLedger::default();
        let finished = tokio::select! {
            done = self.summarize(&source, &windows, &mut ledger) => Some(done),
            () = cancel => {
                warn!("cancelled, cleaning up before exit");
                None
            }
        };
        let resources_created = ledger.len();
        let resources_undeleted = ledger.sweep(&self.resources).await;
        for name in &resources_undeleted {
            warn!(resource = %name, "remote resource left behind");
        }

        let Some((segments, document, refine_error)) = finished else {
            return Err(PipelineError::Cancelled {
                cleaned: resources_created - resources_undeleted.len(),
            });
        };
        Ok(RunReport {
            source,
            segments,
            document,
            refine_error,
            resources_created,
            resources_undeleted,
        })
    }

    async fn summarize(
        &self,
        source: &SourceMedia,
        windows: &[Window],
        ledger: &mut ResourceLedger,
    ) -> (Vec<SegmentResult>, Document, Option<GenerationError>) {
        let mut segments = Vec::with_capacity(windows.len());
        for (i, window) in windows.iter().enumerate() {
            info!(
                index = window.index,
                of = windows.len(),
                range = %window.time_range(),
                "processing segment"
            );
            let outcome = self.process_window(source, window, ledger).await;
            // a window that never left the machine made no request to pace
            let reached_service = !matches!(outcome, Err(SegmentError::Extraction(_)));
            match &outcome {
                Ok(text) => info!(index = window.index, chars = text.len(), "segment summarized"),
                Err(e) => warn!(index = window.index, "skipping segment: {}", chain(e)),
            }
            segments.push(SegmentResult {
                window: *window,
                outcome,
            });

            if reached_service && i + 1 < windows.len() && !self.settings.pacing.is_zero() {
                debug!(delay = ?self.settings.pacing, model = %self.settings.model, "pacing requests");
                tokio::time::sleep(self.settings.pacing).await;
            }
        }

        let (document, refine_error) = self.finish(&segments).await;
        (segments, document, refine_error)
    }

    /// The local segment file lives exactly as long as this call.
    async fn process_window(
        &self,
        source: &SourceMedia,
        window: &Window,
        ledger: &mut ResourceLedger,
    ) -> Result<String, SegmentError> {
        let segment = self.extractor.extract(source, window).await?;
        let uploaded = self.resources.upload(segment.path()).await?;
        let resource = ledger.register(uploaded);
        self.resources.await_active(resource).await?;
        let text = self
            .synthesis
            .generate(resource, &self.settings.model, SEGMENT_PROMPT)
            .await?;
        Ok(text)
    }

    async fn finish(&self, segments: &[SegmentResult]) -> (Document, Option<GenerationError>) {
        let Some(merged) = merge(segments) else {
            warn!("no segment produced a summary");
            return (Document::NothingProduced, None);
        };
        if !self.settings.refine {
            return (Document::Merged(merged), None);
        }
        match self.synthesis.refine(&merged, &self.settings.model).await {
            Ok(refined) => (Document::Refined(refined), None),
            Err(e) => {
                warn!("refinement failed, keeping merged text: {}", chain(&e));
                (Document::Merged(merged), Some(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ResourceState;
    use crate::testing::{candidate, FakeMedia, FakeService, Poll};
    use std::path::PathBuf;
    use tokio::time::Instant;

    struct Harness {
        media: Arc<FakeMedia>,
        service: Arc<FakeService>,
        dir: tempfile::TempDir,
        config: Config,
    }

    impl Harness {
        fn new(media: FakeMedia, service: FakeService) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                work_dir: Some(dir.path().to_path_buf()),
                ..Config::default()
            };
            Self {
                media: Arc::new(media),
                service: Arc::new(service),
                dir,
                config,
            }
        }

        fn pipeline(&self) -> Pipeline {
            Pipeline::new(
                Arc::clone(&self.media) as Arc<dyn MediaTool>,
                Arc::clone(&self.service) as Arc<dyn RemoteService>,
                &self.config,
            )
        }

        async fn run(&self) -> Result<RunReport, PipelineError> {
            self.pipeline()
                .run(Path::new("/videos/lecture.mp4"), std::future::pending())
                .await
        }

        fn leftover_files(&self) -> usize {
            std::fs::read_dir(self.dir.path()).unwrap().count()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_windows_all_succeed() {
        let h = Harness::new(
            FakeMedia::new(3000.0),
            FakeService::new()
                .generation(Ok(candidate("alpha")))
                .generation(Ok(candidate("beta")))
                .generation(Ok(candidate("gamma")))
                .generation(Ok(candidate("# Refined"))),
        );
        let report = h.run().await.unwrap();

        let cuts: Vec<_> = h.media.splits().iter().map(|s| (s.0, s.1)).collect();
        assert_eq!(cuts, vec![(0.0, 1200.0), (1140.0, 1200.0), (2280.0, 720.0)]);
        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.document, Document::Refined("# Refined".to_string()));
        assert!(report.refine_error.is_none());
        assert_eq!(report.resources_created, 3);
        assert!(report.resources_undeleted.is_empty());
        assert!(h.service.live().is_empty());
        assert_eq!(h.leftover_files(), 0);

        let calls = h.service.generate_calls();
        assert_eq!(calls.len(), 4);
        let crate::remote::Content::Text(refine_prompt) = &calls[3].1[0] else {
            panic!("refinement is text only");
        };
        assert!(refine_prompt.contains(
            "Segment 1 (00:00:00 - 00:20:00):\nalpha\n\n\
             Segment 2 (00:19:00 - 00:39:00):\nbeta\n\n\
             Segment 3 (00:38:00 - 00:50:00):\ngamma"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn short_source_uploaded_whole() {
        let mut h = Harness::new(FakeMedia::new(600.0), FakeService::new());
        h.config.refine = false;
        let report = h.run().await.unwrap();

        assert!(h.media.splits().is_empty());
        assert_eq!(h.service.uploads(), vec![PathBuf::from("/videos/lecture.mp4")]);
        assert_eq!(report.segments.len(), 1);
        assert_eq!(
            report.document,
            Document::Merged(
                "Segment 1 (00:00:00 - 00:10:00):\nsummary of https://fake.invalid/files/fake-1"
                    .to_string()
            )
        );
        assert!(h.service.live().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_extracted_means_nothing_produced() {
        let h = Harness::new(
            FakeMedia::new(3000.0).failing_splits([1, 2, 3]),
            FakeService::new(),
        );
        let report = h.run().await.unwrap();

        assert_eq!(report.document, Document::NothingProduced);
        assert_eq!(report.document.text(), None);
        assert_eq!(report.succeeded(), 0);
        assert!(report
            .segments
            .iter()
            .all(|s| matches!(s.outcome, Err(SegmentError::Extraction(_)))));
        assert_eq!(
            report.segments.iter().map(|s| s.window.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(report.resources_created, 0);
        assert!(h.service.uploads().is_empty());
        assert!(h.service.deleted().is_empty());
        assert!(h.service.generate_calls().is_empty());
        assert_eq!(h.leftover_files(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refinement_keeps_merged_segments() {
        let h = Harness::new(
            FakeMedia::new(3000.0),
            FakeService::new()
                .generation(Ok(candidate("alpha")))
                .generation(Err("quota exhausted"))
                .generation(Ok(json_without_text()))
                .generation(Ok(candidate("gamma")))
                .generation(Err("refinement unavailable")),
        );
        let report = h.run().await.unwrap();

        assert_eq!(report.succeeded(), 2);
        assert!(matches!(
            report.segments[1].outcome,
            Err(SegmentError::Generation(GenerationError::Exhausted { attempts: 2, .. }))
        ));
        let merged = "Segment 1 (00:00:00 - 00:20:00):\nalpha\n\n\
                      Segment 3 (00:38:00 - 00:50:00):\ngamma";
        assert_eq!(report.document, Document::Merged(merged.to_string()));
        assert_eq!(merge(&report.segments).as_deref(), Some(merged));
        assert!(report.refine_error.is_some());
        assert_eq!(report.resources_created, 3);
        assert_eq!(h.service.deleted().len(), 3);
        assert!(h.service.live().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resource_is_deleted_once() {
        let h = Harness::new(
            FakeMedia::new(3000.0),
            FakeService::new()
                .upload_ok(vec![Poll::State(ResourceState::Failed)])
                .upload_fails(),
        );
        let report = h.run().await.unwrap();

        assert!(matches!(
            report.segments[0].outcome,
            Err(SegmentError::ResourceFailed(_))
        ));
        assert!(matches!(report.segments[1].outcome, Err(SegmentError::Upload(_))));
        assert!(report.segments[2].summary_text().is_some());
        assert_eq!(report.resources_created, 2);
        // the failed one went at once; the sweep only deleted the other
        assert_eq!(
            h.service.deleted(),
            vec!["files/fake-1".to_string(), "files/fake-3".to_string()]
        );
        assert_eq!(h.leftover_files(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn undeletable_resources_are_reported() {
        let h = Harness::new(FakeMedia::new(600.0), FakeService::new().deletes_fail());
        let report = h.run().await.unwrap();
        assert_eq!(report.resources_undeleted, vec!["files/fake-1".to_string()]);
        assert!(report.document.text().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_still_sweeps() {
        let h = Harness::new(
            FakeMedia::new(3000.0),
            FakeService::new().upload_ok(vec![Poll::State(ResourceState::Uploading)]),
        );
        let e = h
            .pipeline()
            .run(
                Path::new("/videos/lecture.mp4"),
                tokio::time::sleep(Duration::from_secs(30)),
            )
            .await
            .unwrap_err();

        assert!(matches!(e, PipelineError::Cancelled { cleaned: 1 }));
        assert_eq!(h.service.uploads().len(), 1);
        assert!(h.service.live().is_empty());
        assert_eq!(h.leftover_files(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_aborts_before_any_upload() {
        let h = Harness::new(FakeMedia::unprobeable(), FakeService::new());
        let e = h.run().await.unwrap_err();
        assert!(matches!(e, PipelineError::Probe(_)));
        assert!(h.service.uploads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn paces_between_windows_only() {
        let h = Harness::new(FakeMedia::new(3000.0), FakeService::new());
        let started = Instant::now();
        h.run().await.unwrap();
        // three 5s readiness polls, two 4s pauses
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(23), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(27), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn no_pause_after_failed_extraction() {
        let h = Harness::new(FakeMedia::new(3000.0).failing_splits([2]), FakeService::new());
        let started = Instant::now();
        let report = h.run().await.unwrap();
        assert_eq!(report.succeeded(), 2);
        // two 5s readiness polls, one 4s pause after the first window only
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(14), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(18), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn all_extractions_failing_never_pauses() {
        let h = Harness::new(
            FakeMedia::new(3000.0).failing_splits([1, 2, 3]),
            FakeService::new(),
        );
        let started = Instant::now();
        h.run().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    fn json_without_text() -> serde_json::Value {
        serde_json::json!({ "candidates": [{ "finishReason": "RECITATION" }] })
    }
}

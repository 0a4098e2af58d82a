//! Scripted stand-ins for the remote service and the media tool.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::media::MediaTool;
use crate::remote::{Content, RemoteService, ResourceState, UploadedFile};

#[derive(Debug, Clone)]
pub(crate) enum Poll {
    State(ResourceState),
    Error(&'static str),
    /// The request is accepted and never answered.
    Hang,
}

/// A generation reply in the structured candidate/part shape.
pub(crate) fn candidate(text: &str) -> serde_json::Value {
    json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
}

#[derive(Default)]
struct ServiceState {
    // one entry per upload, in order; `None` makes that upload fail
    upload_script: VecDeque<Option<Vec<Poll>>>,
    polls: HashMap<String, VecDeque<Poll>>,
    generations: VecDeque<Result<serde_json::Value, String>>,
    deletes_fail: bool,
    deletes_hang: bool,

    uploads: Vec<PathBuf>,
    poll_count: usize,
    deleted: Vec<String>,
    live: Vec<String>,
    generate_calls: Vec<(String, Vec<Content>)>,
}

/// Unscripted uploads go ACTIVE on the first poll; unscripted generations echo
/// what they were asked about.
#[derive(Default)]
pub(crate) struct FakeService {
    state: Mutex<ServiceState>,
}

impl FakeService {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn upload_ok(self, polls: Vec<Poll>) -> Self {
        self.state.lock().unwrap().upload_script.push_back(Some(polls));
        self
    }

    pub(crate) fn upload_fails(self) -> Self {
        self.state.lock().unwrap().upload_script.push_back(None);
        self
    }

    pub(crate) fn generation(self, reply: Result<serde_json::Value, &str>) -> Self {
        self.state
            .lock()
            .unwrap()
            .generations
            .push_back(reply.map_err(str::to_string));
        self
    }

    pub(crate) fn deletes_fail(self) -> Self {
        self.state.lock().unwrap().deletes_fail = true;
        self
    }

    pub(crate) fn deletes_hang(self) -> Self {
        self.state.lock().unwrap().deletes_hang = true;
        self
    }

    pub(crate) fn uploads(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub(crate) fn polls(&self) -> usize {
        self.state.lock().unwrap().poll_count
    }

    /// Every delete attempt, successful or not.
    pub(crate) fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    /// Uploaded and not successfully deleted.
    pub(crate) fn live(&self) -> Vec<String> {
        self.state.lock().unwrap().live.clone()
    }

    pub(crate) fn generate_calls(&self) -> Vec<(String, Vec<Content>)> {
        self.state.lock().unwrap().generate_calls.clone()
    }
}

#[async_trait]
impl RemoteService for FakeService {
    async fn upload(&self, path: &Path, mime_type: &str) -> anyhow::Result<UploadedFile> {
        let mut s = self.state.lock().unwrap();
        s.uploads.push(path.to_path_buf());
        let polls = match s.upload_script.pop_front() {
            Some(Some(polls)) => polls,
            Some(None) => anyhow::bail!("upload rejected"),
            None => vec![Poll::State(ResourceState::Active)],
        };
        let name = format!("files/fake-{}", s.uploads.len());
        s.polls.insert(name.clone(), polls.into());
        s.live.push(name.clone());
        Ok(UploadedFile {
            uri: format!("https://fake.invalid/{name}"),
            name,
            mime_type: mime_type.to_string(),
        })
    }

    async fn get_state(&self, name: &str) -> anyhow::Result<ResourceState> {
        let poll = {
            let mut s = self.state.lock().unwrap();
            s.poll_count += 1;
            let script = s
                .polls
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("no such file {name}"))?;
            // the last scripted poll repeats forever
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match poll {
            Some(Poll::State(state)) => Ok(state),
            Some(Poll::Error(e)) => Err(anyhow::anyhow!(e)),
            Some(Poll::Hang) => std::future::pending().await,
            None => Ok(ResourceState::Active),
        }
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let hang = {
            let mut s = self.state.lock().unwrap();
            s.deleted.push(name.to_string());
            anyhow::ensure!(!s.deletes_fail, "delete of {name} refused");
            if !s.deletes_hang {
                s.live.retain(|n| n != name);
            }
            s.deletes_hang
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn generate(
        &self,
        model: &str,
        contents: &[Content],
    ) -> anyhow::Result<serde_json::Value> {
        let mut s = self.state.lock().unwrap();
        s.generate_calls.push((model.to_string(), contents.to_vec()));
        match s.generations.pop_front() {
            Some(Ok(v)) => Ok(v),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => {
                let about = contents
                    .iter()
                    .find_map(|c| match c {
                        Content::File { uri, .. } => Some(uri.as_str()),
                        Content::Text(_) => None,
                    })
                    .unwrap_or("text");
                Ok(candidate(&format!("summary of {about}")))
            }
        }
    }
}

#[derive(Default)]
struct MediaState {
    splits: Vec<(f64, f64, PathBuf)>,
}

/// Splits write a small placeholder file; the listed 1-based split calls fail
/// after leaving a partial file behind.
pub(crate) struct FakeMedia {
    duration: Option<f64>,
    failing_splits: HashSet<usize>,
    state: Mutex<MediaState>,
}

impl FakeMedia {
    pub(crate) fn new(duration: f64) -> Self {
        Self {
            duration: Some(duration),
            failing_splits: HashSet::new(),
            state: Mutex::default(),
        }
    }

    pub(crate) fn unprobeable() -> Self {
        Self {
            duration: None,
            ..Self::new(0.0)
        }
    }

    pub(crate) fn failing_splits(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.failing_splits.extend(calls);
        self
    }

    pub(crate) fn splits(&self) -> Vec<(f64, f64, PathBuf)> {
        self.state.lock().unwrap().splits.clone()
    }
}

#[async_trait]
impl MediaTool for FakeMedia {
    async fn probe(&self, path: &Path) -> anyhow::Result<f64> {
        self.duration
            .ok_or_else(|| anyhow::anyhow!("no duration in {}", path.display()))
    }

    async fn split(
        &self,
        _source: &Path,
        start: f64,
        duration: f64,
        output: &Path,
    ) -> anyhow::Result<()> {
        let call = {
            let mut s = self.state.lock().unwrap();
            s.splits.push((start, duration, output.to_path_buf()));
            s.splits.len()
        };
        std::fs::write(output, b"partial")?;
        anyhow::ensure!(
            !self.failing_splits.contains(&call),
            "Invalid data found when processing input"
        );
        std::fs::write(output, b"segment")?;
        Ok(())
    }
}

//! Local media handling: probing durations and cutting windows out of a source.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

use crate::error::{ExtractionError, ProbeError};
use crate::planner::Window;

/// The local tools that know how to read and cut media.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Total duration in seconds.
    async fn probe(&self, path: &Path) -> anyhow::Result<f64>;

    /// Stream-copies `[start, start + duration)` of `source` into `output`.
    async fn split(
        &self,
        source: &Path,
        start: f64,
        duration: f64,
        output: &Path,
    ) -> anyhow::Result<()>;
}

/// A probed source file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMedia {
    pub path: PathBuf,
    /// Seconds.
    pub duration: f64,
}

impl SourceMedia {
    pub async fn probe(tool: &dyn MediaTool, path: &Path) -> Result<Self, ProbeError> {
        let duration = tool
            .probe(path)
            .await
            .and_then(|d| {
                anyhow::ensure!(d.is_finite() && d > 0.0, "unusable duration {d}");
                Ok(d)
            })
            .map_err(|source| ProbeError {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            duration,
        })
    }
}

/// `ffmpeg`/`ffprobe` from `PATH`, with container probing through symphonia first.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl Ffmpeg {
    async fn ffprobe_duration(&self, path: &Path) -> anyhow::Result<f64> {
        let output = tokio::process::Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("ffprobe '{}'", path.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_ffprobe_duration(&output.stdout)
    }
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn probe(&self, path: &Path) -> anyhow::Result<f64> {
        anyhow::ensure!(
            tokio::fs::try_exists(path).await.unwrap_or(false),
            "'{}' does not exist",
            path.display()
        );
        let p = path.to_path_buf();
        let from_container = tokio::task::spawn_blocking(move || container_duration(&p))
            .await
            .context("join container probe")?;
        match from_container {
            Ok(Some(d)) if d > 0.0 => return Ok(d),
            Ok(_) => debug!("container has no frame count, asking ffprobe"),
            Err(e) => debug!("container probe failed, asking ffprobe: {e:#}"),
        }
        self.ffprobe_duration(path).await
    }

    async fn split(
        &self,
        source: &Path,
        start: f64,
        duration: f64,
        output: &Path,
    ) -> anyhow::Result<()> {
        let out = tokio::process::Command::new(&self.ffmpeg)
            .args(split_args(source, start, duration, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("spawn ffmpeg")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!("ffmpeg exited with {}: {}", out.status, stderr.trim());
        }
        Ok(())
    }
}

/// Seek on the input, bound the output, copy every stream as-is.
fn split_args(source: &Path, start: f64, duration: f64, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-loglevel", "error", "-ss"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(format!("{start:.3}").into());
    args.push("-i".into());
    args.push(source.into());
    args.push("-t".into());
    args.push(format!("{duration:.3}").into());
    args.extend(["-c", "copy", "-y"].map(OsString::from));
    args.push(output.into());
    args
}

fn container_duration(path: &Path) -> anyhow::Result<Option<f64>> {
    let src = std::fs::File::open(path).context("failed to open media")?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .context("unsupported format")?;
    let Some((time_base, n_frames)) = probed
        .format
        .tracks()
        .iter()
        .find_map(|t| Some((t.codec_params.time_base?, t.codec_params.n_frames?)))
    else {
        return Ok(None);
    };
    let length = time_base.calc_time(n_frames);
    Ok(Some(length.seconds as f64 + length.frac))
}

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    codec_type: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Prefers the video stream's duration, then audio, then the container's.
fn parse_ffprobe_duration(json: &[u8]) -> anyhow::Result<f64> {
    let probe: FfprobeOutput = serde_json::from_slice(json).context("parse ffprobe json")?;
    let stream = |kind: &str| {
        probe
            .streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some(kind))
            .find_map(|s| s.duration.as_deref())
    };
    let duration = stream("video")
        .or_else(|| stream("audio"))
        .or_else(|| probe.format.as_ref()?.duration.as_deref())
        .context("no stream or container duration")?;
    let duration: f64 = duration
        .trim()
        .parse()
        .with_context(|| format!("bad duration float from ffprobe: {duration}"))?;
    anyhow::ensure!(
        duration.is_finite() && duration > 0.0,
        "unusable duration {duration}"
    );
    Ok(duration)
}

/// A window's file on local disk, removed when dropped.
///
/// When a single window spans the whole source the source itself is used and
/// is left alone.
#[derive(Debug)]
pub struct SegmentFile {
    path: PathBuf,
    owned: bool,
}

impl SegmentFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed segment file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "could not remove segment file: {e}"),
        }
    }
}

/// Materializes windows as standalone files in a work directory.
#[derive(Clone)]
pub struct Extractor {
    tool: Arc<dyn MediaTool>,
    work_dir: PathBuf,
}

impl Extractor {
    pub fn new(tool: Arc<dyn MediaTool>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            work_dir: work_dir.into(),
        }
    }

    /// `<source digest>-segment-<index>.<source ext>` inside the work directory.
    pub fn segment_path(&self, source: &SourceMedia, window: &Window) -> PathBuf {
        let digest = sha256::digest(source.path.to_string_lossy().into_owned());
        let ext = source
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        self.work_dir.join(format!(
            "{}-segment-{:03}.{ext}",
            &digest[..12],
            window.index
        ))
    }

    pub async fn extract(
        &self,
        source: &SourceMedia,
        window: &Window,
    ) -> Result<SegmentFile, ExtractionError> {
        if window.start <= 0.0 && window.end >= source.duration {
            debug!(index = window.index, "window spans the whole source");
            return Ok(SegmentFile {
                path: source.path.clone(),
                owned: false,
            });
        }

        // the guard exists before the tool runs, so partial output goes too
        let segment = SegmentFile {
            path: self.segment_path(source, window),
            owned: true,
        };
        info!(
            index = window.index,
            range = %window.time_range(),
            path = %segment.path.display(),
            "extracting segment"
        );
        self.tool
            .split(&source.path, window.start, window.duration, &segment.path)
            .await
            .map_err(|e| ExtractionError {
                index: window.index,
                message: format!("{e:#}"),
            })?;
        Ok(segment)
    }
}

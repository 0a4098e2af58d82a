//! Run configuration, read from `config.toml`.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gemini::DEFAULT_BASE_URL;
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Every key is optional; missing keys take the defaults below.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_key_file: Option<PathBuf>,
    pub base_url: String,
    pub model: String,
    /// Longest window submitted in one piece. `0` disables splitting.
    pub max_window_secs: f64,
    pub overlap_secs: f64,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    /// Overrides the per-model delay between windows.
    pub pacing_secs: Option<u64>,
    pub generate_attempts: u32,
    pub generate_backoff_secs: u64,
    pub refine: bool,
    /// Where segment files are written; the system temp dir if unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_file: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            // 20 minutes of video stays under the service's per-request ceiling
            max_window_secs: 1200.0,
            overlap_secs: 60.0,
            request_timeout_secs: 1200,
            poll_interval_secs: 5,
            max_wait_secs: 1800,
            pacing_secs: None,
            generate_attempts: 2,
            generate_backoff_secs: 10,
            refine: true,
            work_dir: None,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("parse config")
    }

    /// Reads `path`. A missing file is only an error if it was asked for by name.
    pub async fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Self::from_toml(&s).with_context(|| format!("in '{}'", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("read config '{}'", path.display())),
        }
    }

    /// Key file, then inline key, then `$GEMINI_API_KEY`.
    pub async fn api_key(&self) -> anyhow::Result<String> {
        let key = if let Some(file) = &self.api_key_file {
            tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("read api key file '{}'", file.display()))?
        } else if let Some(key) = &self.api_key {
            key.clone()
        } else {
            std::env::var(API_KEY_ENV)
                .with_context(|| format!("no api key configured and ${API_KEY_ENV} unset"))?
        };
        let key = key.trim();
        anyhow::ensure!(!key.is_empty(), "api key is empty");
        Ok(key.to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn generate_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.generate_attempts,
            Duration::from_secs(self.generate_backoff_secs),
        )
    }

    /// Delay between windows to stay under the model's request-rate ceiling:
    /// about 15 RPM for flash models, 5 RPM for the rest.
    pub fn pacing(&self) -> Duration {
        match self.pacing_secs {
            Some(secs) => Duration::from_secs(secs),
            None if self.model.to_lowercase().contains("flash") => Duration::from_secs(4),
            None => Duration::from_secs(12),
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

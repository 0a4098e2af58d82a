use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use segsum::config::Config;
use segsum::error::{chain, PipelineError};
use segsum::gemini::GeminiClient;
use segsum::media::Ffmpeg;
use segsum::pipeline::{Document, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "segsum", version, about = "Summarize long recordings segment by segment")]
struct Cli {
    /// Video or audio file to summarize
    path: PathBuf,

    /// Configuration file [default: config.toml if present]
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// File holding the API key
    #[arg(long, value_name = "PATH")]
    api_key_file: Option<PathBuf>,

    /// Model used for every request
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,

    /// Longest window in seconds (0 disables splitting)
    #[arg(long, value_name = "SECS")]
    max_window: Option<f64>,

    /// Seconds shared by consecutive windows
    #[arg(long, value_name = "SECS")]
    overlap: Option<f64>,

    /// Timeout for each generation request, in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    #[arg(long, value_name = "SECS")]
    poll_interval: Option<u64>,

    /// Give up on an upload that is not ready after this many seconds
    #[arg(long, value_name = "SECS")]
    max_wait: Option<u64>,

    /// Keep the stitched segment texts as they are
    #[arg(long)]
    no_refine: bool,

    /// Where to write the summary [default: <name>_summary.md]
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(file) = &self.api_key_file {
            config.api_key_file = Some(file.clone());
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(secs) = self.max_window {
            config.max_window_secs = secs;
        }
        if let Some(secs) = self.overlap {
            config.overlap_secs = secs;
        }
        if let Some(secs) = self.timeout {
            config.request_timeout_secs = secs;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(secs) = self.max_wait {
            config.max_wait_secs = secs;
        }
        if self.no_refine {
            config.refine = false;
        }
    }
}

fn default_output(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    PathBuf::from(format!("{stem}_summary.md"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path, true).await?,
        None => Config::load(Path::new("config.toml"), false).await?,
    };
    cli.apply(&mut config);
    let api_key = config.api_key().await.context("resolve api key")?;

    let service = GeminiClient::new(api_key, config.request_timeout())
        .with_base_url(config.base_url.clone());
    let pipeline = Pipeline::new(Arc::new(Ffmpeg::default()), Arc::new(service), &config);

    println!("==> summarizing {} with {}", cli.path.display(), config.model);
    let cancel = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let report = match pipeline.run(&cli.path, cancel).await {
        Ok(report) => report,
        Err(PipelineError::Cancelled { cleaned }) => {
            println!(" -> interrupted; removed {cleaned} remote files");
            anyhow::bail!("interrupted");
        }
        Err(e) => return Err(e).context("summarization failed"),
    };

    println!(
        " -> {} of {} segments summarized",
        report.succeeded(),
        report.segments.len()
    );
    for segment in &report.segments {
        if let Err(e) = &segment.outcome {
            println!(
                " .. segment {} ({}) skipped: {}",
                segment.window.index,
                segment.window.time_range(),
                chain(e)
            );
        }
    }
    if let Some(e) = &report.refine_error {
        println!(" .. refinement failed, keeping stitched text: {}", chain(e));
    }
    for name in &report.resources_undeleted {
        println!(" .. remote file {name} could not be deleted");
    }

    let text = match &report.document {
        Document::Refined(text) | Document::Merged(text) => text,
        Document::NothingProduced => {
            anyhow::bail!("no segment of {} could be summarized", cli.path.display())
        }
    };
    let output = cli.output.unwrap_or_else(|| default_output(&cli.path));
    tokio::fs::write(&output, text)
        .await
        .with_context(|| format!("write summary to '{}'", output.display()))?;
    println!("==> wrote {}", output.display());

    Ok(())
}

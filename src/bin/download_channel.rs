#![forbid(unsafe_code)]

//! Command-line entry point: downloads every video of one YouTube channel into
//! `<output-root>/<handle>/`, next to a description file per video and a
//! `video_info.json` index.

use anyhow::{Context, Result, bail};
use channel_archiver::config::{RuntimeOverrides, resolve_runtime_settings};
use channel_archiver::downloader::{TracingObserver, YtDlp};
use channel_archiver::pipeline::{ChannelArchiver, RunOutcome};
use channel_archiver::youtube::YouTubeClient;
use chrono::Local;
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

const PROMPT: &str =
    "Enter the YouTube channel URL (e.g., https://www.youtube.com/@TheStandardPodcast): ";

/// Download every video of a YouTube channel with yt-dlp.
#[derive(Debug, Parser)]
#[command(name = "download_channel", version)]
struct DownloaderArgs {
    /// Channel URL in the `@handle` form. Prompted for when omitted
    channel_url: Option<String>,

    /// Directory receiving one sub-directory per channel [default: downloads]
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// YouTube Data API key, overriding YOUTUBE_API_KEY
    #[arg(long)]
    api_key: Option<String>,

    /// Base URL of the YouTube Data API
    #[arg(long, hide = true)]
    api_base_url: Option<String>,

    /// Dotenv file read for settings [default: .env]
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log debug output, including everything yt-dlp prints
    #[arg(short, long)]
    verbose: bool,
}

/// `2024-05-01 13:37:00.123`, local time.
struct LocalTimestamp;

impl FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_timer(LocalTimestamp)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = DownloaderArgs::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: DownloaderArgs) -> Result<ExitCode> {
    let settings = resolve_runtime_settings(RuntimeOverrides {
        api_key: args.api_key,
        output_root: args.output_root,
        api_base_url: args.api_base_url,
        env_path: args.env_file,
    })?;

    let channel_url = match args.channel_url {
        Some(url) => normalize_channel_url(&url)?,
        None => prompt_channel_url(&mut io::stdin().lock(), &mut io::stdout())?,
    };

    let downloader = YtDlp::new()?;
    let client = YouTubeClient::new(settings.api_key, settings.api_base_url);

    info!("Channel: {channel_url}");
    info!("Output root: {}", settings.output_root.display());

    let archiver = ChannelArchiver::new(&client, &downloader, &settings.output_root);
    let mut observer = TracingObserver::new();

    match archiver.run(&channel_url, &mut observer)? {
        RunOutcome::Completed(summary) => {
            if !summary.failed.is_empty() {
                warn!("Failed videos: {}", summary.failed.join(", "));
            }
            info!("Output directory: {}", summary.output_dir.display());
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::ChannelNotFound | RunOutcome::ChannelLookupFailed(_) => Ok(ExitCode::FAILURE),
    }
}

fn prompt_channel_url(input: &mut impl BufRead, output: &mut impl Write) -> Result<String> {
    write!(output, "{PROMPT}").context("writing prompt")?;
    output.flush().context("writing prompt")?;

    let mut line = String::new();
    input.read_line(&mut line).context("reading channel URL")?;
    normalize_channel_url(&line)
}

fn normalize_channel_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    if url.is_empty() {
        bail!("no channel URL given");
    }
    if !url.contains('@') {
        warn!("{url} has no @handle; searching for the whole input");
    }
    Ok(url.to_string())
}

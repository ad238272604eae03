#![forbid(unsafe_code)]

//! The archive run: resolve the channel, list its videos, download them one
//! after the other and finish with the `video_info.json` index.

use crate::downloader::{DownloadObserver, DownloadOutcome, MEDIA_EXTENSION, MediaDownloader};
use crate::sanitize::sanitize_filename;
use crate::youtube::{
    ApiError, ChannelLookup, MetadataApi, channel_handle, list_channel_videos, resolve_channel,
};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const INDEX_FILE: &str = "video_info.json";
const DESCRIPTION_SUFFIX: &str = "_description.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub listed: usize,
    pub downloaded: usize,
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The metadata service answered but knows no such channel.
    ChannelNotFound,
    /// The metadata service could not be queried.
    ChannelLookupFailed(ApiError),
    Completed(RunSummary),
}

/// Filename → description mapping written as `video_info.json`. Keys keep
/// insertion order; re-inserting a key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoIndex {
    entries: Map<String, Value>,
}

impl VideoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file_name: String, description: String) {
        self.entries.insert(file_name, Value::String(description));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces whatever is at `path`; the previous index is never merged.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut payload = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut payload, formatter);
        self.entries
            .serialize(&mut serializer)
            .context("serializing video index")?;
        fs::write(path, payload).with_context(|| format!("writing {}", path.display()))
    }
}

pub fn channel_folder_name(channel_url: &str) -> String {
    sanitize_filename(channel_handle(channel_url))
}

pub fn media_file_name(title: &str) -> String {
    sanitize_filename(&format!("{title}.{MEDIA_EXTENSION}"))
}

pub fn description_file_name(title: &str) -> String {
    sanitize_filename(&format!("{title}{DESCRIPTION_SUFFIX}"))
}

/// Everything one archive run needs. Collaborators are borrowed so the
/// caller decides which API client and downloader are used.
pub struct ChannelArchiver<'a> {
    api: &'a dyn MetadataApi,
    downloader: &'a dyn MediaDownloader,
    output_root: PathBuf,
}

impl<'a> ChannelArchiver<'a> {
    pub fn new(
        api: &'a dyn MetadataApi,
        downloader: &'a dyn MediaDownloader,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            downloader,
            output_root: output_root.into(),
        }
    }

    /// Runs the whole pipeline for one channel URL. Only filesystem errors
    /// are returned as `Err`; a channel that cannot be resolved ends the run
    /// before anything is written.
    pub fn run(&self, channel_url: &str, observer: &mut dyn DownloadObserver) -> Result<RunOutcome> {
        let channel_id = match resolve_channel(self.api, channel_url) {
            Ok(ChannelLookup::Found(channel_id)) => channel_id,
            Ok(ChannelLookup::NotFound) => {
                error!("Could not retrieve channel ID. Exiting.");
                return Ok(RunOutcome::ChannelNotFound);
            }
            Err(err) => {
                error!("Could not retrieve channel ID. Exiting.");
                return Ok(RunOutcome::ChannelLookupFailed(err));
            }
        };
        info!("Resolved channel {channel_url} to {channel_id}");

        let videos = list_channel_videos(self.api, &channel_id);
        let total = videos.len();
        info!("Found {total} videos in the channel.");

        let output_dir = self.output_root.join(channel_folder_name(channel_url));
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;

        let mut index = VideoIndex::new();
        let mut failed = Vec::new();

        for (position, video) in videos.iter().enumerate().map(|(i, v)| (i + 1, v)) {
            info!("Downloading video {position}/{total}: {}", video.title);

            match self
                .downloader
                .download(&video.watch_url(), &output_dir, observer)
            {
                DownloadOutcome::Completed { title } => {
                    info!("Successfully downloaded: {title}");

                    let description_name = description_file_name(&title);
                    let description_path = output_dir.join(&description_name);
                    fs::write(&description_path, &video.description)
                        .with_context(|| format!("writing {}", description_path.display()))?;
                    info!("Saved video description to: {description_name}");

                    index.insert(media_file_name(&title), video.description.clone());
                }
                DownloadOutcome::Failed => {
                    error!("Failed to download video: {}", video.id);
                    failed.push(video.id.clone());
                }
            }
        }

        if index.is_empty() {
            warn!("No video was downloaded; {INDEX_FILE} will be empty");
        }
        let index_path = output_dir.join(INDEX_FILE);
        index.write_to(&index_path)?;
        info!(
            "Saved video information for {} videos to: {INDEX_FILE}",
            index.len()
        );

        let downloaded = total - failed.len();
        info!("Channel download completed: {downloaded}/{total} videos downloaded.");

        Ok(RunOutcome::Completed(RunSummary {
            output_dir,
            listed: total,
            downloaded,
            failed,
        }))
    }
}

#![forbid(unsafe_code)]

//! YouTube Data API v3 access: channel lookup by handle and paginated listing
//! of a channel's uploads through the `search.list` endpoint.
//!
//! Everything above the HTTP layer talks to [`MetadataApi`] so the pipeline can
//! be driven by a fake in tests.

use crate::config::ApiKey;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

/// `search.list` never returns more than one channel for the resolver.
pub const CHANNEL_SEARCH_LIMIT: u32 = 1;
/// Largest page size the Data API accepts.
pub const VIDEO_PAGE_SIZE: u32 = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP Error {status} occurred: {message}")]
    Status { status: u16, message: String },
    #[error("could not reach the YouTube API: {0}")]
    Transport(String),
    #[error("unexpected YouTube API response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One upload as reported by the listing. Entries are kept exactly as seen,
/// duplicates included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEntry {
    pub id: String,
    pub title: String,
    pub description: String,
}

impl VideoEntry {
    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoPage {
    pub videos: Vec<VideoEntry>,
    pub next_page_token: Option<String>,
}

/// The two query shapes the archiver needs from the metadata service.
pub trait MetadataApi {
    /// Free-text channel search, most relevant first.
    fn search_channels(&self, query: &str, max_results: u32) -> Result<Vec<ChannelId>, ApiError>;

    /// One page of the channel's videos. `page_token` is the cursor returned
    /// by the previous page, `None` for the first one.
    fn search_videos(
        &self,
        channel_id: &ChannelId,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<VideoPage, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLookup {
    Found(ChannelId),
    NotFound,
}

/// Returns everything after the last `@` of a channel URL, or the whole input
/// when there is none.
pub fn channel_handle(reference: &str) -> &str {
    reference.rsplit('@').next().unwrap_or(reference)
}

/// Maps a channel URL to its channel id. "No such channel" is a regular
/// [`ChannelLookup::NotFound`]; only service failures surface as errors.
pub fn resolve_channel(api: &dyn MetadataApi, reference: &str) -> Result<ChannelLookup, ApiError> {
    let handle = channel_handle(reference);
    debug!("Searching channel for handle {handle:?}");

    let channels = api
        .search_channels(handle, CHANNEL_SEARCH_LIMIT)
        .inspect_err(|err| error!("{err}"))?;

    match channels.into_iter().next() {
        Some(channel_id) => Ok(ChannelLookup::Found(channel_id)),
        None => {
            error!("No channel found for URL: {reference}");
            Ok(ChannelLookup::NotFound)
        }
    }
}

/// Walks every result page until the API stops returning a cursor. A failing
/// page ends the walk; whatever was collected so far is returned.
pub fn list_channel_videos(api: &dyn MetadataApi, channel_id: &ChannelId) -> Vec<VideoEntry> {
    let mut videos = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let page = match api.search_videos(channel_id, VIDEO_PAGE_SIZE, page_token.as_deref()) {
            Ok(page) => page,
            Err(err) => {
                error!("An error occurred: {err}");
                break;
            }
        };

        debug!("Fetched page with {} videos", page.videos.len());
        videos.extend(page.videos);

        match page.next_page_token.filter(|token| !token.is_empty()) {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    videos
}

/// Blocking Data API client. Built once per run and shared by reference.
pub struct YouTubeClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: ApiKey,
}

impl YouTubeClient {
    pub fn new(api_key: ApiKey, base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent(concat!("channel-archiver/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn search(&self, params: &[(&str, &str)]) -> Result<SearchListResponse, ApiError> {
        let url = format!("{}/search", self.base_url);
        let mut request = self.agent.get(&url);
        for (name, value) in params {
            request = request.query(name, value);
        }
        request = request.query("key", self.api_key.expose());

        match request.call() {
            Ok(response) => response
                .into_json::<SearchListResponse>()
                .map_err(|err| ApiError::Decode(err.to_string())),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(status_error(status, &body))
            }
            // The request URL carries the key, so only kind and message are kept.
            Err(ureq::Error::Transport(transport)) => Err(ApiError::Transport(
                match transport.message() {
                    Some(message) => format!("{}: {message}", transport.kind()),
                    None => transport.kind().to_string(),
                },
            )),
        }
    }
}

impl fmt::Debug for YouTubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTubeClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl MetadataApi for YouTubeClient {
    fn search_channels(&self, query: &str, max_results: u32) -> Result<Vec<ChannelId>, ApiError> {
        let max_results = max_results.to_string();
        let response = self.search(&[
            ("part", "snippet"),
            ("q", query),
            ("type", "channel"),
            ("maxResults", &max_results),
        ])?;
        Ok(channels_from_response(response))
    }

    fn search_videos(
        &self,
        channel_id: &ChannelId,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<VideoPage, ApiError> {
        let max_results = max_results.to_string();
        let mut params = vec![
            ("channelId", channel_id.as_str()),
            ("type", "video"),
            ("part", "id,snippet"),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let response = self.search(&params)?;
        Ok(video_page_from_response(response))
    }
}

/// Subset of the `search.list` response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchListResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    id: ResourceId,
    #[serde(default)]
    snippet: Snippet,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
    channel_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    channel_id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

fn channels_from_response(response: SearchListResponse) -> Vec<ChannelId> {
    response
        .items
        .into_iter()
        .filter_map(|item| item.snippet.channel_id.or(item.id.channel_id))
        .map(ChannelId::new)
        .collect()
}

fn video_page_from_response(response: SearchListResponse) -> VideoPage {
    let videos = response
        .items
        .into_iter()
        .filter_map(|item| {
            let Some(id) = item.id.video_id else {
                warn!("Skipping search result without a video id: {:?}", item.snippet.title);
                return None;
            };
            Some(VideoEntry {
                id,
                title: item.snippet.title,
                description: item.snippet.description,
            })
        })
        .collect();

    VideoPage {
        videos,
        next_page_token: response.next_page_token,
    }
}

/// Pulls `error.message` out of a Data API error body when there is one.
fn error_message_from_body(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error.message)
}

fn status_error(status: u16, body: &str) -> ApiError {
    let message = error_message_from_body(body).unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            "no error details".to_string()
        } else {
            trimmed.to_string()
        }
    });
    ApiError::Status { status, message }
}

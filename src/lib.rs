#![forbid(unsafe_code)]

//! Library half of the channel archiver: the YouTube Data API client, the
//! yt-dlp adapter and the pipeline that ties them together. The
//! `download_channel` binary is a thin CLI over [`pipeline::ChannelArchiver::run`].

pub mod config;
pub mod downloader;
pub mod pipeline;
pub mod sanitize;
pub mod youtube;

#![forbid(unsafe_code)]

//! Seams between the tracker and the YouTube platform. The live implementation
//! is [`crate::youtube::YouTubeClient`]; tests use in-memory fakes.

use crate::error::ApiError;
use crate::models::{PlaylistEntry, RunWindow, UploadItem, VideoMetrics};
use std::collections::HashMap;

pub trait DiscoveryProvider {
    /// Uploads of `channel_id` released inside `window`. Items without a
    /// release timestamp are still scheduled and must not be returned.
    fn recent_uploads(&self, channel_id: &str, window: &RunWindow)
    -> Result<Vec<UploadItem>, ApiError>;
}

pub trait PlaylistMutator {
    fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> Result<(), ApiError>;

    fn remove_from_playlist(&self, playlist_id: &str, entry: &PlaylistEntry)
    -> Result<(), ApiError>;
}

pub trait PlaylistReader {
    /// Every item of the playlist, in playlist order.
    fn playlist_items(&self, playlist_id: &str) -> Result<Vec<PlaylistEntry>, ApiError>;
}

pub trait MetricsProvider {
    /// Current metrics for the given ids. Ids absent from the returned map were
    /// not found (deleted or private).
    fn video_metrics(&self, video_ids: &[String])
    -> Result<HashMap<String, VideoMetrics>, ApiError>;
}

pub trait ShortsClassifier {
    /// Probes whether a video is a Short. Network trouble answers `false`.
    fn is_short(&self, video_id: &str) -> bool;
}

/// Convenience bound for the full live surface.
pub trait YouTubeApi:
    DiscoveryProvider + PlaylistMutator + PlaylistReader + MetricsProvider + ShortsClassifier
{
}

impl<T> YouTubeApi for T where
    T: DiscoveryProvider + PlaylistMutator + PlaylistReader + MetricsProvider + ShortsClassifier
{
}

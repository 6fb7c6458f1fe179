#![forbid(unsafe_code)]

//! Blocking YouTube Data API v3 client over `ureq`.

use crate::config::NetworkSettings;
use crate::error::ApiError;
use crate::models::{LiveStatus, PlaylistEntry, RunWindow, UploadItem, VideoMetrics};
use crate::provider::{
    DiscoveryProvider, MetricsProvider, PlaylistMutator, PlaylistReader, ShortsClassifier,
};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use ureq::{Agent, AgentBuilder, Request};

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const SHORTS_BASE: &str = "https://www.youtube.com/shorts";
/// Hard limit of the API for `maxResults` and `videos.list` ids.
const MAX_PAGE_SIZE: usize = 50;

pub struct YouTubeClient {
    agent: Agent,
    probe: Agent,
    token: String,
    page_size: usize,
}

impl YouTubeClient {
    pub fn new(token: &str, network: &NetworkSettings, batch_size: usize) -> Self {
        let timeout = Duration::from_secs(network.timeout_seconds);
        Self {
            agent: AgentBuilder::new().timeout(timeout).build(),
            probe: AgentBuilder::new().timeout(timeout).redirects(0).build(),
            token: token.to_string(),
            page_size: batch_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    fn request(&self, method: &str, resource: &str) -> Request {
        self.agent
            .request(method, &format!("{API_BASE}/{resource}"))
            .set("Authorization", &format!("Bearer {}", self.token))
    }

    fn fetch<T: DeserializeOwned>(&self, request: Request) -> Result<T, ApiError> {
        let response = request.call().map_err(api_error)?;
        response
            .into_json()
            .map_err(|err| ApiError::new("invalidResponse", err.to_string()))
    }

    /// Walks every page of a playlist. `keep_going` sees each page and may
    /// stop the walk early.
    fn playlist_pages<F>(&self, playlist_id: &str, mut keep_going: F) -> Result<(), ApiError>
    where
        F: FnMut(Vec<PlaylistItemResource>) -> bool,
    {
        let page_size = self.page_size.to_string();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .request("GET", "playlistItems")
                .query("part", "snippet,contentDetails,status")
                .query("playlistId", playlist_id)
                .query("maxResults", &page_size);
            if let Some(token) = &page_token {
                request = request.query("pageToken", token);
            }
            let page: Page<PlaylistItemResource> = self.fetch(request)?;
            if !keep_going(page.items) {
                return Ok(());
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(()),
            }
        }
    }
}

/// Uploads playlist of a channel: `UC…` becomes `UU…`.
pub fn uploads_playlist_id(channel_id: &str) -> String {
    format!("UU{}", channel_id.get(2..).unwrap_or_default())
}

impl DiscoveryProvider for YouTubeClient {
    fn recent_uploads(
        &self,
        channel_id: &str,
        window: &RunWindow,
    ) -> Result<Vec<UploadItem>, ApiError> {
        let mut uploads = Vec::new();
        self.playlist_pages(&uploads_playlist_id(channel_id), |items| {
            let mut reached_older = false;
            for item in items {
                let Some(released_at) = item.content_details.video_published_at else {
                    // Scheduled premieres have no publication date yet.
                    continue;
                };
                if released_at <= window.since {
                    reached_older = true;
                }
                if window.contains(released_at) {
                    uploads.push(UploadItem {
                        video_id: item.content_details.video_id,
                        channel_id: channel_id.to_string(),
                        channel_name: item.snippet.video_owner_channel_title.unwrap_or_default(),
                        title: item.snippet.title,
                        released_at: Some(released_at),
                        privacy_status: item.status.map(|s| s.privacy_status).unwrap_or_default(),
                    });
                }
            }
            // Uploads are listed newest first.
            !reached_older
        })?;
        debug!("{channel_id}: {} upload(s) in window", uploads.len());
        Ok(uploads)
    }
}

impl PlaylistReader for YouTubeClient {
    fn playlist_items(&self, playlist_id: &str) -> Result<Vec<PlaylistEntry>, ApiError> {
        let mut entries = Vec::new();
        self.playlist_pages(playlist_id, |items| {
            entries.extend(items.into_iter().map(|item| PlaylistEntry {
                video_id: item.content_details.video_id,
                item_id: item.id,
                added_at: item.snippet.published_at,
            }));
            true
        })?;
        Ok(entries)
    }
}

impl PlaylistMutator for YouTubeClient {
    fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> Result<(), ApiError> {
        self.request("POST", "playlistItems")
            .query("part", "snippet")
            .send_json(json!({
                "snippet": {
                    "playlistId": playlist_id,
                    "resourceId": { "kind": "youtube#video", "videoId": video_id }
                }
            }))
            .map_err(api_error)?;
        Ok(())
    }

    fn remove_from_playlist(
        &self,
        _playlist_id: &str,
        entry: &PlaylistEntry,
    ) -> Result<(), ApiError> {
        self.request("DELETE", "playlistItems")
            .query("id", &entry.item_id)
            .call()
            .map_err(api_error)?;
        Ok(())
    }
}

impl MetricsProvider for YouTubeClient {
    fn video_metrics(
        &self,
        video_ids: &[String],
    ) -> Result<HashMap<String, VideoMetrics>, ApiError> {
        let mut metrics = HashMap::new();
        for chunk in video_ids.chunks(self.page_size) {
            let request = self
                .request("GET", "videos")
                .query("part", "snippet,contentDetails,statistics,status")
                .query("id", &chunk.join(","))
                .query("maxResults", &MAX_PAGE_SIZE.to_string());
            let page: Page<VideoResource> = self.fetch(request)?;
            metrics.extend(page.items.into_iter().map(|video| {
                let id = video.id.clone();
                (id, video.into_metrics())
            }));
        }
        Ok(metrics)
    }
}

impl ShortsClassifier for YouTubeClient {
    fn is_short(&self, video_id: &str) -> bool {
        match self.probe.head(&format!("{SHORTS_BASE}/{video_id}")).call() {
            Ok(response) => response.status() == 200,
            Err(ureq::Error::Status(..)) => false,
            Err(err) => {
                warn!("Failed to check shorts status for {video_id}: {err}");
                false
            }
        }
    }
}

// --- wire format -----------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemResource {
    id: String,
    snippet: PlaylistItemSnippet,
    content_details: PlaylistItemDetails,
    status: Option<PrivacyStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemSnippet {
    #[serde(default)]
    title: String,
    /// When the item was added to the playlist.
    published_at: Option<DateTime<Utc>>,
    video_owner_channel_title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemDetails {
    video_id: String,
    video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivacyStatus {
    #[serde(default)]
    privacy_status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    id: String,
    snippet: Option<VideoSnippet>,
    content_details: Option<VideoDetails>,
    statistics: Option<VideoStatistics>,
    status: Option<PrivacyStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    #[serde(default)]
    live_broadcast_content: String,
}

#[derive(Debug, Deserialize)]
struct VideoDetails {
    #[serde(default)]
    duration: String,
}

/// Counters come back as decimal strings and are omitted when hidden.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

impl VideoResource {
    fn into_metrics(self) -> VideoMetrics {
        let count =
            |value: Option<&String>| -> Option<u64> { value.and_then(|v| v.parse().ok()) };
        let stats = self.statistics.as_ref();
        VideoMetrics {
            views: count(stats.and_then(|s| s.view_count.as_ref())),
            likes: count(stats.and_then(|s| s.like_count.as_ref())),
            comments: count(stats.and_then(|s| s.comment_count.as_ref())),
            duration_secs: self
                .content_details
                .as_ref()
                .and_then(|d| parse_duration(&d.duration))
                .unwrap_or(0),
            live_status: self
                .snippet
                .as_ref()
                .map(|s| LiveStatus::from_api(&s.live_broadcast_content))
                .unwrap_or_default(),
            privacy_status: self.status.map(|s| s.privacy_status).unwrap_or_default(),
        }
    }
}

/// Parses the ISO 8601 durations the API returns (`PT1H2M3S`, `P1DT2H`,
/// `P0D`) into seconds.
pub fn parse_duration(value: &str) -> Option<u64> {
    let rest = value.strip_prefix('P')?;
    let mut seconds = 0u64;
    let mut number = String::new();
    let mut in_time = false;
    let mut saw_unit = false;
    for c in rest.chars() {
        match c {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' => number.push(c),
            unit => {
                let amount: u64 = number.parse().ok()?;
                number.clear();
                let scale = match (unit, in_time) {
                    ('W', false) => 7 * 86_400,
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return None,
                };
                seconds = seconds.checked_add(amount.checked_mul(scale)?)?;
                saw_unit = true;
            }
        }
    }
    (saw_unit && number.is_empty()).then_some(seconds)
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Builds an [`ApiError`] from an error response body. The reason is the
/// first entry of `error.errors`; bodies without one fall back to a reason
/// derived from the status code.
pub fn parse_error_body(status: u16, body: &str) -> ApiError {
    let body = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error)
        .unwrap_or_default();
    let reason = body
        .errors
        .into_iter()
        .map(|detail| detail.reason)
        .find(|reason| !reason.is_empty())
        .unwrap_or_else(|| match status {
            404 => "notFound".to_string(),
            500 => "internalError".to_string(),
            503 => "serviceUnavailable".to_string(),
            other => format!("http{other}"),
        });
    let message = if body.message.is_empty() {
        format!("HTTP {status}")
    } else {
        body.message
    };
    ApiError::new(reason, message).with_status(status)
}

fn api_error(err: ureq::Error) -> ApiError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            parse_error_body(status, &body)
        }
        ureq::Error::Transport(transport) => ApiError::new("transportError", transport.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{ErrorClass, classify};

    #[test]
    fn parses_iso_durations() {
        assert_eq!(parse_duration("PT0S"), Some(0));
        assert_eq!(parse_duration("P0D"), Some(0));
        assert_eq!(parse_duration("PT3M20S"), Some(200));
        assert_eq!(parse_duration("PT1H"), Some(3600));
        assert_eq!(parse_duration("PT1H2M3S"), Some(3723));
        assert_eq!(parse_duration("P1DT2H"), Some(93_600));
        assert_eq!(parse_duration("P1W"), Some(604_800));
    }

    #[test]
    fn rejects_malformed_durations() {
        for value in ["", "PT", "1H", "PT5", "PTM", "P1H", "PT1X"] {
            assert_eq!(parse_duration(value), None, "{value}");
        }
    }

    #[test]
    fn error_reason_comes_from_first_detail() {
        let body = r#"{"error": {"code": 403, "message": "The request cannot be completed because you have exceeded your quota.", "errors": [{"message": "quota", "domain": "youtube.quota", "reason": "quotaExceeded"}]}}"#;
        let err = parse_error_body(403, body);
        assert_eq!(err.reason, "quotaExceeded");
        assert_eq!(err.status, Some(403));
        assert!(err.message.starts_with("The request cannot"));
        assert_eq!(classify(&err.reason), ErrorClass::Quota);
    }

    #[test]
    fn error_without_details_falls_back_to_status() {
        let err = parse_error_body(404, "not json");
        assert_eq!(err.reason, "notFound");
        assert!(err.is_not_found());
        assert_eq!(err.message, "HTTP 404");

        let err = parse_error_body(503, r#"{"error": {"message": "down", "errors": []}}"#);
        assert_eq!(classify(&err.reason), ErrorClass::Transient);
        assert_eq!(err.message, "down");

        let err = parse_error_body(429, "");
        assert_eq!(classify(&err.reason), ErrorClass::Unknown);
    }

    #[test]
    fn uploads_playlist_swaps_prefix() {
        assert_eq!(uploads_playlist_id("UCabc123"), "UUabc123");
        assert_eq!(uploads_playlist_id("U"), "UU");
    }

    #[test]
    fn video_resource_maps_to_metrics() -> serde_json::Result<()> {
        let video: VideoResource = serde_json::from_str(
            r#"{
                "id": "v1",
                "snippet": {"liveBroadcastContent": "upcoming"},
                "contentDetails": {"duration": "PT4M5S"},
                "statistics": {"viewCount": "1200", "likeCount": "34"},
                "status": {"privacyStatus": "public"}
            }"#,
        )?;
        let metrics = video.into_metrics();
        assert_eq!(metrics.views, Some(1200));
        assert_eq!(metrics.likes, Some(34));
        assert_eq!(metrics.comments, None);
        assert_eq!(metrics.duration_secs, 245);
        assert_eq!(metrics.live_status, LiveStatus::Upcoming);
        assert_eq!(metrics.privacy_status, "public");
        Ok(())
    }

    #[test]
    fn playlist_page_parses_release_and_added_times() -> serde_json::Result<()> {
        let page: Page<PlaylistItemResource> = serde_json::from_str(
            r#"{
                "nextPageToken": "CAUQAA",
                "items": [{
                    "id": "item-1",
                    "snippet": {
                        "title": "New single",
                        "publishedAt": "2024-05-31T18:00:00Z",
                        "videoOwnerChannelTitle": "Artist - Topic"
                    },
                    "contentDetails": {"videoId": "v1", "videoPublishedAt": "2024-05-31T17:00:00Z"},
                    "status": {"privacyStatus": "public"}
                }, {
                    "id": "item-2",
                    "snippet": {"title": "Premiere"},
                    "contentDetails": {"videoId": "v2"}
                }]
            }"#,
        )?;
        assert_eq!(page.next_page_token.as_deref(), Some("CAUQAA"));
        assert_eq!(page.items.len(), 2);
        let first = &page.items[0];
        assert_eq!(first.content_details.video_id, "v1");
        assert!(first.content_details.video_published_at < first.snippet.published_at);
        assert!(page.items[1].content_details.video_published_at.is_none());
        Ok(())
    }

    #[test]
    fn page_without_items_is_empty() -> serde_json::Result<()> {
        let page: Page<VideoResource> =
            serde_json::from_str(r#"{"kind": "youtube#videoListResponse"}"#)?;
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
        Ok(())
    }
}

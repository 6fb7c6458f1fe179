#![forbid(unsafe_code)]

//! Domain types passed between discovery, routing, the mutation layer and the
//! stats table.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const STATUS_PUBLIC: &str = "public";
pub const STATUS_DELETED: &str = "deleted";

/// Channel categories as they appear in `channels.json`.
///
/// The French keys of the historical PocketTube export are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "MUSIQUE")]
    Music,
    #[serde(alias = "APPRENTISSAGE")]
    Learning,
    #[serde(alias = "DIVERTISSEMENT")]
    Entertainment,
    #[serde(alias = "GAMING")]
    Gaming,
    #[serde(alias = "ASMR")]
    Other,
}

impl Category {
    /// Non-music categories, highest routing priority first.
    pub const NON_MUSIC_PRIORITY: [Category; 4] = [
        Category::Learning,
        Category::Entertainment,
        Category::Gaming,
        Category::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Music => "music",
            Category::Learning => "learning",
            Category::Entertainment => "entertainment",
            Category::Gaming => "gaming",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveStatus {
    #[default]
    None,
    Upcoming,
    Live,
}

impl LiveStatus {
    /// Parses `snippet.liveBroadcastContent`. Unrecognised values count as
    /// regular uploads.
    pub fn from_api(value: &str) -> Self {
        match value {
            "upcoming" => LiveStatus::Upcoming,
            "live" => LiveStatus::Live,
            _ => LiveStatus::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub categories: BTreeSet<Category>,
    pub favorite: bool,
}

impl Channel {
    pub fn is_music(&self) -> bool {
        self.categories.contains(&Category::Music)
    }

    /// Highest-priority non-music category, if the channel has one.
    pub fn primary_non_music(&self) -> Option<Category> {
        Category::NON_MUSIC_PRIORITY
            .into_iter()
            .find(|category| self.categories.contains(category))
    }
}

/// Raw upload returned by discovery, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadItem {
    pub video_id: String,
    /// Channel whose uploads playlist was listed. Auto-generated artist
    /// channels report a different owner, so routing keys on this one.
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
    pub released_at: Option<DateTime<Utc>>,
    pub privacy_status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoCandidate {
    pub video_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
    pub released_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
    pub is_short: bool,
    pub live_status: LiveStatus,
    pub privacy_status: String,
}

/// Current counters and broadcast state for a video.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoMetrics {
    pub views: Option<u64>,
    pub likes: Option<u64>,
    pub comments: Option<u64>,
    pub duration_secs: u64,
    pub live_status: LiveStatus,
    pub privacy_status: String,
}

/// One row of a playlist as listed by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub video_id: String,
    /// Playlist item id, required to delete the row.
    pub item_id: String,
    pub added_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistSnapshot {
    pub playlist_id: String,
    pub entries: Vec<PlaylistEntry>,
}

impl PlaylistSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, video_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.video_id == video_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Playlist(String),
    /// Long-form upload from a music-only channel.
    Drop,
    Shorts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub video_id: String,
    pub route: Route,
}

/// Discovery window `(since, until)`, both exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl RunWindow {
    /// Window between two runs, both ends truncated to the hour.
    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since: truncate_to_hour(since),
            until: truncate_to_hour(until),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.since < instant && instant < self.until
    }
}

pub fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at)
}

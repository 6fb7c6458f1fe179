#![forbid(unsafe_code)]

//! Pure routing decision: which playlist a freshly discovered video belongs to.

use crate::config::{
    PLAYLIST_BANGER, PLAYLIST_MUSIC_LIVES, PLAYLIST_REGULAR_STREAMS, PLAYLIST_RELEASE,
    TrackerConfig,
};
use crate::error::{ConfigError, RouteError};
use crate::models::{Category, Channel, LiveStatus, Route, VideoCandidate};
use std::collections::HashMap;

/// Immutable lookup tables the router consults. Built once per run.
#[derive(Debug, Clone)]
pub struct RoutingTables {
    pub release_radar: String,
    pub banger_radar: String,
    pub music_lives: String,
    pub regular_streams: String,
    pub category_playlists: HashMap<Category, String>,
    pub long_video_threshold_secs: u64,
}

impl RoutingTables {
    pub fn from_config(config: &TrackerConfig) -> Result<Self, ConfigError> {
        let category_playlists = Category::NON_MUSIC_PRIORITY
            .into_iter()
            .filter_map(|category| {
                config
                    .category_playlist(category)
                    .map(|playlist| (category, playlist.id.clone()))
            })
            .collect();
        Ok(Self {
            release_radar: config.playlist(PLAYLIST_RELEASE)?.id.clone(),
            banger_radar: config.playlist(PLAYLIST_BANGER)?.id.clone(),
            music_lives: config.playlist(PLAYLIST_MUSIC_LIVES)?.id.clone(),
            regular_streams: config.playlist(PLAYLIST_REGULAR_STREAMS)?.id.clone(),
            category_playlists,
            long_video_threshold_secs: config.settings.video.long_video_threshold_minutes * 60,
        })
    }

    /// Playlists in the order additions are performed: favorites first, then
    /// music discovery, category buckets and finally stream buckets.
    pub fn addition_order(&self) -> Vec<&str> {
        let mut order = vec![self.banger_radar.as_str(), self.release_radar.as_str()];
        for category in Category::NON_MUSIC_PRIORITY {
            if let Some(id) = self.category_playlists.get(&category)
                && !order.contains(&id.as_str())
            {
                order.push(id);
            }
        }
        for id in [self.music_lives.as_str(), self.regular_streams.as_str()] {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }
}

#[derive(Debug, Clone)]
pub struct VideoRouter {
    tables: RoutingTables,
}

impl VideoRouter {
    pub fn new(tables: RoutingTables) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &RoutingTables {
        &self.tables
    }

    /// First matching rule wins:
    /// 1. upcoming stream → stream playlist
    /// 2. short → [`Route::Shorts`]
    /// 3. music channel → long-form rules, then favorites, then Release Radar
    /// 4. other channels → their category playlist
    pub fn route(
        &self,
        candidate: &VideoCandidate,
        channel: &Channel,
    ) -> Result<Route, RouteError> {
        if candidate.live_status == LiveStatus::Upcoming {
            return Ok(Route::Playlist(self.stream_playlist(channel).to_string()));
        }
        if candidate.is_short {
            return Ok(Route::Shorts);
        }
        if channel.is_music() {
            self.route_music(candidate, channel)
        } else {
            let category = channel
                .primary_non_music()
                .ok_or_else(|| RouteError::Uncategorized(channel.id.clone()))?;
            self.category_route(channel, category)
        }
    }

    fn stream_playlist(&self, channel: &Channel) -> &str {
        if channel.is_music() {
            &self.tables.music_lives
        } else {
            &self.tables.regular_streams
        }
    }

    fn route_music(
        &self,
        candidate: &VideoCandidate,
        channel: &Channel,
    ) -> Result<Route, RouteError> {
        if candidate.duration_secs > self.tables.long_video_threshold_secs {
            return match channel.primary_non_music() {
                Some(category) => self.category_route(channel, category),
                None => Ok(Route::Drop),
            };
        }
        if channel.favorite {
            return Ok(Route::Playlist(self.tables.banger_radar.clone()));
        }
        Ok(Route::Playlist(self.tables.release_radar.clone()))
    }

    fn category_route(&self, channel: &Channel, category: Category) -> Result<Route, RouteError> {
        self.tables
            .category_playlists
            .get(&category)
            .map(|id| Route::Playlist(id.clone()))
            .ok_or_else(|| RouteError::UnmappedCategory {
                channel_id: channel.id.clone(),
                category: category.to_string(),
            })
    }
}

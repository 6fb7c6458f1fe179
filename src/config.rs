#![forbid(unsafe_code)]

//! Runtime configuration: where the data lives, the API token, tunables from
//! `tracker.toml`, and the channel/playlist lookup tables.

use crate::error::ConfigError;
use crate::models::{Category, Channel};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_SETTINGS_PATH: &str = "tracker.toml";

const CHANNELS_FILE: &str = "channels.json";
const PLAYLISTS_FILE: &str = "playlists.json";
const ADD_ON_FILE: &str = "add_on.json";
const LEDGER_FILE: &str = "api_failure.json";
const STATS_FILE: &str = "stats.json";
const STREAMS_FILE: &str = "seen_streams.json";
const LAST_RUN_FILE: &str = "last_run";

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub data_dir: PathBuf,
    pub settings_path: PathBuf,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_dir: Option<PathBuf>,
    pub settings_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_paths(&file_vars, env_var_string, overrides))
}

fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimePaths {
    let data_dir = overrides
        .data_dir
        .or_else(|| lookup_value("YRT_DATA_DIR", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let settings_path = overrides
        .settings_path
        .or_else(|| lookup_value("YRT_SETTINGS", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
    let access_token = lookup_value("YOUTUBE_ACCESS_TOKEN", file_vars, &env_lookup);
    RuntimePaths {
        data_dir,
        settings_path,
        access_token,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Reads `KEY=value` pairs, tolerating `export`, quotes and comments. A missing
/// file yields an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(content.lines().filter_map(parse_env_line).collect())
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let unquoted = ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value);
    Some((key.to_string(), unquoted.to_string()))
}

/// Replaces `path` with `contents` through a sibling temp file so a crash never
/// leaves a half-written state file behind.
pub fn replace_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("Creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents).with_context(|| format!("Writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("Replacing {}", path.display()))?;
    Ok(())
}

/// Every state file the tracker reads or writes, relative to the data dir.
#[derive(Debug, Clone)]
pub struct DataFiles {
    pub channels: PathBuf,
    pub playlists: PathBuf,
    pub add_on: PathBuf,
    pub ledger: PathBuf,
    pub stats: PathBuf,
    pub streams: PathBuf,
    pub last_run: PathBuf,
}

impl DataFiles {
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            channels: data_dir.join(CHANNELS_FILE),
            playlists: data_dir.join(PLAYLISTS_FILE),
            add_on: data_dir.join(ADD_ON_FILE),
            ledger: data_dir.join(LEDGER_FILE),
            stats: data_dir.join(STATS_FILE),
            streams: data_dir.join(STREAMS_FILE),
            last_run: data_dir.join(LAST_RUN_FILE),
        }
    }
}

// --- tracker.toml ----------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub network: NetworkSettings,
    pub playlists: PlaylistSettings,
    pub video: VideoSettings,
    pub stats: StatsSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiSettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_delay_seconds: u64,
    pub max_backoff_seconds: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 3,
            base_delay_seconds: 1,
            max_backoff_seconds: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkSettings {
    pub timeout_seconds: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { timeout_seconds: 5 }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaylistSettings {
    pub release_radar_target_size: usize,
    pub relistening_age_days: i64,
}

impl Default for PlaylistSettings {
    fn default() -> Self {
        Self {
            release_radar_target_size: 40,
            relistening_age_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoSettings {
    pub long_video_threshold_minutes: u64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            long_video_threshold_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsSettings {
    pub week_deltas: Vec<u32>,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            week_deltas: vec![1, 4, 12, 24],
        }
    }
}

impl Settings {
    /// Loads `tracker.toml`. Missing keys keep their defaults; a missing file
    /// means "all defaults".
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(
                "Settings file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        settings.validate()?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.batch_size == 0 || self.api.batch_size > 50 {
            return Err(ConfigError::InvalidSetting {
                key: "api.batch_size",
                message: "must be between 1 and 50".into(),
            });
        }
        if self.api.max_retries == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "api.max_retries",
                message: "must be at least 1".into(),
            });
        }
        if self.video.long_video_threshold_minutes == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "video.long_video_threshold_minutes",
                message: "must be positive".into(),
            });
        }
        if self.playlists.relistening_age_days < 0 {
            return Err(ConfigError::InvalidSetting {
                key: "playlists.relistening_age_days",
                message: "must not be negative".into(),
            });
        }
        if self.stats.week_deltas.is_empty() || self.stats.week_deltas.contains(&0) {
            return Err(ConfigError::InvalidSetting {
                key: "stats.week_deltas",
                message: "needs at least one positive offset".into(),
            });
        }
        Ok(())
    }
}

// --- channel and playlist tables -------------------------------------------

/// One destination from `playlists.json`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlaylistConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Items older than this many days are removed by expiry cleanup.
    #[serde(default)]
    pub retention_days: Option<u32>,
    /// Remove items once their stream has ended.
    #[serde(default)]
    pub cleanup_on_end: bool,
}

pub const PLAYLIST_RELEASE: &str = "release";
pub const PLAYLIST_BANGER: &str = "banger";
pub const PLAYLIST_RE_LISTENING: &str = "re_listening";
pub const PLAYLIST_LEGACY: &str = "legacy";
pub const PLAYLIST_MUSIC_LIVES: &str = "music_lives";
pub const PLAYLIST_REGULAR_STREAMS: &str = "regular_streams";

const REQUIRED_PLAYLISTS: [&str; 6] = [
    PLAYLIST_RELEASE,
    PLAYLIST_BANGER,
    PLAYLIST_RE_LISTENING,
    PLAYLIST_LEGACY,
    PLAYLIST_MUSIC_LIVES,
    PLAYLIST_REGULAR_STREAMS,
];

/// Keys looked up for a category's destination, first match wins. The second
/// group are the keys used by older `playlists.json` files.
fn category_playlist_keys(category: Category) -> &'static [&'static str] {
    match category {
        Category::Music => &[],
        Category::Learning => &["learning", "apprentissage"],
        Category::Entertainment => &["entertainment", "divertissement_gaming"],
        Category::Gaming => &["gaming", "divertissement_gaming"],
        Category::Other => &["other", "asmr"],
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AddOn {
    /// Display name → channel id.
    #[serde(default)]
    pub favorites: BTreeMap<String, String>,
    /// Channels skipped entirely during discovery.
    #[serde(default, alias = "toPass")]
    pub to_pass: Vec<String>,
    /// Channels whose missing uploads playlist is expected and not worth a warning.
    #[serde(default, alias = "playlistNotFoundPass")]
    pub playlist_not_found_pass: Vec<String>,
}

/// Everything loaded once per run and passed explicitly to the components.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub settings: Settings,
    pub playlists: BTreeMap<String, PlaylistConfig>,
    pub channels: BTreeMap<String, Channel>,
    pub add_on: AddOn,
}

impl TrackerConfig {
    pub fn load(files: &DataFiles, settings: Settings) -> Result<Self, ConfigError> {
        let by_category: BTreeMap<Category, Vec<String>> = read_json(&files.channels)?;
        let playlists: BTreeMap<String, PlaylistConfig> = read_json(&files.playlists)?;
        let add_on: AddOn = read_json(&files.add_on)?;
        let config = Self::from_parts(settings, by_category, playlists, add_on);
        config.validate()?;
        Ok(config)
    }

    pub fn from_parts(
        settings: Settings,
        by_category: BTreeMap<Category, Vec<String>>,
        playlists: BTreeMap<String, PlaylistConfig>,
        add_on: AddOn,
    ) -> Self {
        let favorites: BTreeSet<&str> = add_on.favorites.values().map(String::as_str).collect();
        let mut channels: BTreeMap<String, Channel> = BTreeMap::new();
        for (category, ids) in &by_category {
            for id in ids {
                channels
                    .entry(id.clone())
                    .or_insert_with(|| Channel {
                        id: id.clone(),
                        categories: BTreeSet::new(),
                        favorite: favorites.contains(id.as_str()),
                    })
                    .categories
                    .insert(*category);
            }
        }
        Self {
            settings,
            playlists,
            channels,
            add_on,
        }
    }

    /// Checks every lookup the run depends on, so configuration gaps surface
    /// before the first mutation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        for key in REQUIRED_PLAYLISTS {
            if !self.playlists.contains_key(key) {
                return Err(ConfigError::MissingPlaylist(key));
            }
        }
        for (key, playlist) in &self.playlists {
            if playlist.id.trim().is_empty() {
                return Err(ConfigError::EmptyPlaylistId(key.clone()));
            }
        }
        for channel in self.channels.values() {
            if let Some(category) = channel.primary_non_music()
                && self.category_playlist(category).is_none()
            {
                return Err(ConfigError::UnmappedCategory {
                    category: category.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Looks up a required destination. Only call after [`Self::validate`].
    pub fn playlist(&self, key: &'static str) -> Result<&PlaylistConfig, ConfigError> {
        self.playlists
            .get(key)
            .ok_or(ConfigError::MissingPlaylist(key))
    }

    pub fn category_playlist(&self, category: Category) -> Option<&PlaylistConfig> {
        category_playlist_keys(category)
            .iter()
            .find_map(|key| self.playlists.get(*key))
    }

    /// Channels to scan this run, in id order.
    pub fn tracked_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels
            .values()
            .filter(|channel| !self.add_on.to_pass.contains(&channel.id))
    }

    pub fn playlist_name(&self, playlist_id: &str) -> Option<&str> {
        self.playlists
            .values()
            .find(|playlist| playlist.id == playlist_id)
            .map(|playlist| playlist.name.as_str())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

// --- last run marker -------------------------------------------------------

/// Reads the previous run timestamp. A first run (or an unreadable marker)
/// looks back one day, matching the daily schedule.
pub fn read_last_run(path: &Path, now: DateTime<Utc>) -> DateTime<Utc> {
    let fallback = now - Duration::days(1);
    let Ok(raw) = fs::read_to_string(path) else {
        info!("No previous run recorded, scanning the last 24 hours");
        return fallback;
    };
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(err) => {
            warn!("Ignoring unreadable last-run marker {}: {err}", path.display());
            fallback
        }
    }
}

pub fn write_last_run(path: &Path, at: DateTime<Utc>) -> Result<()> {
    replace_file(path, &format!("{}\n", at.to_rfc3339()))
}

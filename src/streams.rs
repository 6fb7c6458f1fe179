#![forbid(unsafe_code)]

//! Upcoming streams already filed into a stream playlist.
//!
//! Streams never get a stats row, so this is what keeps a rescanned window
//! from filing them twice. On disk it maps video id to release time:
//!
//! ```json
//! { "videoId": "2024-06-01T05:00:00Z" }
//! ```

use crate::config::replace_file;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct SeenStreams {
    path: PathBuf,
    seen: BTreeMap<String, DateTime<Utc>>,
}

impl SeenStreams {
    /// Loads the set; a missing file is an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        let seen = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading streams {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing streams {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            seen,
        })
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn contains(&self, video_id: &str) -> bool {
        self.seen.contains_key(video_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.seen.keys().map(String::as_str)
    }

    pub fn insert(&mut self, video_id: &str, released_at: DateTime<Utc>) {
        self.seen.insert(video_id.to_string(), released_at);
    }

    /// Forgets streams released at or before `since`. No later window can
    /// list them again.
    pub fn forget_before(&mut self, since: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, released_at| *released_at > since);
        before - self.seen.len()
    }

    pub fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.seen).context("serializing streams")?;
        replace_file(&self.path, &(json + "\n"))
    }
}

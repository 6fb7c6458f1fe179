#![forbid(unsafe_code)]

//! Videos whose addition was deferred (quota exhaustion or retries used up),
//! kept per destination playlist until a later run succeeds.
//!
//! On disk the ledger keeps the historical `api_failure.json` shape:
//!
//! ```json
//! { "PLxxxx": { "name": "Release Radar", "failure": ["videoId", "..."] } }
//! ```
//!
//! A run drains the whole ledger into a working list before retrying, records
//! only the entries that fail again, and rewrites the file once at the end.
//! Nothing is cleared before its replacement is known.

use crate::config::replace_file;
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub failure: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFailure {
    pub playlist_id: String,
    pub video_id: String,
}

#[derive(Debug)]
pub struct PendingFailureLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl PendingFailureLedger {
    /// Loads the ledger; a missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading ledger {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing ledger {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|entry| entry.failure.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, playlist_id: &str, video_id: &str) -> bool {
        self.entries
            .get(playlist_id)
            .is_some_and(|entry| entry.failure.iter().any(|id| id == video_id))
    }

    /// Moves every pending entry into the returned working list, leaving an
    /// empty set behind (playlist names are kept). Duplicates collapse.
    pub fn drain(&mut self) -> Vec<PendingFailure> {
        let mut drained = Vec::new();
        for (playlist_id, entry) in &mut self.entries {
            for video_id in entry.failure.drain(..) {
                let pending = PendingFailure {
                    playlist_id: playlist_id.clone(),
                    video_id,
                };
                if !drained.contains(&pending) {
                    drained.push(pending);
                }
            }
        }
        if !drained.is_empty() {
            info!("{} pending addition(s) drained from previous runs", drained.len());
        }
        drained
    }

    /// Queues a deferred addition. Recording the same pair twice is a no-op.
    pub fn record(&mut self, playlist_id: &str, video_id: &str) {
        let entry = self.entries.entry(playlist_id.to_string()).or_default();
        if !entry.failure.iter().any(|id| id == video_id) {
            entry.failure.push(video_id.to_string());
        }
    }

    /// Labels a playlist so the file stays readable.
    pub fn set_name(&mut self, playlist_id: &str, name: &str) {
        let entry = self.entries.entry(playlist_id.to_string()).or_default();
        if entry.name.is_empty() {
            entry.name = name.to_string();
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, LedgerEntry> {
        &self.entries
    }

    /// Replaces the file on disk with the current state.
    pub fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries).context("serializing ledger")?;
        replace_file(&self.path, &(json + "\n"))
    }
}

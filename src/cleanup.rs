#![forbid(unsafe_code)]

//! Playlist housekeeping: retention-based expiry and removal of streams that
//! have ended.

use crate::config::PlaylistConfig;
use crate::models::{LiveStatus, PlaylistEntry};
use crate::provider::{MetricsProvider, PlaylistMutator, PlaylistReader};
use crate::retry::{ErrorClass, Outcome, RetryExecutor, Sleeper, classify};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
    pub unknown_errors: usize,
    /// Playlists that could not be listed this run.
    pub skipped_playlists: usize,
}

impl CleanupReport {
    pub fn absorb(&mut self, other: CleanupReport) {
        self.removed += other.removed;
        self.failed += other.failed;
        self.unknown_errors += other.unknown_errors;
        self.skipped_playlists += other.skipped_playlists;
    }
}

pub struct Housekeeper<'a, A, S> {
    api: &'a A,
    executor: &'a RetryExecutor<S>,
    batch_size: usize,
}

impl<'a, A, S> Housekeeper<'a, A, S>
where
    A: PlaylistReader + PlaylistMutator + MetricsProvider,
    S: Sleeper,
{
    pub fn new(api: &'a A, executor: &'a RetryExecutor<S>, batch_size: usize) -> Self {
        Self {
            api,
            executor,
            batch_size: batch_size.max(1),
        }
    }

    /// Removes items added more than `retention_days` before `now` from every
    /// playlist that sets a retention.
    pub fn remove_expired(
        &self,
        playlists: &BTreeMap<String, PlaylistConfig>,
        now: DateTime<Utc>,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        for playlist in playlists.values() {
            let Some(retention_days) = playlist.retention_days else {
                continue;
            };
            let Some(entries) = self.list(playlist, &mut report) else {
                continue;
            };
            let cutoff = now - Duration::days(i64::from(retention_days));
            let expired: Vec<&PlaylistEntry> = entries
                .iter()
                .filter(|entry| entry.added_at.is_some_and(|added| added < cutoff))
                .collect();
            if expired.is_empty() {
                continue;
            }
            info!(
                "{} item(s) older than {retention_days} day(s) in {}",
                expired.len(),
                playlist.name
            );
            self.remove_all(playlist, &expired, &mut report);
        }
        report
    }

    /// Removes items whose broadcast is over from every playlist flagged
    /// `cleanup_on_end`. Videos the API no longer returns are left alone.
    pub fn remove_ended_streams(
        &self,
        playlists: &BTreeMap<String, PlaylistConfig>,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        for playlist in playlists.values().filter(|p| p.cleanup_on_end) {
            let Some(entries) = self.list(playlist, &mut report) else {
                continue;
            };
            let mut ended = Vec::new();
            for chunk in entries.chunks(self.batch_size) {
                let ids: Vec<String> = chunk.iter().map(|e| e.video_id.clone()).collect();
                match self.api.video_metrics(&ids) {
                    Ok(metrics) => ended.extend(chunk.iter().filter(|entry| {
                        metrics
                            .get(&entry.video_id)
                            .is_some_and(|m| m.live_status == LiveStatus::None)
                    })),
                    Err(err) => {
                        warn!("Error checking stream status in {}: {err}", playlist.name);
                        if classify(&err.reason) == ErrorClass::Unknown {
                            report.unknown_errors += 1;
                        }
                    }
                }
            }
            if ended.is_empty() {
                continue;
            }
            info!("{} ended stream(s) in {}", ended.len(), playlist.name);
            self.remove_all(playlist, &ended, &mut report);
        }
        report
    }

    fn list(
        &self,
        playlist: &PlaylistConfig,
        report: &mut CleanupReport,
    ) -> Option<Vec<PlaylistEntry>> {
        match self.api.playlist_items(&playlist.id) {
            Ok(entries) => Some(entries),
            Err(err) => {
                warn!("Skipping cleanup of {}: {err}", playlist.name);
                report.skipped_playlists += 1;
                None
            }
        }
    }

    fn remove_all(
        &self,
        playlist: &PlaylistConfig,
        entries: &[&PlaylistEntry],
        report: &mut CleanupReport,
    ) {
        for entry in entries {
            let outcome = self.executor.execute(&entry.video_id, || {
                self.api.remove_from_playlist(&playlist.id, entry)
            });
            match outcome {
                Outcome::Applied => report.removed += 1,
                Outcome::Unknown(_) => report.unknown_errors += 1,
                Outcome::Permanent(_) | Outcome::Deferred(_) => report.failed += 1,
            }
        }
    }
}

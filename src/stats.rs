#![forbid(unsafe_code)]

//! Historical record of every tracked upload and its weekly counters.
//!
//! Each row carries one `views_wN` / `likes_wN` / `comments_wN` triple per
//! configured offset. A slot is filled once, the first run at or after
//! `release + N weeks` (hour granularity), and never touched again.

use crate::config::replace_file;
use crate::error::ApiError;
use crate::models::{
    LiveStatus, STATUS_DELETED, VideoCandidate, VideoMetrics, truncate_to_hour,
};
use crate::provider::MetricsProvider;
use crate::retry::{ErrorClass, classify};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

const METRICS: [&str; 3] = ["views", "likes", "comments"];

fn column(metric: &str, week: u32) -> String {
    format!("{metric}_w{week}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub video_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub video_title: String,
    pub release_date: DateTime<Utc>,
    pub status: String,
    pub is_short: bool,
    /// Seconds.
    pub duration: u64,
    #[serde(flatten)]
    pub columns: BTreeMap<String, Option<u64>>,
}

impl StatsRecord {
    pub fn from_candidate(
        candidate: &VideoCandidate,
        released_at: DateTime<Utc>,
        weeks: &[u32],
    ) -> Self {
        let columns = weeks
            .iter()
            .flat_map(|week| METRICS.iter().map(move |metric| (column(metric, *week), None)))
            .collect();
        Self {
            video_id: candidate.video_id.clone(),
            channel_id: candidate.channel_id.clone(),
            channel_name: candidate.channel_name.clone(),
            video_title: candidate.title.clone(),
            release_date: released_at,
            status: candidate.privacy_status.clone(),
            is_short: candidate.is_short,
            duration: candidate.duration_secs,
            columns,
        }
    }

    pub fn value(&self, metric: &str, week: u32) -> Option<u64> {
        self.columns.get(&column(metric, week)).copied().flatten()
    }

    /// A slot counts as filled as soon as any of its counters is present;
    /// channels may hide likes or comments.
    pub fn is_sampled(&self, week: u32) -> bool {
        METRICS.iter().any(|metric| self.value(metric, week).is_some())
    }

    pub fn is_deleted(&self) -> bool {
        self.status == STATUS_DELETED
    }

    /// Whether the `week` slot is open at `now`.
    pub fn is_due(&self, week: u32, now: DateTime<Utc>) -> bool {
        let due = self.release_date + Duration::weeks(i64::from(week));
        truncate_to_hour(now) >= truncate_to_hour(due) && !self.is_sampled(week)
    }

    /// Writes the `week` slot. Returns false, leaving the slot open, when the
    /// API hid every counter.
    fn fill(&mut self, week: u32, metrics: &VideoMetrics) -> bool {
        let values = [metrics.views, metrics.likes, metrics.comments];
        if values.iter().all(Option::is_none) {
            return false;
        }
        for (metric, value) in METRICS.iter().zip(values) {
            self.columns.insert(column(metric, week), value);
        }
        true
    }
}

/// The `stats.json` table, kept sorted by release date then video id.
#[derive(Debug)]
pub struct StatsTable {
    path: PathBuf,
    rows: Vec<StatsRecord>,
}

impl StatsTable {
    /// Loads the table; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let rows = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading stats {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing stats {}", path.display()))?
        } else {
            Vec::new()
        };
        let mut table = Self {
            path: path.to_path_buf(),
            rows,
        };
        table.sort();
        Ok(table)
    }

    pub fn rows(&self) -> &[StatsRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, video_id: &str) -> Option<&StatsRecord> {
        self.rows.iter().find(|row| row.video_id == video_id)
    }

    /// Appends one NEW row per candidate. Upcoming streams, undated items and
    /// ids already in the table are skipped. Returns the number of rows added.
    pub fn append_new(&mut self, candidates: &[VideoCandidate], weeks: &[u32]) -> usize {
        let mut known: HashSet<String> = self.rows.iter().map(|row| row.video_id.clone()).collect();
        let mut added = 0;
        for candidate in candidates {
            if candidate.live_status == LiveStatus::Upcoming {
                continue;
            }
            let Some(released_at) = candidate.released_at else {
                continue;
            };
            if !known.insert(candidate.video_id.clone()) {
                debug!("{} already in stats, skipping", candidate.video_id);
                continue;
            }
            self.rows
                .push(StatsRecord::from_candidate(candidate, released_at, weeks));
            added += 1;
        }
        self.sort();
        added
    }

    pub fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.rows).context("serializing stats")?;
        replace_file(&self.path, &(json + "\n"))
    }

    fn sort(&mut self) {
        self.rows.sort_by(|a, b| {
            a.release_date
                .cmp(&b.release_date)
                .then_with(|| a.video_id.cmp(&b.video_id))
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleReport {
    /// Slots filled, one per (video, week).
    pub filled: usize,
    /// Due slots left open because no counter came back.
    pub unsampled: usize,
    pub marked_deleted: usize,
    pub failed_batches: usize,
    pub unknown_errors: usize,
}

pub struct StatsSampler<'a, P> {
    provider: &'a P,
    weeks: &'a [u32],
    batch_size: usize,
}

impl<'a, P: MetricsProvider> StatsSampler<'a, P> {
    pub fn new(provider: &'a P, weeks: &'a [u32], batch_size: usize) -> Self {
        Self {
            provider,
            weeks,
            batch_size: batch_size.max(1),
        }
    }

    /// Fills every slot due at `now`. A failing batch is logged and left for
    /// the next run; the rest of the table is still sampled.
    pub fn sample(&self, table: &mut StatsTable, now: DateTime<Utc>) -> SampleReport {
        let mut report = SampleReport::default();
        let due: BTreeMap<String, Vec<u32>> = table
            .rows
            .iter()
            .filter(|row| !row.is_deleted())
            .filter_map(|row| {
                let weeks: Vec<u32> = self
                    .weeks
                    .iter()
                    .copied()
                    .filter(|week| row.is_due(*week, now))
                    .collect();
                (!weeks.is_empty()).then(|| (row.video_id.clone(), weeks))
            })
            .collect();
        if due.is_empty() {
            debug!("No stats slot due");
            return report;
        }
        info!("Sampling stats for {} video(s)", due.len());

        let ids: Vec<String> = due.keys().cloned().collect();
        for chunk in ids.chunks(self.batch_size) {
            let metrics = match self.provider.video_metrics(chunk) {
                Ok(metrics) => metrics,
                Err(err) => {
                    self.record_failure(&err, chunk.len(), &mut report);
                    continue;
                }
            };
            for video_id in chunk {
                let Some(row) = table.rows.iter_mut().find(|row| &row.video_id == video_id) else {
                    continue;
                };
                match metrics.get(video_id) {
                    Some(current) => {
                        for week in &due[video_id] {
                            if row.fill(*week, current) {
                                report.filled += 1;
                            } else {
                                debug!("{video_id}: no counters for week {week}, slot left open");
                                report.unsampled += 1;
                            }
                        }
                        if !current.privacy_status.is_empty() {
                            row.status = current.privacy_status.clone();
                        }
                    }
                    None => {
                        info!("{video_id} no longer available, marked as deleted");
                        row.status = STATUS_DELETED.to_string();
                        report.marked_deleted += 1;
                    }
                }
            }
        }
        report
    }

    fn record_failure(&self, err: &ApiError, count: usize, report: &mut SampleReport) {
        warn!("Could not fetch stats for {count} video(s): {err}");
        report.failed_batches += 1;
        if classify(&err.reason) == ErrorClass::Unknown {
            report.unknown_errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::STATUS_PUBLIC;
    use crate::provider::fake::{FakeYouTube, metrics};
    use chrono::TimeZone;
    use tempfile::tempdir;

    const WEEKS: [u32; 4] = [1, 4, 12, 24];

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 6, 15, 0).unwrap()
    }

    fn candidate(video_id: &str, released_at: DateTime<Utc>) -> VideoCandidate {
        VideoCandidate {
            video_id: video_id.into(),
            channel_id: "UCchan".into(),
            channel_name: "Chan".into(),
            title: format!("Title {video_id}"),
            released_at: Some(released_at),
            duration_secs: 200,
            is_short: false,
            live_status: LiveStatus::None,
            privacy_status: STATUS_PUBLIC.into(),
        }
    }

    fn table_with(dir: &Path, candidates: &[VideoCandidate]) -> Result<StatsTable> {
        let mut table = StatsTable::load(&dir.join("stats.json"))?;
        table.append_new(candidates, &WEEKS);
        Ok(table)
    }

    #[test]
    fn released_a_week_ago_fills_only_first_slot() -> Result<()> {
        let dir = tempdir()?;
        let mut table = table_with(dir.path(), &[candidate("v1", now() - Duration::days(7))])?;
        let api = FakeYouTube::default();
        api.set_metrics("v1", metrics(1000, 200, LiveStatus::None));

        let report = StatsSampler::new(&api, &WEEKS, 50).sample(&mut table, now());
        assert_eq!(report.filled, 1);
        let row = table.get("v1").unwrap();
        assert_eq!(row.value("views", 1), Some(1000));
        assert_eq!(row.value("likes", 1), Some(100));
        assert_eq!(row.value("comments", 1), Some(10));
        for week in [4, 12, 24] {
            assert!(!row.is_sampled(week));
        }
        Ok(())
    }

    #[test]
    fn same_day_rerun_does_not_refill() -> Result<()> {
        let dir = tempdir()?;
        let mut table = table_with(dir.path(), &[candidate("v1", now() - Duration::days(7))])?;
        let api = FakeYouTube::default();
        api.set_metrics("v1", metrics(1000, 200, LiveStatus::None));
        let sampler = StatsSampler::new(&api, &WEEKS, 50);
        sampler.sample(&mut table, now());

        api.set_metrics("v1", metrics(5000, 200, LiveStatus::None));
        let report = sampler.sample(&mut table, now() + Duration::hours(3));
        assert_eq!(report, SampleReport::default());
        assert_eq!(table.get("v1").unwrap().value("views", 1), Some(1000));
        assert_eq!(api.metrics_requests.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn slot_opens_on_the_due_hour() -> Result<()> {
        let dir = tempdir()?;
        let released = now() - Duration::days(7) + Duration::minutes(30);
        let mut table = table_with(dir.path(), &[candidate("v1", released)])?;
        let row = table.get("v1").unwrap();
        assert!(row.is_due(1, now()));
        assert!(!row.is_due(1, now() - Duration::hours(1)));

        let api = FakeYouTube::default();
        api.set_metrics("v1", metrics(10, 200, LiveStatus::None));
        StatsSampler::new(&api, &WEEKS, 50).sample(&mut table, now());
        assert!(table.get("v1").unwrap().is_sampled(1));
        Ok(())
    }

    #[test]
    fn hidden_counters_leave_the_slot_open() -> Result<()> {
        let dir = tempdir()?;
        let mut table = table_with(dir.path(), &[candidate("v1", now() - Duration::days(7))])?;
        let api = FakeYouTube::default();
        let mut hidden = metrics(0, 200, LiveStatus::None);
        hidden.views = None;
        hidden.likes = None;
        hidden.comments = None;
        api.set_metrics("v1", hidden);

        let report = StatsSampler::new(&api, &WEEKS, 50).sample(&mut table, now());
        assert_eq!(report.filled, 0);
        assert_eq!(report.unsampled, 1);
        let row = table.get("v1").unwrap();
        assert!(!row.is_sampled(1));
        assert!(row.is_due(1, now()));
        Ok(())
    }

    #[test]
    fn late_run_catches_up_missed_slots() -> Result<()> {
        let dir = tempdir()?;
        let mut table = table_with(dir.path(), &[candidate("v1", now() - Duration::weeks(5))])?;
        let api = FakeYouTube::default();
        api.set_metrics("v1", metrics(42, 200, LiveStatus::None));

        let report = StatsSampler::new(&api, &WEEKS, 50).sample(&mut table, now());
        assert_eq!(report.filled, 2);
        let row = table.get("v1").unwrap();
        assert!(row.is_sampled(1) && row.is_sampled(4));
        assert!(!row.is_sampled(12));
        Ok(())
    }

    #[test]
    fn missing_videos_are_marked_deleted_and_skipped_afterwards() -> Result<()> {
        let dir = tempdir()?;
        let mut table = table_with(dir.path(), &[candidate("gone", now() - Duration::weeks(1))])?;
        let api = FakeYouTube::default();
        let sampler = StatsSampler::new(&api, &WEEKS, 50);

        let report = sampler.sample(&mut table, now());
        assert_eq!(report.marked_deleted, 1);
        assert!(table.get("gone").unwrap().is_deleted());

        sampler.sample(&mut table, now() + Duration::weeks(4));
        assert_eq!(api.metrics_requests.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn requests_are_batched() -> Result<()> {
        let dir = tempdir()?;
        let released = now() - Duration::weeks(1);
        let candidates: Vec<_> = (0..5).map(|i| candidate(&format!("v{i}"), released)).collect();
        let mut table = table_with(dir.path(), &candidates)?;
        let api = FakeYouTube::default();
        for item in &candidates {
            api.set_metrics(&item.video_id, metrics(1, 200, LiveStatus::None));
        }

        StatsSampler::new(&api, &WEEKS, 2).sample(&mut table, now());
        let sizes: Vec<usize> = api.metrics_requests.borrow().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        Ok(())
    }

    #[test]
    fn append_skips_upcoming_and_duplicates() -> Result<()> {
        let dir = tempdir()?;
        let mut table = StatsTable::load(&dir.path().join("stats.json"))?;
        let mut live = candidate("live", now());
        live.live_status = LiveStatus::Upcoming;
        let mut undated = candidate("undated", now());
        undated.released_at = None;
        let added = table.append_new(
            &[
                candidate("b", now()),
                candidate("a", now()),
                candidate("a", now()),
                live,
                undated,
            ],
            &WEEKS,
        );
        assert_eq!(added, 2);
        assert_eq!(table.append_new(&[candidate("a", now())], &WEEKS), 0);
        let ids: Vec<&str> = table.rows().iter().map(|r| r.video_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn persisted_rows_use_flat_columns() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("stats.json");
        let mut table = StatsTable::load(&path)?;
        table.append_new(
            &[
                candidate("late", now()),
                candidate("early", now() - Duration::days(7)),
            ],
            &WEEKS,
        );
        let api = FakeYouTube::default();
        api.set_metrics("early", metrics(7, 200, LiveStatus::None));
        StatsSampler::new(&api, &WEEKS, 50).sample(&mut table, now());
        table.persist()?;

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(value[0]["video_id"], "early");
        assert_eq!(value[0]["views_w1"], 7);
        assert!(value[0]["views_w24"].is_null());
        assert_eq!(value[1]["video_id"], "late");

        let reloaded = StatsTable::load(&path)?;
        assert_eq!(reloaded.rows(), table.rows());
        Ok(())
    }
}

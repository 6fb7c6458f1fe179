#![forbid(unsafe_code)]

//! One tracker run: retry deferred additions, discover new uploads, sample
//! stats, route and add, rebalance the Release Radar, then housekeeping.

use crate::cleanup::{CleanupReport, Housekeeper};
use crate::config::{PLAYLIST_LEGACY, PLAYLIST_RE_LISTENING, TrackerConfig};
use crate::error::{ApiError, ConfigError, RouteError};
use crate::ledger::PendingFailureLedger;
use crate::models::{
    LiveStatus, PlaylistSnapshot, Route, RoutingDecision, RunWindow, UploadItem, VideoCandidate,
};
use crate::provider::{
    DiscoveryProvider, MetricsProvider, PlaylistMutator, PlaylistReader, ShortsClassifier,
    YouTubeApi,
};
use crate::rebalance::{RebalanceReport, Rebalancer};
use crate::retry::{
    ErrorClass, Outcome, RetryExecutor, RetryPolicy, Sleeper, ThreadSleeper, classify,
};
use crate::router::{RoutingTables, VideoRouter};
use crate::stats::{SampleReport, StatsSampler, StatsTable};
use crate::streams::SeenStreams;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};

/// Every disposition of a run. [`RunReport::has_hard_errors`] decides the
/// exit status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub window: Option<RunWindow>,
    /// Ledger entries retried at the start of the run.
    pub retried: usize,
    pub discovered: usize,
    /// Listed uploads skipped because an earlier run already filed them.
    pub already_handled: usize,
    pub applied: usize,
    pub permanent: usize,
    pub deferred: usize,
    pub unknown_errors: usize,
    pub shorts: usize,
    pub dropped: usize,
    pub route_errors: usize,
    /// Channels or metric batches that could not be fetched. Videos behind
    /// them were not seen this run.
    pub discovery_errors: usize,
    pub stats_rows_added: usize,
    pub stats: SampleReport,
    pub rebalance: Option<RebalanceReport>,
    pub cleanup: CleanupReport,
}

impl RunReport {
    pub fn has_hard_errors(&self) -> bool {
        self.unknown_errors > 0
            || self.route_errors > 0
            || self.stats.unknown_errors > 0
            || self.cleanup.unknown_errors > 0
            || self
                .rebalance
                .as_ref()
                .is_some_and(|report| report.unknown_errors > 0)
    }

    /// Whether every channel and every enrichment batch was read. The
    /// last-run marker only moves forward when this holds.
    pub fn discovery_complete(&self) -> bool {
        self.discovery_errors == 0
    }

    fn tally(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::Permanent(_) => self.permanent += 1,
            Outcome::Deferred(_) => self.deferred += 1,
            Outcome::Unknown(_) => self.unknown_errors += 1,
        }
    }

    fn api_failure(&mut self, err: &ApiError) {
        self.discovery_errors += 1;
        if classify(&err.reason) == ErrorClass::Unknown {
            self.unknown_errors += 1;
        }
    }
}

pub struct Tracker<S = ThreadSleeper> {
    config: TrackerConfig,
    router: VideoRouter,
    executor: RetryExecutor<S>,
}

impl Tracker<ThreadSleeper> {
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        Self::with_sleeper(config, ThreadSleeper)
    }
}

impl<S: Sleeper> Tracker<S> {
    /// Validates the configuration and builds the lookup tables. Nothing is
    /// mutated when this fails.
    pub fn with_sleeper(config: TrackerConfig, sleeper: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let router = VideoRouter::new(RoutingTables::from_config(&config)?);
        let executor =
            RetryExecutor::with_sleeper(RetryPolicy::from_settings(&config.settings.api), sleeper);
        Ok(Self {
            config,
            router,
            executor,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn run<A: YouTubeApi>(
        &self,
        api: &A,
        ledger: &mut PendingFailureLedger,
        stats: &mut StatsTable,
        streams: &mut SeenStreams,
        last_run: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RunReport {
        let window = RunWindow::between(last_run, now);
        let mut report = RunReport {
            window: Some(window),
            ..RunReport::default()
        };

        self.retry_ledger(api, ledger, &mut report);

        streams.forget_before(window.since);
        let handled: HashSet<String> = stats
            .rows()
            .iter()
            .map(|row| row.video_id.as_str())
            .chain(streams.ids())
            .map(str::to_string)
            .collect();
        let candidates = self.discover(api, &window, &handled, &mut report);
        report.discovered = candidates.len();
        info!(
            "{} new video(s) between {} and {}",
            candidates.len(),
            window.since,
            window.until
        );

        let settings = &self.config.settings;
        report.stats = StatsSampler::new(api, &settings.stats.week_deltas, settings.api.batch_size)
            .sample(stats, now);
        report.stats_rows_added = stats.append_new(&candidates, &settings.stats.week_deltas);

        let decisions = self.route_all(&candidates, &mut report);
        self.add_routed(api, ledger, &candidates, &decisions, &mut report);
        for candidate in &candidates {
            if let (LiveStatus::Upcoming, Some(released_at)) =
                (candidate.live_status, candidate.released_at)
            {
                streams.insert(&candidate.video_id, released_at);
            }
        }

        report.rebalance = self.rebalance(api, now);

        let housekeeper = Housekeeper::new(api, &self.executor, settings.api.batch_size);
        report
            .cleanup
            .absorb(housekeeper.remove_expired(&self.config.playlists, now));
        report
            .cleanup
            .absorb(housekeeper.remove_ended_streams(&self.config.playlists));

        report
    }

    /// Drains the ledger and retries every entry once through the executor.
    /// Entries deferred again go straight back in.
    fn retry_ledger<M: PlaylistMutator>(
        &self,
        api: &M,
        ledger: &mut PendingFailureLedger,
        report: &mut RunReport,
    ) {
        let pending = ledger.drain();
        if pending.is_empty() {
            return;
        }
        info!("Retrying {} previously deferred addition(s)", pending.len());
        for item in pending {
            self.add(api, ledger, &item.playlist_id, &item.video_id, report);
            report.retried += 1;
        }
    }

    /// Lists new uploads of every tracked channel and enriches them with
    /// duration, broadcast state and the shorts probe. Ids in `handled` were
    /// filed by an earlier run over the same window and are left out.
    pub fn discover<A>(
        &self,
        api: &A,
        window: &RunWindow,
        handled: &HashSet<String>,
        report: &mut RunReport,
    ) -> Vec<VideoCandidate>
    where
        A: DiscoveryProvider + MetricsProvider + ShortsClassifier,
    {
        let mut seen = HashSet::new();
        let mut uploads: Vec<UploadItem> = Vec::new();
        for channel in self.config.tracked_channels() {
            match api.recent_uploads(&channel.id, window) {
                Ok(items) => {
                    for item in items {
                        if handled.contains(&item.video_id) {
                            report.already_handled += 1;
                        } else if seen.insert(item.video_id.clone()) {
                            uploads.push(item);
                        }
                    }
                }
                Err(err) if err.is_not_found() => {
                    if !self.config.add_on.playlist_not_found_pass.contains(&channel.id) {
                        warn!("Uploads playlist not found for {}", channel.id);
                    }
                }
                Err(err) => {
                    error!("Could not list uploads of {}: {err}", channel.id);
                    report.api_failure(&err);
                }
            }
        }

        let mut candidates = Vec::with_capacity(uploads.len());
        for chunk in uploads.chunks(self.config.settings.api.batch_size.max(1)) {
            let ids: Vec<String> = chunk.iter().map(|item| item.video_id.clone()).collect();
            let metrics = match api.video_metrics(&ids) {
                Ok(metrics) => metrics,
                Err(err) => {
                    error!("Could not fetch details of {} new video(s): {err}", ids.len());
                    report.api_failure(&err);
                    continue;
                }
            };
            for item in chunk {
                let Some(current) = metrics.get(&item.video_id) else {
                    debug!("{} vanished before enrichment", item.video_id);
                    continue;
                };
                let is_short = current.live_status != LiveStatus::Upcoming
                    && api.is_short(&item.video_id);
                candidates.push(VideoCandidate {
                    video_id: item.video_id.clone(),
                    channel_id: item.channel_id.clone(),
                    channel_name: item.channel_name.clone(),
                    title: item.title.clone(),
                    released_at: item.released_at,
                    duration_secs: current.duration_secs,
                    is_short,
                    live_status: current.live_status,
                    privacy_status: if current.privacy_status.is_empty() {
                        item.privacy_status.clone()
                    } else {
                        current.privacy_status.clone()
                    },
                });
            }
        }
        candidates
    }

    fn route_all(
        &self,
        candidates: &[VideoCandidate],
        report: &mut RunReport,
    ) -> Vec<RoutingDecision> {
        let mut decisions = Vec::new();
        for candidate in candidates {
            let routed = self
                .config
                .channels
                .get(&candidate.channel_id)
                .ok_or_else(|| RouteError::UnknownChannel(candidate.channel_id.clone()))
                .and_then(|channel| self.router.route(candidate, channel));
            match routed {
                Ok(Route::Shorts) => report.shorts += 1,
                Ok(Route::Drop) => {
                    debug!("{} is a long music upload, dropped", candidate.video_id);
                    report.dropped += 1;
                }
                Ok(route) => decisions.push(RoutingDecision {
                    video_id: candidate.video_id.clone(),
                    route,
                }),
                Err(err) => {
                    error!("Cannot route {}: {err}", candidate.video_id);
                    report.route_errors += 1;
                }
            }
        }
        decisions
    }

    /// Adds routed videos playlist by playlist in priority order, oldest
    /// release first inside a playlist.
    fn add_routed<M: PlaylistMutator>(
        &self,
        api: &M,
        ledger: &mut PendingFailureLedger,
        candidates: &[VideoCandidate],
        decisions: &[RoutingDecision],
        report: &mut RunReport,
    ) {
        let released: HashMap<&str, Option<DateTime<Utc>>> = candidates
            .iter()
            .map(|c| (c.video_id.as_str(), c.released_at))
            .collect();
        let mut by_playlist: HashMap<&str, Vec<&str>> = HashMap::new();
        for decision in decisions {
            if let Route::Playlist(playlist_id) = &decision.route {
                by_playlist
                    .entry(playlist_id.as_str())
                    .or_default()
                    .push(decision.video_id.as_str());
            }
        }
        for playlist_id in self.router.tables().addition_order() {
            let Some(mut videos) = by_playlist.remove(playlist_id) else {
                continue;
            };
            videos.sort_by_key(|id| (released.get(id).copied().flatten(), *id));
            info!(
                "Adding {} video(s) to {}",
                videos.len(),
                self.config.playlist_name(playlist_id).unwrap_or(playlist_id)
            );
            for video_id in videos {
                self.add(api, ledger, playlist_id, video_id, report);
            }
        }
    }

    fn add<M: PlaylistMutator>(
        &self,
        api: &M,
        ledger: &mut PendingFailureLedger,
        playlist_id: &str,
        video_id: &str,
        report: &mut RunReport,
    ) {
        let outcome = self
            .executor
            .execute(video_id, || api.add_to_playlist(playlist_id, video_id));
        if let Outcome::Deferred(_) = outcome {
            ledger.record(playlist_id, video_id);
            if let Some(name) = self.config.playlist_name(playlist_id) {
                ledger.set_name(playlist_id, name);
            }
        }
        report.tally(&outcome);
    }

    fn rebalance<A>(&self, api: &A, now: DateTime<Utc>) -> Option<RebalanceReport>
    where
        A: PlaylistReader + PlaylistMutator,
    {
        let tables = self.router.tables();
        let snapshot = |playlist_id: &str| -> Option<PlaylistSnapshot> {
            match api.playlist_items(playlist_id) {
                Ok(entries) => Some(PlaylistSnapshot {
                    playlist_id: playlist_id.to_string(),
                    entries,
                }),
                Err(err) => {
                    warn!("Skipping rebalance, cannot read {playlist_id}: {err}");
                    None
                }
            }
        };
        let target = snapshot(tables.release_radar.as_str())?;
        let source_a = snapshot(self.config.playlist(PLAYLIST_RE_LISTENING).ok()?.id.as_str())?;
        let source_b = snapshot(self.config.playlist(PLAYLIST_LEGACY).ok()?.id.as_str())?;

        let settings = &self.config.settings.playlists;
        let mut rebalancer = Rebalancer::new(api, &self.executor);
        Some(rebalancer.rebalance(
            &target,
            &source_a,
            &source_b,
            settings.release_radar_target_size,
            settings.relistening_age_days,
            now,
        ))
    }
}

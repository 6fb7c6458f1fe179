#![forbid(unsafe_code)]

//! Keeps the Release Radar at its target size by pulling older entries from
//! the re-listening and legacy playlists.

use crate::models::{PlaylistEntry, PlaylistSnapshot};
use crate::provider::PlaylistMutator;
use crate::retry::{Outcome, RetryExecutor, Sleeper};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use std::collections::HashSet;

/// How many items to pull from each source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocation {
    pub from_a: usize,
    pub from_b: usize,
}

impl Allocation {
    pub fn total(&self) -> usize {
        self.from_a + self.from_b
    }
}

/// Splits `deficit` proportionally to each source's eligible count, then caps
/// each share at what the source can give. A shortfall on one side is not
/// made up by the other.
pub fn allocate(deficit: usize, eligible_a: usize, eligible_b: usize) -> Allocation {
    let eligible = eligible_a + eligible_b;
    if deficit == 0 || eligible == 0 {
        return Allocation::default();
    }
    let share_a = (deficit as f64 * eligible_a as f64 / eligible as f64).round() as usize;
    let share_a = share_a.min(deficit);
    let share_b = deficit - share_a;
    Allocation {
        from_a: share_a.min(eligible_a),
        from_b: share_b.min(eligible_b),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    pub deficit: usize,
    pub planned: Allocation,
    pub moved_from_a: Vec<String>,
    pub moved_from_b: Vec<String>,
    /// Added to the target but still present in their source.
    pub partial_moves: Vec<String>,
    pub failed_adds: usize,
    pub unknown_errors: usize,
}

impl RebalanceReport {
    pub fn moves(&self) -> usize {
        self.moved_from_a.len() + self.moved_from_b.len()
    }

    pub fn shortfall(&self) -> usize {
        self.deficit.saturating_sub(self.moves())
    }
}

pub struct Rebalancer<'a, M, S> {
    mutator: &'a M,
    executor: &'a RetryExecutor<S>,
    /// Videos already added to a target this run; never pulled twice.
    moved: HashSet<String>,
}

impl<'a, M, S> Rebalancer<'a, M, S>
where
    M: PlaylistMutator,
    S: Sleeper,
{
    pub fn new(mutator: &'a M, executor: &'a RetryExecutor<S>) -> Self {
        Self {
            mutator,
            executor,
            moved: HashSet::new(),
        }
    }

    /// Source items added before `now - min_age_days`, not yet in `target` and
    /// not already moved this run. `exclude` removes ids claimed by another
    /// source.
    pub fn eligible<'s>(
        &self,
        source: &'s PlaylistSnapshot,
        target: &PlaylistSnapshot,
        exclude: &HashSet<&str>,
        min_age_days: i64,
        now: DateTime<Utc>,
    ) -> Vec<&'s PlaylistEntry> {
        let cutoff = now - Duration::days(min_age_days);
        let mut seen = HashSet::new();
        source
            .entries
            .iter()
            .filter(|entry| entry.added_at.is_some_and(|added| added < cutoff))
            .filter(|entry| !target.contains(&entry.video_id))
            .filter(|entry| !self.moved.contains(&entry.video_id))
            .filter(|entry| !exclude.contains(entry.video_id.as_str()))
            .filter(|entry| seen.insert(entry.video_id.clone()))
            .collect()
    }

    pub fn rebalance(
        &mut self,
        target: &PlaylistSnapshot,
        source_a: &PlaylistSnapshot,
        source_b: &PlaylistSnapshot,
        target_size: usize,
        min_age_days: i64,
        now: DateTime<Utc>,
    ) -> RebalanceReport {
        let mut report = RebalanceReport::default();
        if target.len() >= target_size {
            info!(
                "No addition necessary for {} ({} of {})",
                target.playlist_id,
                target.len(),
                target_size
            );
            return report;
        }
        report.deficit = target_size - target.len();

        let eligible_a = self.eligible(source_a, target, &HashSet::new(), min_age_days, now);
        let claimed: HashSet<&str> = eligible_a.iter().map(|e| e.video_id.as_str()).collect();
        let eligible_b = self.eligible(source_b, target, &claimed, min_age_days, now);
        report.planned = allocate(report.deficit, eligible_a.len(), eligible_b.len());

        info!(
            "{} needs {} video(s): {} from {} ({} eligible), {} from {} ({} eligible)",
            target.playlist_id,
            report.deficit,
            report.planned.from_a,
            source_a.playlist_id,
            eligible_a.len(),
            report.planned.from_b,
            source_b.playlist_id,
            eligible_b.len()
        );

        for entry in eligible_a.into_iter().take(report.planned.from_a) {
            if let Some(video_id) = self.move_entry(target, source_a, entry, &mut report) {
                report.moved_from_a.push(video_id);
            }
        }
        for entry in eligible_b.into_iter().take(report.planned.from_b) {
            if let Some(video_id) = self.move_entry(target, source_b, entry, &mut report) {
                report.moved_from_b.push(video_id);
            }
        }

        if report.shortfall() > 0 {
            warn!(
                "{} partially filled: {} of {} missing video(s) added",
                target.playlist_id,
                report.moves(),
                report.deficit
            );
        }
        report
    }

    /// Add to the target, then remove from the source. Returns the video id
    /// when the add went through.
    fn move_entry(
        &mut self,
        target: &PlaylistSnapshot,
        source: &PlaylistSnapshot,
        entry: &PlaylistEntry,
        report: &mut RebalanceReport,
    ) -> Option<String> {
        let video_id = entry.video_id.clone();
        let added = self.executor.execute(&video_id, || {
            self.mutator.add_to_playlist(&target.playlist_id, &video_id)
        });
        match added {
            Outcome::Applied => {}
            Outcome::Unknown(_) => {
                report.unknown_errors += 1;
                return None;
            }
            Outcome::Permanent(_) | Outcome::Deferred(_) => {
                report.failed_adds += 1;
                return None;
            }
        }
        self.moved.insert(video_id.clone());

        let removed = self.executor.execute(&video_id, || {
            self.mutator.remove_from_playlist(&source.playlist_id, entry)
        });
        if let Outcome::Unknown(_) = removed {
            report.unknown_errors += 1;
        }
        if !removed.is_applied() {
            warn!(
                "{video_id} added to {} but still in {}",
                target.playlist_id, source.playlist_id
            );
            report.partial_moves.push(video_id.clone());
        }
        Some(video_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::provider::fake::FakeYouTube;
    use crate::retry::RetryPolicy;
    use crate::retry::testing::RecordingSleeper;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn entries(prefix: &str, count: usize, age_days: i64) -> Vec<PlaylistEntry> {
        (0..count)
            .map(|i| PlaylistEntry {
                video_id: format!("{prefix}{i}"),
                item_id: format!("item-{prefix}{i}"),
                added_at: Some(now() - Duration::days(age_days)),
            })
            .collect()
    }

    fn executor() -> RetryExecutor<RecordingSleeper> {
        RetryExecutor::with_sleeper(RetryPolicy::default(), RecordingSleeper::default())
    }

    fn snapshot(id: &str, entries: Vec<PlaylistEntry>) -> PlaylistSnapshot {
        PlaylistSnapshot {
            playlist_id: id.into(),
            entries,
        }
    }

    #[test]
    fn allocation_is_proportional() {
        assert_eq!(
            allocate(10, 14, 6),
            Allocation {
                from_a: 7,
                from_b: 3
            }
        );
        assert_eq!(
            allocate(10, 1, 1),
            Allocation {
                from_a: 1,
                from_b: 1
            }
        );
        assert_eq!(allocate(5, 10, 10).total(), 5);
    }

    #[test]
    fn allocation_does_not_borrow_from_other_source() {
        assert_eq!(
            allocate(10, 14, 0),
            Allocation {
                from_a: 10,
                from_b: 0
            }
        );
        assert_eq!(
            allocate(10, 4, 0),
            Allocation {
                from_a: 4,
                from_b: 0
            }
        );
        assert_eq!(
            allocate(10, 18, 2),
            Allocation {
                from_a: 9,
                from_b: 1
            }
        );
        assert_eq!(allocate(10, 0, 0), Allocation::default());
        assert_eq!(allocate(0, 5, 5), Allocation::default());
    }

    #[test]
    fn full_target_is_left_alone() {
        let api = FakeYouTube::default();
        let executor = executor();
        let mut rebalancer = Rebalancer::new(&api, &executor);
        let report = rebalancer.rebalance(
            &snapshot("PL_release", entries("r", 40, 0)),
            &snapshot("PL_relisten", entries("a", 10, 30)),
            &snapshot("PL_legacy", entries("b", 10, 30)),
            40,
            7,
            now(),
        );
        assert_eq!(report.moves(), 0);
        assert!(api.calls.borrow().is_empty());
    }

    #[test]
    fn fills_target_proportionally_and_moves_items() {
        let mut relisten = entries("a", 14, 30);
        relisten.extend(entries("fresh", 5, 1));
        let api = FakeYouTube::default()
            .with_playlist("PL_relisten", relisten.clone())
            .with_playlist("PL_legacy", entries("b", 6, 30));
        let executor = executor();
        let mut rebalancer = Rebalancer::new(&api, &executor);

        let report = rebalancer.rebalance(
            &snapshot("PL_release", entries("r", 30, 0)),
            &snapshot("PL_relisten", relisten),
            &snapshot("PL_legacy", entries("b", 6, 30)),
            40,
            7,
            now(),
        );

        assert_eq!(report.deficit, 10);
        assert_eq!(
            report.planned,
            Allocation {
                from_a: 7,
                from_b: 3
            }
        );
        assert_eq!(report.moves(), 10);
        assert_eq!(report.shortfall(), 0);
        assert_eq!(api.video_ids("PL_release").len(), 10);
        assert_eq!(api.video_ids("PL_relisten").len(), 19 - 7);
        assert_eq!(api.video_ids("PL_legacy").len(), 3);
        assert!(
            api.video_ids("PL_release")
                .iter()
                .all(|id| !id.starts_with("fresh"))
        );
    }

    #[test]
    fn empty_second_source_is_not_compensated() {
        let api = FakeYouTube::default();
        let executor = executor();
        let mut rebalancer = Rebalancer::new(&api, &executor);
        let report = rebalancer.rebalance(
            &snapshot("PL_release", entries("r", 30, 0)),
            &snapshot("PL_relisten", entries("a", 4, 30)),
            &snapshot("PL_legacy", entries("b", 6, 2)),
            40,
            7,
            now(),
        );
        assert_eq!(
            report.planned,
            Allocation {
                from_a: 4,
                from_b: 0
            }
        );
        assert_eq!(report.moves(), 4);
        assert_eq!(report.shortfall(), 6);
    }

    #[test]
    fn failed_removal_is_not_pulled_again() {
        let api = FakeYouTube::default().with_playlist("PL_relisten", entries("a", 2, 30));
        api.fail_remove("PL_relisten", "a0", vec![ApiError::new("forbidden", "nope")]);
        let executor = executor();
        let mut rebalancer = Rebalancer::new(&api, &executor);
        let target = snapshot("PL_release", Vec::new());
        let source = snapshot("PL_relisten", entries("a", 2, 30));
        let legacy = snapshot("PL_legacy", Vec::new());

        let report = rebalancer.rebalance(&target, &source, &legacy, 1, 7, now());
        assert_eq!(report.moved_from_a, vec!["a0".to_string()]);
        assert_eq!(report.partial_moves, vec!["a0".to_string()]);
        assert!(api.video_ids("PL_relisten").contains(&"a0".to_string()));

        let second = rebalancer.rebalance(&target, &source, &legacy, 1, 7, now());
        assert_eq!(second.moved_from_a, vec!["a1".to_string()]);
    }

    #[test]
    fn failed_add_keeps_item_in_source() {
        let api = FakeYouTube::default().with_playlist("PL_relisten", entries("a", 1, 30));
        api.fail_add("PL_release", "a0", vec![ApiError::new("quotaExceeded", "limit")]);
        let executor = executor();
        let mut rebalancer = Rebalancer::new(&api, &executor);
        let report = rebalancer.rebalance(
            &snapshot("PL_release", Vec::new()),
            &snapshot("PL_relisten", entries("a", 1, 30)),
            &snapshot("PL_legacy", Vec::new()),
            5,
            7,
            now(),
        );
        assert_eq!(report.moves(), 0);
        assert_eq!(report.failed_adds, 1);
        assert_eq!(api.video_ids("PL_relisten"), vec!["a0".to_string()]);
    }

    #[test]
    fn shared_video_is_claimed_by_first_source() {
        let api = FakeYouTube::default();
        let executor = executor();
        let rebalancer = Rebalancer::new(&api, &executor);
        let a = snapshot("A", entries("x", 2, 30));
        let b = snapshot("B", entries("x", 3, 30));
        let target = snapshot("T", Vec::new());
        let eligible_a = rebalancer.eligible(&a, &target, &HashSet::new(), 7, now());
        let claimed: HashSet<&str> = eligible_a.iter().map(|e| e.video_id.as_str()).collect();
        let eligible_b = rebalancer.eligible(&b, &target, &claimed, 7, now());
        assert_eq!(eligible_a.len(), 2);
        assert_eq!(eligible_b.len(), 1);
        assert_eq!(eligible_b[0].video_id, "x2");
    }
}

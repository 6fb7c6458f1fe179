#![forbid(unsafe_code)]

//! Daily entry point: scans followed channels for new uploads, files them into
//! playlists and persists the run state. Meant to be run from cron.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::warn;
use release_tracker::{
    config::{
        DataFiles, RuntimeOverrides, Settings, TrackerConfig, read_last_run,
        resolve_runtime_paths, write_last_run,
    },
    error::ConfigError,
    ledger::PendingFailureLedger,
    stats::StatsTable,
    streams::SeenStreams,
    tracker::{RunReport, Tracker},
    youtube::YouTubeClient,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "track_releases", about = "File new YouTube uploads into playlists")]
struct Args {
    /// Directory holding the channel, playlist and state files.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Path to `tracker.toml`.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Load and validate the configuration, then exit.
    #[arg(long)]
    dry_run_config: bool,
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let runtime = resolve_runtime_paths(RuntimeOverrides {
        data_dir: args.data_dir,
        settings_path: args.settings,
        env_path: args.env_file,
    })?;
    let files = DataFiles::in_dir(&runtime.data_dir);

    println!("Data directory: {}", runtime.data_dir.display());
    println!("Settings: {}", runtime.settings_path.display());

    let settings = Settings::load(&runtime.settings_path)?;
    let config = TrackerConfig::load(&files, settings)?;
    let tracker = Tracker::new(config)?;
    let config = tracker.config();
    println!(
        "Configuration OK: {} channel(s), {} playlist(s).",
        config.channels.len(),
        config.playlists.len()
    );
    if args.dry_run_config {
        return Ok(ExitCode::SUCCESS);
    }

    let token = runtime
        .access_token
        .ok_or(ConfigError::MissingValue("YOUTUBE_ACCESS_TOKEN"))?;
    let mut ledger = PendingFailureLedger::load(&files.ledger)?;
    let mut stats = StatsTable::load(&files.stats)?;
    let mut streams = SeenStreams::load(&files.streams)?;

    let now = Utc::now();
    let last_run = read_last_run(&files.last_run, now);
    let client = YouTubeClient::new(
        &token,
        &config.settings.network,
        config.settings.api.batch_size,
    );

    let report = tracker.run(
        &client,
        &mut ledger,
        &mut stats,
        &mut streams,
        last_run,
        now,
    );

    ledger
        .persist()
        .with_context(|| format!("saving {}", files.ledger.display()))?;
    stats
        .persist()
        .with_context(|| format!("saving {}", files.stats.display()))?;
    streams
        .persist()
        .with_context(|| format!("saving {}", files.streams.display()))?;
    if report.discovery_complete() {
        write_last_run(&files.last_run, now)?;
    } else {
        warn!("Discovery incomplete, keeping the previous last-run marker");
    }

    print_summary(&report, ledger.len());

    if report.has_hard_errors() {
        eprintln!("Run finished with errors, see the log above.");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(report: &RunReport, pending: usize) {
    println!();
    if let Some(window) = &report.window {
        println!("Window: {} -> {}", window.since, window.until);
    }
    println!("Retried from ledger: {}", report.retried);
    println!(
        "New videos: {} ({} already filed by an earlier run)",
        report.discovered, report.already_handled
    );
    println!(
        "  added {}, deferred {}, permanent failures {}, unknown errors {}",
        report.applied, report.deferred, report.permanent, report.unknown_errors
    );
    println!(
        "  shorts {}, dropped {}, unroutable {}",
        report.shorts, report.dropped, report.route_errors
    );
    println!(
        "Stats: {} row(s) added, {} slot(s) filled, {} marked deleted",
        report.stats_rows_added, report.stats.filled, report.stats.marked_deleted
    );
    if let Some(rebalance) = &report.rebalance {
        println!(
            "Release Radar: {} of {} missing video(s) moved in",
            rebalance.moves(),
            rebalance.deficit
        );
    }
    println!(
        "Cleanup: {} removed, {} failed, {} playlist(s) skipped",
        report.cleanup.removed, report.cleanup.failed, report.cleanup.skipped_playlists
    );
    println!("Pending additions: {pending}");
}

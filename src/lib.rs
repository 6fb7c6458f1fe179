#![forbid(unsafe_code)]

//! Routes new YouTube uploads from followed channels into curated playlists,
//! keeps the Release Radar topped up and records weekly view statistics.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod provider;
pub mod rebalance;
pub mod retry;
pub mod router;
pub mod stats;
pub mod streams;
pub mod tracker;
pub mod youtube;

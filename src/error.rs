#![forbid(unsafe_code)]

//! Error types shared by the tracker components.

use std::path::PathBuf;
use thiserror::Error;

/// A failed YouTube Data API call.
///
/// `reason` is the machine-readable reason reported by the API
/// (`error.errors[0].reason`), which the retry layer classifies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {message}")]
pub struct ApiError {
    pub status: Option<u16>,
    pub reason: String,
    pub message: String,
}

impl ApiError {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

/// Problems with configuration files. Always fatal for the whole run and
/// raised before any playlist is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("playlist `{0}` is missing from the playlist configuration")]
    MissingPlaylist(&'static str),
    #[error("playlist `{0}` has an empty id")]
    EmptyPlaylistId(String),
    #[error("category `{category}` has channels but no destination playlist")]
    UnmappedCategory { category: String },
    #[error("invalid setting {key}: {message}")]
    InvalidSetting { key: &'static str, message: String },
    #[error("{0} not set")]
    MissingValue(&'static str),
}

/// Routing failures. These indicate configuration gaps, never transient state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("channel {channel_id} has no destination for category `{category}`")]
    UnmappedCategory {
        channel_id: String,
        category: String,
    },
    #[error("channel {0} is not assigned to any category")]
    Uncategorized(String),
    #[error("channel {0} is not part of the configuration")]
    UnknownChannel(String),
}

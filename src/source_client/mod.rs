//! Fetching and normalizing one upstream root server's listings.

mod fields;
mod http;
pub mod shape;

pub use http::{HttpSourceClient, DEFAULT_USER_AGENT};

use crate::model::{Format, ImportProblem, Meeting, ServiceBody, Source};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Full,
    /// Only meetings changed after the given instant.
    ChangedSince(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Timeout,
    HttpStatus,
    Parse,
    Unreachable,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} responded with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("could not parse response from {url}: {message}")]
    Parse { url: String, message: String },

    #[error("{url} is unreachable: {message}")]
    Unreachable { url: String, message: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Timeout { .. } => FetchErrorKind::Timeout,
            FetchError::HttpStatus { .. } => FetchErrorKind::HttpStatus,
            FetchError::Parse { .. } => FetchErrorKind::Parse,
            FetchError::Unreachable { .. } => FetchErrorKind::Unreachable,
        }
    }
}

/// Normalized result of fetching one source.
#[derive(Debug, Default)]
pub struct FetchedListing {
    pub service_bodies: Vec<ServiceBody>,
    pub meetings: Vec<Meeting>,
    pub formats: Vec<Format>,
    /// Meetings the source reported as deleted (incremental fetches).
    pub deleted_meeting_ids: Vec<i64>,
    pub problems: Vec<ImportProblem>,
    /// Latest change the source has reported, explicitly or via record markers.
    pub change_cutoff: Option<DateTime<Utc>>,
}

impl FetchedListing {
    /// The source's own cutoff if it stated one, else the newest record marker.
    pub fn resolve_change_cutoff(
        reported: Option<DateTime<Utc>>,
        meetings: &[Meeting],
    ) -> Option<DateTime<Utc>> {
        reported.or_else(|| meetings.iter().filter_map(|m| m.last_changed).max())
    }
}

/// Fetches a source's current listing. Implementations apply their own
/// request timeout and never retry.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch(&self, source: &Source, mode: FetchMode) -> Result<FetchedListing, FetchError>;
}

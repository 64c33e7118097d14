//! Records shared by the sync pipeline, the store and the query API.

mod format;
mod meeting;
mod service_body;
mod source;
mod sync_state;

pub use format::{Format, FormatTranslation};
pub use meeting::{Coordinates, Meeting, MeetingDetails, Weekday, EARTH_RADIUS_KM};
pub use service_body::{ServiceBody, ServiceBodyType};
pub use source::{ResponseShape, Source, SourceId};
pub use sync_state::{ImportProblem, LastError, SyncErrorKind, SyncPhase, SyncState};

#[cfg(test)]
pub(crate) use format::test_format;
#[cfg(test)]
pub(crate) use meeting::test_meeting;

use serde::Serialize;
use std::fmt;

/// Composite identity of a meeting or service body: the owning source plus the
/// id the source itself assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordKey {
    pub source_id: SourceId,
    pub local_id: i64,
}

impl RecordKey {
    pub fn new(source_id: SourceId, local_id: i64) -> Self {
        Self {
            source_id,
            local_id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.local_id)
    }
}

/// Everything currently stored for one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSnapshot {
    pub service_bodies: Vec<ServiceBody>,
    pub meetings: Vec<Meeting>,
    pub formats: Vec<Format>,
}

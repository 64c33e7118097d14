//! Persistent store of aggregated meetings.
//!
//! Writers apply one [`SourcePlan`] per transaction; readers query committed
//! snapshots and never observe a half-applied plan.

mod filter;
mod schema;
mod sqlite_store;

pub use filter::{FormatFilter, GeoFilter, MeetingFilter};
pub use schema::MEETING_DB_SCHEMAS;
pub use sqlite_store::{SqliteMeetingStore, DEFAULT_READ_POOL_SIZE};

use crate::model::{
    Format, ImportProblem, Meeting, ServiceBody, SourceId, SourceSnapshot, SyncState,
};
use crate::reconcile::SourcePlan;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The plan contradicts stored data (duplicate key, dangling reference).
    /// Nothing from the plan was written.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::ConstraintViolation(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredServiceBody {
    /// Surrogate id, stable across updates.
    pub id: i64,
    pub parent: Option<i64>,
    pub body: ServiceBody,
}

#[derive(Debug, Clone)]
pub struct StoredMeeting {
    /// Surrogate id, stable across updates.
    pub id: i64,
    pub service_body: i64,
    pub meeting: Meeting,
}

#[derive(Debug, Clone)]
pub struct StoredFormat {
    /// Surrogate id, stable across updates.
    pub id: i64,
    pub format: Format,
}

/// Result of a meeting query. Service bodies cover every meeting's full
/// ancestor chain and were read in the same snapshot as the meetings.
#[derive(Debug, Clone, Default)]
pub struct MeetingQueryResult {
    pub meetings: Vec<StoredMeeting>,
    pub service_bodies: HashMap<i64, StoredServiceBody>,
}

impl MeetingQueryResult {
    /// The meeting's service body followed by its ancestors, nearest first.
    pub fn service_body_chain(&self, meeting: &StoredMeeting) -> Vec<&StoredServiceBody> {
        let mut chain = Vec::new();
        let mut next = Some(meeting.service_body);
        while let Some(id) = next {
            match self.service_bodies.get(&id) {
                Some(body) if !chain.iter().any(|b: &&StoredServiceBody| b.id == id) => {
                    chain.push(body);
                    next = body.parent;
                }
                _ => break,
            }
        }
        chain
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub service_bodies_inserted: usize,
    pub service_bodies_updated: usize,
    pub service_bodies_deleted: usize,
    pub meetings_inserted: usize,
    pub meetings_updated: usize,
    pub meetings_deleted: usize,
    pub formats_inserted: usize,
    pub formats_updated: usize,
    pub formats_deleted: usize,
    /// Rows stored for the source once the plan is applied.
    pub meeting_count: usize,
    pub service_body_count: usize,
    pub problem_count: usize,
}

pub trait MeetingStore: Send + Sync {
    /// Applies the whole plan or nothing.
    fn apply(&self, plan: &SourcePlan) -> Result<ApplySummary, StoreError>;

    fn query(&self, filter: &MeetingFilter) -> Result<MeetingQueryResult, StoreError>;

    /// Service bodies, optionally restricted to the given sources.
    fn service_bodies(&self, sources: &[SourceId]) -> Result<Vec<StoredServiceBody>, StoreError>;

    /// Formats ordered by source and local id. With a language set, formats
    /// without a translation in it are left out.
    fn formats(&self, filter: &FormatFilter) -> Result<Vec<StoredFormat>, StoreError>;

    fn load_source(&self, source_id: SourceId) -> Result<SourceSnapshot, StoreError>;

    /// Sources that have anything stored.
    fn stored_sources(&self) -> Result<Vec<SourceId>, StoreError>;

    /// Removes every record, problem and sync state of a source in one transaction.
    fn purge_source(&self, source_id: SourceId) -> Result<usize, StoreError>;

    fn sync_state(&self, source_id: SourceId) -> Result<Option<SyncState>, StoreError>;

    fn sync_states(&self) -> Result<Vec<SyncState>, StoreError>;

    fn record_sync_state(&self, state: &SyncState) -> Result<(), StoreError>;

    fn import_problems(
        &self,
        source_id: SourceId,
        limit: usize,
    ) -> Result<Vec<ImportProblem>, StoreError>;
}

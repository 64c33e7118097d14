//! Test doubles for the sync pipeline.

use crate::model::{
    ImportProblem, Meeting, ServiceBody, Source, SourceId, SourceSnapshot, SyncState,
};
use crate::reconcile::SourcePlan;
use crate::source_client::{FetchError, FetchMode, FetchedListing, SourceClient};
use crate::store::{
    ApplySummary, FormatFilter, MeetingFilter, MeetingQueryResult, MeetingStore, StoreError,
    StoredFormat, StoredServiceBody,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub enum Response {
    Listing {
        bodies: Vec<ServiceBody>,
        meetings: Vec<Meeting>,
        cutoff: Option<DateTime<Utc>>,
    },
    Status(u16),
}

#[derive(Default)]
pub struct FakeClient {
    pub responses: Mutex<HashMap<SourceId, Response>>,
    pub delays: Mutex<HashMap<SourceId, Duration>>,
    pub calls: Mutex<Vec<(SourceId, FetchMode)>>,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl FakeClient {
    pub fn respond(&self, source: i64, response: Response) {
        self.responses
            .lock()
            .unwrap()
            .insert(SourceId(source), response);
    }

    pub fn listing(&self, source: i64, meetings: Vec<Meeting>) {
        self.respond(
            source,
            Response::Listing {
                bodies: vec![ServiceBody::new(SourceId(source), 5, "Area")],
                meetings,
                cutoff: None,
            },
        );
    }

    pub fn delay(&self, source: i64, delay: Duration) {
        self.delays.lock().unwrap().insert(SourceId(source), delay);
    }

    pub fn calls(&self) -> Vec<(SourceId, FetchMode)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceClient for FakeClient {
    async fn fetch(&self, source: &Source, mode: FetchMode) -> Result<FetchedListing, FetchError> {
        self.calls.lock().unwrap().push((source.id, mode));
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(&source.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let response = self.responses.lock().unwrap().get(&source.id).cloned();
        match response {
            Some(Response::Listing {
                bodies,
                meetings,
                cutoff,
            }) => Ok(FetchedListing {
                service_bodies: bodies,
                meetings,
                change_cutoff: cutoff,
                ..Default::default()
            }),
            Some(Response::Status(status)) => Err(FetchError::HttpStatus {
                url: source.url.clone(),
                status,
            }),
            None => Err(FetchError::Unreachable {
                url: source.url.clone(),
                message: "no response configured".to_string(),
            }),
        }
    }
}

pub struct UnavailableStore;

impl UnavailableStore {
    fn err<T>() -> Result<T, StoreError> {
        Err(StoreError::Unavailable("disk I/O error".to_string()))
    }
}

impl MeetingStore for UnavailableStore {
    fn apply(&self, _: &SourcePlan) -> Result<ApplySummary, StoreError> {
        Self::err()
    }
    fn query(&self, _: &MeetingFilter) -> Result<MeetingQueryResult, StoreError> {
        Self::err()
    }
    fn service_bodies(&self, _: &[SourceId]) -> Result<Vec<StoredServiceBody>, StoreError> {
        Self::err()
    }
    fn formats(&self, _: &FormatFilter) -> Result<Vec<StoredFormat>, StoreError> {
        Self::err()
    }
    fn load_source(&self, _: SourceId) -> Result<SourceSnapshot, StoreError> {
        Self::err()
    }
    fn stored_sources(&self) -> Result<Vec<SourceId>, StoreError> {
        Self::err()
    }
    fn purge_source(&self, _: SourceId) -> Result<usize, StoreError> {
        Self::err()
    }
    fn sync_state(&self, _: SourceId) -> Result<Option<SyncState>, StoreError> {
        Self::err()
    }
    fn sync_states(&self) -> Result<Vec<SyncState>, StoreError> {
        Self::err()
    }
    fn record_sync_state(&self, _: &SyncState) -> Result<(), StoreError> {
        Self::err()
    }
    fn import_problems(&self, _: SourceId, _: usize) -> Result<Vec<ImportProblem>, StoreError> {
        Self::err()
    }
}

/// Delegates to a real store, except that sync state cannot be read.
pub struct StateReadFailingStore<S> {
    pub inner: Arc<S>,
    pub state_writes: AtomicUsize,
}

impl<S: MeetingStore> StateReadFailingStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            state_writes: AtomicUsize::new(0),
        }
    }
}

impl<S: MeetingStore> MeetingStore for StateReadFailingStore<S> {
    fn apply(&self, plan: &SourcePlan) -> Result<ApplySummary, StoreError> {
        self.inner.apply(plan)
    }
    fn query(&self, filter: &MeetingFilter) -> Result<MeetingQueryResult, StoreError> {
        self.inner.query(filter)
    }
    fn service_bodies(&self, sources: &[SourceId]) -> Result<Vec<StoredServiceBody>, StoreError> {
        self.inner.service_bodies(sources)
    }
    fn formats(&self, filter: &FormatFilter) -> Result<Vec<StoredFormat>, StoreError> {
        self.inner.formats(filter)
    }
    fn load_source(&self, source_id: SourceId) -> Result<SourceSnapshot, StoreError> {
        self.inner.load_source(source_id)
    }
    fn stored_sources(&self) -> Result<Vec<SourceId>, StoreError> {
        self.inner.stored_sources()
    }
    fn purge_source(&self, source_id: SourceId) -> Result<usize, StoreError> {
        self.inner.purge_source(source_id)
    }
    fn sync_state(&self, _: SourceId) -> Result<Option<SyncState>, StoreError> {
        Err(StoreError::Unavailable("database is locked".to_string()))
    }
    fn sync_states(&self) -> Result<Vec<SyncState>, StoreError> {
        self.inner.sync_states()
    }
    fn record_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
        self.state_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.record_sync_state(state)
    }
    fn import_problems(
        &self,
        source_id: SourceId,
        limit: usize,
    ) -> Result<Vec<ImportProblem>, StoreError> {
        self.inner.import_problems(source_id, limit)
    }
}

use axum::extract::FromRef;

use crate::store::MeetingStore;
use crate::sync::SyncHandle;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedMeetingStore = Arc<dyn MeetingStore>;
pub type OptionalSyncHandle = Option<SyncHandle>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub store: GuardedMeetingStore,
    pub sync_handle: OptionalSyncHandle,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        store: GuardedMeetingStore,
        sync_handle: OptionalSyncHandle,
    ) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            store,
            sync_handle,
        }
    }
}

impl FromRef<ServerState> for GuardedMeetingStore {
    fn from_ref(input: &ServerState) -> Self {
        input.store.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for OptionalSyncHandle {
    fn from_ref(input: &ServerState) -> Self {
        input.sync_handle.clone()
    }
}

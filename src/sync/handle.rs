use super::orchestrator::{Health, SyncOrchestrator, TickReport};
use crate::model::{ImportProblem, ResponseShape, SourceId, SyncPhase, SyncState};
use crate::store::StoreError;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Command sent to the scheduler.
pub enum SyncCommand {
    RunNow {
        respond: oneshot::Sender<TickReport>,
    },
}

#[derive(Debug, Error)]
pub enum SyncHandleError {
    #[error("sync scheduler is not running")]
    SchedulerUnavailable,

    #[error("sync scheduler dropped the request")]
    NoResponse,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Serializable status of one configured source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: SourceId,
    pub name: Option<String>,
    pub url: String,
    pub enabled: bool,
    pub shape: ResponseShape,
    pub incremental: bool,
    pub phase: SyncPhase,
    pub in_flight: bool,
    pub state: Option<SyncState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub health: Health,
    pub sources: Vec<SourceStatus>,
}

/// Handle to interact with the sync scheduler from HTTP handlers.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    orchestrator: SyncOrchestrator,
}

impl SyncHandle {
    pub fn new(command_tx: mpsc::Sender<SyncCommand>, orchestrator: SyncOrchestrator) -> Self {
        Self {
            command_tx,
            orchestrator,
        }
    }

    /// Runs one tick right away and waits for its report. Sources still busy
    /// with a scheduled cycle are reported as skipped.
    pub async fn run_now(&self) -> Result<TickReport, SyncHandleError> {
        let (respond, response_rx) = oneshot::channel();
        self.command_tx
            .send(SyncCommand::RunNow { respond })
            .await
            .map_err(|_| SyncHandleError::SchedulerUnavailable)?;
        response_rx.await.map_err(|_| SyncHandleError::NoResponse)
    }

    pub fn health(&self) -> Health {
        self.orchestrator.health()
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncHandleError> {
        let store = self.orchestrator.store();
        let states = tokio::task::spawn_blocking(move || store.sync_states())
            .await
            .map_err(|e| SyncHandleError::Task(e.to_string()))??;
        let mut states: HashMap<SourceId, SyncState> =
            states.into_iter().map(|s| (s.source_id, s)).collect();

        let sources = self
            .orchestrator
            .sources()
            .iter()
            .map(|source| SourceStatus {
                id: source.id,
                name: source.name.clone(),
                url: source.url.clone(),
                enabled: source.enabled,
                shape: source.shape,
                incremental: source.incremental,
                phase: self.orchestrator.phase(source.id),
                in_flight: self.orchestrator.is_in_flight(source.id),
                state: states.remove(&source.id),
            })
            .collect();

        Ok(SyncStatus {
            health: self.health(),
            sources,
        })
    }

    /// Import problems of the last applied cycle. `None` for unknown sources.
    pub async fn problems(
        &self,
        source_id: SourceId,
        limit: usize,
    ) -> Result<Option<Vec<ImportProblem>>, SyncHandleError> {
        if !self.orchestrator.sources().iter().any(|s| s.id == source_id) {
            return Ok(None);
        }
        let store = self.orchestrator.store();
        let problems = tokio::task::spawn_blocking(move || store.import_problems(source_id, limit))
            .await
            .map_err(|e| SyncHandleError::Task(e.to_string()))??;
        Ok(Some(problems))
    }
}

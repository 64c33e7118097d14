use super::handle::{SyncCommand, SyncHandle};
use super::orchestrator::SyncOrchestrator;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::orchestrator::TickReport;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Runs sync ticks on a fixed interval and on request.
pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,

    /// Receiver for commands from SyncHandle
    command_receiver: mpsc::Receiver<SyncCommand>,

    /// Token to signal scheduler shutdown. Running ticks observe a child of it.
    shutdown_token: CancellationToken,

    running_ticks: JoinSet<()>,
}

impl SyncScheduler {
    pub fn new(
        orchestrator: SyncOrchestrator,
        command_receiver: mpsc::Receiver<SyncCommand>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            command_receiver,
            shutdown_token,
            running_ticks: JoinSet::new(),
        }
    }

    /// Main scheduler loop. The first tick runs immediately.
    pub async fn run(&mut self) {
        let interval = self.orchestrator.settings().interval();
        info!(
            "Starting sync scheduler for {} sources every {:?}",
            self.orchestrator.sources().len(),
            interval
        );

        match self.orchestrator.purge_removed_sources().await {
            Ok(purged) if !purged.is_empty() => {
                info!("Purged {} sources removed from configuration", purged.len());
            }
            Ok(_) => {}
            Err(e) => error!("Failed to purge removed sources: {}", e),
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.spawn_tick(None);
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd);
                }
                Some(joined) = self.running_ticks.join_next(), if !self.running_ticks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Sync tick task failed: {}", e);
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Sync scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    fn handle_command(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::RunNow { respond } => {
                debug!("Running sync tick on request");
                self.spawn_tick(Some(respond));
            }
        }
    }

    fn spawn_tick(&mut self, respond: Option<oneshot::Sender<TickReport>>) {
        let orchestrator = self.orchestrator.clone();
        let cancel = self.shutdown_token.child_token();
        self.running_ticks.spawn(async move {
            let report = orchestrator.run_once(&cancel).await;
            if let Some(respond) = respond {
                let _ = respond.send(report);
            }
        });
    }

    async fn shutdown(&mut self) {
        info!("Shutting down sync scheduler...");
        let running = &mut self.running_ticks;
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while running.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Sync ticks did not stop within {:?}, aborting", SHUTDOWN_GRACE);
            self.running_ticks.abort_all();
        }
        info!("Sync scheduler shutdown complete");
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(
    orchestrator: SyncOrchestrator,
    shutdown_token: CancellationToken,
) -> (SyncScheduler, SyncHandle) {
    let (command_tx, command_rx) = mpsc::channel(16);
    let handle = SyncHandle::new(command_tx, orchestrator.clone());
    let scheduler = SyncScheduler::new(orchestrator, command_rx, shutdown_token);
    (scheduler, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::model::{test_meeting, Source, SourceId, SyncPhase};
    use crate::store::{MeetingStore, SqliteMeetingStore};
    use crate::sync::clock::SystemClock;
    use crate::sync::test_support::FakeClient;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_scheduler() -> (SyncScheduler, SyncHandle, Arc<FakeClient>, CancellationToken, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteMeetingStore::new(temp_dir.path().join("meetings.db"), 2).unwrap());
        let client = Arc::new(FakeClient::default());
        client.listing(1, vec![test_meeting(1, 1, 5)]);
        let orchestrator = SyncOrchestrator::new(
            vec![Source::new(1, "http://source1.example.org")],
            client.clone(),
            store,
            Arc::new(SystemClock),
            SyncSettings {
                interval_secs: 3600,
                backoff_initial_secs: 0,
                ..SyncSettings::default()
            },
        );
        let shutdown_token = CancellationToken::new();
        let (scheduler, handle) = create_scheduler(orchestrator, shutdown_token.clone());
        (scheduler, handle, client, shutdown_token, temp_dir)
    }

    #[tokio::test]
    async fn first_tick_runs_immediately_and_run_now_reports() {
        let (mut scheduler, handle, client, shutdown_token, _temp_dir) = create_test_scheduler();
        let running = tokio::spawn(async move { scheduler.run().await });

        let report = handle.run_now().await.unwrap();
        assert_eq!(report.sources.len(), 1);

        // one fetch from the startup tick, possibly skipped run_now aside
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.calls().is_empty());

        let status = handle.status().await.unwrap();
        assert!(status.health.is_healthy());
        assert_eq!(status.sources[0].phase, SyncPhase::Idle);
        let state = status.sources[0].state.as_ref().unwrap();
        assert_eq!(state.meeting_count, 1);

        assert_eq!(handle.problems(SourceId(1), 10).await.unwrap(), Some(vec![]));
        assert!(handle.problems(SourceId(9), 10).await.unwrap().is_none());

        shutdown_token.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            handle.run_now().await,
            Err(crate::sync::SyncHandleError::SchedulerUnavailable)
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_running_ticks() {
        let (mut scheduler, _handle, client, shutdown_token, temp_dir) = create_test_scheduler();
        client.delay(1, Duration::from_secs(10));
        let running = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_token.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();

        let store = SqliteMeetingStore::new(temp_dir.path().join("meetings.db"), 1).unwrap();
        assert!(store.load_source(SourceId(1)).unwrap().meetings.is_empty());
    }
}

use super::backoff::BackoffPolicy;
use super::clock::Clock;
use crate::config::SyncSettings;
use crate::model::{Source, SourceId, SourceSnapshot, SyncErrorKind, SyncPhase, SyncState};
use crate::reconcile::{self, ComparePolicy, PlanMode, SourcePlan};
use crate::server::metrics;
use crate::source_client::{FetchError, FetchErrorKind, FetchMode, SourceClient};
use crate::store::{ApplySummary, MeetingStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cycle did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("cycle cancelled")]
    Cancelled,

    #[error("sync task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Fetch(e) => match e.kind() {
                FetchErrorKind::Timeout => SyncErrorKind::Timeout,
                FetchErrorKind::HttpStatus => SyncErrorKind::HttpStatus,
                FetchErrorKind::Parse => SyncErrorKind::Parse,
                FetchErrorKind::Unreachable => SyncErrorKind::Unreachable,
            },
            SyncError::Store(StoreError::ConstraintViolation(_)) => {
                SyncErrorKind::ConstraintViolation
            }
            SyncError::Store(StoreError::Unavailable(_)) => SyncErrorKind::StoreUnavailable,
            SyncError::DeadlineExceeded(_) => SyncErrorKind::DeadlineExceeded,
            SyncError::Cancelled => SyncErrorKind::Cancelled,
            SyncError::Task(_) => SyncErrorKind::Internal,
        }
    }
}

/// Process-level health of the sync pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    /// Every attempted source kept failing on an unavailable store.
    Degraded {
        reason: String,
        since: DateTime<Utc>,
    },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Synced {
        mode: PlanMode,
        changes: usize,
        problems: usize,
        summary: ApplySummary,
    },
    Failed {
        kind: SyncErrorKind,
        message: String,
    },
    /// The previous cycle of this source was still running.
    SkippedInFlight,
    SkippedBackoff {
        until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub source_id: SourceId,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

/// What one tick did to every enabled source.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl TickReport {
    pub fn outcome(&self, source_id: SourceId) -> Option<&SourceOutcome> {
        self.sources
            .iter()
            .find(|r| r.source_id == source_id)
            .map(|r| &r.outcome)
    }

    pub fn synced_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Synced { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Failed { .. }))
            .count()
    }
}

struct Inner {
    sources: Vec<Source>,
    client: Arc<dyn SourceClient>,
    store: Arc<dyn MeetingStore>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    backoff: BackoffPolicy,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<SourceId>>,
    phases: Mutex<HashMap<SourceId, SyncPhase>>,
    health: watch::Sender<Health>,
    unavailable_streak: AtomicU32,
}

impl Inner {
    fn set_phase(&self, source_id: SourceId, phase: SyncPhase) {
        let mut phases = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        phases.insert(source_id, phase);
    }
}

/// Marks a source as in flight for as long as it lives.
struct InFlightGuard {
    inner: Arc<Inner>,
    source_id: SourceId,
}

impl InFlightGuard {
    fn acquire(inner: &Arc<Inner>, source_id: SourceId) -> Option<Self> {
        let mut in_flight = inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(source_id) {
            return None;
        }
        Some(Self {
            inner: Arc::clone(inner),
            source_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.source_id);
        drop(in_flight);
        self.inner.set_phase(self.source_id, SyncPhase::Idle);
    }
}

struct AppliedCycle {
    mode: PlanMode,
    changes: usize,
    problems: usize,
    change_cutoff: Option<DateTime<Utc>>,
    summary: ApplySummary,
}

/// Drives sync cycles across all configured sources.
///
/// Each tick runs one task per enabled source, bounded by
/// `max_concurrent_sources`. A source whose previous cycle is still running
/// is skipped. Sources never share failures: each one fetches, reconciles and
/// applies on its own and reports its outcome over a channel.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        sources: Vec<Source>,
        client: Arc<dyn SourceClient>,
        store: Arc<dyn MeetingStore>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let (health, _) = watch::channel(Health::Healthy);
        let phases = sources.iter().map(|s| (s.id, SyncPhase::Idle)).collect();
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(settings.max_concurrent_sources.max(1))),
                backoff: BackoffPolicy::new(&settings),
                sources,
                client,
                store,
                clock,
                settings,
                in_flight: Mutex::new(HashSet::new()),
                phases: Mutex::new(phases),
                health,
                unavailable_streak: AtomicU32::new(0),
            }),
        }
    }

    pub fn sources(&self) -> &[Source] {
        &self.inner.sources
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> Arc<dyn MeetingStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn phase(&self, source_id: SourceId) -> SyncPhase {
        let phases = self.inner.phases.lock().unwrap_or_else(|e| e.into_inner());
        phases.get(&source_id).copied().unwrap_or(SyncPhase::Idle)
    }

    pub fn is_in_flight(&self, source_id: SourceId) -> bool {
        let in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.contains(&source_id)
    }

    pub fn health(&self) -> Health {
        self.inner.health.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<Health> {
        self.inner.health.subscribe()
    }

    /// Removes everything stored for sources that are no longer configured.
    pub async fn purge_removed_sources(&self) -> Result<Vec<SourceId>, SyncError> {
        let configured: HashSet<SourceId> = self.inner.sources.iter().map(|s| s.id).collect();
        let stored = self.blocking(|store| store.stored_sources()).await?;

        let mut purged = Vec::new();
        for source_id in stored.into_iter().filter(|id| !configured.contains(id)) {
            let removed = self
                .blocking(move |store| store.purge_source(source_id))
                .await?;
            info!(
                "Purged source {} (no longer configured): {} records removed",
                source_id, removed
            );
            metrics::forget_source(&source_id.to_string());
            purged.push(source_id);
        }
        Ok(purged)
    }

    /// Runs one tick over every enabled source and waits for all of them.
    pub async fn run_once(&self, cancel: &CancellationToken) -> TickReport {
        let started_at = self.inner.clock.now();
        let enabled: Vec<&Source> = self.inner.sources.iter().filter(|s| s.enabled).collect();
        debug!("Sync tick started for {} sources", enabled.len());

        let (report_tx, mut report_rx) = mpsc::channel::<SourceReport>(enabled.len().max(1));
        let mut tasks = JoinSet::new();
        let mut reports = Vec::with_capacity(enabled.len());
        let mut spawned = Vec::with_capacity(enabled.len());

        for source in enabled {
            let Some(guard) = InFlightGuard::acquire(&self.inner, source.id) else {
                debug!("{} is still syncing, skipping this tick", source.display_name());
                reports.push(SourceReport {
                    source_id: source.id,
                    outcome: SourceOutcome::SkippedInFlight,
                });
                continue;
            };
            spawned.push(source.id);

            let orchestrator = self.clone();
            let source = source.clone();
            let report_tx = report_tx.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _guard = guard;
                let outcome = match orchestrator.acquire_permit(&cancel).await {
                    Some(_permit) => orchestrator.sync_source(&source, &cancel).await,
                    None => SourceOutcome::Failed {
                        kind: SyncErrorKind::Cancelled,
                        message: SyncError::Cancelled.to_string(),
                    },
                };
                let _ = report_tx
                    .send(SourceReport {
                        source_id: source.id,
                        outcome,
                    })
                    .await;
            });
        }
        drop(report_tx);

        while let Some(report) = report_rx.recv().await {
            reports.push(report);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Sync task panicked: {}", e);
            }
        }
        for source_id in spawned {
            if !reports.iter().any(|r| r.source_id == source_id) {
                reports.push(SourceReport {
                    source_id,
                    outcome: SourceOutcome::Failed {
                        kind: SyncErrorKind::Internal,
                        message: "sync task ended without reporting".to_string(),
                    },
                });
            }
        }
        reports.sort_by_key(|r| r.source_id);

        self.update_health(&reports);

        let report = TickReport {
            started_at,
            finished_at: self.inner.clock.now(),
            sources: reports,
        };
        info!(
            "Sync tick finished: {} synced, {} failed, {} skipped",
            report.synced_count(),
            report.failed_count(),
            report.sources.len() - report.synced_count() - report.failed_count()
        );
        report
    }

    async fn acquire_permit(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.inner.permits).acquire_owned() => permit.ok(),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MeetingStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
            .map_err(SyncError::from)
    }

    /// One complete cycle for one source, including its bookkeeping.
    async fn sync_source(&self, source: &Source, cancel: &CancellationToken) -> SourceOutcome {
        let source_id = source.id;
        let label = source_id.to_string();
        let started = Instant::now();
        let now = self.inner.clock.now();

        // Without the stored state there is no failure count, cutoff or last
        // success to build on, so the cycle fails and nothing is persisted.
        let mut state = match self.blocking(move |store| store.sync_state(source_id)).await {
            Ok(state) => state.unwrap_or_else(|| SyncState::new(source_id)),
            Err(err) => {
                self.inner.set_phase(source_id, SyncPhase::Failed);
                warn!("Could not load sync state of {}: {}", source.display_name(), err);
                metrics::record_sync_cycle(&label, err.kind().as_str(), started.elapsed());
                return SourceOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                };
            }
        };

        if let Some(until) = self.inner.backoff.retry_at(&state).filter(|at| now < *at) {
            debug!(
                "{} is backing off after {} failures until {}",
                source.display_name(),
                state.consecutive_failures,
                until
            );
            return SourceOutcome::SkippedBackoff { until };
        }

        let result = self.run_cycle(source, &state, cancel).await;
        let outcome = match result {
            Ok(applied) => {
                state.record_success(
                    now,
                    applied.change_cutoff,
                    applied.summary.meeting_count,
                    applied.summary.service_body_count,
                    applied.problems,
                );
                info!(
                    "Synced {}: {} changes, {} meetings stored, {} entries skipped",
                    source.display_name(),
                    applied.changes,
                    applied.summary.meeting_count,
                    applied.problems
                );
                SourceOutcome::Synced {
                    mode: applied.mode,
                    changes: applied.changes,
                    problems: applied.problems,
                    summary: applied.summary,
                }
            }
            Err(SyncError::Cancelled) => {
                // Nothing was applied and the attempt does not count as a failure.
                info!("Sync of {} cancelled", source.display_name());
                metrics::record_sync_cycle(&label, SyncErrorKind::Cancelled.as_str(), started.elapsed());
                return SourceOutcome::Failed {
                    kind: SyncErrorKind::Cancelled,
                    message: SyncError::Cancelled.to_string(),
                };
            }
            Err(err) => {
                self.inner.set_phase(source_id, SyncPhase::Failed);
                warn!("Sync of {} failed: {}", source.display_name(), err);
                state.record_failure(now, err.kind(), err.to_string());
                SourceOutcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                }
            }
        };

        let outcome_label = match &outcome {
            SourceOutcome::Failed { kind, .. } => kind.as_str(),
            _ => "synced",
        };
        metrics::record_sync_cycle(&label, outcome_label, started.elapsed());

        let persisted = state.clone();
        if let Err(e) = self
            .blocking(move |store| store.record_sync_state(&persisted))
            .await
        {
            error!("Could not record sync state of {}: {}", source.display_name(), e);
        }
        outcome
    }

    /// Fetch and reconcile under the cycle deadline, then apply. Once apply
    /// starts it runs to completion; it is a single transaction.
    async fn run_cycle(
        &self,
        source: &Source,
        state: &SyncState,
        cancel: &CancellationToken,
    ) -> Result<AppliedCycle, SyncError> {
        let deadline = self.inner.settings.cycle_timeout();
        let plan = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            planned = tokio::time::timeout(deadline, self.fetch_and_reconcile(source, state)) => {
                match planned {
                    Ok(plan) => plan?,
                    Err(_) => return Err(SyncError::DeadlineExceeded(deadline)),
                }
            }
        };

        if !plan.errors.is_empty() {
            warn!(
                "{}: {} records excluded during reconciliation",
                source.display_name(),
                plan.errors.len()
            );
        }
        if plan.is_empty() {
            debug!("{}: no changes", source.display_name());
        }

        self.inner.set_phase(source.id, SyncPhase::Applying);
        let plan = Arc::new(plan);
        let applying = Arc::clone(&plan);
        let summary = self.blocking(move |store| store.apply(&applying)).await?;
        metrics::record_applied_plan(&source.id.to_string(), &plan, summary.meeting_count);

        Ok(AppliedCycle {
            mode: plan.mode,
            changes: plan.change_count(),
            problems: plan.problems.len(),
            change_cutoff: plan.change_cutoff,
            summary,
        })
    }

    async fn fetch_and_reconcile(
        &self,
        source: &Source,
        state: &SyncState,
    ) -> Result<SourcePlan, SyncError> {
        let source_id = source.id;
        let policy = ComparePolicy::for_source(source);
        let previous = self
            .blocking(move |store| store.load_source(source_id))
            .await?;

        let mode = match state.change_cutoff {
            Some(cutoff) if source.incremental => FetchMode::ChangedSince(cutoff),
            _ => FetchMode::Full,
        };

        self.inner.set_phase(source_id, SyncPhase::Fetching);
        let listing = self.inner.client.fetch(source, mode).await?;
        self.inner.set_phase(source_id, SyncPhase::Reconciling);

        let plan = match mode {
            FetchMode::Full => reconcile::diff(source_id, &previous, listing, policy),
            FetchMode::ChangedSince(cutoff) => {
                if listing.change_cutoff.is_some_and(|reported| reported < cutoff) {
                    warn!(
                        "{} reported changes up to {:?}, before the stored cutoff {}; refetching in full",
                        source.display_name(),
                        listing.change_cutoff,
                        cutoff
                    );
                    self.inner.set_phase(source_id, SyncPhase::Fetching);
                    let listing = self.inner.client.fetch(source, FetchMode::Full).await?;
                    self.inner.set_phase(source_id, SyncPhase::Reconciling);
                    let mut plan =
                        reconcile::diff(source_id, &SourceSnapshot::default(), listing, policy);
                    plan.mode = PlanMode::Reset;
                    plan
                } else {
                    let mut plan = reconcile::diff_incremental(source_id, &previous, listing, policy);
                    plan.change_cutoff = plan.change_cutoff.or(Some(cutoff));
                    plan
                }
            }
        };
        Ok(plan)
    }

    fn update_health(&self, reports: &[SourceReport]) {
        let attempted: Vec<&SourceReport> = reports
            .iter()
            .filter(|r| match &r.outcome {
                SourceOutcome::Synced { .. } => true,
                SourceOutcome::Failed { kind, .. } => *kind != SyncErrorKind::Cancelled,
                _ => false,
            })
            .collect();
        if attempted.is_empty() {
            return;
        }

        let all_unavailable = attempted.iter().all(|r| {
            matches!(
                r.outcome,
                SourceOutcome::Failed {
                    kind: SyncErrorKind::StoreUnavailable,
                    ..
                }
            )
        });

        if all_unavailable {
            let streak = self.inner.unavailable_streak.fetch_add(1, Ordering::SeqCst) + 1;
            let threshold = self.inner.settings.unavailable_escalation_ticks;
            if streak >= threshold && self.health().is_healthy() {
                let reason = format!(
                    "store unavailable for every source in {} consecutive ticks",
                    streak
                );
                error!("Sync degraded: {}", reason);
                self.inner.health.send_replace(Health::Degraded {
                    reason,
                    since: self.inner.clock.now(),
                });
                metrics::set_sync_healthy(false);
            }
        } else {
            self.inner.unavailable_streak.store(0, Ordering::SeqCst);
            if !self.health().is_healthy() {
                info!("Store reachable again, sync healthy");
                self.inner.health.send_replace(Health::Healthy);
                metrics::set_sync_healthy(true);
            }
        }
    }
}

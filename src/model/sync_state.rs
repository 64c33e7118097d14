use super::SourceId;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Reconciling,
    Applying,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::Applying => "applying",
            SyncPhase::Failed => "failed",
        }
    }
}

/// Coarse classification of why a cycle failed, persisted with the sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    Timeout,
    HttpStatus,
    Parse,
    Unreachable,
    ConstraintViolation,
    StoreUnavailable,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::Timeout => "timeout",
            SyncErrorKind::HttpStatus => "http_status",
            SyncErrorKind::Parse => "parse",
            SyncErrorKind::Unreachable => "unreachable",
            SyncErrorKind::ConstraintViolation => "constraint_violation",
            SyncErrorKind::StoreUnavailable => "store_unavailable",
            SyncErrorKind::DeadlineExceeded => "deadline_exceeded",
            SyncErrorKind::Cancelled => "cancelled",
            SyncErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(SyncErrorKind::Timeout),
            "http_status" => Some(SyncErrorKind::HttpStatus),
            "parse" => Some(SyncErrorKind::Parse),
            "unreachable" => Some(SyncErrorKind::Unreachable),
            "constraint_violation" => Some(SyncErrorKind::ConstraintViolation),
            "store_unavailable" => Some(SyncErrorKind::StoreUnavailable),
            "deadline_exceeded" => Some(SyncErrorKind::DeadlineExceeded),
            "cancelled" => Some(SyncErrorKind::Cancelled),
            "internal" => Some(SyncErrorKind::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub kind: SyncErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Per-source bookkeeping, written by the orchestrator after each completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub source_id: SourceId,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    /// Highest last-changed marker the source has reported so far.
    pub change_cutoff: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub meeting_count: usize,
    pub service_body_count: usize,
    /// Entries skipped or excluded during the last applied cycle.
    pub skipped_count: usize,
}

impl SyncState {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            last_success_at: None,
            last_attempt_at: None,
            last_error: None,
            change_cutoff: None,
            consecutive_failures: 0,
            meeting_count: 0,
            service_body_count: 0,
            skipped_count: 0,
        }
    }

    pub fn record_success(
        &mut self,
        at: DateTime<Utc>,
        change_cutoff: Option<DateTime<Utc>>,
        meeting_count: usize,
        service_body_count: usize,
        skipped_count: usize,
    ) {
        self.last_attempt_at = Some(at);
        self.last_success_at = Some(at);
        self.last_error = None;
        self.consecutive_failures = 0;
        self.change_cutoff = change_cutoff;
        self.meeting_count = meeting_count;
        self.service_body_count = service_body_count;
        self.skipped_count = skipped_count;
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, kind: SyncErrorKind, message: String) {
        self.last_attempt_at = Some(at);
        self.last_error = Some(LastError { kind, message, at });
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// An upstream entry that was skipped or excluded during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportProblem {
    pub source_id: SourceId,
    pub message: String,
    /// Raw JSON of the offending entry, when there is one.
    pub data: Option<String>,
}

impl ImportProblem {
    pub fn new(source_id: SourceId, message: impl Into<String>, data: Option<String>) -> Self {
        Self {
            source_id,
            message: message.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_then_success_resets_counter() {
        let now = Utc::now();
        let mut state = SyncState::new(SourceId(1));
        state.record_failure(now, SyncErrorKind::Timeout, "slow".to_string());
        state.record_failure(now, SyncErrorKind::HttpStatus, "502".to_string());
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_error.as_ref().unwrap().kind, SyncErrorKind::HttpStatus);
        assert!(state.last_success_at.is_none());

        state.record_success(now, None, 4, 2, 0);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
        assert_eq!(state.meeting_count, 4);
    }

    #[test]
    fn error_kind_round_trips_through_str() {
        for kind in [
            SyncErrorKind::Timeout,
            SyncErrorKind::ConstraintViolation,
            SyncErrorKind::StoreUnavailable,
            SyncErrorKind::Cancelled,
        ] {
            assert_eq!(SyncErrorKind::parse(kind.as_str()), Some(kind));
        }
    }
}

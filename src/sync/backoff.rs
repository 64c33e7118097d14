//! Backoff across consecutive failed cycles of a source.
//!
//! Failed sources are never retried inside a cycle. Backoff only decides
//! whether a later tick should attempt the source again yet.

use crate::config::SyncSettings;
use crate::model::SyncState;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl BackoffPolicy {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            initial_backoff_secs: settings.backoff_initial_secs,
            max_backoff_secs: settings.backoff_max_secs,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.initial_backoff_secs == 0
    }

    /// `initial * multiplier^(failures - 1)`, capped at the maximum.
    pub fn backoff_secs(&self, consecutive_failures: u32) -> u64 {
        if self.is_disabled() || consecutive_failures == 0 {
            return 0;
        }
        let exponent = (consecutive_failures - 1).min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_secs as f64) as u64
    }

    /// When the source may be attempted again, if it is currently backing off.
    pub fn retry_at(&self, state: &SyncState) -> Option<DateTime<Utc>> {
        let error = state.last_error.as_ref()?;
        let secs = self.backoff_secs(state.consecutive_failures);
        if secs == 0 {
            return None;
        }
        Some(error.at + Duration::seconds(secs.min(i64::MAX as u64) as i64))
    }

    /// True when `now` is still inside the source's backoff window.
    pub fn is_backing_off(&self, state: &SyncState, now: DateTime<Utc>) -> bool {
        self.retry_at(state).is_some_and(|at| now < at)
    }
}

//! Activity tracking
//!
//! Detects quiet periods so the sleep cycle runs when nobody is using the
//! engine. Every user-initiated operation records an activity event; the
//! background loop polls `should_run_auto` on its check interval.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Maximum activity events retained
const MAX_LOG_SIZE: usize = 1000;

/// Window for the events-per-minute rate
const RATE_WINDOW_SECS: i64 = 300;

/// Activity statistics
#[derive(Debug, Clone, Serialize)]
pub struct ActivityStats {
    /// Activity events currently tracked
    pub total_events: usize,
    /// Events per minute over the recent window
    pub events_per_minute: f64,
    /// Timestamp of last activity
    pub last_activity: Option<DateTime<Utc>>,
    /// Whether the quiet period has elapsed
    pub is_quiet: bool,
}

/// Tracks user activity to detect quiet periods
pub struct ActivityTracker {
    log: Mutex<VecDeque<DateTime<Utc>>>,
    last_cycle: Mutex<Option<DateTime<Utc>>>,
    quiet_period: Duration,
    min_cycle_gap: Duration,
}

impl ActivityTracker {
    /// Create with the given quiet period and minimum gap between auto cycles
    pub fn new(quiet_period_ms: u64, min_cycle_gap_ms: u64) -> Self {
        Self {
            log: Mutex::new(VecDeque::with_capacity(MAX_LOG_SIZE)),
            last_cycle: Mutex::new(None),
            quiet_period: Duration::milliseconds(quiet_period_ms as i64),
            min_cycle_gap: Duration::milliseconds(min_cycle_gap_ms as i64),
        }
    }

    /// Record a user-initiated operation
    pub fn record_activity(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.push_back(Utc::now());
            while log.len() > MAX_LOG_SIZE {
                log.pop_front();
            }
        }
    }

    /// Time since the last recorded activity, `None` if none ever
    pub fn time_since_last_activity(&self) -> Option<Duration> {
        self.log
            .lock()
            .ok()
            .and_then(|log| log.back().copied())
            .map(|last| Utc::now() - last)
    }

    /// Whether the quiet period has elapsed since the last activity
    ///
    /// A tracker that has never seen activity counts as quiet.
    pub fn is_quiet(&self) -> bool {
        self.time_since_last_activity()
            .map(|idle| idle >= self.quiet_period)
            .unwrap_or(true)
    }

    /// Whether an automatic sleep cycle may start now
    ///
    /// Requires the quiet period to have elapsed and the minimum gap since
    /// the previous cycle to be respected. Forced cycles skip this check.
    pub fn should_run_auto(&self, now: DateTime<Utc>) -> bool {
        if !self.is_quiet() {
            return false;
        }
        let last_cycle = self.last_cycle.lock().ok().and_then(|guard| *guard);
        match last_cycle {
            Some(last) => now - last >= self.min_cycle_gap,
            None => true,
        }
    }

    /// Record that a sleep cycle ran
    pub fn mark_cycle(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.last_cycle.lock() {
            *guard = Some(now);
        }
    }

    /// Activity statistics
    pub fn stats(&self) -> ActivityStats {
        let (total_events, last_activity, recent) = self
            .log
            .lock()
            .map(|log| {
                let window_start = Utc::now() - Duration::seconds(RATE_WINDOW_SECS);
                let recent = log.iter().filter(|&&t| t >= window_start).count();
                (log.len(), log.back().copied(), recent)
            })
            .unwrap_or((0, None, 0));

        ActivityStats {
            total_events,
            events_per_minute: recent as f64 / (RATE_WINDOW_SECS as f64 / 60.0),
            last_activity,
            is_quiet: self.is_quiet(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

// botsift/src/state.rs
//
// Per-key statistical record and the event application algorithm.
//
// A KeyState is only ever touched by the worker that currently owns its key,
// so it carries no lock of its own. It is persisted as JSON in the key_state
// table and updated in the same transaction that deletes the applied events
// from the ingestion buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{ClassLabel, LogEvent};
use crate::stats::Series;

/// Deltas at or above this age are not recorded (2 days in milliseconds).
pub const STALE_AFTER_MS: i64 = 2 * 86_400 * 1000;

/// Recent distinct user agents kept per key.
pub const MAX_USER_AGENTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    pub latest:           Option<LogEvent>,
    pub diffs:            Series<i64>,
    pub hour_diffs:       Series<u8>,
    pub hours:            [u64; 24],
    pub requests:         u64,
    pub pages:            u64,
    pub errors:           u64,
    pub user_agents:      VecDeque<String>,
    pub class_label:      Option<ClassLabel>,
    pub prediction:       Option<f64>,
    /// Highest ingestion-buffer sequence number folded into this record.
    pub applied_through:  i64,
    pub updated_at:       DateTime<Utc>,
}

/// What applying one event did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Sub-resource request: counters and user agents only.
    Counted,
    /// First page view for the key: `latest` set, no delta.
    First,
    /// Page view appended a delta to the distributions.
    Delta,
    /// Page view after a gap beyond STALE_AFTER_MS: `latest` advanced, no delta.
    Stale,
    /// Page view older than `latest` (clock skew, old log replay). Ignored.
    Discarded,
    /// Already applied (by sequence number, identical to `latest`, or a
    /// sub-resource older than `latest`). Ignored.
    Replay,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            latest:          None,
            diffs:           Series::new(),
            hour_diffs:      Series::new(),
            hours:           [0; 24],
            requests:        0,
            pages:           0,
            errors:          0,
            user_agents:     VecDeque::new(),
            class_label:     None,
            prediction:      None,
            applied_through: 0,
            updated_at:      Utc::now(),
        }
    }
}

impl KeyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one buffered event (`seq` = its buffer sequence number) into the record.
    pub fn apply(&mut self, seq: i64, event: &LogEvent) -> Applied {
        if seq <= self.applied_through {
            return Applied::Replay;
        }
        let outcome = self.apply_event(event);
        self.applied_through = seq;
        if outcome != Applied::Replay {
            self.updated_at = Utc::now();
        }
        outcome
    }

    /// Fold an event that has no buffer sequence number.
    pub fn apply_event(&mut self, event: &LogEvent) -> Applied {
        if !event.is_page() {
            // a sub-resource fetch older than the latest page view was
            // already counted with that page's batch
            if self.latest.as_ref().is_some_and(|l| event.epoch_ms < l.epoch_ms) {
                return Applied::Replay;
            }
            self.count(event);
            return Applied::Counted;
        }

        let Some(latest) = self.latest.as_ref() else {
            self.count(event);
            self.latest = Some(event.clone());
            return Applied::First;
        };

        if latest.same_observation(event) {
            return Applied::Replay;
        }

        let diff = event.epoch_ms - latest.epoch_ms;
        if diff < 0 {
            return Applied::Discarded;
        }

        let outcome = if diff < STALE_AFTER_MS {
            let hour_diff = (i16::from(event.hour) - i16::from(latest.hour)).unsigned_abs() as u8;
            self.diffs.push(diff);
            self.hour_diffs.push(hour_diff);
            self.hours[usize::from(event.hour)] += 1;
            Applied::Delta
        } else {
            Applied::Stale
        };

        self.count(event);
        self.latest = Some(event.clone());
        outcome
    }

    fn count(&mut self, event: &LogEvent) {
        self.requests += 1;
        if event.is_error() {
            self.errors += 1;
        }
        if event.is_page() {
            self.pages += 1;
        }
        self.remember_user_agent(&event.user_agent);
    }

    fn remember_user_agent(&mut self, ua: &str) {
        if self.user_agents.iter().any(|u| u == ua) {
            return;
        }
        if self.user_agents.len() >= MAX_USER_AGENTS {
            self.user_agents.pop_front();
        }
        self.user_agents.push_back(ua.to_string());
    }

    /// Structural checks run after load and before every commit.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.diffs.len() != self.hour_diffs.len() {
            return Err(format!(
                "diffs/hour_diffs length mismatch: {} vs {}",
                self.diffs.len(), self.hour_diffs.len()
            ));
        }
        if self.pages > self.requests || self.errors > self.requests {
            return Err(format!(
                "counter overflow: requests={} pages={} errors={}",
                self.requests, self.pages, self.errors
            ));
        }
        if self.hour_diffs.iter().any(|&h| h > 23) {
            return Err("hour delta outside 0..=23".into());
        }
        Ok(())
    }
}

// botsift/src/storage/key_state.rs
//
// Key state store and the per-key drain transaction.
//
// drain_key is the only writer of statistics. Inside one transaction it:
//   1. loads the key's KeyState (or starts a fresh one)
//   2. reads up to `batch` pending rows in seq order
//   3. folds them into the state
//   4. checks the state's structural invariants
//   5. upserts the state and deletes pending rows through the watermark
// Any failure before commit rolls the whole thing back and leaves the rows
// pending, so a poisoned key never loses or half-applies events.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::buffer::{delete_through, fetch_pending};
use super::Storage;
use crate::error::{EngineError, Result};
use crate::events::{ClassLabel, Key};
use crate::state::{Applied, KeyState};

/// Result of one drain transaction for one key.
#[derive(Debug, Clone, Default)]
pub struct DrainOutcome {
    /// State as committed.
    pub state:      KeyState,
    /// Rows read and deleted in this transaction.
    pub rows:       usize,
    pub deltas:     usize,
    pub counted:    usize,
    pub discarded:  usize,
    pub replayed:   usize,
    pub stale:      usize,
    pub malformed:  usize,
    /// Highest seq deleted, `None` when nothing was pending.
    pub watermark:  Option<i64>,
    /// The batch was full; more rows may be waiting.
    pub more:       bool,
}

impl DrainOutcome {
    fn tally(&mut self, applied: Applied) {
        match applied {
            Applied::Delta               => self.deltas += 1,
            Applied::Counted
            | Applied::First             => self.counted += 1,
            Applied::Discarded           => self.discarded += 1,
            Applied::Replay              => self.replayed += 1,
            Applied::Stale               => self.stale += 1,
        }
    }
}

impl Storage {
    /// Persisted state for `key`, if it was ever drained.
    pub fn load_state(&self, key: &Key) -> Result<Option<KeyState>> {
        let raw = self.with_conn(|conn| read_state(conn, key))?;
        raw.map(|json| decode_state(key, &json)).transpose()
    }

    /// Apply up to `batch` pending events for `key` atomically.
    pub fn drain_key(&self, key: &Key, batch: usize) -> Result<DrainOutcome> {
        let batch = batch.max(1);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let mut state = match read_state(&tx, key)? {
                Some(json) => match decode_state(key, &json) {
                    Ok(s)  => s,
                    Err(e) => return Ok(Err(e)),
                },
                None => KeyState::new(),
            };

            let pending = fetch_pending(&tx, key, batch)?;
            let mut out = DrainOutcome {
                rows:  pending.len(),
                more:  pending.len() == batch,
                ..DrainOutcome::default()
            };

            if pending.is_empty() {
                out.state = state;
                return Ok(Ok(out));
            }

            for row in &pending {
                if row.event.hour > 23 {
                    warn!(key = %key, seq = row.seq, "discarding buffered event with invalid hour");
                    out.malformed += 1;
                    continue;
                }
                let applied = state.apply(row.seq, &row.event);
                out.tally(applied);
            }
            let watermark = pending.last().map(|p| p.seq).unwrap_or_default();
            state.applied_through = state.applied_through.max(watermark);

            if let Err(detail) = state.check_invariants() {
                return Ok(Err(EngineError::invariant(key, detail)));
            }

            let json = match serde_json::to_string(&state) {
                Ok(j)  => j,
                Err(e) => return Ok(Err(EngineError::Encoding(e))),
            };
            write_state(&tx, key, &json, &state)?;
            delete_through(&tx, key, watermark)?;
            tx.commit()?;

            debug!(
                key = %key, rows = out.rows, deltas = out.deltas,
                discarded = out.discarded, replayed = out.replayed, watermark,
                "drained"
            );
            out.watermark = Some(watermark);
            out.state = state;
            Ok(Ok(out))
        })?
    }

    /// Store the latest score and class label for `key`.
    pub fn record_prediction(
        &self,
        key:        &Key,
        prediction: Option<f64>,
        label:      Option<ClassLabel>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut state = match read_state(&tx, key)? {
                Some(json) => match decode_state(key, &json) {
                    Ok(s)  => s,
                    Err(e) => return Ok(Err(e)),
                },
                None => KeyState::new(),
            };
            if prediction.is_some() {
                state.prediction = prediction;
            }
            if label.is_some() {
                state.class_label = label;
            }
            state.updated_at = Utc::now();

            let json = match serde_json::to_string(&state) {
                Ok(j)  => j,
                Err(e) => return Ok(Err(EngineError::Encoding(e))),
            };
            write_state(&tx, key, &json, &state)?;
            tx.commit()?;
            Ok(Ok(()))
        })?
    }
}

fn read_state(conn: &Connection, key: &Key) -> rusqlite::Result<Option<String>> {
    conn.prepare_cached("SELECT state FROM key_state WHERE host = ?1 AND address = ?2")?
        .query_row(params![key.host, key.address], |r| r.get(0))
        .optional()
}

fn decode_state(key: &Key, json: &str) -> Result<KeyState> {
    let state: KeyState = serde_json::from_str(json)
        .map_err(|e| EngineError::invariant(key, format!("undecodable state: {}", e)))?;
    state
        .check_invariants()
        .map_err(|detail| EngineError::invariant(key, detail))?;
    Ok(state)
}

fn write_state(conn: &Connection, key: &Key, json: &str, state: &KeyState) -> rusqlite::Result<usize> {
    conn.prepare_cached(
        "INSERT INTO key_state (host, address, state, prediction, class, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(host, address) DO UPDATE SET
             state      = excluded.state,
             prediction = excluded.prediction,
             class      = excluded.class,
             updated_at = excluded.updated_at",
    )?
    .execute(params![
        key.host,
        key.address,
        json,
        state.prediction,
        state.class_label.map(|c| c.to_string()),
        state.updated_at.timestamp_millis(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::LogEvent;
    use crate::storage::testutil::temp_storage;

    fn page(epoch_ms: i64, hour: u8) -> LogEvent {
        LogEvent {
            key:          Key::new("example.org", "10.1.1.1"),
            hour,
            status_line:  "200".into(),
            user_agent:   "Mozilla/5.0".into(),
            epoch_ms,
            content_type: "text/html".into(),
        }
    }

    fn key() -> Key {
        Key::new("example.org", "10.1.1.1")
    }

    #[test]
    fn drain_applies_and_clears() {
        let (_d, s) = temp_storage(2);
        s.append(&[page(1000, 10), page(1500, 10), page(2300, 10)]).unwrap();

        let out = s.drain_key(&key(), 100).unwrap();
        assert_eq!(out.rows, 3);
        assert_eq!(out.deltas, 2);
        assert!(!out.more);
        assert_eq!(out.state.diffs.to_vec(), vec![500, 800]);
        assert_eq!(out.state.hours[10], 2);
        assert_eq!(s.pending_count(&key()).unwrap(), 0);

        let stored = s.load_state(&key()).unwrap().unwrap();
        assert_eq!(stored.diffs.to_vec(), vec![500, 800]);
        assert_eq!(stored.requests, 3);
    }

    #[test]
    fn empty_drain_commits_nothing() {
        let (_d, s) = temp_storage(1);
        let out = s.drain_key(&key(), 10).unwrap();
        assert_eq!(out.rows, 0);
        assert!(out.watermark.is_none());
        assert!(s.load_state(&key()).unwrap().is_none());
    }

    #[test]
    fn batches_continue_where_they_left_off() {
        let (_d, s) = temp_storage(1);
        let events: Vec<_> = (0..5).map(|i| page(1000 + i * 100, 3)).collect();
        s.append(&events).unwrap();

        let first = s.drain_key(&key(), 2).unwrap();
        assert!(first.more);
        assert_eq!(first.rows, 2);
        assert_eq!(s.pending_count(&key()).unwrap(), 3);

        let second = s.drain_key(&key(), 2).unwrap();
        let third = s.drain_key(&key(), 2).unwrap();
        assert_eq!(second.rows + third.rows, 3);
        assert!(!third.more);
        assert_eq!(third.state.diffs.to_vec(), vec![100, 100, 100, 100]);
    }

    #[test]
    fn corrupt_state_leaves_events_pending() {
        let (_d, s) = temp_storage(1);
        s.with_conn(|c| {
            c.execute(
                "INSERT INTO key_state (host, address, state, updated_at) VALUES (?1, ?2, '{oops', 0)",
                params!["example.org", "10.1.1.1"],
            )
        })
        .unwrap();
        s.append(&[page(1000, 1), page(2000, 1)]).unwrap();

        let err = s.drain_key(&key(), 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert_eq!(s.pending_count(&key()).unwrap(), 2);

        // siblings are unaffected
        let other = Key::new("example.org", "10.9.9.9");
        s.append(&[LogEvent { key: other.clone(), ..page(1, 1) }]).unwrap();
        assert_eq!(s.drain_key(&other, 10).unwrap().rows, 1);
    }

    #[test]
    fn rows_below_applied_through_are_replays() {
        let (_d, s) = temp_storage(1);
        s.append(&[page(1000, 1), page(1200, 1)]).unwrap();
        let out = s.drain_key(&key(), 10).unwrap();
        let through = out.state.applied_through;

        // a redelivered row carrying an already-applied sequence number
        s.with_conn(|c| {
            c.execute(
                "INSERT INTO pending_events
                   (seq, host, address, hour, status_line, user_agent, epoch_ms, content_type, received_at)
                 VALUES (?1, 'example.org', '10.1.1.1', 1, '200', 'x', 5000, 'text/html', 0)",
                params![through - 1],
            )
        })
        .unwrap();

        let again = s.drain_key(&key(), 10).unwrap();
        assert_eq!(again.replayed, 1);
        assert_eq!(again.state.diffs.to_vec(), vec![200]);
        assert_eq!(s.pending_count(&key()).unwrap(), 0);
    }

    #[test]
    fn invalid_hour_row_is_dropped_alone() {
        let (_d, s) = temp_storage(1);
        s.append(&[page(1000, 1)]).unwrap();
        s.with_conn(|c| {
            c.execute(
                "INSERT INTO pending_events
                   (host, address, hour, status_line, user_agent, epoch_ms, content_type, received_at)
                 VALUES ('example.org', '10.1.1.1', 99, '200', 'x', 1100, 'text/html', 0)",
                [],
            )
        })
        .unwrap();
        s.append(&[page(1300, 1)]).unwrap();

        let out = s.drain_key(&key(), 10).unwrap();
        assert_eq!(out.malformed, 1);
        assert_eq!(out.state.diffs.to_vec(), vec![300]);
        assert_eq!(s.pending_count(&key()).unwrap(), 0);
    }

    #[test]
    fn prediction_is_persisted_with_state() {
        let (_d, s) = temp_storage(1);
        s.append(&[page(1000, 1), page(1100, 1)]).unwrap();
        s.drain_key(&key(), 10).unwrap();

        s.record_prediction(&key(), Some(-0.4), Some(ClassLabel::Human)).unwrap();
        let st = s.load_state(&key()).unwrap().unwrap();
        assert_eq!(st.prediction, Some(-0.4));
        assert_eq!(st.class_label, Some(ClassLabel::Human));
        assert_eq!(st.diffs.to_vec(), vec![100]);

        let class: String = s
            .with_conn(|c| {
                c.query_row(
                    "SELECT class FROM key_state WHERE host = 'example.org' AND address = '10.1.1.1'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(class, "human");
    }
}

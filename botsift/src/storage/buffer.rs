// botsift/src/storage/buffer.rs
//
// Durable ingestion buffer. Append-only from ingestion, drained per key by the
// owning worker. A drain deletes through a watermark (the highest seq it
// applied), so rows appended for the same key while the drain ran survive.

use chrono::Utc;
use rusqlite::{params, Connection};

use super::Storage;
use crate::error::Result;
use crate::events::{Key, LogEvent};

/// One buffered event and its arrival sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub seq:   i64,
    pub event: LogEvent,
}

impl Storage {
    /// Append a batch of events in one transaction. Returns rows written.
    pub fn append(&self, events: &[LogEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let received_at = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO pending_events
                       (host, address, hour, status_line, user_agent, epoch_ms, content_type, received_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for ev in events {
                    stmt.execute(params![
                        ev.key.host, ev.key.address, ev.hour, ev.status_line,
                        ev.user_agent, ev.epoch_ms, ev.content_type, received_at,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(events.len())
        })
    }

    /// Number of events waiting for `key`.
    pub fn pending_count(&self, key: &Key) -> Result<u64> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT COUNT(*) FROM pending_events WHERE host = ?1 AND address = ?2",
            )?
            .query_row(params![key.host, key.address], |r| r.get::<_, i64>(0))
            .map(|n| n as u64)
        })
    }

    /// Up to `limit` distinct keys that have buffered events.
    pub fn pending_keys(&self, limit: usize) -> Result<Vec<Key>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT host, address FROM pending_events LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |r| {
                Ok(Key::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            rows.collect()
        })
    }

    /// Total buffered events across all keys.
    pub fn pending_total(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM pending_events", [], |r| r.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    /// Oldest-first events for `key`, at most `limit`.
    pub fn peek_pending(&self, key: &Key, limit: usize) -> Result<Vec<PendingEvent>> {
        self.with_conn(|conn| fetch_pending(conn, key, limit))
    }
}

/// Rows whose hour no longer fits 0..=23 are returned with `hour = 255` so the
/// caller can discard them as malformed without failing the whole key.
pub(super) fn fetch_pending(
    conn:  &Connection,
    key:   &Key,
    limit: usize,
) -> rusqlite::Result<Vec<PendingEvent>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, hour, status_line, user_agent, epoch_ms, content_type
           FROM pending_events
          WHERE host = ?1 AND address = ?2
          ORDER BY seq
          LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![key.host, key.address, limit as i64], |r| {
        let hour: i64 = r.get(1)?;
        Ok(PendingEvent {
            seq: r.get(0)?,
            event: LogEvent {
                key:          key.clone(),
                hour:         u8::try_from(hour).ok().filter(|h| *h <= 23).unwrap_or(u8::MAX),
                status_line:  r.get(2)?,
                user_agent:   r.get(3)?,
                epoch_ms:     r.get(4)?,
                content_type: r.get(5)?,
            },
        })
    })?;
    rows.collect()
}

/// Delete every row for `key` up to and including `watermark`.
pub(super) fn delete_through(conn: &Connection, key: &Key, watermark: i64) -> rusqlite::Result<usize> {
    conn.prepare_cached(
        "DELETE FROM pending_events WHERE host = ?1 AND address = ?2 AND seq <= ?3",
    )?
    .execute(params![key.host, key.address, watermark])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::temp_storage;

    fn ev(host: &str, addr: &str, epoch_ms: i64) -> LogEvent {
        LogEvent {
            key:          Key::new(host, addr),
            hour:         4,
            status_line:  "200".into(),
            user_agent:   "ua".into(),
            epoch_ms,
            content_type: "text/html".into(),
        }
    }

    #[test]
    fn counts_are_per_key() {
        let (_d, s) = temp_storage(2);
        s.append(&[ev("a", "1.1.1.1", 1), ev("a", "1.1.1.1", 2), ev("b", "2.2.2.2", 3)]).unwrap();

        assert_eq!(s.pending_count(&Key::new("a", "1.1.1.1")).unwrap(), 2);
        assert_eq!(s.pending_count(&Key::new("b", "2.2.2.2")).unwrap(), 1);
        assert_eq!(s.pending_count(&Key::new("a", "2.2.2.2")).unwrap(), 0);
        assert_eq!(s.pending_total().unwrap(), 3);

        let mut keys = s.pending_keys(10).unwrap();
        keys.sort();
        assert_eq!(keys, vec![Key::new("a", "1.1.1.1"), Key::new("b", "2.2.2.2")]);
        assert_eq!(s.pending_keys(1).unwrap().len(), 1);
    }

    #[test]
    fn pending_is_in_arrival_order() {
        let (_d, s) = temp_storage(1);
        s.append(&[ev("a", "x", 30), ev("a", "x", 10)]).unwrap();
        s.append(&[ev("a", "x", 20)]).unwrap();

        let pending = s.peek_pending(&Key::new("a", "x"), 100).unwrap();
        let epochs: Vec<i64> = pending.iter().map(|p| p.event.epoch_ms).collect();
        assert_eq!(epochs, vec![30, 10, 20]);
        assert!(pending.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn delete_through_spares_later_appends() {
        let (_d, s) = temp_storage(2);
        let key = Key::new("a", "x");
        s.append(&[ev("a", "x", 1), ev("a", "x", 2)]).unwrap();
        let seen = s.peek_pending(&key, 100).unwrap();
        let watermark = seen.last().unwrap().seq;

        // arrives while the drain is in flight
        s.append(&[ev("a", "x", 3)]).unwrap();

        let deleted = s.with_conn(|c| delete_through(c, &key, watermark)).unwrap();
        assert_eq!(deleted, 2);
        let left = s.peek_pending(&key, 100).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event.epoch_ms, 3);
    }

    #[test]
    fn concurrent_appends_all_land() {
        let (_d, s) = temp_storage(4);
        let s = std::sync::Arc::new(s);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        s.append(&[ev("h", &format!("10.0.0.{}", t), i)]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.pending_total().unwrap(), 100);
    }
}

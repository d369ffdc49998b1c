// botsift/src/storage/mod.rs
//
// Durable ingestion buffer + key state store, both in one SQLite database
// (WAL mode, so ingestion appends and per-key drains proceed concurrently).
//
// Data layout:
//   pending_events(seq, host, address, ...) : append-only buffer, seq = arrival order
//   key_state(host, address, state JSON)    : one statistical record per key
//
// Connections come from a fixed pool and are handed out as scoped guards, so
// they are always returned on every exit path. All calls here are blocking;
// async callers go through tokio::task::spawn_blocking.

pub mod buffer;
pub mod key_state;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::{is_transient_sqlite, needs_reconnect, EngineError, Result};

pub use buffer::PendingEvent;
pub use key_state::DrainOutcome;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_events (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    host         TEXT    NOT NULL,
    address      TEXT    NOT NULL,
    hour         INTEGER NOT NULL,
    status_line  TEXT    NOT NULL,
    user_agent   TEXT    NOT NULL,
    epoch_ms     INTEGER NOT NULL,
    content_type TEXT    NOT NULL,
    received_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_key_seq ON pending_events(host, address, seq);

CREATE TABLE IF NOT EXISTS key_state (
    host        TEXT    NOT NULL,
    address     TEXT    NOT NULL,
    state       TEXT    NOT NULL,
    prediction  REAL,
    class       TEXT,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (host, address)
);
"#;

// ── Connection pool ───────────────────────────────────────────────────────────

pub struct Storage {
    path:     PathBuf,
    slots:    Vec<Mutex<Connection>>,
    next:     AtomicUsize,
    retries:  u32,
}

impl Storage {
    /// Open (or create) the database and run the schema.
    pub fn open(path: impl AsRef<Path>, pool_size: usize, retries: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pool_size = pool_size.max(1);

        let mut slots = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            slots.push(Mutex::new(open_connection(&path)?));
        }

        let storage = Self { path, slots, next: AtomicUsize::new(0), retries };
        storage.with_conn(|conn| conn.execute_batch(SCHEMA))?;
        debug!(path = %storage.path.display(), pool_size, "storage opened");
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take a free connection, or block on the next slot in rotation.
    fn acquire(&self) -> MutexGuard<'_, Connection> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let n = self.slots.len();
        for i in 0..n {
            if let Some(guard) = self.slots[(start + i) % n].try_lock() {
                return guard;
            }
        }
        self.slots[start % n].lock()
    }

    /// Run `op` on a pooled connection. Transient failures are retried with
    /// linear backoff; I/O failures reopen the connection first.
    pub fn with_conn<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            let mut conn = self.acquire();
            match op(&mut *conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_transient_sqlite(&e) && attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, "transient storage error, retrying: {}", e);
                    if needs_reconnect(&e) {
                        match open_connection(&self.path) {
                            Ok(fresh) => *conn = fresh,
                            Err(re) => warn!("reconnect failed: {}", re),
                        }
                    }
                    drop(conn);
                    std::thread::sleep(Duration::from_millis(25 * u64::from(attempt)));
                }
                Err(e) => return Err(EngineError::Storage(e)),
            }
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        warn!(path = %path.display(), "journal_mode is '{}', expected 'wal'", mode);
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Storage;
    use tempfile::TempDir;

    /// Storage in a fresh temp dir. Keep the TempDir alive for the test's duration.
    pub fn temp_storage(pool: usize) -> (TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path().join("botsift.db"), pool, 3).expect("open storage");
        (dir, storage)
    }
}

// botsift/src/engine/partitioner.rs
//
// Ownership partitioner: which worker slot drains which key.
//
// The table is the only structure mutated by several tasks at once. It sits
// behind one parking_lot mutex that is held for O(1) map updates only, never
// across I/O. Each worker slot has its own wake signal (tokio Notify); assign
// raises the owner's signal while the lock is still held, so a worker that
// snapshots its keys under the same lock either sees the new key or has a
// stored wake permit waiting for it.
//
// Every assign stamps the record with a fresh epoch. A worker may release a
// key only with the epoch it observed when it counted that key's pending
// events. Ingestion appends before it assigns, so an append that lands after
// the count always bumps the epoch and the stale release is refused.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

use crate::events::Key;

pub type WorkerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ownership {
    worker: WorkerId,
    epoch:  u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub worker: WorkerId,
    /// The key had no owner before this call.
    pub fresh:  bool,
}

#[derive(Default)]
struct OwnershipTable {
    owners: HashMap<Key, Ownership>,
    owned:  HashMap<WorkerId, HashSet<Key>>,
    next:   WorkerId,
    epoch:  u64,
}

pub struct Partitioner {
    table: Mutex<OwnershipTable>,
    wakes: Vec<Notify>,
}

impl Partitioner {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            table: Mutex::new(OwnershipTable::default()),
            wakes: (0..workers).map(|_| Notify::new()).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.wakes.len()
    }

    /// Owner of `key`, assigning the next slot round-robin if it has none.
    /// Always raises the owner's wake signal.
    pub fn assign(&self, key: &Key) -> Assignment {
        let mut t = self.table.lock();
        t.epoch += 1;
        let epoch = t.epoch;

        let assignment = match t.owners.get_mut(key) {
            Some(rec) => {
                rec.epoch = epoch;
                Assignment { worker: rec.worker, fresh: false }
            }
            None => {
                let worker = t.next;
                t.next = (t.next + 1) % self.wakes.len();
                t.owners.insert(key.clone(), Ownership { worker, epoch });
                t.owned.entry(worker).or_default().insert(key.clone());
                debug!(key = %key, worker, "assigned");
                Assignment { worker, fresh: true }
            }
        };
        self.wakes[assignment.worker].notify_one();
        assignment
    }

    /// Assign every key in `keys` under one lock acquisition. Returns how many
    /// were previously unowned.
    pub fn assign_all<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> usize {
        let mut t = self.table.lock();
        let mut fresh = 0;
        let mut woken = HashSet::new();
        for key in keys {
            t.epoch += 1;
            let epoch = t.epoch;
            let worker = match t.owners.get_mut(key) {
                Some(rec) => {
                    rec.epoch = epoch;
                    rec.worker
                }
                None => {
                    let worker = t.next;
                    t.next = (t.next + 1) % self.wakes.len();
                    t.owners.insert(key.clone(), Ownership { worker, epoch });
                    t.owned.entry(worker).or_default().insert(key.clone());
                    fresh += 1;
                    worker
                }
            };
            if woken.insert(worker) {
                self.wakes[worker].notify_one();
            }
        }
        fresh
    }

    /// Drop `worker`'s ownership of `key`, but only if nobody has assigned
    /// the key since the caller observed `epoch`. Returns whether it released.
    pub fn release(&self, worker: WorkerId, key: &Key, epoch: u64) -> bool {
        let mut t = self.table.lock();
        match t.owners.get(key) {
            Some(rec) if rec.worker == worker && rec.epoch == epoch => {}
            _ => return false,
        }
        t.owners.remove(key);
        if let Some(set) = t.owned.get_mut(&worker) {
            set.remove(key);
            if set.is_empty() {
                t.owned.remove(&worker);
            }
        }
        debug!(key = %key, worker, "released");
        true
    }

    /// Keys currently owned by `worker` with their assignment epochs.
    pub fn snapshot(&self, worker: WorkerId) -> Vec<(Key, u64)> {
        let t = self.table.lock();
        let Some(set) = t.owned.get(&worker) else {
            return Vec::new();
        };
        let mut keys: Vec<(Key, u64)> = set
            .iter()
            .filter_map(|k| t.owners.get(k).map(|rec| (k.clone(), rec.epoch)))
            .collect();
        keys.sort_by_key(|(_, epoch)| *epoch);
        keys
    }

    pub fn owner_of(&self, key: &Key) -> Option<WorkerId> {
        self.table.lock().owners.get(key).map(|rec| rec.worker)
    }

    /// Number of keys with an owner.
    pub fn tracked_keys(&self) -> usize {
        self.table.lock().owners.len()
    }

    /// Number of worker slots that own at least one key.
    pub fn busy_workers(&self) -> usize {
        self.table.lock().owned.len()
    }

    pub fn wake(&self, worker: WorkerId) {
        if let Some(n) = self.wakes.get(worker) {
            n.notify_one();
        }
    }

    pub fn wake_all(&self) {
        for n in &self.wakes {
            n.notify_one();
        }
    }

    /// Future that completes on `worker`'s next wake signal (or immediately if
    /// one was raised since the last wait).
    pub fn notified(&self, worker: WorkerId) -> Notified<'_> {
        self.wakes[worker % self.wakes.len()].notified()
    }

    #[cfg(test)]
    fn consistent(&self) -> bool {
        let t = self.table.lock();
        let forward = t.owners.iter().all(|(k, rec)| {
            t.owned.get(&rec.worker).map_or(false, |set| set.contains(k))
        });
        let inverse = t.owned.iter().all(|(w, set)| {
            !set.is_empty() && set.iter().all(|k| t.owners.get(k).map(|r| r.worker) == Some(*w))
        });
        forward && inverse
    }
}

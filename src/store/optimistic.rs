//! OptimisticStore - versioned store with commit-time conflict detection.
//!
//! Each transaction reads from the committed snapshot current when it began,
//! remembering the version of everything it saw. A transaction that wrote
//! nothing commits without validation: its reads were already consistent.
//! Otherwise the store takes its write lock at commit, checks that none of
//! those versions moved, and applies the buffered writes. A moved version is
//! a conflict: the whole transaction function is re-run according to the
//! store's [`RetryPolicy`].
//!
//! Committed state is copy-on-write. A commit made while a transaction still
//! holds the previous snapshot copies the whole state.
//!
//! When opened with a path, committed state is written to disk after every
//! commit and loaded again by [`OptimisticStore::open`]. Every writing commit
//! rewrites the full snapshot file under the write lock, so commit cost grows
//! with the total number of records, outbox envelopes included. Like the
//! in-process store's global lock, this bounds the store to modest volumes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread;

use serde::{Deserialize, Serialize};

use super::write_set::WriteSet;
use super::{RetryPolicy, Store, StoreError, Transaction, TransactionFn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    bytes: Vec<u8>,
    version: u64,
}

/// Committed state. `generations` changes whenever a kind gains a new UID,
/// so scans can detect records inserted after they ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    records: BTreeMap<String, BTreeMap<String, StoredRecord>>,
    generations: BTreeMap<String, u64>,
}

impl State {
    fn version(&self, kind: &str, uid: &str) -> u64 {
        self.records
            .get(kind)
            .and_then(|rows| rows.get(uid))
            .map(|r| r.version)
            .unwrap_or(0)
    }

    fn generation(&self, kind: &str) -> u64 {
        self.generations.get(kind).copied().unwrap_or(0)
    }

    fn apply(&mut self, writes: WriteSet) {
        for (kind, rows) in writes.into_inner() {
            let table = self.records.entry(kind.clone()).or_default();
            let mut inserted = false;
            for (uid, bytes) in rows {
                match table.get_mut(&uid) {
                    Some(existing) => {
                        existing.bytes = bytes;
                        existing.version += 1;
                    }
                    None => {
                        table.insert(uid, StoredRecord { bytes, version: 1 });
                        inserted = true;
                    }
                }
            }
            if inserted {
                *self.generations.entry(kind).or_insert(0) += 1;
            }
        }
    }
}

/// Durable store with optimistic concurrency and bounded conflict retry.
///
/// Clone-friendly via Arc; clones share state and the backing file.
#[derive(Clone)]
pub struct OptimisticStore {
    state: Arc<RwLock<Arc<State>>>,
    path: Option<PathBuf>,
    policy: RetryPolicy,
}

impl Default for OptimisticStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticStore {
    /// A store kept only in memory.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(Arc::new(State::default()))),
            path: None,
            policy: RetryPolicy::default(),
        }
    }

    /// Open (or create) a store persisted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| StoreError::Storage(e.to_string()))?;
            bitcode::deserialize(&bytes).map_err(|e| {
                StoreError::Storage(format!("corrupt snapshot {}: {}", path.display(), e))
            })?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Storage(e.to_string()))?;
            }
            State::default()
        };

        tracing::debug!(path = %path.display(), "opened optimistic store");
        Ok(Self {
            state: Arc::new(RwLock::new(Arc::new(state))),
            path: Some(path),
            policy: RetryPolicy::default(),
        })
    }

    /// Replace the conflict retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn snapshot(&self) -> Result<Arc<State>, StoreError> {
        self.state
            .read()
            .map(|state| Arc::clone(&state))
            .map_err(|_| StoreError::LockPoisoned("snapshot"))
    }

    fn commit(&self, tx: SnapshotTransaction) -> Result<(), StoreError> {
        let SnapshotTransaction {
            reads,
            scans,
            writes,
            ..
        } = tx;

        if writes.is_empty() {
            return Ok(());
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("commit"))?;

        for ((kind, uid), seen) in &reads {
            if state.version(kind, uid) != *seen {
                return Err(StoreError::Conflict {
                    kind: kind.clone(),
                    uid: uid.clone(),
                });
            }
        }
        for (kind, seen) in &scans {
            if state.generation(kind) != *seen {
                return Err(StoreError::Conflict {
                    kind: kind.clone(),
                    uid: "*".to_string(),
                });
            }
        }

        match &self.path {
            Some(path) => {
                let mut next = (**state).clone();
                next.apply(writes);
                persist(path, &next)?;
                *state = Arc::new(next);
            }
            None => Arc::make_mut(&mut *state).apply(writes),
        }
        Ok(())
    }
}

fn persist(path: &Path, state: &State) -> Result<(), StoreError> {
    let bytes = bitcode::serialize(state).map_err(|e| StoreError::Storage(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| StoreError::Storage(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::Storage(e.to_string()))
}

struct SnapshotTransaction {
    snapshot: Arc<State>,
    reads: BTreeMap<(String, String), u64>,
    scans: BTreeMap<String, u64>,
    writes: WriteSet,
}

impl SnapshotTransaction {
    fn new(snapshot: Arc<State>) -> Self {
        Self {
            snapshot,
            reads: BTreeMap::new(),
            scans: BTreeMap::new(),
            writes: WriteSet::new(),
        }
    }
}

impl Transaction for SnapshotTransaction {
    fn get(&mut self, kind: &str, uid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(bytes) = self.writes.get(kind, uid) {
            return Ok(Some(bytes.clone()));
        }
        let stored = self.snapshot.records.get(kind).and_then(|rows| rows.get(uid));

        self.reads
            .entry((kind.to_string(), uid.to_string()))
            .or_insert_with(|| stored.map(|r| r.version).unwrap_or(0));
        Ok(stored.map(|r| r.bytes.clone()))
    }

    fn put(&mut self, kind: &str, uid: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.writes.put(kind, uid, bytes);
        Ok(())
    }

    fn scan(&mut self, kind: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let state = &self.snapshot;

        self.scans
            .entry(kind.to_string())
            .or_insert_with(|| state.generation(kind));

        let rows = state.records.get(kind);
        if let Some(rows) = rows {
            for (uid, record) in rows {
                self.reads
                    .entry((kind.to_string(), uid.clone()))
                    .or_insert(record.version);
            }
        }
        let committed = rows
            .into_iter()
            .flatten()
            .map(|(uid, record)| (uid, &record.bytes));
        Ok(self.writes.merge_scan(kind, committed))
    }
}

impl Store for OptimisticStore {
    fn run_in_transaction(&self, f: &mut TransactionFn<'_>) -> Result<(), StoreError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let mut tx = SnapshotTransaction::new(self.snapshot()?);
            f(&mut tx)?;

            match self.commit(tx) {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "transaction committed after retry");
                    }
                    return Ok(());
                }
                Err(err) if err.is_conflict() => {
                    if attempt >= max_attempts {
                        tracing::error!(attempt, error = %err, "transaction conflict retries exhausted");
                        return Err(StoreError::ConflictRetriesExhausted { attempts: attempt });
                    }
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transaction conflict, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

//! InMemoryStore - single-lock transactional store for one process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::write_set::WriteSet;
use super::{Store, StoreError, Transaction, TransactionFn};

type Records = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// In-process store where one mutex guards every transaction.
///
/// The lock is held while the transaction function runs, so at most one
/// transaction is in progress process-wide. Writes are buffered and only
/// applied when the function returns `Ok`; an error leaves the store as it
/// was. Clone-friendly via Arc.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<Mutex<Records>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed records of `kind`.
    pub fn count(&self, kind: &str) -> Result<usize, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::LockPoisoned("count"))?;
        Ok(records.get(kind).map(|rows| rows.len()).unwrap_or(0))
    }
}

struct LockedTransaction<'a> {
    committed: &'a Records,
    writes: WriteSet,
}

impl Transaction for LockedTransaction<'_> {
    fn get(&mut self, kind: &str, uid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(bytes) = self.writes.get(kind, uid) {
            return Ok(Some(bytes.clone()));
        }
        Ok(self
            .committed
            .get(kind)
            .and_then(|rows| rows.get(uid))
            .cloned())
    }

    fn put(&mut self, kind: &str, uid: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.writes.put(kind, uid, bytes);
        Ok(())
    }

    fn scan(&mut self, kind: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let committed = self.committed.get(kind).into_iter().flatten();
        Ok(self.writes.merge_scan(kind, committed))
    }
}

impl Store for InMemoryStore {
    fn run_in_transaction(&self, f: &mut TransactionFn<'_>) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::LockPoisoned("transaction"))?;

        let writes = {
            let mut tx = LockedTransaction {
                committed: &records,
                writes: WriteSet::new(),
            };
            f(&mut tx)?;
            tx.writes
        };

        if writes.is_empty() {
            return Ok(());
        }
        for (kind, rows) in writes.into_inner() {
            records.entry(kind).or_default().extend(rows);
        }
        Ok(())
    }
}

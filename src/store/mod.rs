//! Transactional Store - keyed records with all-or-nothing transactions.
//!
//! Records are grouped by kind (`Record::KIND`) and keyed by a string UID.
//! Every read and write happens through a transaction handle that is passed
//! explicitly; operations outside a transaction are single-operation
//! transactions of their own.
//!
//! ## Example
//!
//! ```
//! use relay_outbox::store::{InMemoryStore, Record, StoreError, StoreExt};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
//! struct Basket {
//!     items: u32,
//! }
//!
//! impl Record for Basket {
//!     const KIND: &'static str = "Basket";
//! }
//!
//! let store = InMemoryStore::new();
//! store
//!     .transaction(|tx| -> Result<(), StoreError> {
//!         tx.put("b-1", &Basket { items: 2 })
//!     })
//!     .unwrap();
//!
//! assert_eq!(store.get::<Basket>("b-1").unwrap(), Some(Basket { items: 2 }));
//! ```
//!
//! Two implementations are provided:
//!
//! - [`InMemoryStore`] serializes every transaction through one mutex.
//! - [`OptimisticStore`] validates read versions at commit and re-runs the
//!   transaction function on conflict, per its [`RetryPolicy`].
//!
//! Transaction functions may run more than once. They must not perform
//! non-idempotent side effects outside the store.

mod error;
mod in_memory;
mod optimistic;
mod query;
mod retry;
mod write_set;

use serde::{de::DeserializeOwned, Serialize};

pub use error::StoreError;
pub use in_memory::InMemoryStore;
pub use optimistic::OptimisticStore;
pub use query::{Direction, Filter, FilterOp, Query};
pub use retry::RetryPolicy;

/// A type that can be stored in a [`Store`].
pub trait Record: Serialize + DeserializeOwned {
    /// The collection this record lives in (e.g. "Basket", "OutboxEnvelope").
    const KIND: &'static str;
}

/// Raw, untyped access to the records visible inside one transaction.
///
/// Reads observe the transaction's own uncommitted writes.
pub trait Transaction {
    fn get(&mut self, kind: &str, uid: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&mut self, kind: &str, uid: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// All `(uid, bytes)` pairs of a kind, in UID order.
    fn scan(&mut self, kind: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// Type alias for the transaction function accepted by [`Store`].
pub type TransactionFn<'a> = dyn FnMut(&mut dyn Transaction) -> Result<(), StoreError> + 'a;

/// A store that can run a function under an isolation boundary.
pub trait Store: Send + Sync {
    /// Run `f` inside a transaction and commit its writes if it returns `Ok`.
    ///
    /// Any error from `f` discards all of its writes and is returned as-is.
    fn run_in_transaction(&self, f: &mut TransactionFn<'_>) -> Result<(), StoreError>;
}

/// Typed transaction handle passed to transaction functions.
pub struct Tx<'a> {
    inner: &'a mut dyn Transaction,
}

impl<'a> Tx<'a> {
    pub fn new(inner: &'a mut dyn Transaction) -> Self {
        Self { inner }
    }

    /// Load a record. Returns `None` if no record exists under `uid`.
    pub fn get<T: Record>(&mut self, uid: &str) -> Result<Option<T>, StoreError> {
        match self.inner.get(T::KIND, uid)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load a record, failing with `StoreError::NotFound` if it is missing.
    pub fn require<T: Record>(&mut self, uid: &str) -> Result<T, StoreError> {
        self.get(uid)?
            .ok_or_else(|| StoreError::not_found(T::KIND, uid))
    }

    /// Write a record. Last write wins.
    pub fn put<T: Record>(&mut self, uid: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.inner.put(T::KIND, uid, bytes)
    }

    /// Run a query over every record of `T`'s kind.
    pub fn query<T: Record>(&mut self, query: &Query) -> Result<Vec<T>, StoreError> {
        let rows = self.inner.scan(T::KIND)?;
        query.apply(rows)
    }
}

/// Typed convenience methods available on every [`Store`].
pub trait StoreExt: Store {
    /// Run `f` in a transaction, returning its value.
    ///
    /// `f` may return the caller's own error type. Such an error aborts the
    /// transaction and is handed back unchanged.
    fn transaction<T, E, F>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(&mut Tx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut output: Option<T> = None;
        let mut failure: Option<E> = None;

        let result = self.run_in_transaction(&mut |raw: &mut dyn Transaction| {
            let mut tx = Tx::new(raw);
            match f(&mut tx) {
                Ok(value) => {
                    output = Some(value);
                    failure = None;
                    Ok(())
                }
                Err(err) => {
                    output = None;
                    failure = Some(err);
                    Err(StoreError::Aborted)
                }
            }
        });

        match result {
            Ok(()) => output.ok_or_else(|| E::from(StoreError::Aborted)),
            Err(StoreError::Aborted) => Err(failure.unwrap_or_else(|| E::from(StoreError::Aborted))),
            Err(err) => Err(E::from(err)),
        }
    }

    /// Load a record in its own transaction.
    fn get<T: Record>(&self, uid: &str) -> Result<Option<T>, StoreError> {
        self.transaction(|tx| tx.get::<T>(uid))
    }

    /// Write a record in its own transaction.
    fn put<T: Record>(&self, uid: &str, value: &T) -> Result<(), StoreError> {
        self.transaction(|tx| tx.put(uid, value))
    }

    /// Run a query in its own transaction.
    fn query<T: Record>(&self, query: &Query) -> Result<Vec<T>, StoreError> {
        self.transaction(|tx| tx.query::<T>(query))
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

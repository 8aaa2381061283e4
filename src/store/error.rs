use thiserror::Error;

/// Error type for transactional store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Another transaction committed a record this transaction read.
    #[error("transaction conflict on {kind}:{uid}")]
    Conflict { kind: String, uid: String },

    /// Conflicts kept occurring until the retry budget ran out.
    #[error("transaction aborted after {attempts} conflicting attempts")]
    ConflictRetriesExhausted { attempts: u32 },

    /// A record required by the caller does not exist.
    #[error("record not found: {kind}:{uid}")]
    NotFound { kind: String, uid: String },

    /// Record encoding or decoding failed.
    #[error("record serialization error: {0}")]
    Serde(String),

    /// The backing storage failed (I/O, corrupt snapshot, ...).
    #[error("storage error: {0}")]
    Storage(String),

    /// The transaction function returned an error; nothing was written.
    #[error("transaction aborted by caller")]
    Aborted,

    /// A mutex guarding the store was poisoned.
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

impl StoreError {
    pub fn not_found(kind: impl Into<String>, uid: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: kind.into(),
            uid: uid.into(),
        }
    }

    /// Whether re-running the transaction function may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serde(err.to_string())
    }
}

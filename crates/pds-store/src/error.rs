use pds_types::{ActorId, Cid, TypeError};

/// Errors from block store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested block is not in the store.
    #[error("block not found: {0}")]
    BlockNotFound(Cid),

    /// The requested blob is absent or has been withdrawn.
    #[error("blob not found: {0}")]
    BlobNotFound(Cid),

    /// Block bytes do not hash to the CID they were written under.
    #[error("content does not match CID {0}")]
    CidMismatch(Cid),

    /// A mutating call ran without an open write transaction.
    #[error("{operation} requires an open write transaction")]
    NotInTransaction { operation: &'static str },

    /// The transaction was rolled back after an operation inside it failed.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("no repo for actor {0}")]
    ActorNotFound(ActorId),

    #[error("repo already exists for actor {0}")]
    ActorExists(ActorId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid value: {0}")]
    Type(#[from] TypeError),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Domain "not found" conditions, as opposed to storage failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BlockNotFound(_) | Self::BlobNotFound(_) | Self::ActorNotFound(_)
        )
    }

    /// Programming errors that must abort immediately and never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotInTransaction { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

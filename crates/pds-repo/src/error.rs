use pds_store::StoreError;
use pds_types::{Cid, TypeError};

/// Errors from repo reads, writes and tree decoding.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid value: {0}")]
    Type(#[from] TypeError),

    /// A block the operation needs is not in the store.
    #[error("block not found: {0}")]
    BlockNotFound(Cid),

    /// Block bytes are not a valid commit or tree node.
    #[error("malformed block {cid}: {reason}")]
    Malformed { cid: Cid, reason: String },

    #[error("encoding failed: {0}")]
    Encode(String),

    /// Repo deletion is not available on the write path.
    #[error("destroying a repo is not allowed through the transactor")]
    DestroyDisallowed,
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::BlockNotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_fatal())
    }

    pub(crate) fn malformed(cid: Cid, reason: impl ToString) -> Self {
        Self::Malformed {
            cid,
            reason: reason.to_string(),
        }
    }
}

/// Result alias for repo operations.
pub type RepoResult<T> = Result<T, RepoError>;

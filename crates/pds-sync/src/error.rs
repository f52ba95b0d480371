use thiserror::Error;

use pds_car::CarError;
use pds_repo::RepoError;
use pds_store::StoreError;
use pds_types::{ActorId, Cid, TypeError};

#[derive(Debug, Error)]
pub enum SyncError {
    /// The actor has no repo, or the repo has no commits yet.
    #[error("could not find repo for {0}")]
    RepoNotFound(ActorId),

    /// The requested commit is not in the actor's repo.
    #[error("could not find commit {0}")]
    CommitNotFound(Cid),

    #[error("blob not found: {0}")]
    BlobNotFound(Cid),

    /// A received archive does not prove what it claims to.
    #[error("proof verification failed: {0}")]
    VerificationFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The background export task stopped abnormally.
    #[error("export task failed: {0}")]
    TaskFailed(String),

    #[error("repo error: {0}")]
    Repo(#[from] RepoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("archive error: {0}")]
    Car(#[from] CarError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Conditions a caller reports as "not found" rather than as a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RepoNotFound(_) | Self::CommitNotFound(_) | Self::BlobNotFound(_)
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

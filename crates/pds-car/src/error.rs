use thiserror::Error;

use pds_types::{Cid, TypeError};

#[derive(Debug, Error)]
pub enum CarError {
    #[error("unsupported CAR version: {0}")]
    UnsupportedVersion(u64),

    #[error("invalid CAR header: {0}")]
    InvalidHeader(String),

    #[error("truncated CAR data at offset {offset}")]
    Truncated { offset: usize },

    #[error("corrupt CAR frame at offset {offset}: {reason}")]
    CorruptFrame { offset: usize, reason: String },

    #[error("block content does not match CID {0}")]
    CidMismatch(Cid),

    #[error("encoding failed: {0}")]
    Encode(String),

    #[error("invalid value: {0}")]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CarResult<T> = Result<T, CarError>;

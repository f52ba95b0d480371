use thiserror::Error;

/// Errors produced by type parsing and validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("unsupported codec: 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("unsupported multibase prefix: {0:?}")]
    UnsupportedMultibase(Option<char>),

    #[error("invalid varint: {0}")]
    InvalidVarint(&'static str),

    #[error("invalid revision: {0:?}")]
    InvalidRev(String),

    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("invalid record key: {0:?}")]
    InvalidRecordKey(String),

    #[error("invalid data key: {0:?}")]
    InvalidDataKey(String),

    #[error("invalid actor id: {0:?}")]
    InvalidActor(String),
}

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Upper bound on record key length.
pub const MAX_RKEY_LEN: usize = 512;

/// Address of a record within a repo: `collection/rkey`.
///
/// The data key (`collection/rkey`) is the key under which the record's CID
/// is stored in the repo tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordPath {
    pub collection: String,
    pub rkey: String,
}

impl RecordPath {
    /// Create a validated record path.
    pub fn new(collection: impl Into<String>, rkey: impl Into<String>) -> Result<Self, TypeError> {
        let collection = collection.into();
        let rkey = rkey.into();
        validate_collection(&collection)?;
        validate_rkey(&rkey)?;
        Ok(Self { collection, rkey })
    }

    /// The tree key for this record.
    pub fn data_key(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }

    /// Parse a `collection/rkey` tree key.
    pub fn from_data_key(key: &str) -> Result<Self, TypeError> {
        let (collection, rkey) = key
            .split_once('/')
            .ok_or_else(|| TypeError::InvalidDataKey(key.to_string()))?;
        Self::new(collection, rkey).map_err(|_| TypeError::InvalidDataKey(key.to_string()))
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.rkey)
    }
}

/// Collections are dotted names with at least three segments, e.g.
/// `app.bsky.feed.post`.
pub fn validate_collection(collection: &str) -> Result<(), TypeError> {
    let segments: Vec<&str> = collection.split('.').collect();
    let valid = collection.len() <= 317
        && segments.len() >= 3
        && segments.iter().all(|s| {
            !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
    if valid {
        Ok(())
    } else {
        Err(TypeError::InvalidCollection(collection.to_string()))
    }
}

pub fn validate_rkey(rkey: &str) -> Result<(), TypeError> {
    let valid = !rkey.is_empty()
        && rkey.len() <= MAX_RKEY_LEN
        && rkey != "."
        && rkey != ".."
        && rkey
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'~' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(TypeError::InvalidRecordKey(rkey.to_string()))
    }
}

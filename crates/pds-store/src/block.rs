use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pds_types::{Cid, Rev};

/// A persisted block row: `(cid, repo_rev, size, content)`.
///
/// `repo_rev` names the commit that first wrote the block. A later write of
/// the same CID never replaces it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub cid: Cid,
    pub repo_rev: Rev,
    pub size: u64,
    pub content: Bytes,
}

impl StoredBlock {
    pub fn new(cid: Cid, content: impl Into<Bytes>, repo_rev: Rev) -> Self {
        let content = content.into();
        Self {
            cid,
            repo_rev,
            size: content.len() as u64,
            content,
        }
    }

    /// Returns `true` if the content hashes to the CID.
    pub fn verify(&self) -> bool {
        self.cid.verify(&self.content)
    }
}

/// One row of the append-only root log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootEntry {
    pub cid: Cid,
    pub rev: Rev,
    pub indexed_at: DateTime<Utc>,
}

impl RootEntry {
    pub fn new(cid: Cid, rev: Rev, indexed_at: DateTime<Utc>) -> Self {
        Self {
            cid,
            rev,
            indexed_at,
        }
    }
}

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use pds_store::{BlockMap, CidSet};
use pds_types::{ActorId, Cid, Rev};

use crate::error::{RepoError, RepoResult};

/// Commit object format version.
pub const COMMIT_VERSION: u8 = 3;

/// One atomic state transition of a repo, as produced by the tree-diff
/// producer: the new root and rev, the blocks it introduces and the blocks
/// no longer reachable from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitData {
    pub cid: Cid,
    pub rev: Rev,
    pub new_blocks: BlockMap,
    pub removed_cids: CidSet,
}

/// Signed commit block. Its CID is the repo root.
///
/// `data` is the root of the record tree. Signatures are produced and
/// checked outside this crate; `sig` is carried as opaque bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub did: ActorId,
    pub version: u8,
    pub data: Cid,
    pub rev: Rev,
    pub prev: Option<Cid>,
    #[serde(with = "serde_bytes")]
    pub sig: Vec<u8>,
}

impl Commit {
    pub fn new(did: ActorId, data: Cid, rev: Rev, prev: Option<Cid>, sig: Vec<u8>) -> Self {
        Self {
            did,
            version: COMMIT_VERSION,
            data,
            rev,
            prev,
            sig,
        }
    }

    /// CBOR-encode the commit and compute its CID.
    pub fn to_block(&self) -> RepoResult<(Cid, Bytes)> {
        let bytes = serde_cbor::to_vec(self).map_err(|e| RepoError::Encode(e.to_string()))?;
        Ok((Cid::cbor(&bytes), Bytes::from(bytes)))
    }

    /// Decode the commit stored under `cid`.
    pub fn decode(cid: Cid, bytes: &[u8]) -> RepoResult<Self> {
        let commit: Self =
            serde_cbor::from_slice(bytes).map_err(|e| RepoError::malformed(cid, e))?;
        if commit.version != COMMIT_VERSION {
            return Err(RepoError::malformed(
                cid,
                format!("unsupported commit version {}", commit.version),
            ));
        }
        Ok(commit)
    }
}

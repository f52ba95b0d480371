use bytes::Bytes;

use pds_car::read_car;
use pds_repo::mst::{list_leaves, lookup};
use pds_repo::{BlockSource, Commit, RepoError};
use pds_store::BlockMap;
use pds_types::{Cid, RecordPath};

use crate::error::{SyncError, SyncResult};

/// What a received archive proves about one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordProof {
    Present { path: RecordPath, cid: Cid, record: Bytes },
    Absent { path: RecordPath },
}

impl RecordProof {
    pub fn path(&self) -> &RecordPath {
        match self {
            Self::Present { path, .. } | Self::Absent { path } => path,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }
}

/// Result of checking a record export.
#[derive(Clone, Debug)]
pub struct ProofReport {
    /// The archive's root: the commit CID.
    pub root: Cid,
    pub commit: Commit,
    pub records: Vec<RecordProof>,
}

/// Checks archives received from a peer against the records they claim to
/// cover. Every block is verified against its CID while reading; a block the
/// proof needs but does not carry fails verification.
pub struct ProofVerifier;

impl ProofVerifier {
    /// Verify a record export, resolving each of `paths` to a present or
    /// absent record.
    pub fn verify_records(car: &[u8], paths: &[RecordPath]) -> SyncResult<ProofReport> {
        let (root, blocks) = load(car)?;
        let commit = blocks.read_commit(&root).map_err(incomplete)?;

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let proof = match lookup(&blocks, commit.data, &path.data_key()).map_err(incomplete)? {
                Some(cid) => RecordProof::Present {
                    path: path.clone(),
                    cid,
                    record: blocks.read_block(&cid).map_err(incomplete)?,
                },
                None => RecordProof::Absent { path: path.clone() },
            };
            records.push(proof);
        }

        Ok(ProofReport { root, commit, records })
    }

    /// Verify a full export: every tree node and record must be present.
    /// Returns the records as `(data key, record CID)` in key order.
    pub fn verify_repo(car: &[u8]) -> SyncResult<Vec<(String, Cid)>> {
        let (root, blocks) = load(car)?;
        let commit = blocks.read_commit(&root).map_err(incomplete)?;
        let leaves = list_leaves(&blocks, commit.data).map_err(incomplete)?;
        if let Some((key, cid)) = leaves.iter().find(|(_, cid)| !blocks.has(cid)) {
            return Err(SyncError::VerificationFailed(format!(
                "record {key} ({cid}) missing from archive"
            )));
        }
        Ok(leaves)
    }
}

fn load(car: &[u8]) -> SyncResult<(Cid, BlockMap)> {
    let (header, blocks) = read_car(car)?;
    let root = match header.roots.as_slice() {
        [root] => *root,
        roots => {
            return Err(SyncError::VerificationFailed(format!(
                "expected one root, found {}",
                roots.len()
            )))
        }
    };
    Ok((root, blocks.into_iter().collect()))
}

fn incomplete(err: RepoError) -> SyncError {
    match err {
        RepoError::BlockNotFound(cid) => {
            SyncError::VerificationFailed(format!("block {cid} missing from archive"))
        }
        other => other.into(),
    }
}

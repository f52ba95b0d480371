use std::sync::Mutex;

use bytes::Bytes;
use tracing::debug;

use pds_store::{ActorDb, BlockMap, ReadHandle, RootEntry};
use pds_types::{Cid, Rev};

use crate::commit::Commit;
use crate::error::{RepoError, RepoResult};
use crate::mst::MstNode;

/// Anything blocks can be fetched from by CID.
///
/// Implementations return `Ok(None)` for a missing block and reserve `Err`
/// for storage failures.
pub trait BlockSource {
    fn get_block(&self, cid: &Cid) -> RepoResult<Option<Bytes>>;

    fn has_block(&self, cid: &Cid) -> RepoResult<bool> {
        Ok(self.get_block(cid)?.is_some())
    }

    /// Fetch a block that must exist.
    fn read_block(&self, cid: &Cid) -> RepoResult<Bytes> {
        self.get_block(cid)?.ok_or(RepoError::BlockNotFound(*cid))
    }

    fn read_commit(&self, cid: &Cid) -> RepoResult<Commit> {
        Commit::decode(*cid, &self.read_block(cid)?)
    }

    fn read_node(&self, cid: &Cid) -> RepoResult<MstNode> {
        MstNode::decode(*cid, &self.read_block(cid)?)
    }
}

impl<T: BlockSource + ?Sized> BlockSource for &T {
    fn get_block(&self, cid: &Cid) -> RepoResult<Option<Bytes>> {
        (**self).get_block(cid)
    }
}

impl BlockSource for BlockMap {
    fn get_block(&self, cid: &Cid) -> RepoResult<Option<Bytes>> {
        Ok(self.get(cid).cloned())
    }
}

/// Read surface shared by [`RepoReader`] and the transactor.
pub trait RepoRead: BlockSource {
    /// CID of the head root, or `None` for a repo with no commits.
    fn get_root(&self) -> Option<Cid> {
        self.get_root_detailed().map(|root| root.cid)
    }

    fn get_root_detailed(&self) -> Option<RootEntry>;

    /// Split `cids` into the blocks found and the CIDs that are missing.
    fn get_blocks(&self, cids: &[Cid]) -> RepoResult<(BlockMap, Vec<Cid>)> {
        let mut found = BlockMap::new();
        let mut missing = Vec::new();
        for cid in cids {
            match self.get_block(cid)? {
                Some(bytes) => found.set(*cid, bytes),
                None => missing.push(*cid),
            }
        }
        Ok((found, missing))
    }

    /// Prefetch up to the configured limit of blocks written by `rev` into
    /// the cache. Returns how many were loaded.
    fn cache_rev(&self, rev: &Rev) -> RepoResult<usize>;
}

/// Read-only view of an actor's repo at one committed snapshot.
///
/// Lookups check the reader's cache first and then the snapshot. Only
/// [`RepoRead::cache_rev`] fills the cache, so a long walk over the repo
/// does not accumulate every block it touches.
#[derive(Debug)]
pub struct RepoReader {
    handle: ReadHandle,
    cache: Mutex<BlockMap>,
    prefetch_limit: usize,
}

impl RepoReader {
    /// Open a reader on the current committed state of `db`.
    pub fn new(db: &ActorDb) -> Self {
        Self::from_handle(db.read(), db.config().prefetch_limit)
    }

    pub fn from_handle(handle: ReadHandle, prefetch_limit: usize) -> Self {
        Self {
            handle,
            cache: Mutex::new(BlockMap::new()),
            prefetch_limit,
        }
    }

    pub fn handle(&self) -> &ReadHandle {
        &self.handle
    }

    /// Blocks currently held in the cache.
    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().expect("lock poisoned").len()
    }
}

impl BlockSource for RepoReader {
    fn get_block(&self, cid: &Cid) -> RepoResult<Option<Bytes>> {
        if let Some(bytes) = self.cache.lock().expect("lock poisoned").get(cid) {
            return Ok(Some(bytes.clone()));
        }
        Ok(self.handle.block(cid).map(|block| block.content.clone()))
    }
}

impl RepoRead for RepoReader {
    fn get_root_detailed(&self) -> Option<RootEntry> {
        self.handle.head().cloned()
    }

    fn cache_rev(&self, rev: &Rev) -> RepoResult<usize> {
        let blocks = self.handle.blocks_for_rev(rev, self.prefetch_limit);
        let mut cache = self.cache.lock().expect("lock poisoned");
        for block in &blocks {
            cache.set(block.cid, block.content.clone());
        }
        debug!(rev = %rev, blocks = blocks.len(), "prefetched revision blocks");
        Ok(blocks.len())
    }
}

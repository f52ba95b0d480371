use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use pds_store::{ActorDb, BlockMap, RootEntry, WriteTxn};
use pds_types::{Cid, Rev};

use crate::commit::CommitData;
use crate::error::{RepoError, RepoResult};
use crate::reader::{BlockSource, RepoRead};

/// Write path of an actor's repo.
///
/// Wraps the actor's open [`WriteTxn`], so every mutation runs inside the
/// single write transaction and becomes visible only when it commits. Reads
/// see the transaction's own staged writes.
#[derive(Debug)]
pub struct RepoTransactor<'t, 'db> {
    txn: &'t mut WriteTxn<'db>,
    cache: Mutex<BlockMap>,
    now: DateTime<Utc>,
}

impl<'t, 'db> RepoTransactor<'t, 'db> {
    pub fn new(txn: &'t mut WriteTxn<'db>) -> Self {
        Self::with_time(txn, Utc::now())
    }

    /// A transactor stamping root entries with `now`.
    pub fn with_time(txn: &'t mut WriteTxn<'db>, now: DateTime<Utc>) -> Self {
        Self {
            txn,
            cache: Mutex::new(BlockMap::new()),
            now,
        }
    }

    /// Run `f` inside a write transaction on `db`, committing if it succeeds.
    pub fn run<T, F>(db: &ActorDb, f: F) -> RepoResult<T>
    where
        F: FnOnce(&mut RepoTransactor<'_, '_>) -> RepoResult<T>,
    {
        db.transaction(|txn| {
            let mut transactor = RepoTransactor::new(txn);
            f(&mut transactor)
        })
    }

    pub fn put_block(&mut self, cid: Cid, content: Bytes, rev: &Rev) -> RepoResult<()> {
        self.txn.put_block(cid, content.clone(), rev)?;
        self.cache.get_mut().expect("lock poisoned").set(cid, content);
        Ok(())
    }

    /// Store every block of `blocks`. Returns how many were new.
    pub fn put_many(&mut self, blocks: &BlockMap, rev: &Rev) -> RepoResult<usize> {
        let inserted = self
            .txn
            .put_many(blocks.iter().map(|(cid, bytes)| (*cid, bytes.clone())), rev)?;
        self.cache.get_mut().expect("lock poisoned").add_map(blocks);
        Ok(inserted)
    }

    /// Delete `cids`. Returns how many were present.
    pub fn delete_many<'a, I>(&mut self, cids: I) -> RepoResult<usize>
    where
        I: IntoIterator<Item = &'a Cid>,
    {
        let cids: Vec<&Cid> = cids.into_iter().collect();
        let deleted = self.txn.delete_many(cids.iter().copied())?;
        let cache = self.cache.get_mut().expect("lock poisoned");
        for cid in cids {
            cache.delete(cid);
        }
        Ok(deleted)
    }

    /// Append a root entry for `cid` at `rev`.
    pub fn update_root(&mut self, cid: Cid, rev: Rev) -> RepoResult<()> {
        self.txn.update_root(cid, rev, self.now)?;
        Ok(())
    }

    /// Persist one commit: the new root, its new blocks and the removal of
    /// the blocks it supersedes.
    ///
    /// A CID listed both as new and as removed is kept.
    pub fn apply_commit(&mut self, commit: &CommitData) -> RepoResult<()> {
        self.update_root(commit.cid, commit.rev.clone())?;
        let inserted = self.put_many(&commit.new_blocks, &commit.rev)?;
        let removed = self.delete_many(
            commit
                .removed_cids
                .iter()
                .filter(|cid| !commit.new_blocks.has(cid)),
        )?;
        info!(
            root = %commit.cid,
            rev = %commit.rev,
            new_blocks = inserted,
            removed_blocks = removed,
            "commit staged"
        );
        Ok(())
    }

    /// Always rejected: repo deletion is not available on the write path.
    pub fn destroy(&mut self) -> RepoResult<()> {
        error!("refusing to destroy repo through the transactor");
        Err(RepoError::DestroyDisallowed)
    }
}

impl BlockSource for RepoTransactor<'_, '_> {
    fn get_block(&self, cid: &Cid) -> RepoResult<Option<Bytes>> {
        if let Some(bytes) = self.cache.lock().expect("lock poisoned").get(cid) {
            return Ok(Some(bytes.clone()));
        }
        Ok(self.txn.block(cid).map(|block| block.content.clone()))
    }
}

impl RepoRead for RepoTransactor<'_, '_> {
    fn get_root_detailed(&self) -> Option<RootEntry> {
        self.txn.head().cloned()
    }

    fn cache_rev(&self, rev: &Rev) -> RepoResult<usize> {
        let blocks = self.txn.blocks_for_rev(rev, self.txn.config().prefetch_limit);
        let mut cache = self.cache.lock().expect("lock poisoned");
        for block in &blocks {
            cache.set(block.cid, block.content.clone());
        }
        debug!(rev = %rev, blocks = blocks.len(), "prefetched revision blocks");
        Ok(blocks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pds_store::{CidSet, StoreError};
    use pds_types::ActorId;

    use crate::reader::RepoReader;

    fn db() -> ActorDb {
        ActorDb::in_memory(ActorId::new("did:plc:writer").unwrap())
    }

    fn rev(s: &str) -> Rev {
        Rev::new(s).unwrap()
    }

    fn blocks(contents: &[&[u8]]) -> BlockMap {
        contents
            .iter()
            .map(|c| (Cid::cbor(c), Bytes::copy_from_slice(c)))
            .collect()
    }

    fn commit(root: &[u8], r: &str, new: &[&[u8]], removed: &[Cid]) -> CommitData {
        CommitData {
            cid: Cid::cbor(root),
            rev: rev(r),
            new_blocks: blocks(new),
            removed_cids: removed.iter().copied().collect(),
        }
    }

    // --- Commit application ---

    #[test]
    fn two_commit_scenario() {
        let db = db();
        let (x, y) = (Cid::cbor(b"bx"), Cid::cbor(b"by"));

        let c1 = commit(b"R1", "000001", &[b"bx"], &[]);
        RepoTransactor::run(&db, |tx| tx.apply_commit(&c1)).unwrap();
        let reader = RepoReader::new(&db);
        assert_eq!(reader.get_root(), Some(Cid::cbor(b"R1")));
        assert_eq!(reader.read_block(&x).unwrap().as_ref(), b"bx");
        drop(reader);

        let c2 = commit(b"R2", "000002", &[b"by"], &[x]);
        RepoTransactor::run(&db, |tx| tx.apply_commit(&c2)).unwrap();
        let reader = RepoReader::new(&db);
        assert_eq!(reader.get_root(), Some(Cid::cbor(b"R2")));
        assert!(reader.read_block(&x).unwrap_err().is_not_found());
        assert_eq!(reader.read_block(&y).unwrap().as_ref(), b"by");
        assert_eq!(reader.handle().roots().len(), 2);
    }

    #[test]
    fn removed_block_can_be_reintroduced() {
        let db = db();
        let x = Cid::cbor(b"bx");
        for c in [
            commit(b"R1", "1", &[b"bx"], &[]),
            commit(b"R2", "2", &[], &[x]),
            commit(b"R3", "3", &[b"bx"], &[]),
        ] {
            RepoTransactor::run(&db, |tx| tx.apply_commit(&c)).unwrap();
        }
        assert!(RepoReader::new(&db).has_block(&x).unwrap());
    }

    #[test]
    fn new_blocks_win_over_removal() {
        let db = db();
        let x = Cid::cbor(b"bx");
        RepoTransactor::run(&db, |tx| tx.apply_commit(&commit(b"R1", "1", &[b"bx"], &[]))).unwrap();
        RepoTransactor::run(&db, |tx| tx.apply_commit(&commit(b"R2", "2", &[b"bx"], &[x]))).unwrap();
        assert!(RepoReader::new(&db).has_block(&x).unwrap());
    }

    #[test]
    fn failed_commit_leaves_prior_state() {
        let db = db();
        RepoTransactor::run(&db, |tx| tx.apply_commit(&commit(b"R1", "1", &[b"a"], &[]))).unwrap();

        let mut bad = commit(b"R2", "2", &[b"b"], &[Cid::cbor(b"a")]);
        bad.new_blocks.set(Cid::cbor(b"claimed"), Bytes::from_static(b"other"));
        let err = RepoTransactor::run(&db, |tx| tx.apply_commit(&bad)).unwrap_err();
        assert!(matches!(err, RepoError::Store(StoreError::CidMismatch(_))));

        let reader = RepoReader::new(&db);
        assert_eq!(reader.get_root(), Some(Cid::cbor(b"R1")));
        assert!(reader.has_block(&Cid::cbor(b"a")).unwrap());
        assert!(!reader.has_block(&Cid::cbor(b"b")).unwrap());
    }

    #[test]
    fn transactor_reads_its_own_writes() {
        let db = db();
        RepoTransactor::run(&db, |tx| {
            let c = commit(b"R1", "000001", &[b"x"], &[]);
            tx.apply_commit(&c)?;
            assert_eq!(tx.get_root(), Some(Cid::cbor(b"R1")));
            assert!(tx.has_block(&Cid::cbor(b"x"))?);
            // Nothing is visible outside until commit.
            assert_eq!(RepoReader::new(&db).get_root(), None);
            Ok(())
        })
        .unwrap();
        assert_eq!(RepoReader::new(&db).get_root(), Some(Cid::cbor(b"R1")));
    }

    // --- Block writes ---

    #[test]
    fn put_block_twice_is_same_as_once() {
        let db = db();
        let cid = Cid::cbor(b"dup");
        for r in ["1", "2"] {
            RepoTransactor::run(&db, |tx| tx.put_block(cid, Bytes::from_static(b"dup"), &rev(r))).unwrap();
        }
        let reader = RepoReader::new(&db);
        assert_eq!(reader.handle().block_count(), 1);
        assert_eq!(reader.handle().block(&cid).unwrap().repo_rev, rev("1"));
    }

    #[test]
    fn put_many_1200_blocks() {
        let db = db();
        let contents: Vec<Vec<u8>> = (0u32..1200).map(|i| i.to_le_bytes().to_vec()).collect();
        let refs: Vec<&[u8]> = contents.iter().map(Vec::as_slice).collect();
        let batch = blocks(&refs);

        let inserted = RepoTransactor::run(&db, |tx| tx.put_many(&batch, &rev("1"))).unwrap();
        assert_eq!(inserted, 1200);

        let reader = RepoReader::new(&db);
        assert_eq!(reader.handle().block_count(), 1200);
        let cids: Vec<Cid> = batch.cids().copied().collect();
        let (found, missing) = reader.get_blocks(&cids).unwrap();
        assert_eq!(found, batch);
        assert!(missing.is_empty());
    }

    #[test]
    fn empty_operations_change_nothing() {
        let db = db();
        RepoTransactor::run(&db, |tx| tx.apply_commit(&commit(b"R1", "1", &[b"a"], &[]))).unwrap();

        RepoTransactor::run(&db, |tx| {
            assert_eq!(tx.put_many(&BlockMap::new(), &rev("2"))?, 0);
            assert_eq!(tx.delete_many(&CidSet::new())?, 0);
            Ok(())
        })
        .unwrap();

        let reader = RepoReader::new(&db);
        assert_eq!(reader.handle().block_count(), 1);
        assert_eq!(reader.get_root(), Some(Cid::cbor(b"R1")));
    }

    #[test]
    fn update_root_appends() {
        let db = db();
        let stamp = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        db.transaction(|txn| -> RepoResult<()> {
            let mut tx = RepoTransactor::with_time(txn, stamp);
            tx.update_root(Cid::cbor(b"R1"), rev("1"))?;
            tx.update_root(Cid::cbor(b"R2"), rev("2"))
        })
        .unwrap();

        let reader = RepoReader::new(&db);
        let roots = reader.handle().roots();
        assert_eq!(roots.len(), 2);
        assert!(roots.iter().all(|root| root.indexed_at == stamp));
        assert_eq!(reader.get_root_detailed().unwrap().cid, Cid::cbor(b"R2"));
    }

    #[test]
    fn cache_rev_inside_transaction() {
        let db = db();
        RepoTransactor::run(&db, |tx| {
            tx.apply_commit(&commit(b"R1", "1", &[b"a", b"b"], &[]))?;
            assert_eq!(tx.cache_rev(&rev("1"))?, 2);
            assert_eq!(tx.read_block(&Cid::cbor(b"a"))?.as_ref(), b"a");
            Ok(())
        })
        .unwrap();
    }

    // --- Guards ---

    #[test]
    fn destroy_is_always_rejected() {
        let db = db();
        RepoTransactor::run(&db, |tx| tx.apply_commit(&commit(b"R1", "1", &[b"a"], &[]))).unwrap();
        let err = RepoTransactor::run(&db, |tx| tx.destroy()).unwrap_err();
        assert!(matches!(err, RepoError::DestroyDisallowed));
        assert_eq!(RepoReader::new(&db).get_root(), Some(Cid::cbor(b"R1")));
    }

    #[test]
    fn mutation_after_failure_is_fatal() {
        let db = db();
        let result = RepoTransactor::run(&db, |tx| {
            let _ = tx.put_block(Cid::cbor(b"x"), Bytes::from_static(b"y"), &rev("1"));
            let err = tx.update_root(Cid::cbor(b"R"), rev("1")).unwrap_err();
            assert!(err.is_fatal());
            Err::<(), _>(err)
        });
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(RepoReader::new(&db).get_root(), None);
    }

    #[test]
    fn store_errors_convert() {
        let err: RepoError = StoreError::BlockNotFound(Cid::cbor(b"z")).into();
        assert!(err.is_not_found());
    }
}

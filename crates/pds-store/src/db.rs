use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use pds_types::{ActorId, Cid, Codec, Rev};

use crate::block::{RootEntry, StoredBlock};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::log::{CommitLog, LogRecord};

/// Smallest possible CID; lower bound for range scans of the rev index.
const MIN_CID: Cid = Cid::from_digest(Codec::Raw, [0; 32]);

/// Serialized size of `value` in the commit log.
fn encoded_len<T: Serialize>(value: &T) -> u64 {
    bincode::serialized_size(value).unwrap_or(0)
}

/// Blocks and roots written by one or more consecutive commits.
///
/// A `None` entry is a tombstone hiding a block held by an older level.
#[derive(Clone, Debug, Default)]
struct Level {
    blocks: HashMap<Cid, Option<StoredBlock>>,
    by_rev: BTreeSet<(Rev, Cid)>,
    roots: Vec<RootEntry>,
}

impl Level {
    fn len(&self) -> usize {
        self.blocks.len() + self.roots.len()
    }

    fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.roots.is_empty()
    }

    fn rev_range<'a>(&'a self, rev: &'a Rev) -> impl Iterator<Item = &'a Cid> + 'a {
        self.by_rev
            .range((rev.clone(), MIN_CID)..)
            .take_while(move |(r, _)| r == rev)
            .map(|(_, cid)| cid)
    }

    /// Lay `newer` over this level. Tombstones are kept unless `drop_tombstones`.
    fn absorb(&mut self, newer: &Level, drop_tombstones: bool) {
        for (cid, entry) in &newer.blocks {
            if let Some(Some(old)) = self.blocks.get(cid) {
                self.by_rev.remove(&(old.repo_rev.clone(), *cid));
            }
            match entry {
                Some(block) => {
                    self.by_rev.insert((block.repo_rev.clone(), *cid));
                    self.blocks.insert(*cid, Some(block.clone()));
                }
                None if drop_tombstones => {
                    self.blocks.remove(cid);
                }
                None => {
                    self.blocks.insert(*cid, None);
                }
            }
        }
        self.roots.extend(newer.roots.iter().cloned());
    }
}

/// Committed state of one actor's repo.
///
/// Snapshots are immutable once published. A commit produces a new snapshot
/// and swaps it in; readers holding the previous one keep seeing it.
///
/// State is a shared base level plus a short stack of commit levels, newest
/// last. A commit adds one level holding only what it changed, so a commit
/// made while readers hold older snapshots never copies their blocks. Levels
/// are merged pairwise once the newest is as large as the one below it, and
/// folded into the base when nothing else shares the base or when they have
/// grown to half its size.
#[derive(Clone, Debug, Default)]
pub struct RepoSnapshot {
    base: Arc<Level>,
    levels: Vec<Arc<Level>>,
    head: Option<RootEntry>,
    block_count: usize,
    root_count: usize,
    live_len: u64,
}

impl RepoSnapshot {
    /// The root entry with the greatest rev.
    pub fn head(&self) -> Option<&RootEntry> {
        self.head.as_ref()
    }

    /// Every root entry in append order.
    pub fn roots(&self) -> Vec<&RootEntry> {
        let mut roots = Vec::with_capacity(self.root_count);
        roots.extend(self.base.roots.iter());
        for level in &self.levels {
            roots.extend(level.roots.iter());
        }
        roots
    }

    pub fn block(&self, cid: &Cid) -> Option<&StoredBlock> {
        for level in self.newest_first() {
            if let Some(entry) = level.blocks.get(cid) {
                return entry.as_ref();
            }
        }
        None
    }

    pub fn has_block(&self, cid: &Cid) -> bool {
        self.block(cid).is_some()
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Bytes the live blocks and roots take up once serialized.
    pub fn live_len(&self) -> u64 {
        self.live_len
    }

    /// Up to `limit` blocks first written by `rev`.
    pub fn blocks_for_rev(&self, rev: &Rev, limit: usize) -> Vec<&StoredBlock> {
        let levels: Vec<&Level> = self.newest_first().collect();
        let mut found = Vec::new();
        for (depth, &level) in levels.iter().enumerate() {
            for cid in level.rev_range(rev) {
                if found.len() == limit {
                    return found;
                }
                if levels[..depth].iter().any(|newer| newer.blocks.contains_key(cid)) {
                    continue;
                }
                if let Some(Some(block)) = level.blocks.get(cid) {
                    found.push(block);
                }
            }
        }
        found
    }

    /// The whole live state as one log record: every root in append order
    /// and every live block.
    pub fn to_record(&self) -> LogRecord {
        let levels: Vec<&Level> = self.newest_first().collect();
        let mut puts = Vec::with_capacity(self.block_count);
        for (depth, &level) in levels.iter().enumerate() {
            for (cid, entry) in &level.blocks {
                let Some(block) = entry else { continue };
                if !levels[..depth].iter().any(|newer| newer.blocks.contains_key(cid)) {
                    puts.push(block.clone());
                }
            }
        }
        puts.sort_by(|a, b| a.cid.cmp(&b.cid));
        LogRecord {
            roots: self.roots().into_iter().cloned().collect(),
            puts,
            deletes: Vec::new(),
        }
    }

    /// Commit levels not yet folded into the base.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Whether both snapshots read their folded blocks from the same storage.
    pub fn shares_base_with(&self, other: &RepoSnapshot) -> bool {
        Arc::ptr_eq(&self.base, &other.base)
    }

    fn newest_first(&self) -> impl Iterator<Item = &Level> {
        self.levels
            .iter()
            .rev()
            .map(|level| level.as_ref())
            .chain(std::iter::once(self.base.as_ref()))
    }

    fn apply(&mut self, record: LogRecord) {
        let mut level = Level::default();
        for cid in record.deletes {
            if level.blocks.contains_key(&cid) {
                continue;
            }
            let Some(removed) = self.block(&cid).map(encoded_len) else {
                continue;
            };
            self.block_count -= 1;
            self.live_len = self.live_len.saturating_sub(removed);
            level.blocks.insert(cid, None);
        }
        for block in record.puts {
            let visible = match level.blocks.get(&block.cid) {
                Some(entry) => entry.is_some(),
                None => self.has_block(&block.cid),
            };
            if visible {
                continue;
            }
            self.block_count += 1;
            self.live_len += encoded_len(&block);
            level.by_rev.insert((block.repo_rev.clone(), block.cid));
            level.blocks.insert(block.cid, Some(block));
        }
        for root in record.roots {
            if self.head.as_ref().map_or(true, |head| root.rev >= head.rev) {
                self.head = Some(root.clone());
            }
            self.root_count += 1;
            self.live_len += encoded_len(&root);
            level.roots.push(root);
        }
        if !level.is_empty() {
            self.push_level(level);
        }
    }

    fn push_level(&mut self, level: Level) {
        self.levels.push(Arc::new(level));

        while let [.., older, newer] = self.levels.as_slice() {
            if newer.len() < older.len() {
                break;
            }
            let newer = self.levels.pop().unwrap_or_default();
            let older = self.levels.pop().unwrap_or_default();
            let mut merged = Arc::unwrap_or_clone(older);
            merged.absorb(&newer, false);
            self.levels.push(Arc::new(merged));
        }

        let pending: usize = self.levels.iter().map(|level| level.len()).sum();
        if Arc::get_mut(&mut self.base).is_some() || pending * 2 >= self.base.len() {
            let base = Arc::make_mut(&mut self.base);
            for level in self.levels.drain(..) {
                base.absorb(&level, true);
            }
        }
    }
}

/// Where a write transaction stands.
///
/// A transaction opens in `WriteOpen` and moves to one of the staged states
/// as work is added. A commit happens when the transaction closure returns
/// `Ok`; `Aborted` means an operation failed and nothing will be published.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnPhase {
    WriteOpen,
    BlocksStaged,
    RootStaged,
    BlocksAndRootStaged,
    Aborted,
}

/// Work counters for one write transaction.
///
/// `statements` counts the writes that a relational backend would issue:
/// one per `put_block`, `update_root` and non-empty `delete_many`, and one
/// per `put_many` chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxnStats {
    pub statements: usize,
    pub put_chunks: usize,
    pub blocks_put: usize,
    pub blocks_ignored: usize,
    pub blocks_deleted: usize,
    pub roots_appended: usize,
}

/// An open write transaction on one actor's repo.
///
/// Reads see the transaction's own staged writes layered over the snapshot
/// it started from. Staged work is published only when the enclosing
/// [`ActorDb::transaction`] call commits.
#[derive(Debug)]
pub struct WriteTxn<'db> {
    config: &'db StoreConfig,
    base: Arc<RepoSnapshot>,
    staged_blocks: HashMap<Cid, Option<StoredBlock>>,
    staged_roots: Vec<RootEntry>,
    aborted: Option<String>,
    stats: TxnStats,
}

impl<'db> WriteTxn<'db> {
    fn new(config: &'db StoreConfig, base: Arc<RepoSnapshot>) -> Self {
        Self {
            config,
            base,
            staged_blocks: HashMap::new(),
            staged_roots: Vec::new(),
            aborted: None,
            stats: TxnStats::default(),
        }
    }

    pub fn phase(&self) -> TxnPhase {
        if self.aborted.is_some() {
            return TxnPhase::Aborted;
        }
        match (self.staged_blocks.is_empty(), self.staged_roots.is_empty()) {
            (true, true) => TxnPhase::WriteOpen,
            (false, true) => TxnPhase::BlocksStaged,
            (true, false) => TxnPhase::RootStaged,
            (false, false) => TxnPhase::BlocksAndRootStaged,
        }
    }

    pub fn stats(&self) -> TxnStats {
        self.stats
    }

    pub fn config(&self) -> &StoreConfig {
        self.config
    }

    // --- Reads ---

    /// Head as of this transaction, including a staged root.
    pub fn head(&self) -> Option<&RootEntry> {
        let mut head = self.base.head();
        for root in &self.staged_roots {
            if head.map_or(true, |h| root.rev >= h.rev) {
                head = Some(root);
            }
        }
        head
    }

    pub fn block(&self, cid: &Cid) -> Option<&StoredBlock> {
        match self.staged_blocks.get(cid) {
            Some(staged) => staged.as_ref(),
            None => self.base.block(cid),
        }
    }

    pub fn has_block(&self, cid: &Cid) -> bool {
        self.block(cid).is_some()
    }

    /// Up to `limit` visible blocks first written by `rev`.
    pub fn blocks_for_rev(&self, rev: &Rev, limit: usize) -> Vec<&StoredBlock> {
        let staged = self
            .staged_blocks
            .values()
            .flatten()
            .filter(|block| &block.repo_rev == rev);
        let committed = self
            .base
            .blocks_for_rev(rev, usize::MAX)
            .into_iter()
            .filter(|block| !matches!(self.staged_blocks.get(&block.cid), Some(None)));
        staged.chain(committed).take(limit).collect()
    }

    // --- Writes ---

    /// Stage one block. A CID that is already present is left untouched.
    ///
    /// Returns `true` if the block was new.
    pub fn put_block(&mut self, cid: Cid, content: impl Into<Bytes>, rev: &Rev) -> StoreResult<bool> {
        self.ensure_open("put_block")?;
        self.stats.statements += 1;
        let block = StoredBlock::new(cid, content, rev.clone());
        self.stage_put(block)
    }

    /// Stage many blocks, `put_chunk_size` at a time.
    ///
    /// An empty input issues nothing. Returns the number of new blocks.
    pub fn put_many<I>(&mut self, blocks: I, rev: &Rev) -> StoreResult<usize>
    where
        I: IntoIterator<Item = (Cid, Bytes)>,
    {
        self.ensure_open("put_many")?;
        let blocks: Vec<(Cid, Bytes)> = blocks.into_iter().collect();
        if blocks.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0;
        for chunk in blocks.chunks(self.config.put_chunk_size) {
            self.stats.statements += 1;
            self.stats.put_chunks += 1;
            for (cid, content) in chunk {
                let block = StoredBlock::new(*cid, content.clone(), rev.clone());
                if self.stage_put(block)? {
                    inserted += 1;
                }
            }
            debug!(chunk = chunk.len(), rev = %rev, "staged block chunk");
        }
        Ok(inserted)
    }

    /// Stage deletion of `cids`. An empty input issues nothing.
    ///
    /// Returns how many of them were present.
    pub fn delete_many<'a, I>(&mut self, cids: I) -> StoreResult<usize>
    where
        I: IntoIterator<Item = &'a Cid>,
    {
        self.ensure_open("delete_many")?;
        let cids: Vec<Cid> = cids.into_iter().copied().collect();
        if cids.is_empty() {
            return Ok(0);
        }

        self.stats.statements += 1;
        let mut deleted = 0;
        for cid in cids {
            if self.has_block(&cid) {
                deleted += 1;
            }
            if self.base.has_block(&cid) {
                self.staged_blocks.insert(cid, None);
            } else {
                // Never committed, so dropping the staged put is enough.
                self.staged_blocks.remove(&cid);
            }
        }
        self.stats.blocks_deleted += deleted;
        Ok(deleted)
    }

    /// Append a root entry.
    pub fn update_root(&mut self, cid: Cid, rev: Rev, indexed_at: DateTime<Utc>) -> StoreResult<()> {
        self.ensure_open("update_root")?;
        if let Some(head) = self.head() {
            if rev <= head.rev {
                warn!(rev = %rev, head = %head.rev, "root rev does not advance head");
            }
        }
        self.stats.statements += 1;
        self.stats.roots_appended += 1;
        self.staged_roots.push(RootEntry::new(cid, rev, indexed_at));
        Ok(())
    }

    /// Mark the transaction aborted. Later mutations fail and nothing commits.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.aborted.is_none() {
            self.aborted = Some(reason.into());
        }
    }

    fn stage_put(&mut self, block: StoredBlock) -> StoreResult<bool> {
        if !block.verify() {
            self.abort(format!("content does not match CID {}", block.cid));
            return Err(StoreError::CidMismatch(block.cid));
        }
        if self.has_block(&block.cid) {
            self.stats.blocks_ignored += 1;
            return Ok(false);
        }
        if self.base.has_block(&block.cid) {
            // Deleted earlier in this transaction; the committed row stays.
            self.staged_blocks.remove(&block.cid);
        } else {
            self.staged_blocks.insert(block.cid, Some(block));
        }
        self.stats.blocks_put += 1;
        Ok(true)
    }

    fn ensure_open(&self, operation: &'static str) -> StoreResult<()> {
        if let Some(reason) = &self.aborted {
            error!(operation, reason = %reason, "mutation on aborted transaction");
            return Err(StoreError::NotInTransaction { operation });
        }
        Ok(())
    }

    fn into_record(self) -> LogRecord {
        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for (cid, staged) in self.staged_blocks {
            match staged {
                Some(block) => puts.push(block),
                None => deletes.push(cid),
            }
        }
        puts.sort_by(|a, b| a.cid.cmp(&b.cid));
        deletes.sort();
        LogRecord {
            roots: self.staged_roots,
            puts,
            deletes,
        }
    }
}

/// A read-only view of one committed snapshot.
///
/// Dropping the handle releases it; [`ActorDb::open_read_handles`] counts
/// the live ones.
#[derive(Debug)]
pub struct ReadHandle {
    actor: ActorId,
    snapshot: Arc<RepoSnapshot>,
    open_reads: Arc<AtomicUsize>,
}

impl ReadHandle {
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }
}

impl Deref for ReadHandle {
    type Target = RepoSnapshot;

    fn deref(&self) -> &RepoSnapshot {
        &self.snapshot
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.open_reads.fetch_sub(1, Ordering::AcqRel);
        debug!(actor = %self.actor, "read handle released");
    }
}

/// Storage for one actor's repo.
///
/// Any number of [`ReadHandle`]s may be open while at most one write
/// transaction runs. With a `data_dir` configured every commit is appended
/// to the actor's [`CommitLog`] before it becomes visible.
#[derive(Debug)]
pub struct ActorDb {
    actor: ActorId,
    config: StoreConfig,
    committed: RwLock<Arc<RepoSnapshot>>,
    writer: Mutex<Option<CommitLog>>,
    open_reads: Arc<AtomicUsize>,
}

impl ActorDb {
    /// A repo that lives only in memory.
    pub fn in_memory(actor: ActorId) -> Self {
        let config = StoreConfig::default();
        Self::from_parts(actor, config, RepoSnapshot::default(), None)
    }

    /// Open the actor's repo per `config`, replaying its commit log if one exists.
    pub fn open(actor: ActorId, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let Some(dir) = config.data_dir.clone() else {
            return Ok(Self::from_parts(actor, config, RepoSnapshot::default(), None));
        };

        let path = Self::log_path(&dir, &actor);
        let (mut log, records) = CommitLog::open(&path, config.sync_mode)?;
        let mut snapshot = RepoSnapshot::default();
        let replayed = records.len();
        for record in records {
            snapshot.apply(record);
        }
        info!(
            actor = %actor,
            commits = replayed,
            blocks = snapshot.block_count(),
            "opened actor repo"
        );
        compact_if_wanted(&actor, &config, &mut log, &snapshot);
        Ok(Self::from_parts(actor, config, snapshot, Some(log)))
    }

    /// Location of an actor's commit log under `data_dir`.
    pub fn log_path(data_dir: &Path, actor: &ActorId) -> PathBuf {
        data_dir.join(format!("{}.log", actor.file_stem()))
    }

    fn from_parts(
        actor: ActorId,
        config: StoreConfig,
        snapshot: RepoSnapshot,
        log: Option<CommitLog>,
    ) -> Self {
        Self {
            actor,
            config,
            committed: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(log),
            open_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Take a read handle on the current committed snapshot.
    pub fn read(&self) -> ReadHandle {
        let snapshot = Arc::clone(&self.committed.read().expect("lock poisoned"));
        self.open_reads.fetch_add(1, Ordering::AcqRel);
        ReadHandle {
            actor: self.actor.clone(),
            snapshot,
            open_reads: Arc::clone(&self.open_reads),
        }
    }

    /// Number of read handles not yet dropped.
    pub fn open_read_handles(&self) -> usize {
        self.open_reads.load(Ordering::Acquire)
    }

    /// Run `f` as this actor's single write transaction.
    ///
    /// Blocks until any other writer finishes. If `f` returns `Ok` and no
    /// operation inside it failed, its staged work is logged and published
    /// as one atomic step. Otherwise everything it staged is discarded.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        let base = Arc::clone(&self.committed.read().expect("lock poisoned"));
        let mut txn = WriteTxn::new(&self.config, base);

        let value = match f(&mut txn) {
            Ok(value) => value,
            Err(e) => {
                warn!(actor = %self.actor, phase = ?txn.phase(), "write transaction aborted");
                return Err(e);
            }
        };
        if let Some(reason) = txn.aborted.take() {
            warn!(actor = %self.actor, reason = %reason, "write transaction aborted");
            return Err(StoreError::TransactionAborted(reason).into());
        }

        let stats = txn.stats;
        let record = txn.into_record();
        if record.is_empty() {
            debug!(actor = %self.actor, "nothing to commit");
            return Ok(value);
        }

        if let Some(log) = writer.as_mut() {
            log.append(&record)?;
        }

        let rev = record.roots.last().map(|root| root.rev.clone());
        let mut committed = self.committed.write().expect("lock poisoned");
        Arc::make_mut(&mut committed).apply(record);
        let published = Arc::clone(&committed);
        drop(committed);

        if let Some(log) = writer.as_mut() {
            compact_if_wanted(&self.actor, &self.config, log, &published);
        }

        info!(
            actor = %self.actor,
            rev = ?rev,
            puts = stats.blocks_put,
            deletes = stats.blocks_deleted,
            "transaction committed"
        );
        Ok(value)
    }

    /// Rewrite the commit log as one record of the current state.
    ///
    /// Waits for any running writer. Returns the new log length, or `None`
    /// for a repo without a log.
    pub fn compact(&self) -> StoreResult<Option<u64>> {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        let Some(log) = writer.as_mut() else {
            return Ok(None);
        };
        let snapshot = Arc::clone(&self.committed.read().expect("lock poisoned"));
        let before = log.len();
        log.rewrite(&snapshot.to_record())?;
        info!(actor = %self.actor, before, after = log.len(), "commit log compacted");
        Ok(Some(log.len()))
    }

    /// Current length of the commit log, if the repo has one.
    pub fn log_len(&self) -> Option<u64> {
        self.writer.lock().expect("writer lock poisoned").as_ref().map(CommitLog::len)
    }
}

/// Compact `log` when its dead share passes the configured threshold.
///
/// The commit that triggered it is already durable, so a failure here is
/// logged and left for the next attempt.
fn compact_if_wanted(actor: &ActorId, config: &StoreConfig, log: &mut CommitLog, snapshot: &RepoSnapshot) {
    let before = log.len();
    if !config.wants_compaction(before, snapshot.live_len()) {
        return;
    }
    match log.rewrite(&snapshot.to_record()) {
        Ok(()) => info!(actor = %actor, before, after = log.len(), "commit log compacted"),
        Err(e) => warn!(actor = %actor, error = %e, "commit log compaction failed"),
    }
}

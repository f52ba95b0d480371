use std::collections::HashSet;

use bytes::Bytes;
use tracing::debug;

use pds_car::CarFrames;
use pds_repo::mst::{next_step, PathStep};
use pds_repo::{BlockSource, Commit, MstNode, NodeEntry};
use pds_types::{Cid, RecordPath};

use crate::error::{SyncError, SyncResult};

#[derive(Debug)]
enum Task {
    Commit(Cid),
    /// Continue the search for `keys[key]` at `node`.
    Path { key: usize, node: Cid },
    /// Emit a node and everything below it.
    Subtree(Cid),
    Record(Cid),
}

/// Depth-first walk producing the blocks of an export, one at a time.
///
/// A record walk emits the commit, the tree nodes on the search path of each
/// key and the record blocks of keys that exist. Subtrees off those paths are
/// never read. A full walk emits the commit and every node and record below
/// it. Each block is emitted at most once.
///
/// A referenced block missing from `repo` is yielded as an error and ends
/// the walk.
#[derive(Debug)]
pub struct BlockWalk<R> {
    repo: R,
    keys: Vec<String>,
    full: bool,
    stack: Vec<Task>,
    emitted: HashSet<Cid>,
    blocks_read: usize,
    done: bool,
}

impl<R: BlockSource> BlockWalk<R> {
    /// Walk proving inclusion or absence of each of `paths` under `commit`.
    pub fn records(repo: R, commit: Cid, paths: &[RecordPath]) -> Self {
        Self::new(repo, commit, paths.iter().map(RecordPath::data_key).collect(), false)
    }

    /// Walk of the whole repo under `commit`.
    pub fn full(repo: R, commit: Cid) -> Self {
        Self::new(repo, commit, Vec::new(), true)
    }

    fn new(repo: R, commit: Cid, keys: Vec<String>, full: bool) -> Self {
        Self {
            repo,
            keys,
            full,
            stack: vec![Task::Commit(commit)],
            emitted: HashSet::new(),
            blocks_read: 0,
            done: false,
        }
    }

    /// Blocks fetched from the repo so far, including path nodes re-read for
    /// a later key.
    pub fn blocks_read(&self) -> usize {
        self.blocks_read
    }

    pub fn blocks_emitted(&self) -> usize {
        self.emitted.len()
    }

    fn fetch(&mut self, cid: &Cid) -> SyncResult<Bytes> {
        self.blocks_read += 1;
        Ok(self.repo.read_block(cid)?)
    }

    /// Process one task; returns the block to emit, if any.
    fn step(&mut self, task: Task) -> SyncResult<Option<(Cid, Bytes)>> {
        match task {
            Task::Commit(cid) => {
                let bytes = self.fetch(&cid)?;
                let commit = Commit::decode(cid, &bytes)?;
                if self.full {
                    self.stack.push(Task::Subtree(commit.data));
                } else {
                    for key in (0..self.keys.len()).rev() {
                        self.stack.push(Task::Path { key, node: commit.data });
                    }
                }
                Ok(self.emit(cid, bytes))
            }
            Task::Path { key, node } => {
                let bytes = self.fetch(&node)?;
                let decoded = MstNode::decode(node, &bytes)?;
                match next_step(&decoded, &self.keys[key]) {
                    PathStep::Found(record) => self.stack.push(Task::Record(record)),
                    PathStep::Descend(subtree) => self.stack.push(Task::Path { key, node: subtree }),
                    PathStep::Absent => {}
                }
                Ok(self.emit(node, bytes))
            }
            Task::Subtree(node) => {
                if self.emitted.contains(&node) {
                    return Ok(None);
                }
                let bytes = self.fetch(&node)?;
                let decoded = MstNode::decode(node, &bytes)?;
                for entry in decoded.entries().iter().rev() {
                    self.stack.push(match entry {
                        NodeEntry::Tree(cid) => Task::Subtree(*cid),
                        NodeEntry::Leaf { value, .. } => Task::Record(*value),
                    });
                }
                Ok(self.emit(node, bytes))
            }
            Task::Record(cid) => {
                if self.emitted.contains(&cid) {
                    return Ok(None);
                }
                let bytes = self.fetch(&cid)?;
                Ok(self.emit(cid, bytes))
            }
        }
    }

    fn emit(&mut self, cid: Cid, bytes: Bytes) -> Option<(Cid, Bytes)> {
        self.emitted.insert(cid).then_some((cid, bytes))
    }
}

impl<R: BlockSource> Iterator for BlockWalk<R> {
    type Item = SyncResult<(Cid, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(task) = self.stack.pop() {
            match self.step(task) {
                Ok(Some(block)) => return Some(Ok(block)),
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    self.stack.clear();
                    debug!(error = %e, emitted = self.emitted.len(), "export walk failed");
                    return Some(Err(e));
                }
            }
        }
        self.done = true;
        debug!(
            emitted = self.emitted.len(),
            read = self.blocks_read,
            "export walk complete"
        );
        None
    }
}

/// Archive frames of a block walk.
pub type ExportFrames<R> = CarFrames<BlockWalk<R>>;

fn ensure_commit<R: BlockSource>(repo: &R, commit: &Cid) -> SyncResult<()> {
    if !repo.has_block(commit)? {
        return Err(SyncError::CommitNotFound(*commit));
    }
    Ok(())
}

/// Frames of an archive rooted at `commit` proving each of `paths`.
///
/// Fails with `CommitNotFound` before producing anything if `commit` is not
/// stored. Absent records are not an error; their absence proof is included.
pub fn get_records<R: BlockSource>(repo: R, commit: Cid, paths: &[RecordPath]) -> SyncResult<ExportFrames<R>> {
    ensure_commit(&repo, &commit)?;
    Ok(CarFrames::new(commit, BlockWalk::records(repo, commit, paths)))
}

/// Frames of an archive holding every block reachable from `commit`.
pub fn get_repo<R: BlockSource>(repo: R, commit: Cid) -> SyncResult<ExportFrames<R>> {
    ensure_commit(&repo, &commit)?;
    Ok(CarFrames::new(commit, BlockWalk::full(repo, commit)))
}

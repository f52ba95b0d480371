use pds_types::Cid;

use crate::error::RepoResult;
use crate::mst::node::{MstNode, NodeEntry};
use crate::reader::BlockSource;

/// Where a key search goes from one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStep {
    /// The key is a leaf of this node; carries the record CID.
    Found(Cid),
    /// The key can only be in this subtree.
    Descend(Cid),
    /// The key is not in the tree; this node proves it.
    Absent,
}

/// Decide the next step of a search for `key` at `node`.
pub fn next_step(node: &MstNode, key: &str) -> PathStep {
    let entries = node.entries();
    let index = node.find_gt_or_equal_leaf_index(key);
    if let Some(NodeEntry::Leaf { key: found, value }) = entries.get(index) {
        if found == key {
            return PathStep::Found(*value);
        }
    }
    match index.checked_sub(1).and_then(|i| entries.get(i)) {
        Some(NodeEntry::Tree(subtree)) => PathStep::Descend(*subtree),
        _ => PathStep::Absent,
    }
}

/// CIDs proving presence or absence of `key`: every node on the search path
/// from `data_root`, then the record CID if the key exists.
pub fn cids_for_path<R: BlockSource + ?Sized>(repo: &R, data_root: Cid, key: &str) -> RepoResult<Vec<Cid>> {
    let mut cids = Vec::new();
    let mut current = data_root;
    loop {
        cids.push(current);
        let node = repo.read_node(&current)?;
        match next_step(&node, key) {
            PathStep::Found(value) => {
                cids.push(value);
                return Ok(cids);
            }
            PathStep::Descend(subtree) => current = subtree,
            PathStep::Absent => return Ok(cids),
        }
    }
}

/// The record CID stored under `key`, if any.
pub fn lookup<R: BlockSource + ?Sized>(repo: &R, data_root: Cid, key: &str) -> RepoResult<Option<Cid>> {
    let mut current = data_root;
    loop {
        let node = repo.read_node(&current)?;
        match next_step(&node, key) {
            PathStep::Found(value) => return Ok(Some(value)),
            PathStep::Descend(subtree) => current = subtree,
            PathStep::Absent => return Ok(None),
        }
    }
}

/// Every `(key, record CID)` in the tree, in key order.
pub fn list_leaves<R: BlockSource + ?Sized>(repo: &R, data_root: Cid) -> RepoResult<Vec<(String, Cid)>> {
    let mut out = Vec::new();
    collect_leaves(repo, data_root, &mut out)?;
    Ok(out)
}

fn collect_leaves<R: BlockSource + ?Sized>(repo: &R, cid: Cid, out: &mut Vec<(String, Cid)>) -> RepoResult<()> {
    let node = repo.read_node(&cid)?;
    for entry in node.entries() {
        match entry {
            NodeEntry::Tree(subtree) => collect_leaves(repo, *subtree, out)?,
            NodeEntry::Leaf { key, value } => out.push((key.clone(), *value)),
        }
    }
    Ok(())
}

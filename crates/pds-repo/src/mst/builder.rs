use std::collections::BTreeMap;

use pds_store::BlockMap;
use pds_types::{Cid, RecordPath};

use crate::error::{RepoError, RepoResult};
use crate::mst::node::{layer_for_key, MstNode, NodeEntry};

/// Output of [`MstBuilder::build`]: the tree root and every node block.
#[derive(Clone, Debug)]
pub struct BuiltTree {
    pub root: Cid,
    pub blocks: BlockMap,
}

/// Builds a whole tree from a set of records.
///
/// The shape depends only on the keys, so the same record set always yields
/// the same root. Used to import repos and to produce fixtures; it does not
/// compute incremental edits.
#[derive(Clone, Debug, Default)]
pub struct MstBuilder {
    leaves: BTreeMap<String, Cid>,
}

impl MstBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record CID for `path`, returning the previous one.
    pub fn insert(&mut self, path: &RecordPath, value: Cid) -> Option<Cid> {
        self.leaves.insert(path.data_key(), value)
    }

    pub fn remove(&mut self, path: &RecordPath) -> Option<Cid> {
        self.leaves.remove(&path.data_key())
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn build(&self) -> RepoResult<BuiltTree> {
        let items: Vec<(&str, Cid, u32)> = self
            .leaves
            .iter()
            .map(|(key, value)| (key.as_str(), *value, layer_for_key(key)))
            .collect();
        let top = items.iter().map(|(_, _, layer)| *layer).max().unwrap_or(0);

        let mut blocks = BlockMap::new();
        let root = build_node(&items, top, &mut blocks)?;
        Ok(BuiltTree { root, blocks })
    }
}

/// Build the node for `items` at `layer`. Every item's layer is `<= layer`.
fn build_node(items: &[(&str, Cid, u32)], layer: u32, blocks: &mut BlockMap) -> RepoResult<Cid> {
    let mut entries = Vec::new();
    let mut run_start = 0;
    for (i, (key, value, key_layer)) in items.iter().enumerate() {
        if *key_layer < layer {
            continue;
        }
        if run_start < i {
            entries.push(NodeEntry::Tree(build_node(&items[run_start..i], layer - 1, blocks)?));
        }
        entries.push(NodeEntry::leaf(*key, *value));
        run_start = i + 1;
    }
    if run_start < items.len() {
        entries.push(NodeEntry::Tree(build_node(&items[run_start..], layer - 1, blocks)?));
    }

    let node = MstNode::new(entries).map_err(RepoError::Encode)?;
    let (cid, bytes) = node.to_block()?;
    blocks.set(cid, bytes);
    Ok(cid)
}

use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use pds_types::{Cid, Codec};

/// Set of CIDs, ordered for deterministic iteration.
pub type CidSet = BTreeSet<Cid>;

/// Non-persistent `cid -> bytes` map.
///
/// Used as the write buffer of a commit and as the read-through cache of a
/// reader or transactor. Never authoritative: anything missing here is
/// looked up in the block store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockMap {
    blocks: BTreeMap<Cid, Bytes>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert bytes under the CID computed for `codec`, returning the CID.
    pub fn add(&mut self, codec: Codec, content: impl Into<Bytes>) -> Cid {
        let content = content.into();
        let cid = Cid::compute(codec, &content);
        self.blocks.insert(cid, content);
        cid
    }

    pub fn set(&mut self, cid: Cid, content: impl Into<Bytes>) {
        self.blocks.insert(cid, content.into());
    }

    pub fn get(&self, cid: &Cid) -> Option<&Bytes> {
        self.blocks.get(cid)
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.blocks.contains_key(cid)
    }

    pub fn delete(&mut self, cid: &Cid) -> Option<Bytes> {
        self.blocks.remove(cid)
    }

    /// Split `cids` into the blocks held here and the ones that are not.
    pub fn get_many<'a>(&self, cids: impl IntoIterator<Item = &'a Cid>) -> (BlockMap, Vec<Cid>) {
        let mut found = BlockMap::new();
        let mut missing = Vec::new();
        for cid in cids {
            match self.blocks.get(cid) {
                Some(bytes) => found.set(*cid, bytes.clone()),
                None => missing.push(*cid),
            }
        }
        (found, missing)
    }

    /// Copy every entry of `other` into this map.
    pub fn add_map(&mut self, other: &BlockMap) {
        for (cid, bytes) in &other.blocks {
            self.blocks.insert(*cid, bytes.clone());
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total content bytes held.
    pub fn byte_size(&self) -> usize {
        self.blocks.values().map(Bytes::len).sum()
    }

    pub fn cids(&self) -> impl Iterator<Item = &Cid> {
        self.blocks.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Cid, Bytes> {
        self.blocks.iter()
    }
}

impl FromIterator<(Cid, Bytes)> for BlockMap {
    fn from_iter<I: IntoIterator<Item = (Cid, Bytes)>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for BlockMap {
    type Item = (Cid, Bytes);
    type IntoIter = btree_map::IntoIter<Cid, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

impl<'a> IntoIterator for &'a BlockMap {
    type Item = (&'a Cid, &'a Bytes);
    type IntoIter = btree_map::Iter<'a, Cid, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}

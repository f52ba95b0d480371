use serde::{Deserialize, Serialize};

use pds_types::Cid;

use crate::error::{RepoError, RepoResult};

/// One decoded entry of a tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEntry {
    /// Pointer to a subtree holding keys between its neighbouring leaves.
    Tree(Cid),
    /// A record: data key and the CID of the record block.
    Leaf { key: String, value: Cid },
}

impl NodeEntry {
    pub fn leaf(key: impl Into<String>, value: Cid) -> Self {
        Self::Leaf {
            key: key.into(),
            value,
        }
    }
}

/// Wire form: `{l, e: [{p, k, v, t}]}` with keys prefix-compressed against
/// the previous leaf of the same node.
#[derive(Serialize, Deserialize)]
struct NodeData {
    l: Option<Cid>,
    e: Vec<EntryData>,
}

#[derive(Serialize, Deserialize)]
struct EntryData {
    p: usize,
    #[serde(with = "serde_bytes")]
    k: Vec<u8>,
    v: Cid,
    t: Option<Cid>,
}

/// A node of the Merkle search tree.
///
/// Entries alternate between optional subtrees and leaves in key order:
/// `[Tree?, Leaf, Tree?, Leaf, ..., Tree?]`. Two subtrees are never adjacent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MstNode {
    entries: Vec<NodeEntry>,
}

impl MstNode {
    /// Build a node from entries, checking their shape and key order.
    pub fn new(entries: Vec<NodeEntry>) -> Result<Self, String> {
        let mut last_key: Option<&str> = None;
        let mut last_was_tree = false;
        for entry in &entries {
            match entry {
                NodeEntry::Tree(_) => {
                    if last_was_tree {
                        return Err("adjacent subtree pointers".into());
                    }
                    last_was_tree = true;
                }
                NodeEntry::Leaf { key, .. } => {
                    if last_key.is_some_and(|prev| prev >= key.as_str()) {
                        return Err(format!("key {key:?} out of order"));
                    }
                    last_key = Some(key);
                    last_was_tree = false;
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Leaves of this node in key order.
    pub fn leaves(&self) -> impl Iterator<Item = (&str, &Cid)> {
        self.entries.iter().filter_map(|entry| match entry {
            NodeEntry::Leaf { key, value } => Some((key.as_str(), value)),
            NodeEntry::Tree(_) => None,
        })
    }

    /// Subtree pointers of this node, left to right.
    pub fn subtrees(&self) -> impl Iterator<Item = &Cid> {
        self.entries.iter().filter_map(|entry| match entry {
            NodeEntry::Tree(cid) => Some(cid),
            NodeEntry::Leaf { .. } => None,
        })
    }

    /// Index of the first leaf whose key is `>= key`, or `entries().len()`.
    pub fn find_gt_or_equal_leaf_index(&self, key: &str) -> usize {
        self.entries
            .iter()
            .position(|entry| matches!(entry, NodeEntry::Leaf { key: k, .. } if k.as_str() >= key))
            .unwrap_or(self.entries.len())
    }

    pub fn encode(&self) -> RepoResult<Vec<u8>> {
        let mut iter = self.entries.iter().peekable();
        let l = match iter.peek() {
            Some(NodeEntry::Tree(cid)) => {
                let cid = *cid;
                iter.next();
                Some(cid)
            }
            _ => None,
        };

        let mut e = Vec::new();
        let mut prev: &[u8] = &[];
        while let Some(entry) = iter.next() {
            let NodeEntry::Leaf { key, value } = entry else {
                return Err(RepoError::Encode("adjacent subtree pointers".into()));
            };
            let t = match iter.peek() {
                Some(NodeEntry::Tree(cid)) => {
                    let cid = *cid;
                    iter.next();
                    Some(cid)
                }
                _ => None,
            };
            let key = key.as_bytes();
            let p = common_prefix_len(prev, key);
            e.push(EntryData {
                p,
                k: key[p..].to_vec(),
                v: *value,
                t,
            });
            prev = key;
        }

        serde_cbor::to_vec(&NodeData { l, e }).map_err(|err| RepoError::Encode(err.to_string()))
    }

    /// Encode and compute the node's CID.
    pub fn to_block(&self) -> RepoResult<(Cid, Vec<u8>)> {
        let bytes = self.encode()?;
        Ok((Cid::cbor(&bytes), bytes))
    }

    /// Decode the node stored under `cid`.
    pub fn decode(cid: Cid, bytes: &[u8]) -> RepoResult<Self> {
        let data: NodeData =
            serde_cbor::from_slice(bytes).map_err(|e| RepoError::malformed(cid, e))?;

        let mut entries = Vec::with_capacity(data.e.len() * 2 + 1);
        if let Some(left) = data.l {
            entries.push(NodeEntry::Tree(left));
        }
        let mut prev: Vec<u8> = Vec::new();
        for entry in data.e {
            if entry.p > prev.len() {
                return Err(RepoError::malformed(cid, "key prefix longer than previous key"));
            }
            let mut key = prev[..entry.p].to_vec();
            key.extend_from_slice(&entry.k);
            let key_str = String::from_utf8(key.clone())
                .map_err(|_| RepoError::malformed(cid, "key is not UTF-8"))?;
            entries.push(NodeEntry::Leaf {
                key: key_str,
                value: entry.v,
            });
            if let Some(right) = entry.t {
                entries.push(NodeEntry::Tree(right));
            }
            prev = key;
        }

        Self::new(entries).map_err(|reason| RepoError::malformed(cid, reason))
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Tree layer of a key: leading zero bit pairs of its BLAKE3 hash (fanout 4).
pub fn layer_for_key(key: &str) -> u32 {
    let hash = blake3::hash(key.as_bytes());
    let mut layer = 0;
    for byte in hash.as_bytes() {
        if *byte == 0 {
            layer += 4;
            continue;
        }
        layer += byte.leading_zeros() / 2;
        break;
    }
    layer
}

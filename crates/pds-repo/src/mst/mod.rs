//! Merkle search tree: node codec, key search and whole-tree construction.

pub mod builder;
pub mod node;
pub mod walk;

pub use builder::{BuiltTree, MstBuilder};
pub use node::{layer_for_key, MstNode, NodeEntry};
pub use walk::{cids_for_path, list_leaves, lookup, next_step, PathStep};

//! Actor repo access on top of `pds-store`.
//!
//! - [`RepoReader`] resolves the head root and reads blocks from one
//!   committed snapshot.
//! - [`RepoTransactor`] is the write path: block writes, root appends and
//!   atomic application of a precomputed [`CommitData`].
//! - [`mst`] decodes and searches Merkle search tree nodes; [`Commit`] is
//!   the signed commit block at the top of every repo.
//!
//! Tree edits are computed elsewhere; this crate only persists their result.

pub mod commit;
pub mod error;
pub mod mst;
pub mod reader;
pub mod transactor;

pub use commit::{Commit, CommitData, COMMIT_VERSION};
pub use error::{RepoError, RepoResult};
pub use mst::{MstBuilder, MstNode, NodeEntry};
pub use reader::{BlockSource, RepoRead, RepoReader};
pub use transactor::RepoTransactor;

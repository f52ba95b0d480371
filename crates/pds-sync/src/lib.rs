//! Repo export for peer sync.
//!
//! - [`export`] walks a repo from a commit and yields the blocks proving the
//!   presence or absence of requested records, or of the whole repo, framed
//!   as a CAR archive.
//! - [`CarStream`] runs that walk in the background behind a bounded channel
//!   so the archive is never held in memory whole.
//! - [`SyncService`] resolves actors and commits and serves exports and
//!   blobs; [`ProofVerifier`] checks archives on the receiving side.

pub mod config;
pub mod error;
pub mod export;
pub mod service;
pub mod stream;
pub mod verify;

#[cfg(test)]
mod scenario;

pub use config::{ExportConfig, DEFAULT_CHANNEL_CAPACITY};
pub use error::{SyncError, SyncResult};
pub use export::{get_records, get_repo, BlockWalk, ExportFrames};
pub use service::{BlobResponse, CarResponse, SyncService, DEFAULT_BLOB_MIME_TYPE};
pub use stream::CarStream;
pub use verify::{ProofReport, ProofVerifier, RecordProof};

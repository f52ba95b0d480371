//! Per-actor block storage.
//!
//! Every actor's repo is an independent unit: a content-addressed block table
//! plus an append-only log of roots, held by an [`ActorDb`]. Readers take a
//! [`ReadHandle`] on an immutable snapshot; one writer at a time stages work
//! in a [`WriteTxn`] that is published atomically on commit.
//!
//! # Storage Backends
//!
//! - In memory ([`ActorDb::in_memory`], [`InMemoryBlobStore`])
//! - On disk: one [`CommitLog`] per actor, replayed on open and rewritten
//!   as a single record once mostly dead, and a [`DiskBlobStore`] directory
//!   per actor
//!
//! # Design Rules
//!
//! 1. Blocks are immutable; writing an existing CID is a no-op.
//! 2. Content is verified against its CID before it is staged.
//! 3. Readers never observe a partially applied transaction.
//! 4. A failed operation aborts its whole transaction.
//! 5. Mutating an aborted transaction is a fatal programming error.

pub mod actor_store;
pub mod blob;
pub mod block;
pub mod block_map;
pub mod config;
pub mod db;
pub mod error;
pub mod log;

pub use actor_store::ActorStore;
pub use blob::{BlobData, BlobStore, DiskBlobStore, InMemoryBlobStore};
pub use block::{RootEntry, StoredBlock};
pub use block_map::{BlockMap, CidSet};
pub use config::{
    StoreConfig, SyncMode, DEFAULT_COMPACT_DEAD_PERCENT, DEFAULT_COMPACT_MIN_BYTES, DEFAULT_PREFETCH_LIMIT,
    DEFAULT_PUT_CHUNK_SIZE,
};
pub use db::{ActorDb, ReadHandle, RepoSnapshot, TxnPhase, TxnStats, WriteTxn};
pub use error::{StoreError, StoreResult};
pub use log::{CommitLog, LogRecord};

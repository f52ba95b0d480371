//! Foundation types for per-actor repository storage.
//!
//! Every other crate in the workspace depends on `pds-types`.
//!
//! # Key Types
//!
//! - [`Cid`]: content identifier (codec + BLAKE3 digest)
//! - [`Rev`]: sortable commit revision; [`RevClock`] issues new ones
//! - [`RecordPath`]: `collection/rkey` address of a record
//! - [`ActorId`]: DID of the actor owning a repo

pub mod actor;
pub mod cid;
pub mod error;
pub mod path;
pub mod rev;
pub mod varint;

pub use actor::ActorId;
pub use cid::{Cid, Codec, CID_BYTES_LEN};
pub use error::TypeError;
pub use path::RecordPath;
pub use rev::{Rev, RevClock};

//! CAR v1 archives: a varint-framed CBOR header naming the root, followed
//! by `varint | cid | data` frames, one per block.
//!
//! [`CarFrames`] produces frames lazily from any block source so archives
//! can be streamed without being held in memory. [`CarReader`] decodes and
//! verifies them.

pub mod error;
pub mod header;
pub mod reader;
pub mod writer;

pub use error::{CarError, CarResult};
pub use header::{CarHeader, CAR_VERSION};
pub use reader::{read_car, CarReader};
pub use writer::{block_frame, header_frame, write_car, CarFrames, CarWriter};

/// MIME type of a CAR archive.
pub const CAR_CONTENT_TYPE: &str = "application/vnd.ipld.car";

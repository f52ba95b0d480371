use serde::{Deserialize, Serialize};

use pds_types::Cid;

use crate::error::{CarError, CarResult};

/// The only archive version produced and accepted.
pub const CAR_VERSION: u64 = 1;

/// CBOR header at the start of every archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeader {
    pub version: u64,
    pub roots: Vec<Cid>,
}

impl CarHeader {
    /// Header naming a single root.
    pub fn new(root: Cid) -> Self {
        Self {
            version: CAR_VERSION,
            roots: vec![root],
        }
    }

    pub fn encode(&self) -> CarResult<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| CarError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> CarResult<Self> {
        let header: Self =
            serde_cbor::from_slice(bytes).map_err(|e| CarError::InvalidHeader(e.to_string()))?;
        if header.version != CAR_VERSION {
            return Err(CarError::UnsupportedVersion(header.version));
        }
        if header.roots.is_empty() {
            return Err(CarError::InvalidHeader("no roots".into()));
        }
        Ok(header)
    }
}

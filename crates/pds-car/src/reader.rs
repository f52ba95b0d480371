use bytes::Bytes;

use pds_types::varint::decode_varint;
use pds_types::Cid;

use crate::error::{CarError, CarResult};
use crate::header::CarHeader;

/// Reads an archive from memory, verifying every block against its CID.
///
/// Iterating yields `(cid, data)` pairs in archive order and stops after the
/// first error.
#[derive(Debug)]
pub struct CarReader<'a> {
    header: CarHeader,
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> CarReader<'a> {
    /// Parse the header; blocks are decoded on demand.
    pub fn new(data: &'a [u8]) -> CarResult<Self> {
        let (len, consumed) = decode_varint(data).map_err(|e| CarError::CorruptFrame {
            offset: 0,
            reason: e.to_string(),
        })?;
        let end = consumed
            .checked_add(len as usize)
            .filter(|end| *end <= data.len())
            .ok_or(CarError::Truncated { offset: 0 })?;
        let header = CarHeader::decode(&data[consumed..end])?;
        Ok(Self {
            header,
            data,
            offset: end,
            failed: false,
        })
    }

    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// The first root named by the header.
    pub fn root(&self) -> Cid {
        self.header.roots[0]
    }

    fn read_frame(&mut self) -> CarResult<(Cid, Bytes)> {
        let start = self.offset;
        let rest = &self.data[start..];
        let (len, consumed) = decode_varint(rest).map_err(|e| CarError::CorruptFrame {
            offset: start,
            reason: e.to_string(),
        })?;
        let body = rest
            .get(consumed..consumed.saturating_add(len as usize))
            .ok_or(CarError::Truncated { offset: start })?;
        let (cid, cid_len) = Cid::read_bytes(body).map_err(|e| CarError::CorruptFrame {
            offset: start,
            reason: e.to_string(),
        })?;
        let content = &body[cid_len..];
        if !cid.verify(content) {
            return Err(CarError::CidMismatch(cid));
        }
        self.offset = start + consumed + body.len();
        Ok((cid, Bytes::copy_from_slice(content)))
    }
}

impl Iterator for CarReader<'_> {
    type Item = CarResult<(Cid, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let frame = self.read_frame();
        self.failed = frame.is_err();
        Some(frame)
    }
}

/// Decode a whole archive.
pub fn read_car(data: &[u8]) -> CarResult<(CarHeader, Vec<(Cid, Bytes)>)> {
    let reader = CarReader::new(data)?;
    let header = reader.header().clone();
    let blocks = reader.collect::<CarResult<Vec<_>>>()?;
    Ok((header, blocks))
}

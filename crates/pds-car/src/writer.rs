use std::io::Write;

use bytes::Bytes;
use tracing::debug;

use pds_types::varint::{encode_varint, varint_len};
use pds_types::{Cid, CID_BYTES_LEN};

use crate::error::{CarError, CarResult};
use crate::header::CarHeader;

/// Frame the header: `varint(len) | cbor(header)`.
pub fn header_frame(header: &CarHeader) -> CarResult<Bytes> {
    let encoded = header.encode()?;
    let mut frame = Vec::with_capacity(varint_len(encoded.len() as u64) + encoded.len());
    encode_varint(&mut frame, encoded.len() as u64);
    frame.extend_from_slice(&encoded);
    Ok(Bytes::from(frame))
}

/// Frame one block: `varint(len(cid) + len(data)) | cid | data`.
pub fn block_frame(cid: &Cid, data: &[u8]) -> Bytes {
    let body_len = CID_BYTES_LEN + data.len();
    let mut frame = Vec::with_capacity(varint_len(body_len as u64) + body_len);
    encode_varint(&mut frame, body_len as u64);
    cid.write_bytes(&mut frame);
    frame.extend_from_slice(data);
    Bytes::from(frame)
}

/// Lazily turns a root and a sequence of blocks into archive frames.
///
/// Yields the header frame first, then one frame per block, pulling each
/// block from the source only when its frame is requested. The first error
/// from the source is yielded and ends the sequence.
#[derive(Debug)]
pub struct CarFrames<I> {
    header: Option<CarHeader>,
    blocks: I,
    done: bool,
    frames: usize,
}

impl<I> CarFrames<I> {
    pub fn new(root: Cid, blocks: I) -> Self {
        Self {
            header: Some(CarHeader::new(root)),
            blocks,
            done: false,
            frames: 0,
        }
    }

    /// Block frames produced so far.
    pub fn blocks_emitted(&self) -> usize {
        self.frames
    }
}

impl<I, E> Iterator for CarFrames<I>
where
    I: Iterator<Item = Result<(Cid, Bytes), E>>,
    E: From<CarError>,
{
    type Item = Result<Bytes, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(header) = self.header.take() {
            let frame = header_frame(&header).map_err(E::from);
            self.done = frame.is_err();
            return Some(frame);
        }
        match self.blocks.next() {
            Some(Ok((cid, data))) => {
                self.frames += 1;
                Some(Ok(block_frame(&cid, &data)))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                debug!(blocks = self.frames, "archive complete");
                None
            }
        }
    }
}

/// Writes a complete archive to any [`Write`] sink.
#[derive(Debug)]
pub struct CarWriter<W> {
    out: W,
    blocks: usize,
}

impl<W: Write> CarWriter<W> {
    /// Start an archive with a single root, writing the header immediately.
    pub fn new(mut out: W, root: Cid) -> CarResult<Self> {
        out.write_all(&header_frame(&CarHeader::new(root))?)?;
        Ok(Self { out, blocks: 0 })
    }

    pub fn write_block(&mut self, cid: &Cid, data: &[u8]) -> CarResult<()> {
        self.out.write_all(&block_frame(cid, data))?;
        self.blocks += 1;
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.blocks
    }

    pub fn finish(mut self) -> CarResult<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Encode a whole archive into memory.
pub fn write_car<'a, I>(root: Cid, blocks: I) -> CarResult<Vec<u8>>
where
    I: IntoIterator<Item = (&'a Cid, &'a [u8])>,
{
    let mut writer = CarWriter::new(Vec::new(), root)?;
    for (cid, data) in blocks {
        writer.write_block(cid, data)?;
    }
    writer.finish()
}

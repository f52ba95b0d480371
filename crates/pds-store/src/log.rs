use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pds_types::Cid;

use crate::block::{RootEntry, StoredBlock};
use crate::config::SyncMode;
use crate::error::{StoreError, StoreResult};

/// Length prefix plus CRC32.
const HEADER_SIZE: usize = 8;

/// The effects of one committed write transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub roots: Vec<RootEntry>,
    pub puts: Vec<StoredBlock>,
    pub deletes: Vec<Cid>,
}

impl LogRecord {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Per-actor commit log.
///
/// On-disk format, one frame per committed transaction:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized LogRecord)]
/// ```
///
/// Opening replays every intact frame. The first frame that is short, fails
/// its checksum or does not decode marks a torn tail left by a crash; it and
/// everything after it is cut off so the next append lands on a clean boundary.
///
/// Appends never touch earlier frames. [`CommitLog::rewrite`] replaces the
/// whole history with one record of the live state.
#[derive(Debug)]
pub struct CommitLog {
    path: PathBuf,
    file: File,
    offset: u64,
    sync_mode: SyncMode,
}

impl CommitLog {
    /// Open (or create) the log at `path` and return it with the recovered records.
    pub fn open(path: &Path, sync_mode: SyncMode) -> StoreResult<(Self, Vec<LogRecord>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let (records, valid_len) = recover(&data);

        if valid_len < data.len() as u64 {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = data.len(),
                "discarding torn commit log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), records = records.len(), "commit log opened");
        let log = Self {
            path: path.to_path_buf(),
            file,
            offset: valid_len,
            sync_mode,
        };
        Ok((log, records))
    }

    /// Append one record. Returns the byte offset it was written at.
    ///
    /// A failed write is cut back off the file before the error is returned.
    pub fn append(&mut self, record: &LogRecord) -> StoreResult<u64> {
        let frame = encode_frame(record)?;

        let entry_offset = self.offset;
        if let Err(e) = self.write_frame(&frame) {
            warn!(offset = entry_offset, error = %e, "commit log append failed; rolling back");
            // Best effort; a leftover partial frame is also cut on the next open.
            let _ = self.file.set_len(entry_offset);
            return Err(e.into());
        }
        self.offset += frame.len() as u64;

        debug!(offset = entry_offset, len = frame.len() - HEADER_SIZE, "commit log append");
        Ok(entry_offset)
    }

    /// Replace the whole log with `record`, which must describe the complete
    /// live state.
    ///
    /// The new log is written beside the old one, synced and renamed over
    /// it. A crash leaves either the old log or the new one in place, and
    /// both replay to the same state.
    pub fn rewrite(&mut self, record: &LogRecord) -> StoreResult<()> {
        let frame = if record.is_empty() {
            Vec::new()
        } else {
            encode_frame(record)?
        };
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&frame)?;
        tmp.as_file().sync_all()?;
        let file = tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;

        let before = self.offset;
        self.file = file;
        self.offset = frame.len() as u64;
        debug!(path = %self.path.display(), before, after = self.offset, "commit log rewritten");
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.file.write_all(frame)?;
        match self.sync_mode {
            SyncMode::EveryWrite => self.file.sync_data(),
            SyncMode::OsDefault => self.file.flush(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of intact log data.
    pub fn len(&self) -> u64 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }
}

fn encode_frame(record: &LogRecord) -> StoreResult<Vec<u8>> {
    let payload =
        bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let length = u32::try_from(payload.len()).map_err(|_| {
        StoreError::Serialization(format!("commit record of {} bytes is too large", payload.len()))
    })?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode frames front to back, stopping at the first damaged one.
/// Returns the records and the length of the intact prefix.
fn recover(data: &[u8]) -> (Vec<LogRecord>, u64) {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let Some(header) = data.get(offset..offset + HEADER_SIZE) else {
            warn!(offset, "truncated commit log header");
            break;
        };
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let start = offset + HEADER_SIZE;
        let Some(payload) = data.get(start..start + length) else {
            warn!(offset, length, "truncated commit log record");
            break;
        };

        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            warn!(offset, expected = expected_crc, actual = actual_crc, "commit log CRC mismatch");
            break;
        }

        match bincode::deserialize::<LogRecord>(payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(offset, error = %e, "undecodable commit log record");
                break;
            }
        }
        offset = start + length;
    }

    (records, offset as u64)
}

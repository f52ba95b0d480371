use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use tracing::debug;

use pds_types::Cid;

use crate::error::{StoreError, StoreResult};

const MIME_SUFFIX: &str = "mime";
const WITHDRAWN_SUFFIX: &str = "withdrawn";

/// A blob as returned to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobData {
    pub cid: Cid,
    pub mime_type: Option<String>,
    pub content: Bytes,
}

impl BlobData {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Content-addressed store for an actor's blobs.
///
/// Blobs are keyed by their raw-codec CID. A withdrawn (taken down) blob is
/// kept but reads as absent until it is restored.
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Store `content` and return its CID. Storing the same bytes again is a no-op.
    fn put_blob(&self, content: Bytes, mime_type: Option<&str>) -> StoreResult<Cid>;

    /// Fetch a blob.
    ///
    /// Returns `StoreError::BlobNotFound` if it is absent or withdrawn.
    fn get_blob(&self, cid: &Cid) -> StoreResult<BlobData>;

    /// Whether a readable (present, not withdrawn) blob exists.
    fn has_blob(&self, cid: &Cid) -> StoreResult<bool>;

    /// Withdraw a blob. Returns `false` if no such blob is stored.
    fn takedown(&self, cid: &Cid) -> StoreResult<bool>;

    /// Make a withdrawn blob readable again. Returns `false` if no such blob is stored.
    fn restore(&self, cid: &Cid) -> StoreResult<bool>;
}

#[derive(Debug)]
struct MemoryBlob {
    content: Bytes,
    mime_type: Option<String>,
    withdrawn: bool,
}

/// `HashMap`-backed blob store for tests and in-memory repos.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<Cid, MemoryBlob>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_withdrawn(&self, cid: &Cid, withdrawn: bool) -> bool {
        let mut blobs = self.blobs.write().expect("lock poisoned");
        match blobs.get_mut(cid) {
            Some(blob) => {
                blob.withdrawn = withdrawn;
                true
            }
            None => false,
        }
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put_blob(&self, content: Bytes, mime_type: Option<&str>) -> StoreResult<Cid> {
        let cid = Cid::raw(&content);
        let mut blobs = self.blobs.write().expect("lock poisoned");
        blobs.entry(cid).or_insert_with(|| MemoryBlob {
            content,
            mime_type: mime_type.map(str::to_owned),
            withdrawn: false,
        });
        Ok(cid)
    }

    fn get_blob(&self, cid: &Cid) -> StoreResult<BlobData> {
        let blobs = self.blobs.read().expect("lock poisoned");
        match blobs.get(cid) {
            Some(blob) if !blob.withdrawn => Ok(BlobData {
                cid: *cid,
                mime_type: blob.mime_type.clone(),
                content: blob.content.clone(),
            }),
            _ => Err(StoreError::BlobNotFound(*cid)),
        }
    }

    fn has_blob(&self, cid: &Cid) -> StoreResult<bool> {
        let blobs = self.blobs.read().expect("lock poisoned");
        Ok(blobs.get(cid).is_some_and(|blob| !blob.withdrawn))
    }

    fn takedown(&self, cid: &Cid) -> StoreResult<bool> {
        Ok(self.set_withdrawn(cid, true))
    }

    fn restore(&self, cid: &Cid) -> StoreResult<bool> {
        Ok(self.set_withdrawn(cid, false))
    }
}

/// Blob store keeping one file per blob under a directory.
///
/// Layout: `<cid>` holds the bytes, `<cid>.mime` the MIME type if one was
/// given, and an empty `<cid>.withdrawn` marks a takedown. Blob files are
/// written to a temporary file and renamed into place.
#[derive(Debug)]
pub struct DiskBlobStore {
    dir: PathBuf,
}

impl DiskBlobStore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, cid: &Cid) -> PathBuf {
        self.dir.join(cid.to_string())
    }

    fn sidecar_path(&self, cid: &Cid, suffix: &str) -> PathBuf {
        self.dir.join(format!("{cid}.{suffix}"))
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> StoreResult<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content)?;
        tmp.as_file().sync_data()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

impl BlobStore for DiskBlobStore {
    fn put_blob(&self, content: Bytes, mime_type: Option<&str>) -> StoreResult<Cid> {
        let cid = Cid::raw(&content);
        let path = self.blob_path(&cid);
        if path.exists() {
            return Ok(cid);
        }
        if let Some(mime) = mime_type {
            self.write_atomic(&self.sidecar_path(&cid, MIME_SUFFIX), mime.as_bytes())?;
        }
        self.write_atomic(&path, &content)?;
        debug!(cid = %cid, size = content.len(), "blob stored");
        Ok(cid)
    }

    fn get_blob(&self, cid: &Cid) -> StoreResult<BlobData> {
        if self.sidecar_path(cid, WITHDRAWN_SUFFIX).exists() {
            return Err(StoreError::BlobNotFound(*cid));
        }
        let content = match fs::read(self.blob_path(cid)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::BlobNotFound(*cid)),
            Err(e) => return Err(e.into()),
        };
        if !cid.verify(&content) {
            return Err(StoreError::CidMismatch(*cid));
        }
        let mime_type = match fs::read_to_string(self.sidecar_path(cid, MIME_SUFFIX)) {
            Ok(mime) => Some(mime),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(BlobData {
            cid: *cid,
            mime_type,
            content: Bytes::from(content),
        })
    }

    fn has_blob(&self, cid: &Cid) -> StoreResult<bool> {
        Ok(self.blob_path(cid).exists() && !self.sidecar_path(cid, WITHDRAWN_SUFFIX).exists())
    }

    fn takedown(&self, cid: &Cid) -> StoreResult<bool> {
        if !self.blob_path(cid).exists() {
            return Ok(false);
        }
        fs::write(self.sidecar_path(cid, WITHDRAWN_SUFFIX), b"")?;
        debug!(cid = %cid, "blob withdrawn");
        Ok(true)
    }

    fn restore(&self, cid: &Cid) -> StoreResult<bool> {
        if !self.blob_path(cid).exists() {
            return Ok(false);
        }
        match fs::remove_file(self.sidecar_path(cid, WITHDRAWN_SUFFIX)) {
            Ok(()) => debug!(cid = %cid, "blob restored"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }
}

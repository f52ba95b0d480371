use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use pds_car::CAR_CONTENT_TYPE;
use pds_repo::{BlockSource, Commit, RepoRead, RepoReader};
use pds_store::{ActorStore, StoreError};
use pds_types::{ActorId, Cid, RecordPath};

use crate::config::ExportConfig;
use crate::error::{SyncError, SyncResult};
use crate::export::{self, ExportFrames};
use crate::stream::CarStream;

/// MIME type reported for blobs stored without one.
pub const DEFAULT_BLOB_MIME_TYPE: &str = "application/octet-stream";

/// A streamed archive export.
#[derive(Debug)]
pub struct CarResponse {
    pub content_type: &'static str,
    /// Commit the archive is rooted at.
    pub root: Cid,
    pub stream: CarStream,
}

/// A blob with the response headers it must be served with.
#[derive(Clone, Debug)]
pub struct BlobResponse {
    pub cid: Cid,
    pub content_type: String,
    pub content_length: u64,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

impl BlobResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Sync-facing surface of the store: record and repo exports, and blobs.
///
/// Actor, head and commit are resolved before any streaming starts, so
/// every not-found condition is returned as an error rather than as a
/// broken stream.
#[derive(Debug)]
pub struct SyncService {
    store: Arc<ActorStore>,
    config: ExportConfig,
}

impl SyncService {
    pub fn new(store: Arc<ActorStore>, config: ExportConfig) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn store(&self) -> &Arc<ActorStore> {
        &self.store
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Export the proof for one record.
    pub async fn get_record(
        &self,
        actor: &ActorId,
        collection: &str,
        rkey: &str,
        commit: Option<Cid>,
    ) -> SyncResult<CarResponse> {
        let path = RecordPath::new(collection, rkey)?;
        self.get_records(actor, &[path], commit).await
    }

    /// Export proofs for `paths` at `commit`, or at the head if `None`.
    /// With no paths this is a full export.
    pub async fn get_records(
        &self,
        actor: &ActorId,
        paths: &[RecordPath],
        commit: Option<Cid>,
    ) -> SyncResult<CarResponse> {
        if paths.is_empty() {
            return self.get_repo(actor, commit).await;
        }
        let (reader, root) = self.resolve(actor, commit).await?;
        let frames = export::get_records(reader, root, paths)?;
        info!(actor = %actor, root = %root, records = paths.len(), "record export started");
        Ok(self.respond(root, frames))
    }

    /// Export every block reachable from `commit`, or from the head if `None`.
    pub async fn get_repo(&self, actor: &ActorId, commit: Option<Cid>) -> SyncResult<CarResponse> {
        let (reader, root) = self.resolve(actor, commit).await?;
        let frames = export::get_repo(reader, root)?;
        info!(actor = %actor, root = %root, "repo export started");
        Ok(self.respond(root, frames))
    }

    /// Fetch a blob with its serving headers. Withdrawn blobs are not found.
    pub fn get_blob(&self, actor: &ActorId, cid: &Cid) -> SyncResult<BlobResponse> {
        let blobs = self.store.blobs(actor).map_err(repo_not_found)?;
        let blob = blobs.get_blob(cid).map_err(|e| match e {
            StoreError::BlobNotFound(cid) => SyncError::BlobNotFound(cid),
            other => other.into(),
        })?;

        let content_type = blob
            .mime_type
            .clone()
            .unwrap_or_else(|| DEFAULT_BLOB_MIME_TYPE.to_owned());
        let content_length = blob.size();
        let headers = vec![
            ("content-type", content_type.clone()),
            ("content-length", content_length.to_string()),
            ("x-content-type-options", "nosniff".to_owned()),
            ("content-security-policy", "default-src 'none'; sandbox".to_owned()),
        ];
        debug!(actor = %actor, cid = %cid, size = content_length, "blob served");
        Ok(BlobResponse {
            cid: blob.cid,
            content_type,
            content_length,
            headers,
            body: blob.content,
        })
    }

    /// Open a reader on the actor's repo and pick the commit to export.
    ///
    /// Opening may replay a commit log from disk, so it runs on the
    /// blocking pool.
    async fn resolve(&self, actor: &ActorId, commit: Option<Cid>) -> SyncResult<(RepoReader, Cid)> {
        let store = Arc::clone(&self.store);
        let actor = actor.clone();
        tokio::task::spawn_blocking(move || resolve_blocking(&store, &actor, commit))
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))?
    }

    fn respond(&self, root: Cid, frames: ExportFrames<RepoReader>) -> CarResponse {
        CarResponse {
            content_type: CAR_CONTENT_TYPE,
            root,
            stream: CarStream::spawn(frames, self.config.channel_capacity),
        }
    }
}

fn resolve_blocking(store: &ActorStore, actor: &ActorId, commit: Option<Cid>) -> SyncResult<(RepoReader, Cid)> {
    let db = store.open(actor).map_err(repo_not_found)?;
    let reader = RepoReader::new(&db);
    let root = match commit {
        Some(cid) => {
            ensure_commit(&reader, &cid)?;
            cid
        }
        None => reader
            .get_root()
            .ok_or_else(|| SyncError::RepoNotFound(actor.clone()))?,
    };
    debug!(actor = %actor, root = %root, "export resolved");
    Ok((reader, root))
}

/// An explicit commit must be stored and decode as a commit.
fn ensure_commit(reader: &RepoReader, cid: &Cid) -> SyncResult<()> {
    let Some(bytes) = reader.get_block(cid)? else {
        return Err(SyncError::CommitNotFound(*cid));
    };
    if let Err(e) = Commit::decode(*cid, &bytes) {
        debug!(cid = %cid, error = %e, "requested commit is not a commit block");
        return Err(SyncError::CommitNotFound(*cid));
    }
    Ok(())
}

fn repo_not_found(err: StoreError) -> SyncError {
    match err {
        StoreError::ActorNotFound(actor) => SyncError::RepoNotFound(actor),
        other => other.into(),
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use pds_types::ActorId;

use crate::blob::{BlobStore, DiskBlobStore, InMemoryBlobStore};
use crate::config::StoreConfig;
use crate::db::ActorDb;
use crate::error::{StoreError, StoreResult};

/// Registry of per-actor repos and blob stores.
///
/// Each actor gets its own [`ActorDb`]; nothing is shared or locked across
/// actors. Handles are opened lazily and cached until [`ActorStore::close`]
/// or [`ActorStore::evict_idle`] releases them.
#[derive(Debug)]
pub struct ActorStore {
    config: StoreConfig,
    repos: RwLock<HashMap<ActorId, Arc<ActorDb>>>,
    blobs: RwLock<HashMap<ActorId, Arc<dyn BlobStore>>>,
}

impl ActorStore {
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)?;
        }
        info!(data_dir = ?config.data_dir, "actor store opened");
        Ok(Self {
            config,
            repos: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
        })
    }

    /// A store that keeps every repo in memory.
    pub fn in_memory() -> Self {
        Self {
            config: StoreConfig::default(),
            repos: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether a repo has been created for `actor`.
    pub fn exists(&self, actor: &ActorId) -> bool {
        let repos = self.repos.read().expect("lock poisoned");
        repos.contains_key(actor) || self.exists_on_disk(actor)
    }

    fn exists_on_disk(&self, actor: &ActorId) -> bool {
        self.config
            .data_dir
            .as_deref()
            .is_some_and(|dir| ActorDb::log_path(dir, actor).exists())
    }

    /// Create an empty repo for `actor`.
    pub fn create(&self, actor: &ActorId) -> StoreResult<Arc<ActorDb>> {
        let mut repos = self.repos.write().expect("lock poisoned");
        if repos.contains_key(actor) || self.exists_on_disk(actor) {
            return Err(StoreError::ActorExists(actor.clone()));
        }
        let db = Arc::new(ActorDb::open(actor.clone(), self.config.clone())?);
        repos.insert(actor.clone(), Arc::clone(&db));
        info!(actor = %actor, "actor repo created");
        Ok(db)
    }

    /// Open an existing repo.
    pub fn open(&self, actor: &ActorId) -> StoreResult<Arc<ActorDb>> {
        if let Some(db) = self.repos.read().expect("lock poisoned").get(actor) {
            return Ok(Arc::clone(db));
        }

        let mut repos = self.repos.write().expect("lock poisoned");
        if let Some(db) = repos.get(actor) {
            return Ok(Arc::clone(db));
        }
        if !self.exists_on_disk(actor) {
            return Err(StoreError::ActorNotFound(actor.clone()));
        }
        let db = Arc::new(ActorDb::open(actor.clone(), self.config.clone())?);
        repos.insert(actor.clone(), Arc::clone(&db));
        Ok(db)
    }

    /// The blob store of an existing repo.
    pub fn blobs(&self, actor: &ActorId) -> StoreResult<Arc<dyn BlobStore>> {
        if !self.exists(actor) {
            return Err(StoreError::ActorNotFound(actor.clone()));
        }
        if let Some(store) = self.blobs.read().expect("lock poisoned").get(actor) {
            return Ok(Arc::clone(store));
        }

        let mut blobs = self.blobs.write().expect("lock poisoned");
        if let Some(store) = blobs.get(actor) {
            return Ok(Arc::clone(store));
        }
        let store: Arc<dyn BlobStore> = match self.blob_dir(actor) {
            Some(dir) => Arc::new(DiskBlobStore::open(dir)?),
            None => Arc::new(InMemoryBlobStore::new()),
        };
        blobs.insert(actor.clone(), Arc::clone(&store));
        Ok(store)
    }

    fn blob_dir(&self, actor: &ActorId) -> Option<PathBuf> {
        let dir = self.config.data_dir.as_ref()?;
        Some(dir.join("blobs").join(actor.file_stem()))
    }

    /// Release the cached handles of a persistent repo.
    ///
    /// Refused while anything else still holds the repo's [`ActorDb`], since
    /// reopening then would put a second writer on the same commit log. Read
    /// handles already taken stay valid. In-memory repos live only in the
    /// cache and are never released. Returns `true` if the repo was closed.
    pub fn close(&self, actor: &ActorId) -> bool {
        if self.config.data_dir.is_none() {
            return false;
        }
        let mut repos = self.repos.write().expect("lock poisoned");
        match repos.get(actor) {
            Some(db) if Arc::strong_count(db) == 1 => {}
            Some(_) => {
                debug!(actor = %actor, "repo still in use; not closed");
                return false;
            }
            None => return false,
        }
        repos.remove(actor);
        drop(repos);
        self.release_blobs(actor);
        info!(actor = %actor, "actor repo closed");
        true
    }

    /// Close every persistent repo that nothing outside the store holds and
    /// that has no open read handles. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        if self.config.data_dir.is_none() {
            return 0;
        }
        let mut repos = self.repos.write().expect("lock poisoned");
        let idle: Vec<ActorId> = repos
            .iter()
            .filter(|(_, db)| Arc::strong_count(db) == 1 && db.open_read_handles() == 0)
            .map(|(actor, _)| actor.clone())
            .collect();
        for actor in &idle {
            repos.remove(actor);
        }
        drop(repos);

        for actor in &idle {
            self.release_blobs(actor);
        }
        if !idle.is_empty() {
            info!(closed = idle.len(), "idle actor repos evicted");
        }
        idle.len()
    }

    fn release_blobs(&self, actor: &ActorId) {
        let mut blobs = self.blobs.write().expect("lock poisoned");
        if blobs.get(actor).is_some_and(|store| Arc::strong_count(store) == 1) {
            blobs.remove(actor);
        }
    }

    /// Actors whose repos are currently open.
    pub fn open_actors(&self) -> Vec<ActorId> {
        let repos = self.repos.read().expect("lock poisoned");
        let mut actors: Vec<ActorId> = repos.keys().cloned().collect();
        actors.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        actors
    }
}

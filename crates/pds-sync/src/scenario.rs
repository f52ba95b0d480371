//! End-to-end checks: commits built from record edits, applied through the
//! transactor, exported through the service and verified as proofs.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::StreamExt;

use pds_car::CAR_CONTENT_TYPE;
use pds_repo::{BlockSource, Commit, CommitData, MstBuilder, RepoRead, RepoReader, RepoTransactor};
use pds_store::{ActorDb, ActorStore, BlockMap, CidSet, StoreConfig};
use pds_types::{ActorId, Cid, Codec, RecordPath, Rev};

use crate::config::ExportConfig;
use crate::error::SyncError;
use crate::service::SyncService;
use crate::verify::{ProofVerifier, RecordProof};

const COLLECTION: &str = "app.bsky.feed.post";

fn record_bytes(text: &str) -> Bytes {
    Bytes::from(serde_cbor::to_vec(&text).unwrap())
}

/// A committed repo held only as a block map.
pub(crate) struct Fixture {
    pub blocks: BlockMap,
    pub commit: Cid,
    pub data: Cid,
}

impl Fixture {
    pub fn path(i: usize) -> RecordPath {
        RecordPath::new(COLLECTION, format!("post{i:03}")).unwrap()
    }

    pub fn build(n: usize) -> Self {
        let mut blocks = BlockMap::new();
        let mut builder = MstBuilder::new();
        for i in 0..n {
            let cid = blocks.add(Codec::DagCbor, record_bytes(&format!("record body {i}")));
            builder.insert(&Self::path(i), cid);
        }
        let tree = builder.build().unwrap();
        blocks.add_map(&tree.blocks);
        let commit = Commit::new(
            ActorId::new("did:plc:fixture").unwrap(),
            tree.root,
            Rev::new("000001").unwrap(),
            None,
            vec![0; 64],
        );
        let (commit_cid, bytes) = commit.to_block().unwrap();
        blocks.set(commit_cid, bytes);
        Self {
            blocks,
            commit: commit_cid,
            data: tree.root,
        }
    }
}

/// Stands in for the tree-diff producer: tracks record state, and on
/// commit derives `CommitData` from the blocks reachable before and after.
pub(crate) struct RepoWriter {
    actor: ActorId,
    db: Arc<ActorDb>,
    builder: MstBuilder,
    records: BTreeMap<String, Bytes>,
    reachable: BlockMap,
    head: Option<(Cid, Commit)>,
    seq: u32,
}

impl RepoWriter {
    pub fn create(store: &ActorStore, did: &str) -> Self {
        let actor = ActorId::new(did).unwrap();
        let db = store.create(&actor).unwrap();
        Self {
            actor,
            db,
            builder: MstBuilder::new(),
            records: BTreeMap::new(),
            reachable: BlockMap::new(),
            head: None,
            seq: 0,
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn db(&self) -> &ActorDb {
        &self.db
    }

    pub fn root(&self) -> Cid {
        self.head.as_ref().expect("no commit yet").0
    }

    pub fn commit_object(&self) -> &Commit {
        &self.head.as_ref().expect("no commit yet").1
    }

    pub fn put(&mut self, path: &RecordPath, text: &str) -> Cid {
        let bytes = record_bytes(text);
        let cid = Cid::cbor(&bytes);
        self.builder.insert(path, cid);
        self.records.insert(path.data_key(), bytes);
        cid
    }

    pub fn put_many(&mut self, n: usize) {
        for i in 0..n {
            self.put(&Fixture::path(i), &format!("post number {i}"));
        }
    }

    pub fn delete(&mut self, path: &RecordPath) {
        self.builder.remove(path);
        self.records.remove(&path.data_key());
    }

    /// Build the next commit and apply it through the transactor.
    pub fn commit(&mut self) -> CommitData {
        self.seq += 1;
        let rev = Rev::new(format!("{:06}", self.seq)).unwrap();
        let tree = self.builder.build().unwrap();
        let prev = self.head.as_ref().map(|(cid, _)| *cid);
        let commit = Commit::new(self.actor.clone(), tree.root, rev.clone(), prev, vec![7; 64]);
        let (cid, bytes) = commit.to_block().unwrap();

        let mut reachable = tree.blocks;
        for record in self.records.values() {
            reachable.add(Codec::DagCbor, record.clone());
        }
        reachable.set(cid, bytes);

        let new_blocks: BlockMap = reachable
            .iter()
            .filter(|(cid, _)| !self.reachable.has(cid))
            .map(|(cid, bytes)| (*cid, bytes.clone()))
            .collect();
        let removed_cids: CidSet = self
            .reachable
            .cids()
            .filter(|cid| !reachable.has(cid))
            .copied()
            .collect();
        let data = CommitData {
            cid,
            rev,
            new_blocks,
            removed_cids,
        };

        RepoTransactor::run(&self.db, |t| t.apply_commit(&data)).unwrap();
        self.reachable = reachable;
        self.head = Some((cid, commit));
        data
    }
}

fn service_with(store: ActorStore, capacity: usize) -> SyncService {
    SyncService::new(Arc::new(store), ExportConfig { channel_capacity: capacity }).unwrap()
}

fn service() -> SyncService {
    service_with(ActorStore::in_memory(), ExportConfig::default().channel_capacity)
}

// --- Record export ---

#[tokio::test]
async fn record_export_proves_inclusion() {
    let service = service();
    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    writer.put_many(100);
    writer.commit();

    let response = service
        .get_record(writer.actor(), COLLECTION, "post007", None)
        .await
        .unwrap();
    assert_eq!(response.content_type, CAR_CONTENT_TYPE);
    assert_eq!(response.root, writer.root());

    let car = response.stream.collect_bytes().await.unwrap();
    let report = ProofVerifier::verify_records(&car, &[Fixture::path(7)]).unwrap();
    assert_eq!(report.root, writer.root());
    assert_eq!(&report.commit, writer.commit_object());
    match &report.records[0] {
        RecordProof::Present { record, .. } => assert_eq!(record, &record_bytes("post number 7")),
        other => panic!("expected inclusion proof, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_record_yields_absence_proof() {
    let service = service();
    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    writer.put_many(100);
    writer.commit();

    let response = service
        .get_record(writer.actor(), COLLECTION, "post999", None)
        .await
        .unwrap();
    let car = response.stream.collect_bytes().await.unwrap();
    let report = ProofVerifier::verify_records(&car, &[Fixture::path(999)]).unwrap();
    assert!(!report.records[0].is_present());
}

#[tokio::test]
async fn several_targets_in_one_archive() {
    let service = service();
    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    writer.put_many(60);
    writer.commit();

    let paths = [Fixture::path(3), Fixture::path(59), Fixture::path(60)];
    let car = service
        .get_records(writer.actor(), &paths, None)
        .await
        .unwrap()
        .stream
        .collect_bytes()
        .await
        .unwrap();
    let report = ProofVerifier::verify_records(&car, &paths).unwrap();
    let present: Vec<bool> = report.records.iter().map(RecordProof::is_present).collect();
    assert_eq!(present, vec![true, true, false]);
}

// --- Full export ---

#[tokio::test]
async fn no_targets_exports_whole_repo() {
    let service = service();
    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    writer.put_many(40);
    writer.commit();

    let response = service.get_records(writer.actor(), &[], None).await.unwrap();
    let car = response.stream.collect_bytes().await.unwrap();
    let leaves = ProofVerifier::verify_repo(&car).unwrap();
    let keys: Vec<String> = leaves.into_iter().map(|(key, _)| key).collect();
    let expected: Vec<String> = (0..40).map(|i| Fixture::path(i).data_key()).collect();
    assert_eq!(keys, expected);
}

// --- Commit sequence ---

#[tokio::test]
async fn second_commit_replaces_record() {
    let service = service();
    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    let x = RecordPath::new(COLLECTION, "x").unwrap();
    let y = RecordPath::new(COLLECTION, "y").unwrap();

    let x_cid = writer.put(&x, "record x");
    let r1 = writer.commit();
    writer.delete(&x);
    let y_cid = writer.put(&y, "record y");
    let r2 = writer.commit();

    let reader = RepoReader::new(writer.db());
    assert_eq!(reader.get_root(), Some(r2.cid));
    assert!(r2.removed_cids.contains(&x_cid));
    assert!(r2.removed_cids.contains(&r1.cid));
    assert!(!reader.has_block(&x_cid).unwrap());
    assert!(reader.has_block(&y_cid).unwrap());
    for cid in r2.new_blocks.cids() {
        assert!(reader.has_block(cid).unwrap());
    }

    let car = service
        .get_records(writer.actor(), &[x.clone(), y.clone()], None)
        .await
        .unwrap()
        .stream
        .collect_bytes()
        .await
        .unwrap();
    let report = ProofVerifier::verify_records(&car, &[x.clone(), y]).unwrap();
    assert!(!report.records[0].is_present());
    assert!(report.records[1].is_present());

    // The superseded commit was removed with the rest of R1.
    assert!(matches!(
        service.get_record(writer.actor(), COLLECTION, "x", Some(r1.cid)).await,
        Err(SyncError::CommitNotFound(cid)) if cid == r1.cid
    ));
}

#[tokio::test]
async fn export_in_flight_keeps_its_snapshot() {
    let service = service_with(ActorStore::in_memory(), 1);
    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    writer.put_many(200);
    let r1 = writer.commit();

    let response = service.get_repo(writer.actor(), None).await.unwrap();
    let mut stream = response.stream;
    let mut car = stream.next().await.unwrap().unwrap().to_vec();

    // Replace every record while the export is paused.
    for i in 0..200 {
        writer.delete(&Fixture::path(i));
    }
    writer.put(&RecordPath::new(COLLECTION, "fresh").unwrap(), "only record");
    let r2 = writer.commit();
    assert_eq!(RepoReader::new(writer.db()).get_root(), Some(r2.cid));

    while let Some(frame) = stream.next().await {
        car.extend_from_slice(&frame.unwrap());
    }
    assert_eq!(ProofVerifier::verify_repo(&car).unwrap().len(), 200);
    assert_eq!(response.root, r1.cid);
}

#[tokio::test]
async fn explicit_commit_is_exported() {
    let service = service();
    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    writer.put_many(10);
    let r1 = writer.commit();

    let response = service.get_repo(writer.actor(), Some(r1.cid)).await.unwrap();
    assert_eq!(response.root, r1.cid);
    let car = response.stream.collect_bytes().await.unwrap();
    assert_eq!(ProofVerifier::verify_repo(&car).unwrap().len(), 10);
}

// --- Not found ---

#[tokio::test]
async fn unresolvable_exports_fail_before_streaming() {
    let service = service();
    let stranger = ActorId::new("did:plc:stranger").unwrap();
    assert!(matches!(
        service.get_repo(&stranger, None).await,
        Err(SyncError::RepoNotFound(_))
    ));

    let empty = RepoWriter::create(service.store(), "did:plc:empty");
    let err = service.get_repo(empty.actor(), None).await.unwrap_err();
    assert!(matches!(err, SyncError::RepoNotFound(ref actor) if actor == empty.actor()));
    assert!(err.is_not_found());

    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    writer.put_many(5);
    writer.commit();
    let unknown = Cid::cbor(b"not a commit anyone made");
    assert!(matches!(
        service.get_repo(writer.actor(), Some(unknown)).await,
        Err(SyncError::CommitNotFound(_))
    ));
    // A stored block that is not a commit.
    let data = writer.commit_object().data;
    assert!(matches!(
        service.get_records(writer.actor(), &[Fixture::path(0)], Some(data)).await,
        Err(SyncError::CommitNotFound(cid)) if cid == data
    ));
}

#[tokio::test]
async fn invalid_record_path_is_rejected() {
    let service = service();
    let mut writer = RepoWriter::create(service.store(), "did:plc:alice");
    writer.put_many(1);
    writer.commit();
    assert!(matches!(
        service.get_record(writer.actor(), "not-a-collection", "post000", None).await,
        Err(SyncError::Type(_))
    ));
}

// --- Blobs ---

#[tokio::test]
async fn blob_served_with_headers() {
    let service = service();
    let writer = RepoWriter::create(service.store(), "did:plc:alice");
    let blobs = service.store().blobs(writer.actor()).unwrap();
    let image = blobs
        .put_blob(Bytes::from_static(b"\x89PNG not really"), Some("image/png"))
        .unwrap();
    let opaque = blobs.put_blob(Bytes::from_static(b"opaque"), None).unwrap();

    let response = service.get_blob(writer.actor(), &image).unwrap();
    assert_eq!(response.content_type, "image/png");
    assert_eq!(response.content_length, 15);
    assert_eq!(response.body.as_ref(), b"\x89PNG not really");
    assert_eq!(response.header("Content-Length"), Some("15"));
    assert_eq!(response.header("x-content-type-options"), Some("nosniff"));
    assert_eq!(
        response.header("content-security-policy"),
        Some("default-src 'none'; sandbox")
    );

    let response = service.get_blob(writer.actor(), &opaque).unwrap();
    assert_eq!(response.content_type, "application/octet-stream");
    assert_eq!(response.header("content-type"), Some("application/octet-stream"));
}

#[tokio::test]
async fn withdrawn_or_unknown_blob_is_not_found() {
    let service = service();
    let writer = RepoWriter::create(service.store(), "did:plc:alice");
    let blobs = service.store().blobs(writer.actor()).unwrap();
    let cid = blobs.put_blob(Bytes::from_static(b"taken down"), None).unwrap();
    blobs.takedown(&cid).unwrap();

    assert!(matches!(
        service.get_blob(writer.actor(), &cid),
        Err(SyncError::BlobNotFound(c)) if c == cid
    ));
    assert!(matches!(
        service.get_blob(writer.actor(), &Cid::raw(b"never stored")),
        Err(SyncError::BlobNotFound(_))
    ));
    let stranger = ActorId::new("did:plc:stranger").unwrap();
    assert!(matches!(
        service.get_blob(&stranger, &cid),
        Err(SyncError::RepoNotFound(_))
    ));

    blobs.restore(&cid).unwrap();
    assert!(service.get_blob(writer.actor(), &cid).is_ok());
}

// --- Durability ---

#[tokio::test]
async fn exports_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::persistent(dir.path());
    let (actor, root) = {
        let store = ActorStore::new(config.clone()).unwrap();
        let mut writer = RepoWriter::create(&store, "did:plc:durable");
        writer.put_many(30);
        writer.commit();
        writer.delete(&Fixture::path(0));
        writer.commit();
        (writer.actor().clone(), writer.root())
    };

    let service = service_with(ActorStore::new(config).unwrap(), 4);
    let response = service.get_repo(&actor, None).await.unwrap();
    assert_eq!(response.root, root);
    let car = response.stream.collect_bytes().await.unwrap();
    assert_eq!(ProofVerifier::verify_repo(&car).unwrap().len(), 29);
}

#[tokio::test(flavor = "current_thread")]
async fn uncached_repos_open_on_the_blocking_pool() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::persistent(dir.path());
    let roots: Vec<(ActorId, Cid)> = {
        let store = ActorStore::new(config.clone()).unwrap();
        ["did:plc:first", "did:plc:second"]
            .into_iter()
            .map(|did| {
                let mut writer = RepoWriter::create(&store, did);
                writer.put_many(20);
                writer.commit();
                (writer.actor().clone(), writer.root())
            })
            .collect()
    };

    // Nothing is cached yet, so both exports replay a log from disk while
    // sharing the single runtime thread.
    let service = service_with(ActorStore::new(config).unwrap(), 2);
    assert!(service.store().open_actors().is_empty());
    let (first, second) = tokio::join!(
        service.get_repo(&roots[0].0, None),
        service.get_repo(&roots[1].0, None),
    );
    for (response, (_, root)) in [first.unwrap(), second.unwrap()].into_iter().zip(&roots) {
        assert_eq!(response.root, *root);
        let car = response.stream.collect_bytes().await.unwrap();
        assert_eq!(ProofVerifier::verify_repo(&car).unwrap().len(), 20);
    }
    assert_eq!(service.store().open_actors().len(), 2);

    let unknown = ActorId::new("did:plc:nobody").unwrap();
    assert!(matches!(
        service.get_repo(&unknown, None).await,
        Err(SyncError::RepoNotFound(actor)) if actor == unknown
    ));
}

#[tokio::test]
async fn closed_repo_is_reopened_for_the_next_export() {
    let dir = tempfile::tempdir().unwrap();
    let store = ActorStore::new(StoreConfig::persistent(dir.path())).unwrap();
    let (actor, root) = {
        let mut writer = RepoWriter::create(&store, "did:plc:closable");
        writer.put_many(10);
        writer.commit();
        (writer.actor().clone(), writer.root())
    };
    let service = service_with(store, 4);

    let response = service.get_repo(&actor, None).await.unwrap();
    // The export keeps only a read handle, so the repo can be released mid-stream.
    assert!(service.store().close(&actor));
    let car = response.stream.collect_bytes().await.unwrap();
    assert_eq!(ProofVerifier::verify_repo(&car).unwrap().len(), 10);

    let again = service.get_repo(&actor, None).await.unwrap();
    assert_eq!(again.root, root);
}

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use super::{Error, JobStatus, Part, PartStatus, ProgressReporter, TransferTracker};
use crate::contentstore::{
    ContentReader, ContentStore, ContentWriter, FsStore, Info, MemoryStore, Status,
};
use crate::fixtures::{blob_a_descriptor, blob_b_descriptor, BLOB_A, BLOB_B};
use crate::oci::{ref_key, Descriptor};
use crate::Digest;

const INTERVAL: Duration = Duration::from_millis(5);

/// Records every call it receives.
#[derive(Default)]
struct RecordingReporter {
    job_statuses: Mutex<Vec<JobStatus>>,
    statuses: Mutex<Vec<(String, PartStatus)>>,
}

impl RecordingReporter {
    fn statuses_of(&self, key: &str) -> Vec<PartStatus> {
        self.statuses
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| *s)
            .collect()
    }
}

impl ProgressReporter for RecordingReporter {
    fn job_status(&self, _name: &str, status: JobStatus) {
        self.job_statuses.lock().push(status);
    }

    fn status_changed(&self, ref_key: &str, part: &Part) {
        self.statuses.lock().push((ref_key.to_string(), part.status));
    }
}

/// A store answering from canned data, for the cases a real one can't easily
/// be brought into.
#[derive(Default)]
struct ScriptedStore {
    statuses: Mutex<Option<Vec<Status>>>,
    info: Mutex<Option<Option<Info>>>,
}

#[async_trait]
impl ContentStore for ScriptedStore {
    async fn info(&self, _digest: &Digest) -> Result<Option<Info>, crate::Error> {
        self.info
            .lock()
            .clone()
            .ok_or_else(|| crate::Error::StorageError("store unreachable".into()))
    }

    async fn list_statuses(&self) -> Result<Vec<Status>, crate::Error> {
        self.statuses
            .lock()
            .clone()
            .ok_or_else(|| crate::Error::StorageError("store unreachable".into()))
    }

    async fn open_read(
        &self,
        _digest: &Digest,
    ) -> Result<Option<Box<dyn ContentReader>>, crate::Error> {
        Err(crate::Error::InvalidRequest("not supported".into()))
    }

    async fn writer(
        &self,
        _ref_key: &str,
        _expected: &Descriptor,
    ) -> Result<Box<dyn ContentWriter>, crate::Error> {
        Err(crate::Error::InvalidRequest("not supported".into()))
    }
}

async fn commit(store: &MemoryStore, desc: &Descriptor, data: &[u8]) {
    let mut w = store.writer(&ref_key(desc), desc).await.unwrap();
    w.write_all(data).await.unwrap();
    w.commit().await.unwrap();
}

/// Polls `f` until it returns true, failing the test after a second.
async fn wait_for(f: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !f() {
            tokio::time::sleep(INTERVAL).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A blob that is already in the store is reported as existing, without ever
/// passing through another status.
#[tokio::test]
async fn existing_blob() {
    let store = MemoryStore::default();
    commit(&store, &blob_a_descriptor(), &BLOB_A).await;
    // make sure the pull starts strictly later.
    tokio::time::sleep(Duration::from_millis(2)).await;

    let reporter = Arc::new(RecordingReporter::default());
    let tracker = TransferTracker::new("x:1", Arc::new(store.clone()))
        .with_interval(INTERVAL)
        .with_reporter(reporter.clone());
    tracker.jobs().add(&blob_a_descriptor());
    let handle = tracker.spawn();

    tokio::time::sleep(INTERVAL * 4).await;
    let parts = handle.finish().await.expect("must finish");

    assert_eq!(1, parts.len());
    assert_eq!(PartStatus::Exists, parts[0].status);
    assert_eq!(
        vec![PartStatus::Exists],
        reporter.statuses_of(&ref_key(&blob_a_descriptor()))
    );
}

/// A blob seen in flight ends as done.
#[tokio::test]
async fn downloaded_blob() {
    let store = MemoryStore::default();
    let desc = blob_b_descriptor();

    let reporter = Arc::new(RecordingReporter::default());
    let tracker = TransferTracker::new("x:1", Arc::new(store.clone()))
        .with_interval(INTERVAL)
        .with_reporter(reporter.clone());
    tracker.jobs().add(&desc);
    let handle = tracker.spawn();

    let mut w = store.writer(&ref_key(&desc), &desc).await.unwrap();
    w.write_all(&BLOB_B[..1024]).await.unwrap();

    wait_for(|| {
        handle
            .parts()
            .first()
            .is_some_and(|p| p.status == PartStatus::Downloading)
    })
    .await;
    assert_eq!(1024, handle.parts()[0].offset);

    w.write_all(&BLOB_B[1024..]).await.unwrap();
    w.commit().await.unwrap();

    let parts = handle.finish().await.expect("must finish");
    assert_eq!(PartStatus::Done, parts[0].status);
    assert_eq!(BLOB_B.len() as u64, parts[0].offset);
    assert_eq!(BLOB_B.len() as u64, parts[0].total);

    let statuses = reporter.statuses_of(&ref_key(&desc));
    assert_eq!(Some(&PartStatus::Done), statuses.last());
    assert!(!statuses.contains(&PartStatus::Exists));
}

/// A blob committed to a filesystem store between two ticks, without ever
/// being seen in flight, is done. Its creation time must not be earlier than
/// the start of the pull.
#[tokio::test]
async fn fs_store_written_blob_done() {
    let dir = tempfile::tempdir().unwrap();
    let desc = blob_a_descriptor();

    for round in 0..50 {
        let store = FsStore::new(dir.path().join(round.to_string()))
            .await
            .unwrap();

        // only the immediate first tick runs before finish
        let tracker = TransferTracker::new("x:1", Arc::new(store.clone()))
            .with_interval(Duration::from_secs(3600));
        tracker.jobs().add(&desc);
        let handle = tracker.spawn();

        let mut w = store.writer(&ref_key(&desc), &desc).await.unwrap();
        w.write_all(&BLOB_A).await.unwrap();
        w.commit().await.unwrap();

        let parts = handle.finish().await.expect("must finish");
        assert_eq!(PartStatus::Done, parts[0].status, "round {}", round);
    }
}

/// A blob seen in flight ends as done, even if the store reports it as older
/// than the pull.
#[tokio::test]
async fn downloaded_blob_never_exists() {
    let desc = blob_a_descriptor();
    let store = Arc::new(ScriptedStore::default());
    *store.info.lock() = Some(None);
    *store.statuses.lock() = Some(vec![Status {
        ref_key: ref_key(&desc),
        offset: 1,
        total: 2,
        started_at: SystemTime::now(),
        updated_at: SystemTime::now(),
    }]);

    let tracker = TransferTracker::new("x:1", store.clone()).with_interval(INTERVAL);
    tracker.jobs().add(&desc);
    let handle = tracker.spawn();

    wait_for(|| {
        handle
            .parts()
            .first()
            .is_some_and(|p| p.status == PartStatus::Downloading)
    })
    .await;

    // the write completes, and the store hands out an old timestamp.
    *store.statuses.lock() = Some(vec![]);
    *store.info.lock() = Some(Some(Info {
        digest: desc.digest,
        size: 2,
        created_at: UNIX_EPOCH,
    }));

    let parts = handle.finish().await.expect("must finish");
    assert_eq!(PartStatus::Done, parts[0].status);
    assert_eq!(2, parts[0].offset);
}

/// After the pull is over, every job is in a terminal status.
#[tokio::test]
async fn all_terminal_after_finish() {
    let store = MemoryStore::default();

    let never_written = blob_a_descriptor();
    let in_flight = blob_b_descriptor();
    let completed = crate::fixtures::config_descriptor(b"{}");

    let tracker =
        TransferTracker::new("x:1", Arc::new(store.clone())).with_interval(Duration::from_secs(3600));
    let jobs = tracker.jobs();
    let handle = tracker.spawn();

    jobs.add(&never_written);
    jobs.add(&in_flight);
    jobs.add(&completed);

    let mut w = store.writer(&ref_key(&in_flight), &in_flight).await.unwrap();
    w.write_all(&BLOB_B[..10]).await.unwrap();
    commit(&store, &completed, b"{}").await;

    let parts = handle.finish().await.expect("must finish");
    assert_eq!(3, parts.len());
    assert!(parts.iter().all(|p| p.status.is_terminal()));

    assert_eq!(PartStatus::Done, parts[0].status);
    assert_eq!((1, 1), (parts[0].offset, parts[0].total));

    assert_eq!(PartStatus::Done, parts[1].status);
    assert_eq!(BLOB_B.len() as u64, parts[1].offset);
    assert_eq!(BLOB_B.len() as u64, parts[1].total);

    assert_eq!(PartStatus::Done, parts[2].status);
    assert_eq!(2, parts[2].total);

    drop(w);
}

/// Failing to query a blob's info stops the tracker with an error.
#[tokio::test]
async fn info_error_halts() {
    let store = Arc::new(ScriptedStore::default());
    *store.statuses.lock() = Some(vec![]);

    let tracker = TransferTracker::new("x:1", store).with_interval(INTERVAL);
    tracker.jobs().add(&blob_a_descriptor());
    let handle = tracker.spawn();

    tokio::time::sleep(INTERVAL * 4).await;
    assert!(matches!(
        handle.finish().await,
        Err(Error::Info { .. })
    ));
}

/// Failing to list the writes in progress only skips the tick.
#[tokio::test]
async fn list_error_skips() {
    let store = Arc::new(ScriptedStore::default());
    *store.info.lock() = Some(None);

    let tracker = TransferTracker::new("x:1", store).with_interval(INTERVAL);
    tracker.jobs().add(&blob_a_descriptor());
    let handle = tracker.spawn();

    tokio::time::sleep(INTERVAL * 4).await;
    assert!(handle.parts().is_empty());

    let parts = handle.finish().await.expect("must finish");
    assert_eq!(PartStatus::Done, parts[0].status);
}

/// The pull is resolving until the first blob is registered.
#[tokio::test]
async fn job_status() {
    let store = MemoryStore::default();
    let reporter = Arc::new(RecordingReporter::default());
    let tracker = TransferTracker::new("x:1", Arc::new(store))
        .with_interval(INTERVAL)
        .with_reporter(reporter.clone());
    let jobs = tracker.jobs();
    let handle = tracker.spawn();

    wait_for(|| !reporter.job_statuses.lock().is_empty()).await;
    jobs.add(&blob_a_descriptor());
    handle.finish().await.expect("must finish");

    assert_eq!(
        vec![JobStatus::Resolving, JobStatus::Resolved],
        *reporter.job_statuses.lock()
    );
}

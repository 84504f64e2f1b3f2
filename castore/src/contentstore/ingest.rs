use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};

use super::{Info, Status};
use crate::{oci::Descriptor, Digest, Error};

/// Bookkeeping of all writes currently in flight in a store.
/// This is what [super::ContentStore::list_statuses] reports.
#[derive(Clone, Default)]
pub(crate) struct Ingests {
    active: Arc<Mutex<HashMap<String, Status>>>,
}

impl Ingests {
    /// Registers a new ingest under `ref_key`. Fails if another writer for
    /// the same key is still open.
    pub fn begin(&self, ref_key: &str, total: u64) -> Result<IngestGuard, Error> {
        let mut active = self.active.lock();
        if active.contains_key(ref_key) {
            return Err(Error::InvalidRequest(format!(
                "ref {} is already being written",
                ref_key
            )));
        }

        let now = SystemTime::now();
        active.insert(
            ref_key.to_string(),
            Status {
                ref_key: ref_key.to_string(),
                offset: 0,
                total,
                started_at: now,
                updated_at: now,
            },
        );

        Ok(IngestGuard {
            ingests: self.clone(),
            ref_key: ref_key.to_string(),
        })
    }

    pub fn list(&self) -> Vec<Status> {
        let mut statuses: Vec<Status> = self.active.lock().values().cloned().collect();
        statuses.sort_by(|a, b| a.ref_key.cmp(&b.ref_key));
        statuses
    }
}

/// Keeps an ingest visible while alive, removes it on drop.
pub(crate) struct IngestGuard {
    ingests: Ingests,
    ref_key: String,
}

impl IngestGuard {
    fn advance(&self, n: u64) {
        if let Some(status) = self.ingests.active.lock().get_mut(&self.ref_key) {
            status.offset += n;
            status.updated_at = SystemTime::now();
        }
    }
}

impl Drop for IngestGuard {
    fn drop(&mut self) {
        self.ingests.active.lock().remove(&self.ref_key);
    }
}

/// State shared by all writer implementations: hashes what passes through,
/// counts bytes and keeps the status entry up to date.
pub(crate) struct IngestState {
    expected: Descriptor,
    hasher: Sha256,
    written: u64,
    guard: Option<IngestGuard>,
}

impl IngestState {
    pub fn new(expected: Descriptor, guard: IngestGuard) -> Self {
        Self {
            expected,
            hasher: Sha256::new(),
            written: 0,
            guard: Some(guard),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_none()
    }

    pub fn observe(&mut self, buf: &[u8]) {
        self.hasher.update(buf);
        self.written += buf.len() as u64;
        if let Some(guard) = &self.guard {
            guard.advance(buf.len() as u64);
        }
    }

    /// Closes the ingest and checks what was written against the expected
    /// descriptor. The status entry disappears regardless of the outcome.
    pub fn finish(&mut self) -> Result<Digest, Error> {
        if self.guard.take().is_none() {
            return Err(Error::InvalidRequest("writer already closed".to_string()));
        }

        if self.written != self.expected.size {
            return Err(Error::InvalidRequest(format!(
                "unexpected size for {}: wanted {}, got {}",
                self.expected.digest, self.expected.size, self.written
            )));
        }

        let digest: Digest = std::mem::take(&mut self.hasher).finalize().into();
        if digest != self.expected.digest {
            return Err(Error::InvalidRequest(format!(
                "unexpected digest: wanted {}, got {}",
                self.expected.digest, digest
            )));
        }

        Ok(digest)
    }

    pub fn info(&self, created_at: SystemTime) -> Info {
        Info {
            digest: self.expected.digest,
            size: self.expected.size,
            created_at,
        }
    }
}

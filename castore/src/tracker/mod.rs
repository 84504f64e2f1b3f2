//! Progress tracking for pulls into a [ContentStore].
//!
//! The store has no notion of completion events. Its only observable state is
//! the list of writes in progress and the info of committed blobs, so the
//! [TransferTracker] polls both at a fixed interval and infers the status of
//! every blob requested during the pull:
//!
//! 1. every blob in the list of writes in progress is `downloading`,
//! 2. every other blob not yet in a terminal status is looked up: missing
//!    blobs are `waiting`, blobs created after the pull started (or seen
//!    downloading before) are `done`, older ones `exists`,
//! 3. once the pull is over, a last pass runs and every blob still not in a
//!    terminal status is forced to `done`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::contentstore::ContentStore;
use crate::oci::ref_key;
use crate::Digest;

mod jobs;
mod parts;

#[cfg(test)]
mod tests;

pub use self::jobs::Jobs;
pub use self::parts::{Part, PartStatus};
use self::parts::Parts;

/// The interval the store is polled at.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to query info of {digest}: {source}")]
    Info {
        digest: Digest,
        source: crate::Error,
    },

    #[error("tracker task failed: {0}")]
    Join(#[from] JoinError),
}

/// Whether the image being pulled has been resolved to its blobs yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Resolving,
    Resolved,
}

/// Receives the state transitions of a [TransferTracker]. Called from the
/// tracker task, never while holding a lock.
pub trait ProgressReporter: Send + Sync {
    /// The overall status of the pull changed.
    fn job_status(&self, _name: &str, _status: JobStatus) {}

    /// A part was created or changed its status.
    fn status_changed(&self, _ref_key: &str, _part: &Part) {}

    /// The offset of a known part changed.
    fn offset_changed(&self, _ref_key: &str, _part: &Part) {}
}

/// Tracks the transfer of the blobs registered in its [Jobs] into a store.
pub struct TransferTracker {
    jobs: Jobs,
    store: Arc<dyn ContentStore>,
    parts: Arc<Parts>,
    reporter: Option<Arc<dyn ProgressReporter>>,
    interval: Duration,
}

impl TransferTracker {
    pub fn new(name: &str, store: Arc<dyn ContentStore>) -> Self {
        Self {
            jobs: Jobs::new(name),
            store,
            parts: Default::default(),
            reporter: None,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The registry to add requested blobs to, typically from the image
    /// handler of a pull.
    pub fn jobs(&self) -> Jobs {
        self.jobs.clone()
    }

    /// Starts polling in the background. The pull start time is now.
    pub fn spawn(self) -> TrackerHandle {
        let cancel = CancellationToken::new();
        let jobs = self.jobs.clone();
        let parts = self.parts.clone();
        let task = tokio::spawn(self.run(SystemTime::now(), cancel.clone()));

        TrackerHandle {
            cancel,
            task,
            jobs,
            parts,
        }
    }

    #[instrument(skip_all, err, fields(image=%self.jobs.name()))]
    async fn run(self, start: SystemTime, cancel: CancellationToken) -> Result<(), Error> {
        let mut job_status = None;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(start, &mut job_status).await?,
            }
        }

        // the pull is over, everything it wrote is committed by now.
        self.tick(start, &mut job_status).await?;
        self.complete();

        Ok(())
    }

    /// Runs the active and inactive passes once.
    async fn tick(
        &self,
        start: SystemTime,
        job_status: &mut Option<JobStatus>,
    ) -> Result<(), Error> {
        let status = if self.jobs.is_resolved() {
            JobStatus::Resolved
        } else {
            JobStatus::Resolving
        };
        if *job_status != Some(status) {
            *job_status = Some(status);
            if let Some(reporter) = &self.reporter {
                reporter.job_status(self.jobs.name(), status);
            }
        }

        let jobs = self.jobs.jobs();
        let keys: HashSet<String> = jobs.iter().map(ref_key).collect();

        let statuses = match self.store.list_statuses().await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(err=%e, "failed to list content statuses");
                return Ok(());
            }
        };

        let mut active = HashSet::new();
        for status in statuses {
            if !keys.contains(&status.ref_key) {
                continue;
            }
            self.set(Part {
                ref_key: status.ref_key.clone(),
                status: PartStatus::Downloading,
                offset: status.offset,
                total: status.total,
                started_at: Some(status.started_at),
                updated_at: Some(status.updated_at),
            });
            active.insert(status.ref_key);
        }

        for desc in jobs {
            let key = ref_key(&desc);
            if active.contains(&key) {
                continue;
            }

            let current = self.parts.get(&key);
            if current.as_ref().is_some_and(|p| p.status.is_terminal()) {
                continue;
            }

            let info = self
                .store
                .info(&desc.digest)
                .await
                .map_err(|source| Error::Info {
                    digest: desc.digest,
                    source,
                })?;

            let part = match info {
                None => Part {
                    ref_key: key,
                    status: PartStatus::Waiting,
                    offset: 0,
                    total: 0,
                    started_at: None,
                    updated_at: None,
                },
                Some(info) => {
                    let seen_downloading = current
                        .as_ref()
                        .is_some_and(|p| p.status == PartStatus::Downloading);

                    if seen_downloading || info.created_at >= start {
                        // finished between two polls.
                        Part {
                            ref_key: key,
                            status: PartStatus::Done,
                            offset: info.size,
                            total: info.size,
                            started_at: current.and_then(|p| p.started_at),
                            updated_at: Some(info.created_at),
                        }
                    } else {
                        Part {
                            ref_key: key,
                            status: PartStatus::Exists,
                            offset: info.size,
                            total: info.size,
                            started_at: None,
                            updated_at: None,
                        }
                    }
                }
            };
            self.set(part);
        }

        Ok(())
    }

    /// Forces every job not in a terminal status to `done`.
    fn complete(&self) {
        for desc in self.jobs.jobs() {
            let key = ref_key(&desc);
            let part = match self.parts.get(&key) {
                Some(part) if part.status.is_terminal() => continue,
                Some(part) => {
                    let total = if part.total == 0 { 1 } else { part.total };
                    Part {
                        status: PartStatus::Done,
                        offset: total,
                        total,
                        ..part
                    }
                }
                None => Part {
                    ref_key: key,
                    status: PartStatus::Done,
                    offset: 1,
                    total: 1,
                    started_at: None,
                    updated_at: None,
                },
            };
            self.set(part);
        }
    }

    fn set(&self, part: Part) {
        let Some(change) = self.parts.apply(part) else {
            return;
        };
        if let Some(reporter) = &self.reporter {
            if change.status_changed {
                reporter.status_changed(&change.part.ref_key, &change.part);
            }
            if change.offset_changed {
                reporter.offset_changed(&change.part.ref_key, &change.part);
            }
        }
    }
}

/// A running [TransferTracker].
pub struct TrackerHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
    jobs: Jobs,
    parts: Arc<Parts>,
}

impl TrackerHandle {
    /// The registry to add requested blobs to.
    pub fn jobs(&self) -> Jobs {
        self.jobs.clone()
    }

    /// Returns a copy of the known parts, in job order.
    pub fn parts(&self) -> Vec<Part> {
        self.jobs
            .jobs()
            .iter()
            .filter_map(|desc| self.parts.get(&ref_key(desc)))
            .collect()
    }

    /// Signals the end of the pull and waits for the tracker to run its final
    /// passes. Returns the final parts, all in a terminal status, or the error
    /// that stopped the tracker early.
    pub async fn finish(mut self) -> Result<Vec<Part>, Error> {
        self.cancel.cancel();
        (&mut self.task).await??;
        Ok(self.parts())
    }
}

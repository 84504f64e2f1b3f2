use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::debug;

/// Transfer status of a single blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// Requested, but neither in flight nor in the store.
    Waiting,
    /// Being written to the store.
    Downloading,
    /// Written to the store during this pull.
    Done,
    /// Already in the store before the pull started.
    Exists,
}

impl PartStatus {
    /// Statuses only ever move to a higher rank.
    fn rank(self) -> u8 {
        match self {
            PartStatus::Waiting => 0,
            PartStatus::Downloading => 1,
            PartStatus::Done | PartStatus::Exists => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PartStatus::Done | PartStatus::Exists)
    }
}

impl std::fmt::Display for PartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PartStatus::Waiting => "waiting",
            PartStatus::Downloading => "downloading",
            PartStatus::Done => "done",
            PartStatus::Exists => "exists",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub ref_key: String,
    pub status: PartStatus,
    pub offset: u64,
    pub total: u64,
    pub started_at: Option<SystemTime>,
    pub updated_at: Option<SystemTime>,
}

/// What changed when applying an update.
pub(crate) struct Change {
    pub part: Part,
    pub status_changed: bool,
    pub offset_changed: bool,
}

/// Status of every blob seen so far, keyed by ref key.
#[derive(Default)]
pub(crate) struct Parts {
    table: Mutex<HashMap<String, Part>>,
}

impl Parts {
    pub fn get(&self, ref_key: &str) -> Option<Part> {
        self.table.lock().get(ref_key).cloned()
    }

    /// Applies `update` to the part with the same ref key, creating it if
    /// needed. Updates moving the status backwards, or touching a part in a
    /// terminal status, are dropped. Returns None if nothing changed.
    pub fn apply(&self, update: Part) -> Option<Change> {
        let mut table = self.table.lock();

        let Some(current) = table.get_mut(&update.ref_key) else {
            debug!(part=?update, "part created");
            table.insert(update.ref_key.clone(), update.clone());
            return Some(Change {
                part: update,
                status_changed: true,
                offset_changed: false,
            });
        };

        if current.status.is_terminal() || update.status.rank() < current.status.rank() {
            return None;
        }
        if *current == update {
            return None;
        }

        debug!(part=?update, "part updated");
        let change = Change {
            status_changed: current.status != update.status,
            offset_changed: current.offset != update.offset,
            part: update.clone(),
        };
        *current = update;
        Some(change)
    }
}

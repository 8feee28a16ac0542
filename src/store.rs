//! Single-writer, multi-reader holder of the latest snapshot.
//!
//! The writer half lives on the receiver thread; readers are cheap to clone
//! and never block it. Snapshots are swapped in whole behind an `Arc`, so a
//! reader sees either the previous frame or the new one.

use crate::types::Snapshot;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Shared {
    current: ArcSwapOption<Snapshot>,
    stale: AtomicBool,
}

/// Result of [`SnapshotWriter::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    Accepted,
    /// Frame number was not newer than the one already published.
    Rejected { latest: u32 },
}

/// Producer side. Not `Clone`: exactly one writer per store.
pub struct SnapshotWriter {
    shared: Arc<Shared>,
    last_frame: Option<u32>,
}

/// Consumer side.
#[derive(Clone)]
pub struct SnapshotReader {
    shared: Arc<Shared>,
}

/// Create a connected writer/reader pair with no data yet.
pub fn snapshot_store() -> (SnapshotWriter, SnapshotReader) {
    let shared = Arc::new(Shared {
        current: ArcSwapOption::empty(),
        stale: AtomicBool::new(false),
    });
    (
        SnapshotWriter {
            shared: shared.clone(),
            last_frame: None,
        },
        SnapshotReader { shared },
    )
}

impl SnapshotWriter {
    /// Swap in `snapshot` if its frame number is newer than the last one.
    /// Clears the stale flag on success.
    pub fn publish(&mut self, snapshot: Snapshot) -> Publish {
        self.publish_arc(Arc::new(snapshot))
    }

    /// Same as [`publish`](Self::publish) for an already shared snapshot.
    pub fn publish_arc(&mut self, snapshot: Arc<Snapshot>) -> Publish {
        if let Some(latest) = self.last_frame {
            if snapshot.frame_number <= latest {
                return Publish::Rejected { latest };
            }
        }
        self.last_frame = Some(snapshot.frame_number);
        self.shared.current.store(Some(snapshot));
        self.shared.stale.store(false, Ordering::Release);
        Publish::Accepted
    }

    pub fn mark_stale(&self) {
        self.shared.stale.store(true, Ordering::Release);
    }

    pub fn last_frame(&self) -> Option<u32> {
        self.last_frame
    }
}

impl SnapshotReader {
    /// Latest published snapshot, or `None` before the first frame.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.shared.current.load_full()
    }

    /// True once the writer flagged the data as older than its freshness threshold.
    pub fn is_stale(&self) -> bool {
        self.shared.stale.load(Ordering::Acquire)
    }
}

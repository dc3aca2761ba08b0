// Tracker registry
//
// Side-table from resource id to its state tracker, owned by whoever creates the
// resources (the device session). Entries hold weak references: the registry answers
// lookups but never keeps a tracker alive. An entry disappears either when the
// resource is destroyed (`unregister`) or when the last tracker handle is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::tracker::{ResourceStateTracker, TrackerCell};
use super::usage::UsageState;
use crate::resource::{ResourceDesc, ResourceId};

pub(crate) type RegistryMap = Mutex<HashMap<ResourceId, Weak<TrackerCell>>>;

pub struct TrackerRegistry {
    map: Arc<RegistryMap>,
    next_id: AtomicU64,
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create the tracker for a new resource, with every subresource in `initial`.
    pub fn register(&self, desc: ResourceDesc, initial: UsageState) -> ResourceStateTracker {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::debug!(
            "Tracking '{}' ({}) with {} subresources in {}",
            desc.name,
            id,
            desc.layout.count(),
            initial
        );
        let tracker = ResourceStateTracker::new(id, desc, initial, Arc::downgrade(&self.map));
        self.map.lock().insert(id, tracker.downgrade());
        tracker
    }

    /// Look up the tracker of a live resource.
    pub fn get(&self, id: ResourceId) -> Option<ResourceStateTracker> {
        let cell = self.map.lock().get(&id)?.upgrade()?;
        Some(ResourceStateTracker::from_cell(cell))
    }

    /// The resource is being destroyed: forget its tracker. Handles still held
    /// elsewhere keep working but the registry no longer answers for the id.
    pub fn unregister(&self, id: ResourceId) -> bool {
        let removed = self.map.lock().remove(&id).is_some();
        if removed {
            log::debug!("Unregistered state tracker {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every tracker still alive.
    pub fn trackers(&self) -> Vec<ResourceStateTracker> {
        let cells: Vec<_> = self.map.lock().values().filter_map(Weak::upgrade).collect();
        cells.into_iter().map(ResourceStateTracker::from_cell).collect()
    }
}

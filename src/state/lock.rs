// State locks
//
// EnterState hands back a token; the subresources stay locked in their state until
// it is unlocked or dropped. Releasing happens exactly once either way.

use std::sync::Weak;

use super::subresource::SubresourceRange;
use super::tracker::{ResourceStateTracker, TrackerCell};

/// Proof that a range of subresources is held in one usage state.
///
/// The range is unlocked exactly once: by `unlock()`, or when the token is dropped
/// (including while unwinding). The token does not keep the resource alive; if the
/// tracker is already gone there is nothing left to unlock.
#[must_use = "dropping the lock immediately unlocks the subresources"]
#[derive(Debug)]
pub struct ResourceStateLock {
    tracker: Weak<TrackerCell>,
    range: SubresourceRange,
    active: bool,
}

impl ResourceStateLock {
    pub(crate) fn new(tracker: Weak<TrackerCell>, range: SubresourceRange) -> Self {
        Self {
            tracker,
            range,
            active: true,
        }
    }

    pub fn range(&self) -> &SubresourceRange {
        &self.range
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The tracker this lock belongs to, if it still exists.
    pub fn tracker(&self) -> Option<ResourceStateTracker> {
        self.tracker.upgrade().map(ResourceStateTracker::from_cell)
    }

    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(cell) = self.tracker.upgrade() {
            cell.unlock_range(&self.range);
        }
    }
}

impl Drop for ResourceStateLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use crate::barrier::BarrierBatch;
    use crate::resource::{ResourceDesc, ResourceId};
    use crate::state::{Scope, Subresource, SubresourceLayout, TrackerRegistry, UsageState};

    #[test]
    fn test_explicit_unlock_once() {
        let registry = TrackerRegistry::new();
        let t = registry.register(
            ResourceDesc::texture("t", SubresourceLayout::new(2, 1, 1), 9),
            UsageState::COMMON,
        );
        let mut batch = BarrierBatch::new(4);
        let lock = t.enter_state(&mut batch, UsageState::RENDER_TARGET, Scope::All).unwrap();
        assert!(lock.is_active());
        assert_eq!(lock.tracker().map(|t| t.id()), Some(t.id()));
        lock.unlock();
        assert_eq!(t.lock_count(Subresource::new(1, 0, 0)), 0);
    }

    #[test]
    fn test_unlock_on_panic() {
        let registry = TrackerRegistry::new();
        let t = registry.register(ResourceDesc::buffer("b", 3), UsageState::COMMON);
        let inner = t.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut batch = BarrierBatch::new(4);
            let _lock = inner.enter_state(&mut batch, UsageState::COPY_DEST, Scope::All).unwrap();
            panic!("operation blew up");
        }));
        assert!(result.is_err());
        assert!(!t.is_locked());
    }

    #[test]
    fn test_lock_outliving_tracker() {
        let registry = TrackerRegistry::new();
        let t = registry.register(ResourceDesc::buffer("b", 5), UsageState::COMMON);
        let id = t.id();
        let mut batch = BarrierBatch::new(4);
        let lock = t.enter_state(&mut batch, UsageState::COPY_SOURCE, Scope::All).unwrap();
        drop(t);
        assert!(registry.get(id).is_none());
        assert!(lock.tracker().is_none());
        drop(lock);
    }

    #[test]
    fn test_compatible_lock_on_different_ids() {
        let registry = TrackerRegistry::new();
        let a = registry.register(ResourceDesc::buffer("a", 1), UsageState::COMMON);
        let b = registry.register(ResourceDesc::buffer("b", 2), UsageState::COMMON);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), ResourceId(0));
    }
}

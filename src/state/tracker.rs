// Resource state tracker
//
// Single source of truth for the usage state of every subresource of one resource.
// EnterState is all-or-nothing: every subresource in scope is validated before
// anything is mutated or any barrier is queued, so a StateConflict leaves the table
// and the barrier batch exactly as they were. A scope that names subresources the
// resource doesn't have is refused the same way.
//
// Trackers are shared (`Clone` is AddRef, dropping is Release). The last release
// removes the registry entry that points at the tracker.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::lock::ResourceStateLock;
use super::registry::RegistryMap;
use super::subresource::{Subresource, SubresourceLayout, SubresourceRange, SubresourceTable};
use super::usage::UsageState;
use super::view::Scope;
use crate::barrier::{Barrier, BarrierBatch, BarrierSubresources};
use crate::error::{ScopeOutOfRange, StateConflict, StateError};
use crate::resource::{ResourceDesc, ResourceId};

pub(crate) struct TrackerCell {
    id: ResourceId,
    desc: ResourceDesc,
    table: Mutex<SubresourceTable>,
    registry: Weak<RegistryMap>,
}

impl TrackerCell {
    pub(crate) fn unlock_range(&self, range: &SubresourceRange) {
        let mut table = self.table.lock();
        let layout = *table.layout();
        for index in range.indices(&layout) {
            let entry = table.get_mut(index);
            assert!(
                entry.lock_count > 0,
                "unlock of '{}' subresource {} ({}) that is not locked",
                self.desc.name,
                index,
                layout.decompose(index)
            );
            entry.lock_count -= 1;
        }
    }
}

impl Drop for TrackerCell {
    fn drop(&mut self) {
        // Last reference gone: the side-table must stop answering for this resource
        if let Some(registry) = self.registry.upgrade() {
            let mut map = registry.lock();
            if map.get(&self.id).is_some_and(|entry| entry.strong_count() == 0) {
                map.remove(&self.id);
                log::debug!("Released state tracker for '{}' ({})", self.desc.name, self.id);
            }
        }
    }
}

/// Shared handle to one resource's state table.
#[derive(Clone)]
pub struct ResourceStateTracker {
    cell: Arc<TrackerCell>,
}

impl std::fmt::Debug for ResourceStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStateTracker")
            .field("id", &self.cell.id)
            .field("name", &self.cell.desc.name)
            .finish()
    }
}

impl ResourceStateTracker {
    pub(crate) fn new(
        id: ResourceId,
        desc: ResourceDesc,
        initial: UsageState,
        registry: Weak<RegistryMap>,
    ) -> Self {
        let table = SubresourceTable::new(desc.layout, initial);
        Self {
            cell: Arc::new(TrackerCell {
                id,
                desc,
                table: Mutex::new(table),
                registry,
            }),
        }
    }

    pub(crate) fn from_cell(cell: Arc<TrackerCell>) -> Self {
        Self { cell }
    }

    pub(crate) fn downgrade(&self) -> Weak<TrackerCell> {
        Arc::downgrade(&self.cell)
    }

    pub fn id(&self) -> ResourceId {
        self.cell.id
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.cell.desc
    }

    pub fn name(&self) -> &str {
        &self.cell.desc.name
    }

    pub fn layout(&self) -> SubresourceLayout {
        self.cell.desc.layout
    }

    /// Number of live handles (AddRef count).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }

    pub fn current_state(&self, sub: Subresource) -> UsageState {
        let layout = self.layout();
        self.cell.table.lock().get(layout.index_of(sub)).state
    }

    pub fn lock_count(&self, sub: Subresource) -> u32 {
        let layout = self.layout();
        self.cell.table.lock().get(layout.index_of(sub)).lock_count
    }

    /// True if any subresource is currently locked.
    pub fn is_locked(&self) -> bool {
        self.cell.table.lock().iter().any(|entry| entry.is_locked())
    }

    /// Move every subresource in `scope` to `target`, queueing the barriers that takes,
    /// and lock them in that state until the returned token goes away.
    pub fn enter_state(
        &self,
        batch: &mut BarrierBatch,
        target: UsageState,
        scope: impl Into<Scope>,
    ) -> Result<ResourceStateLock, StateError> {
        let layout = self.layout();
        let scope = scope.into();
        let range = scope.resolve(&layout).ok_or_else(|| ScopeOutOfRange {
            resource: self.cell.id,
            resource_name: self.cell.desc.name.clone(),
            scope,
            layout,
        })?;
        let mut table = self.cell.table.lock();

        // Pass 1: validate, and find out whether the scope is in one state
        let mut shared = None;
        let mut homogeneous = true;
        for index in range.indices(&layout) {
            let entry = table.get(index);
            if entry.is_locked() && entry.state != target {
                return Err(StateConflict {
                    resource: self.cell.id,
                    resource_name: self.cell.desc.name.clone(),
                    index,
                    subresource: layout.decompose(index),
                    current: entry.state,
                    requested: target,
                }
                .into());
            }
            let key = (entry.state, entry.initialized);
            match shared {
                None => shared = Some(key),
                Some(other) if other != key => homogeneous = false,
                Some(_) => {}
            }
        }

        // Pass 2: plan the barriers
        let mut barriers = Vec::new();
        if homogeneous {
            if let Some((before, initialized)) = shared.filter(|(state, _)| *state != target) {
                let subresources = if range.covers(&layout) {
                    BarrierSubresources::All
                } else if range.len() == 1 {
                    BarrierSubresources::Index(layout.index_of(Subresource::new(
                        range.base_mip,
                        range.base_array,
                        range.base_plane,
                    )))
                } else {
                    BarrierSubresources::Range(range)
                };
                barriers.push(self.barrier(subresources, before, target).discarding(!initialized));
            }
        } else {
            for index in range.indices(&layout) {
                let entry = table.get(index);
                if entry.state != target {
                    barriers.push(
                        self.barrier(BarrierSubresources::Index(index), entry.state, target)
                            .discarding(!entry.initialized),
                    );
                }
            }
        }
        batch.reserve(barriers.len());

        // Pass 3: commit to the table
        for index in range.indices(&layout) {
            let entry = table.get_mut(index);
            if entry.state != target {
                entry.state = target;
                entry.initialized = true;
            }
            entry.lock_count += 1;
        }
        drop(table);

        for barrier in barriers {
            batch.append(barrier);
        }
        Ok(ResourceStateLock::new(self.downgrade(), range))
    }

    /// Release one lock on every subresource in `range`.
    pub fn unlock(&self, range: &SubresourceRange) {
        self.cell.unlock_range(range);
    }

    fn barrier(&self, subresources: BarrierSubresources, before: UsageState, after: UsageState) -> Barrier {
        Barrier::transition(self.cell.id, &self.cell.desc, subresources, before, after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::view::ViewDesc;

    fn tracker(layout: SubresourceLayout) -> ResourceStateTracker {
        let desc = ResourceDesc::texture("target", layout, 42);
        ResourceStateTracker::new(ResourceId(1), desc, UsageState::COMMON, Weak::new())
    }

    #[test]
    fn test_enter_then_drop_leaves_state() {
        let t = tracker(SubresourceLayout::new(1, 1, 1));
        let mut batch = BarrierBatch::new(16);
        let sub = Subresource::default();

        let lock = t.enter_state(&mut batch, UsageState::COPY_DEST, sub).unwrap();
        assert_eq!(t.lock_count(sub), 1);
        drop(lock);
        assert_eq!(t.lock_count(sub), 0);
        assert_eq!(t.current_state(sub), UsageState::COPY_DEST);
        assert_eq!(batch.len(), 1);

        // Same state again: no barrier, still succeeds
        let _lock = t.enter_state(&mut batch, UsageState::COPY_DEST, sub).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_homogeneous_whole_resource_is_one_barrier() {
        let t = tracker(SubresourceLayout::new(4, 2, 1));
        let mut batch = BarrierBatch::new(16);
        let _lock = t.enter_state(&mut batch, UsageState::RENDER_TARGET, Scope::All).unwrap();
        let barriers = batch.take_all();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].subresources, BarrierSubresources::All);
        assert_eq!(barriers[0].before, UsageState::COMMON);
    }

    #[test]
    fn test_homogeneous_subrange_is_one_ranged_barrier() {
        let layout = SubresourceLayout::new(4, 1, 1);
        let t = tracker(layout);
        let mut batch = BarrierBatch::new(16);
        let view = ViewDesc::ShaderResource {
            most_detailed_mip: 1,
            mip_levels: 2,
            first_array_slice: 0,
            array_size: 1,
            plane_slice: 0,
        };
        let lock = t.enter_state(&mut batch, UsageState::PIXEL_SHADER_RESOURCE, view).unwrap();
        let barriers = batch.take_all();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].subresources, BarrierSubresources::Range(*lock.range()));
        assert_eq!(t.current_state(Subresource::new(0, 0, 0)), UsageState::COMMON);
        assert_eq!(t.current_state(Subresource::new(3, 0, 0)), UsageState::COMMON);
    }

    #[test]
    fn test_heterogeneous_emits_per_differing_subresource() {
        let t = tracker(SubresourceLayout::new(4, 1, 1));
        let mut batch = BarrierBatch::new(16);
        drop(t.enter_state(&mut batch, UsageState::COPY_DEST, Subresource::new(1, 0, 0)).unwrap());
        drop(t.enter_state(&mut batch, UsageState::RENDER_TARGET, Subresource::new(2, 0, 0)).unwrap());
        batch.clear();

        let _lock = t.enter_state(&mut batch, UsageState::RENDER_TARGET, Scope::All).unwrap();
        let barriers = batch.take_all();
        // mips 0, 1, 3 differ; mip 2 already matches
        assert_eq!(barriers.len(), 3);
        let indices: Vec<_> = barriers.iter().map(|b| b.subresources).collect();
        assert_eq!(
            indices,
            vec![
                BarrierSubresources::Index(0),
                BarrierSubresources::Index(1),
                BarrierSubresources::Index(3)
            ]
        );
        assert_eq!(barriers[1].before, UsageState::COPY_DEST);
    }

    #[test]
    fn test_conflict_leaves_no_trace() {
        let t = tracker(SubresourceLayout::new(3, 1, 1));
        let mut batch = BarrierBatch::new(16);
        let _held = t.enter_state(&mut batch, UsageState::RENDER_TARGET, Subresource::new(2, 0, 0)).unwrap();
        batch.clear();

        let err = t.enter_state(&mut batch, UsageState::PIXEL_SHADER_RESOURCE, Scope::All).unwrap_err();
        let StateError::Conflict(err) = err else {
            panic!("expected a conflict");
        };
        assert_eq!(err.subresource, Subresource::new(2, 0, 0));
        assert_eq!(err.current, UsageState::RENDER_TARGET);
        assert_eq!(err.requested, UsageState::PIXEL_SHADER_RESOURCE);

        // Mips 0 and 1 come before the conflict in scope order and must be untouched
        assert!(batch.is_empty());
        assert_eq!(t.current_state(Subresource::new(0, 0, 0)), UsageState::COMMON);
        assert_eq!(t.lock_count(Subresource::new(0, 0, 0)), 0);
        assert_eq!(t.current_state(Subresource::new(2, 0, 0)), UsageState::RENDER_TARGET);
        assert_eq!(t.lock_count(Subresource::new(2, 0, 0)), 1);
    }

    #[test]
    fn test_scope_past_the_end_is_refused() {
        let t = tracker(SubresourceLayout::new(2, 1, 1));
        let mut batch = BarrierBatch::new(16);

        let err = t
            .enter_state(&mut batch, UsageState::RENDER_TARGET, Subresource::new(5, 0, 0))
            .unwrap_err();
        assert!(matches!(err, StateError::OutOfRange(ref e) if e.scope == Scope::Subresource(Subresource::new(5, 0, 0))));

        let err = t
            .enter_state(&mut batch, UsageState::RENDER_TARGET, ViewDesc::render_target(7))
            .unwrap_err();
        assert!(matches!(err, StateError::OutOfRange(_)));

        // No barrier queued, nothing locked, nothing moved
        assert!(batch.is_empty());
        assert!(!t.is_locked());
        assert_eq!(t.current_state(Subresource::new(1, 0, 0)), UsageState::COMMON);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_query_outside_resource_panics() {
        let t = tracker(SubresourceLayout::new(2, 2, 1));
        t.current_state(Subresource::new(2, 0, 0));
    }

    #[test]
    fn test_only_first_transition_discards() {
        let t = tracker(SubresourceLayout::new(1, 1, 1));
        let mut batch = BarrierBatch::new(16);
        drop(t.enter_state(&mut batch, UsageState::RENDER_TARGET, Scope::All).unwrap());
        drop(t.enter_state(&mut batch, UsageState::COMMON, Scope::All).unwrap());
        drop(t.enter_state(&mut batch, UsageState::PIXEL_SHADER_RESOURCE, Scope::All).unwrap());

        // Going back to COMMON mid-frame must not throw the render away
        let discards: Vec<bool> = batch.take_all().iter().map(|b| b.discard).collect();
        assert_eq!(discards, vec![true, false, false]);
    }

    #[test]
    fn test_fresh_and_written_subresources_split_the_fast_path() {
        let t = tracker(SubresourceLayout::new(2, 1, 1));
        let mut batch = BarrierBatch::new(16);
        drop(t.enter_state(&mut batch, UsageState::COPY_DEST, Subresource::new(0, 0, 0)).unwrap());
        drop(t.enter_state(&mut batch, UsageState::COMMON, Subresource::new(0, 0, 0)).unwrap());
        batch.clear();

        // Both mips read COMMON, but only mip 0 holds data
        let _lock = t.enter_state(&mut batch, UsageState::COPY_SOURCE, Scope::All).unwrap();
        let barriers = batch.take_all();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].subresources, BarrierSubresources::Index(0));
        assert!(!barriers[0].discard);
        assert_eq!(barriers[1].subresources, BarrierSubresources::Index(1));
        assert!(barriers[1].discard);
    }

    #[test]
    fn test_compatible_relock_counts_up() {
        let t = tracker(SubresourceLayout::new(1, 1, 1));
        let mut batch = BarrierBatch::new(16);
        let sub = Subresource::default();
        let a = t.enter_state(&mut batch, UsageState::ALL_SHADER_RESOURCE, Scope::All).unwrap();
        let b = t.enter_state(&mut batch, UsageState::ALL_SHADER_RESOURCE, sub).unwrap();
        assert_eq!(t.lock_count(sub), 2);
        drop(a);
        assert!(t.is_locked());
        drop(b);
        assert!(!t.is_locked());
    }

    #[test]
    fn test_ref_counting() {
        let t = tracker(SubresourceLayout::BUFFER);
        let other = t.clone();
        assert_eq!(t.ref_count(), 2);
        drop(other);
        assert_eq!(t.ref_count(), 1);
    }

    #[test]
    #[should_panic(expected = "not locked")]
    fn test_unlock_underflow_panics() {
        let t = tracker(SubresourceLayout::BUFFER);
        t.unlock(&SubresourceLayout::BUFFER.full_range());
    }
}

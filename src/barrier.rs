// Barrier batching
//
// Trackers decide *which* transitions are needed; they never talk to the command
// list. Decisions pile up here and go out as one barrier call on commit(). Until then
// nothing has reached the hardware, which is what lets a failing EnterState leave no
// trace behind.

use crate::resource::{ResourceDesc, ResourceId, ResourceKind};
use crate::state::{SubresourceLayout, SubresourceRange, UsageState};

/// Which subresources a barrier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierSubresources {
    All,
    Index(u32),
    Range(SubresourceRange),
}

/// One pending state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub kind: ResourceKind,
    pub raw: u64,
    pub layout: SubresourceLayout,
    pub subresources: BarrierSubresources,
    pub before: UsageState,
    pub after: UsageState,
    /// The subresources have never been transitioned, so their old contents
    /// need not survive this barrier.
    pub discard: bool,
}

impl Barrier {
    pub fn transition(
        resource: ResourceId,
        desc: &ResourceDesc,
        subresources: BarrierSubresources,
        before: UsageState,
        after: UsageState,
    ) -> Self {
        Self {
            resource,
            kind: desc.kind,
            raw: desc.raw,
            layout: desc.layout,
            subresources,
            before,
            after,
            discard: false,
        }
    }

    /// Mark the old contents as undefined.
    pub fn discarding(mut self, discard: bool) -> Self {
        self.discard = discard;
        self
    }

    /// The concrete subresource box this barrier touches.
    pub fn range(&self) -> SubresourceRange {
        match self.subresources {
            BarrierSubresources::All => self.layout.full_range(),
            BarrierSubresources::Index(index) => SubresourceRange::single(self.layout.decompose(index)),
            BarrierSubresources::Range(range) => range,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

/// The "append transition barriers" half of a command-recording handle.
pub trait CommandRecorder {
    fn resource_barriers(&mut self, barriers: &[Barrier]);
}

/// Bounded, ordered list of barriers waiting for the next commit.
#[derive(Debug)]
pub struct BarrierBatch {
    records: Vec<Barrier>,
    capacity: usize,
}

impl BarrierBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.records.len()
    }

    pub fn pending(&self) -> &[Barrier] {
        &self.records
    }

    /// Panics when `additional` more barriers would not fit. A frame never needs more
    /// distinct transitions than the configured capacity, so running out means the
    /// capacity is misconfigured.
    pub fn reserve(&self, additional: usize) {
        assert!(
            additional <= self.remaining(),
            "barrier batch overflow: {} pending + {} new > capacity {} (raise frame.barrier_capacity)",
            self.records.len(),
            additional,
            self.capacity
        );
    }

    pub fn append(&mut self, barrier: Barrier) {
        debug_assert!(!barrier.is_noop(), "no-op barrier {:?}", barrier);
        self.reserve(1);
        log::trace!(
            "barrier {} {:?}: {} -> {}",
            barrier.resource,
            barrier.subresources,
            barrier.before,
            barrier.after
        );
        self.records.push(barrier);
    }

    /// Take every pending barrier, leaving the batch empty.
    pub fn take_all(&mut self) -> Vec<Barrier> {
        std::mem::replace(&mut self.records, Vec::with_capacity(self.capacity))
    }

    /// Forget every pending barrier without recording it.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Flush everything as one barrier call. Returns how many barriers went out.
    pub fn commit<R: CommandRecorder + ?Sized>(&mut self, recorder: &mut R) -> usize {
        if self.records.is_empty() {
            return 0;
        }
        let count = self.records.len();
        recorder.resource_barriers(&self.records);
        self.records.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Subresource;

    #[derive(Default)]
    struct CountingRecorder {
        calls: Vec<usize>,
    }

    impl CommandRecorder for CountingRecorder {
        fn resource_barriers(&mut self, barriers: &[Barrier]) {
            self.calls.push(barriers.len());
        }
    }

    fn barrier(after: UsageState) -> Barrier {
        let desc = ResourceDesc::texture("t", SubresourceLayout::new(2, 1, 1), 1);
        Barrier::transition(ResourceId(1), &desc, BarrierSubresources::All, UsageState::COMMON, after)
    }

    #[test]
    fn test_commit_is_one_call() {
        let mut batch = BarrierBatch::new(8);
        batch.append(barrier(UsageState::RENDER_TARGET));
        batch.append(barrier(UsageState::COPY_DEST));
        batch.append(barrier(UsageState::UNORDERED_ACCESS));

        let mut recorder = CountingRecorder::default();
        assert_eq!(batch.commit(&mut recorder), 3);
        assert_eq!(recorder.calls, vec![3]);
        assert!(batch.is_empty());

        // Nothing pending: no call at all
        assert_eq!(batch.commit(&mut recorder), 0);
        assert_eq!(recorder.calls.len(), 1);
    }

    #[test]
    fn test_take_all_preserves_order() {
        let mut batch = BarrierBatch::new(4);
        batch.append(barrier(UsageState::RENDER_TARGET));
        batch.append(barrier(UsageState::COPY_SOURCE));
        let taken = batch.take_all();
        assert_eq!(taken[0].after, UsageState::RENDER_TARGET);
        assert_eq!(taken[1].after, UsageState::COPY_SOURCE);
        assert!(batch.is_empty());
        assert_eq!(batch.remaining(), 4);
    }

    #[test]
    #[should_panic(expected = "barrier batch overflow")]
    fn test_overflow_is_fatal() {
        let mut batch = BarrierBatch::new(1);
        batch.append(barrier(UsageState::RENDER_TARGET));
        batch.append(barrier(UsageState::COPY_DEST));
    }

    #[test]
    fn test_index_barrier_range() {
        let desc = ResourceDesc::texture("t", SubresourceLayout::new(3, 2, 1), 1);
        let b = Barrier::transition(
            ResourceId(2),
            &desc,
            BarrierSubresources::Index(4),
            UsageState::COMMON,
            UsageState::COPY_DEST,
        );
        assert_eq!(b.range(), SubresourceRange::single(Subresource::new(1, 1, 0)));
    }
}

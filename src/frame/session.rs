// Device session - the frame driver
//
// Owns everything that used to be process-wide: the fence, the command-list ring,
// the pending-release list, the barrier batch and the tracker registry. One session
// per device; when the device is lost the whole session is thrown away and rebuilt.
//
// FRAME FLOW:
// ┌─────────────────────────────────────────────────────────────────────────┐
// │  record (EnterState / barriers / commands) ─> Flush ─> record ─> ...    │
// │                                                                         │
// │  Flush = Signal   close + execute + signal head, bucket the releases,   │
// │                   block if more than N frames are in flight             │
// │        + Reclaim  destroy buckets of every completed slot               │
// │        + Prepare  reset the next slot's allocator                       │
// └─────────────────────────────────────────────────────────────────────────┘

use super::fence::{Fence, FenceCounters};
use super::queue::{CommandAllocator, CommandQueue, FrameListener};
use super::release::ReleaseQueue;
use super::ring::{CommandListRing, SlotState};
use crate::barrier::{Barrier, BarrierBatch};
use crate::config::FrameConfig;
use crate::error::{DeviceError, OperationError, StateError};
use crate::resource::{ResourceDesc, ResourceId};
use crate::state::{ResourceStateLock, ResourceStateTracker, Scope, TrackerRegistry, UsageState};

pub struct DeviceSession<Q: CommandQueue> {
    queue: Q,
    fence: Q::Fence,
    ring: CommandListRing<Q::Allocator>,
    counters: FenceCounters,
    releases: ReleaseQueue,
    barriers: BarrierBatch,
    registry: TrackerRegistry,
    listeners: Vec<Box<dyn FrameListener>>,
    lost: bool,
}

impl<Q: CommandQueue> DeviceSession<Q> {
    /// Create the fence and ring on `queue` and start recording the first frame.
    pub fn new(queue: Q, config: &FrameConfig) -> Result<Self, DeviceError> {
        let fence = queue.create_fence()?;
        let ring = CommandListRing::new(config.frames_in_flight, |_| queue.create_allocator())?;
        log::info!(
            "Device session: {} frames in flight ({} ring slots), barrier batch of {}",
            config.frames_in_flight,
            ring.len(),
            config.barrier_capacity
        );

        let mut session = Self {
            queue,
            fence,
            ring,
            counters: FenceCounters::default(),
            releases: ReleaseQueue::new(),
            barriers: BarrierBatch::new(config.barrier_capacity),
            registry: TrackerRegistry::new(),
            listeners: Vec::new(),
            lost: false,
        };
        session.prepare_next()?;
        Ok(session)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn counters(&self) -> FenceCounters {
        self.counters
    }

    pub fn ring(&self) -> &CommandListRing<Q::Allocator> {
        &self.ring
    }

    pub fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }

    pub fn pending_barriers(&self) -> &[Barrier] {
        self.barriers.pending()
    }

    /// Handle other subsystems use to retire GPU objects.
    pub fn releases(&self) -> ReleaseQueue {
        self.releases.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Index of the slot being recorded.
    pub fn current_slot(&self) -> usize {
        self.ring.index_for(self.counters.next_value())
    }

    /// Recording handle of the current frame. Pending barriers are committed first so
    /// whatever gets recorded next sees the transitions.
    pub fn recorder(&mut self) -> &mut Q::Allocator {
        self.commit_resource_barriers();
        let index = self.current_slot();
        &mut self.ring.slot_mut(index).allocator
    }

    pub fn add_listener(&mut self, listener: Box<dyn FrameListener>) {
        self.listeners.push(listener);
    }

    // =========================================================================
    // RESOURCES & STATES
    // =========================================================================

    pub fn create_tracker(&self, desc: ResourceDesc, initial: UsageState) -> ResourceStateTracker {
        self.registry.register(desc, initial)
    }

    pub fn tracker(&self, id: ResourceId) -> Option<ResourceStateTracker> {
        self.registry.get(id)
    }

    /// The only sanctioned way to use a tracked resource in a given state.
    pub fn enter_state(
        &mut self,
        tracker: &ResourceStateTracker,
        state: UsageState,
        scope: impl Into<Scope>,
    ) -> Result<ResourceStateLock, StateError> {
        tracker.enter_state(&mut self.barriers, state, scope)
    }

    /// Queue a hand-made transition. No-op transitions are dropped.
    pub fn resource_barrier(&mut self, barrier: Barrier) -> bool {
        if barrier.is_noop() {
            return false;
        }
        self.barriers.append(barrier);
        true
    }

    /// Flush queued transitions to the current frame as one barrier call.
    ///
    /// While the current slot is not recording (a submit failed and PrepareNext has not
    /// run yet) the barriers stay queued.
    pub fn commit_resource_barriers(&mut self) -> usize {
        let index = self.current_slot();
        let slot = self.ring.slot_mut(index);
        if slot.state != SlotState::Recording {
            return 0;
        }
        self.barriers.commit(&mut slot.allocator)
    }

    /// Destroy `object` no earlier than the fence value of the frame being recorded.
    pub fn defer_release<T: Send + 'static>(&self, object: T) {
        self.releases.defer(object);
    }

    /// The resource behind `tracker` is going away: stop answering for it in the
    /// registry now, destroy the GPU object once the current frame completes.
    pub fn destroy_resource<T: Send + 'static>(&self, tracker: ResourceStateTracker, object: T) {
        if tracker.is_locked() {
            log::warn!("Destroying '{}' ({}) while it is still locked", tracker.name(), tracker.id());
        }
        self.registry.unregister(tracker.id());
        self.releases.defer(object);
    }

    // =========================================================================
    // FRAME PACING
    // =========================================================================

    /// Close and submit the current frame, then signal its fence value.
    ///
    /// Blocks when more than `frames_in_flight` frames would be outstanding.
    /// If closing or submitting fails the slot drops back to idle; call
    /// `prepare_next` before recording the frame again.
    pub fn signal(&mut self) -> Result<u64, DeviceError> {
        let value = self.counters.next_value();
        let index = self.ring.index_for(value);
        if self.ring.slot(index).state() != SlotState::Recording {
            return Err(DeviceError::Backend(format!(
                "frame slot {} is not recording (prepare_next after a failed submit)",
                index
            )));
        }
        self.commit_resource_barriers();

        let slot = self.ring.slot_mut(index);
        let submitted = slot
            .allocator
            .close()
            .and_then(|()| self.queue.execute(&mut slot.allocator))
            .and_then(|()| self.queue.signal(&self.fence, value));
        if submitted.is_err() {
            // Closed or half-submitted: only a reset makes this allocator usable again
            slot.state = SlotState::Idle;
        }
        self.check(submitted)?;

        let slot = self.ring.slot_mut(index);
        debug_assert!(slot.bucket.is_empty());
        slot.bucket = self.releases.take();
        slot.signaled = value;
        slot.state = SlotState::Submitted;
        self.counters.advance_submitted(value);
        log::trace!(
            "Signaled frame {} in slot {} ({} releases bucketed)",
            value,
            index,
            slot.bucket.len()
        );

        // Back-pressure: the ring only has room for N frames the GPU has not finished
        let completed = self.check(self.fence.completed_value())?;
        self.counters.observe_completed(completed);
        let depth = self.ring.frames_in_flight() as u64;
        if self.counters.in_flight() > depth {
            let wait_for = self.counters.submitted() - depth;
            log::debug!(
                "Ring full ({} frames in flight), waiting for fence value {}",
                self.counters.in_flight(),
                wait_for
            );
            self.check(self.fence.wait(wait_for))?;
            let completed = self.check(self.fence.completed_value())?;
            self.counters.observe_completed(completed.max(wait_for));
        }
        Ok(value)
    }

    /// Destroy the buckets of every slot the GPU has finished with, and tell pooled
    /// allocators where the fence is. Returns the completed value.
    pub fn reclaim(&mut self) -> Result<u64, DeviceError> {
        let completed = self.check(self.fence.completed_value())?;
        self.counters.observe_completed(completed);

        let mut released = 0;
        while self.counters.reclaimed() < self.counters.completed() {
            let value = self.counters.reclaimed() + 1;
            let index = self.ring.index_for(value);
            let slot = self.ring.slot_mut(index);
            debug_assert_eq!(slot.signaled, value);
            released += slot.reclaim();
            self.counters.advance_reclaimed(value);
        }
        if released > 0 {
            log::debug!("Reclaimed {} objects up to fence value {}", released, self.counters.completed());
        }

        let (completed, submitted) = (self.counters.completed(), self.counters.submitted());
        for listener in &mut self.listeners {
            listener.on_reclaim(completed, submitted);
        }
        Ok(completed)
    }

    /// Reset the next slot's allocator and begin recording into it.
    ///
    /// Panics if the slot still holds work the GPU may be using: that can only happen
    /// if Signal / Reclaim were skipped, and resetting would free memory in use.
    pub fn prepare_next(&mut self) -> Result<(), DeviceError> {
        let index = self.current_slot();
        let reclaimed = self.counters.reclaimed();
        let slot = self.ring.slot_mut(index);
        assert!(
            slot.bucket.is_empty() && slot.signaled <= reclaimed,
            "frame slot {} reset while fence value {} is unreclaimed ({} pending releases)",
            index,
            slot.signaled,
            slot.bucket.len()
        );

        let reset = slot.allocator.reset();
        self.check(reset)?;
        self.ring.slot_mut(index).state = SlotState::Recording;
        log::trace!("Recording frame {} into slot {}", self.counters.next_value(), index);
        Ok(())
    }

    /// End the frame: Signal + Reclaim + PrepareNext. Returns the signaled value.
    pub fn flush(&mut self) -> Result<u64, DeviceError> {
        let value = self.signal()?;
        self.reclaim()?;
        self.prepare_next()?;
        Ok(value)
    }

    /// Block until everything submitted has finished, then reclaim it all.
    pub fn sync(&mut self) -> Result<(), DeviceError> {
        let target = self.counters.submitted();
        if target > 0 {
            log::debug!("Syncing to fence value {}", target);
            self.check(self.fence.wait(target))?;
        }
        self.reclaim()?;
        Ok(())
    }

    // =========================================================================
    // ERROR BOUNDARIES
    // =========================================================================

    /// Run one rendering operation. State errors and allocation failures skip just
    /// this operation (returns `Ok(false)`); a lost device is passed up.
    pub fn run_operation<F>(&mut self, name: &str, op: F) -> Result<bool, DeviceError>
    where
        F: FnOnce(&mut Self) -> Result<(), OperationError>,
    {
        match op(self) {
            Ok(()) => Ok(true),
            Err(OperationError::State(err)) => {
                log::error!("Skipping '{}' this frame: {}", name, err);
                Ok(false)
            }
            Err(OperationError::Allocation(err)) => {
                log::warn!("Skipping '{}' this frame: {}", name, err);
                Ok(false)
            }
            Err(OperationError::Device(err)) => {
                if err.is_lost() {
                    self.lost = true;
                }
                log::error!("'{}' failed: {}", name, err);
                Err(err)
            }
        }
    }

    /// Tear down after device loss: drop every deferred object immediately.
    pub fn abandon(mut self) {
        self.lost = true;
        let released = self.ring.discard_all() + self.releases.take().len();
        log::warn!("Abandoned device session ({} deferred objects dropped)", released);
    }

    fn check<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        if let Err(DeviceError::Lost) = result {
            if !self.lost {
                log::error!("Device lost at fence value {}", self.counters.submitted());
            }
            self.lost = true;
        }
        result
    }
}

impl<Q: CommandQueue> Drop for DeviceSession<Q> {
    fn drop(&mut self) {
        if self.lost {
            self.ring.discard_all();
            return;
        }
        if let Err(err) = self.sync() {
            log::error!("Failed to sync device session on shutdown: {}", err);
            self.ring.discard_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimEvent, SimGpu, SimQueue};
    use crate::state::{Subresource, SubresourceLayout};

    fn session(frames_in_flight: usize, gpu: &SimGpu) -> DeviceSession<SimQueue> {
        let config = FrameConfig {
            frames_in_flight,
            barrier_capacity: 32,
        };
        DeviceSession::new(SimQueue::new(gpu.clone()), &config).unwrap()
    }

    #[test]
    fn test_first_slot_prepared_on_creation() {
        let gpu = SimGpu::new();
        let s = session(2, &gpu);
        assert_eq!(s.ring().slot(0).state(), SlotState::Recording);
        assert_eq!(gpu.events(), vec![SimEvent::Reset { slot: 0 }]);
    }

    #[test]
    fn test_barriers_go_out_on_signal() {
        let gpu = SimGpu::with_lag(0);
        let mut s = session(2, &gpu);
        let t = s.create_tracker(
            ResourceDesc::texture("rt", SubresourceLayout::new(2, 1, 1), gpu.next_handle()),
            UsageState::COMMON,
        );
        drop(s.enter_state(&t, UsageState::RENDER_TARGET, Scope::All).unwrap());
        assert_eq!(s.pending_barriers().len(), 1);
        gpu.clear_events();

        s.flush().unwrap();
        let events = gpu.events();
        assert_eq!(events[0], SimEvent::Barriers { slot: 0, count: 1 });
        assert_eq!(events[1], SimEvent::Close { slot: 0 });
        assert_eq!(events[2], SimEvent::Execute { slot: 0 });
        assert_eq!(events[3], SimEvent::Signal(1));
        assert!(s.pending_barriers().is_empty());
    }

    #[test]
    fn test_release_waits_for_its_frame() {
        let gpu = SimGpu::new();
        let mut s = session(2, &gpu);
        s.defer_release(gpu.object("old-texture"));
        s.flush().unwrap();
        assert!(!gpu.released("old-texture"));

        gpu.complete_up_to(1);
        s.reclaim().unwrap();
        assert!(gpu.released("old-texture"));
    }

    #[test]
    fn test_destroy_resource_unregisters_now() {
        let gpu = SimGpu::new();
        let mut s = session(1, &gpu);
        let t = s.create_tracker(ResourceDesc::buffer("vb", gpu.next_handle()), UsageState::COMMON);
        let id = t.id();
        s.destroy_resource(t, gpu.object("vb"));
        assert!(s.tracker(id).is_none());
        s.sync().unwrap();
        assert!(!gpu.released("vb"));
        s.flush().unwrap();
        s.sync().unwrap();
        assert!(gpu.released("vb"));
    }

    #[test]
    fn test_sync_drains_everything() {
        let gpu = SimGpu::new();
        let mut s = session(3, &gpu);
        for frame in 0..3 {
            s.defer_release(gpu.object(&format!("f{}", frame)));
            s.flush().unwrap();
        }
        s.sync().unwrap();
        assert_eq!(s.counters().completed(), 3);
        assert_eq!(s.counters().reclaimed(), 3);
        assert!((0..3).all(|frame| gpu.released(&format!("f{}", frame))));
    }

    #[test]
    fn test_operation_boundary_skips_conflicts() {
        let gpu = SimGpu::with_lag(0);
        let mut s = session(2, &gpu);
        let t = s.create_tracker(
            ResourceDesc::texture("shadow", SubresourceLayout::new(1, 1, 1), gpu.next_handle()),
            UsageState::COMMON,
        );

        let ran = s
            .run_operation("bad-pass", |s| {
                let _rt = s.enter_state(&t, UsageState::RENDER_TARGET, Scope::All)?;
                let _srv = s.enter_state(&t, UsageState::PIXEL_SHADER_RESOURCE, Subresource::default())?;
                Ok(())
            })
            .unwrap();
        assert!(!ran);
        assert!(!t.is_locked());
        assert_eq!(t.current_state(Subresource::default()), UsageState::RENDER_TARGET);

        let ran = s
            .run_operation("good-pass", |s| {
                let _srv = s.enter_state(&t, UsageState::PIXEL_SHADER_RESOURCE, Scope::All)?;
                Ok(())
            })
            .unwrap();
        assert!(ran);
    }

    #[test]
    fn test_operation_boundary_skips_scopes_out_of_range() {
        let gpu = SimGpu::with_lag(0);
        let mut s = session(2, &gpu);
        let t = s.create_tracker(
            ResourceDesc::texture("bloom", SubresourceLayout::new(2, 1, 1), gpu.next_handle()),
            UsageState::COMMON,
        );

        let ran = s
            .run_operation("mip-7", |s| {
                let _rt = s.enter_state(&t, UsageState::RENDER_TARGET, crate::state::ViewDesc::render_target(7))?;
                Ok(())
            })
            .unwrap();
        assert!(!ran);
        assert!(s.pending_barriers().is_empty());
        assert!(!t.is_locked());
    }

    #[test]
    #[should_panic(expected = "reset while fence value")]
    fn test_prepare_without_reclaim_is_fatal() {
        let gpu = SimGpu::new();
        let mut s = session(1, &gpu);
        s.defer_release(gpu.object("frame-1"));
        s.flush().unwrap();

        // Frame 2 forces a wait for frame 1, but its slot is never reclaimed
        s.signal().unwrap();
        assert_eq!(s.counters().completed(), 1);
        let _ = s.prepare_next();
    }

    #[test]
    fn test_failed_submit_needs_a_fresh_slot() {
        let gpu = SimGpu::with_lag(0);
        let mut s = session(2, &gpu);
        s.defer_release(gpu.object("kept"));
        gpu.fail_next_execute();
        assert!(matches!(s.flush(), Err(DeviceError::Backend(_))));
        assert!(!s.is_lost());
        assert_eq!(s.ring().slot(0).state(), SlotState::Idle);

        // The closed command list is neither closed nor submitted a second time
        gpu.clear_events();
        assert!(matches!(s.flush(), Err(DeviceError::Backend(_))));
        assert!(gpu.events().is_empty());

        s.prepare_next().unwrap();
        assert_eq!(s.flush().unwrap(), 1);
        let closes = gpu
            .events()
            .iter()
            .filter(|event| matches!(event, SimEvent::Close { .. }))
            .count();
        assert_eq!(closes, 1);
        assert!(gpu.released("kept"));
    }

    #[test]
    fn test_device_lost_propagates() {
        let gpu = SimGpu::with_lag(0);
        let mut s = session(2, &gpu);
        s.flush().unwrap();
        gpu.lose_device();
        assert_eq!(s.flush(), Err(DeviceError::Lost));
        assert!(s.is_lost());

        let err = s
            .run_operation("after-loss", |_| Err(DeviceError::Lost.into()))
            .unwrap_err();
        assert!(err.is_lost());
        s.abandon();
    }

    #[test]
    fn test_manual_barrier() {
        let gpu = SimGpu::new();
        let mut s = session(1, &gpu);
        let desc = ResourceDesc::buffer("staging", gpu.next_handle());
        let t = s.create_tracker(desc.clone(), UsageState::COMMON);
        let noop = Barrier::transition(
            t.id(),
            &desc,
            crate::barrier::BarrierSubresources::All,
            UsageState::COPY_DEST,
            UsageState::COPY_DEST,
        );
        assert!(!s.resource_barrier(noop));
        let real = Barrier::transition(
            t.id(),
            &desc,
            crate::barrier::BarrierSubresources::All,
            UsageState::COPY_DEST,
            UsageState::COPY_SOURCE,
        );
        assert!(s.resource_barrier(real));
        assert_eq!(s.commit_resource_barriers(), 1);
        assert_eq!(s.commit_resource_barriers(), 0);
    }
}

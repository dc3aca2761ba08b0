// Command-list ring
//
// N frames may be in flight on the GPU while the CPU records one more, so the ring
// has N + 1 slots. Frame with fence value v lives in slot (v - 1) % (N + 1).
//
// Slot lifecycle:
//   Idle -> Recording (PrepareNext) -> Submitted (Signal)
//        -> [fence reaches the slot's value] -> reclaimed back to Idle

use super::release::Retired;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

pub struct FrameSlot<A> {
    pub(crate) allocator: A,
    pub(crate) bucket: Vec<Retired>,
    pub(crate) signaled: u64,
    pub(crate) state: SlotState,
}

impl<A> FrameSlot<A> {
    fn new(allocator: A) -> Self {
        Self {
            allocator,
            bucket: Vec::new(),
            signaled: 0,
            state: SlotState::Idle,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Fence value this slot last signaled (0 if never submitted).
    pub fn signaled(&self) -> u64 {
        self.signaled
    }

    pub fn pending_releases(&self) -> usize {
        self.bucket.len()
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The GPU is done with this slot: destroy everything in its bucket.
    pub(crate) fn reclaim(&mut self) -> usize {
        debug_assert_eq!(self.state, SlotState::Submitted);
        let released = self.bucket.len();
        self.bucket.clear();
        self.state = SlotState::Idle;
        released
    }
}

pub struct CommandListRing<A> {
    slots: Vec<FrameSlot<A>>,
    frames_in_flight: usize,
}

impl<A> CommandListRing<A> {
    pub fn new<E>(frames_in_flight: usize, mut make: impl FnMut(usize) -> Result<A, E>) -> Result<Self, E> {
        assert!(frames_in_flight > 0, "ring needs at least one frame in flight");
        let slots = (0..=frames_in_flight)
            .map(|index| make(index).map(FrameSlot::new))
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Self {
            slots,
            frames_in_flight,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot used by the frame that signals `value`.
    pub fn index_for(&self, value: u64) -> usize {
        debug_assert!(value > 0);
        ((value - 1) % self.slots.len() as u64) as usize
    }

    pub fn slot(&self, index: usize) -> &FrameSlot<A> {
        &self.slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut FrameSlot<A> {
        &mut self.slots[index]
    }

    pub fn slots(&self) -> impl Iterator<Item = &FrameSlot<A>> {
        self.slots.iter()
    }

    /// Drop every bucket without waiting for the GPU. Only for a dead device.
    pub(crate) fn discard_all(&mut self) -> usize {
        let mut released = 0;
        for slot in &mut self.slots {
            released += slot.bucket.len();
            slot.bucket.clear();
            slot.state = SlotState::Idle;
        }
        released
    }
}

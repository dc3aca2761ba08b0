// Upload ring
//
// Linear allocator for per-frame CPU -> GPU data. Every allocation is tagged with the
// fence value of the frame that records it; space is handed back only once the
// session reports that value completed. The ring never owns memory itself - the
// Vulkan backend maps a buffer behind it, the simulated backend uses it as-is.
//
// Offsets are kept as ever-growing "virtual" cursors; physical offset = virtual %
// capacity. head - tail is the number of bytes in use.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::AllocationError;
use crate::frame::FrameListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAllocation {
    /// Physical byte offset into the backing buffer.
    pub offset: u64,
    pub size: u64,
    /// Fence value of the frame that owns this range.
    pub frame: u64,
}

#[derive(Debug)]
struct RingState {
    capacity: u64,
    alignment: u64,
    head: u64,
    tail: u64,
    frame: u64,
    /// (frame, end cursor) per frame that still owns space, oldest first.
    regions: VecDeque<(u64, u64)>,
}

/// Shared handle; one clone goes to the session as a frame listener.
#[derive(Clone)]
pub struct UploadRing {
    state: Arc<Mutex<RingState>>,
}

impl UploadRing {
    /// `alignment` must be a power of two dividing `capacity`.
    pub fn new(capacity: u64, alignment: u64) -> Self {
        assert!(capacity > 0, "upload ring needs some space");
        assert!(
            alignment.is_power_of_two() && capacity % alignment == 0,
            "upload alignment {} must be a power of two dividing the capacity {}",
            alignment,
            capacity
        );
        Self {
            state: Arc::new(Mutex::new(RingState {
                capacity,
                alignment,
                head: 0,
                tail: 0,
                frame: 1,
                regions: VecDeque::new(),
            })),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    pub fn used(&self) -> u64 {
        let state = self.state.lock();
        state.head - state.tail
    }

    /// Fence value new allocations are tagged with.
    pub fn current_frame(&self) -> u64 {
        self.state.lock().frame
    }

    pub fn allocate(&self, size: u64) -> Result<UploadAllocation, AllocationError> {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        if size > capacity {
            return Err(AllocationError::TooLarge {
                requested: size,
                capacity,
            });
        }

        let mut start = align_up(state.head, state.alignment);
        if start % capacity + size > capacity {
            // Doesn't fit before the end of the buffer: skip to the start again
            start = align_up(start, capacity);
        }
        let end = start + size.max(1);
        if end - state.tail > capacity {
            return Err(AllocationError::OutOfSpace {
                requested: size,
                available: capacity - (state.head - state.tail),
            });
        }

        state.head = end;
        let frame = state.frame;
        match state.regions.back_mut() {
            Some((owner, region_end)) if *owner == frame => *region_end = end,
            _ => state.regions.push_back((frame, end)),
        }
        Ok(UploadAllocation {
            offset: start % capacity,
            size,
            frame,
        })
    }
}

impl FrameListener for UploadRing {
    fn on_reclaim(&mut self, completed: u64, submitted: u64) {
        let mut state = self.state.lock();
        while let Some(&(frame, end)) = state.regions.front() {
            if frame > completed {
                break;
            }
            state.tail = end;
            state.regions.pop_front();
        }
        if state.regions.is_empty() {
            state.tail = state.head;
        }
        state.frame = submitted + 1;
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

// Simulated device
//
// A queue, fence and recording allocator with no GPU behind them. The "GPU" finishes
// work either a fixed number of frames behind the CPU (`with_lag`) or only when told
// to / waited on (`new`). Everything interesting is appended to an ordered event log,
// so callers can check what happened in which order.
//
// Used by the test-suite and by the demo binary when no Vulkan device is wanted.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::barrier::{Barrier, CommandRecorder};
use crate::error::DeviceError;
use crate::frame::{CommandAllocator, CommandQueue, Fence};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Allocator of `slot` reset and opened for recording.
    Reset { slot: usize },
    /// One barrier call with `count` transitions recorded into `slot`.
    Barriers { slot: usize, count: usize },
    Close { slot: usize },
    Execute { slot: usize },
    /// Queue asked to signal this fence value.
    Signal(u64),
    /// CPU blocked on this fence value.
    Wait(u64),
    /// A deferred object was dropped.
    Released(String),
}

#[derive(Default)]
struct SimState {
    submitted: u64,
    completed: u64,
    lag: Option<u64>,
    lost: bool,
    lose_at: Option<u64>,
    fail_execute: bool,
    next_handle: u64,
    next_slot: usize,
    events: Vec<SimEvent>,
    barriers: Vec<Barrier>,
}

impl SimState {
    fn alive(&self) -> Result<(), DeviceError> {
        if self.lost {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }
}

/// Shared handle to the simulated GPU.
#[derive(Clone, Default)]
pub struct SimGpu {
    state: Arc<Mutex<SimState>>,
}

impl SimGpu {
    /// A GPU that finishes nothing unless told to or waited on.
    pub fn new() -> Self {
        Self::default()
    }

    /// A GPU that is always `lag` frames behind the last signal.
    pub fn with_lag(lag: u64) -> Self {
        let gpu = Self::new();
        gpu.state.lock().lag = Some(lag);
        gpu
    }

    /// Pretend the device is lost from now on.
    pub fn lose_device(&self) {
        self.state.lock().lost = true;
    }

    /// Lose the device when fence value `value` is signaled.
    pub fn lose_at(&self, value: u64) {
        self.state.lock().lose_at = Some(value);
    }

    /// Make the next submit fail with a backend error. The device survives.
    pub fn fail_next_execute(&self) {
        self.state.lock().fail_execute = true;
    }

    /// Let the GPU finish every frame up to `value`.
    pub fn complete_up_to(&self, value: u64) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(value.min(state.submitted));
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    /// A fresh fake backend handle.
    pub fn next_handle(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_handle += 1;
        0x1000 + state.next_handle
    }

    /// An object that logs `Released(name)` when dropped.
    pub fn object(&self, name: &str) -> SimObject {
        SimObject {
            name: name.to_string(),
            gpu: self.clone(),
        }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Every barrier recorded so far, in order.
    pub fn barriers(&self) -> Vec<Barrier> {
        self.state.lock().barriers.clone()
    }

    pub fn released(&self, name: &str) -> bool {
        self.state
            .lock()
            .events
            .iter()
            .any(|event| matches!(event, SimEvent::Released(n) if n == name))
    }

    fn push(&self, event: SimEvent) {
        self.state.lock().events.push(event);
    }
}

/// Deferred object that reports its destruction.
pub struct SimObject {
    name: String,
    gpu: SimGpu,
}

impl Drop for SimObject {
    fn drop(&mut self) {
        self.gpu.push(SimEvent::Released(std::mem::take(&mut self.name)));
    }
}

pub struct SimQueue {
    gpu: SimGpu,
}

impl SimQueue {
    pub fn new(gpu: SimGpu) -> Self {
        Self { gpu }
    }

    pub fn gpu(&self) -> &SimGpu {
        &self.gpu
    }
}

pub struct SimFence {
    gpu: SimGpu,
}

pub struct SimAllocator {
    slot: usize,
    gpu: SimGpu,
    open: bool,
}

impl SimAllocator {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl CommandRecorder for SimAllocator {
    fn resource_barriers(&mut self, barriers: &[Barrier]) {
        debug_assert!(self.open, "recording into a closed allocator");
        let mut state = self.gpu.state.lock();
        state.events.push(SimEvent::Barriers {
            slot: self.slot,
            count: barriers.len(),
        });
        state.barriers.extend_from_slice(barriers);
    }
}

impl CommandAllocator for SimAllocator {
    fn reset(&mut self) -> Result<(), DeviceError> {
        self.gpu.state.lock().alive()?;
        self.open = true;
        self.gpu.push(SimEvent::Reset { slot: self.slot });
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.gpu.state.lock().alive()?;
        self.open = false;
        self.gpu.push(SimEvent::Close { slot: self.slot });
        Ok(())
    }
}

impl CommandQueue for SimQueue {
    type Allocator = SimAllocator;
    type Fence = SimFence;

    fn create_fence(&self) -> Result<SimFence, DeviceError> {
        self.gpu.state.lock().alive()?;
        Ok(SimFence { gpu: self.gpu.clone() })
    }

    fn create_allocator(&self) -> Result<SimAllocator, DeviceError> {
        let mut state = self.gpu.state.lock();
        state.alive()?;
        let slot = state.next_slot;
        state.next_slot += 1;
        Ok(SimAllocator {
            slot,
            gpu: self.gpu.clone(),
            open: false,
        })
    }

    fn execute(&self, allocator: &mut SimAllocator) -> Result<(), DeviceError> {
        let mut state = self.gpu.state.lock();
        state.alive()?;
        if std::mem::take(&mut state.fail_execute) {
            return Err(DeviceError::Backend(format!("submit of slot {} rejected", allocator.slot)));
        }
        drop(state);
        debug_assert!(!allocator.open, "executing an open allocator");
        self.gpu.push(SimEvent::Execute { slot: allocator.slot });
        Ok(())
    }

    fn signal(&self, _fence: &SimFence, value: u64) -> Result<(), DeviceError> {
        let mut state = self.gpu.state.lock();
        state.alive()?;
        if state.lose_at == Some(value) {
            state.lost = true;
            return Err(DeviceError::Lost);
        }
        state.submitted = value;
        state.events.push(SimEvent::Signal(value));
        if let Some(lag) = state.lag {
            state.completed = state.completed.max(value.saturating_sub(lag));
        }
        Ok(())
    }
}

impl Fence for SimFence {
    fn completed_value(&self) -> Result<u64, DeviceError> {
        let state = self.gpu.state.lock();
        state.alive()?;
        Ok(state.completed)
    }

    fn wait(&self, value: u64) -> Result<(), DeviceError> {
        let mut state = self.gpu.state.lock();
        state.alive()?;
        if value > state.submitted {
            return Err(DeviceError::Backend(format!(
                "wait for fence value {} that was never signaled (last {})",
                value, state.submitted
            )));
        }
        state.events.push(SimEvent::Wait(value));
        // The GPU catches up while the CPU is blocked
        state.completed = state.completed.max(value);
        Ok(())
    }
}

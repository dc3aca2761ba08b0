// Fence bookkeeping
//
// Fence values are 1-based: the first submitted frame signals 1, the next 2, and so on.
// 0 means "nothing yet". Three counters describe the pipeline:
//
//   reclaimed (tail) <= completed <= submitted (head)
//
// - submitted: last value asked of the queue
// - completed: highest value the hardware has reported finished
// - reclaimed: every slot up to this value has had its bucket destroyed

use crate::error::DeviceError;

/// CPU view of a GPU fence.
pub trait Fence {
    /// Highest value the hardware reports finished.
    fn completed_value(&self) -> Result<u64, DeviceError>;

    /// Block the calling thread until the fence reaches `value`.
    fn wait(&self, value: u64) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceCounters {
    submitted: u64,
    completed: u64,
    reclaimed: u64,
}

impl FenceCounters {
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn reclaimed(&self) -> u64 {
        self.reclaimed
    }

    /// Value the frame currently being recorded will signal.
    pub fn next_value(&self) -> u64 {
        self.submitted + 1
    }

    /// Frames submitted but not yet finished on the GPU.
    pub fn in_flight(&self) -> u64 {
        self.submitted - self.completed
    }

    pub(crate) fn advance_submitted(&mut self, value: u64) {
        assert_eq!(value, self.submitted + 1, "fence values must be signaled in order");
        self.submitted = value;
        self.check();
    }

    /// Record what the hardware reported. Never moves backwards.
    pub(crate) fn observe_completed(&mut self, value: u64) {
        debug_assert!(
            value <= self.submitted,
            "fence reports {} complete but only {} were submitted",
            value,
            self.submitted
        );
        self.completed = self.completed.max(value.min(self.submitted));
        self.check();
    }

    pub(crate) fn advance_reclaimed(&mut self, value: u64) {
        debug_assert!(value > self.reclaimed && value <= self.completed);
        self.reclaimed = value;
        self.check();
    }

    fn check(&self) {
        debug_assert!(
            self.reclaimed <= self.completed && self.completed <= self.submitted,
            "fence counters out of order: {:?}",
            self
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_advance() {
        let mut counters = FenceCounters::default();
        assert_eq!(counters.next_value(), 1);
        counters.advance_submitted(1);
        counters.advance_submitted(2);
        assert_eq!(counters.in_flight(), 2);

        counters.observe_completed(1);
        assert_eq!(counters.in_flight(), 1);
        counters.advance_reclaimed(1);
        assert_eq!(counters.reclaimed(), 1);
    }

    #[test]
    fn test_completed_never_regresses() {
        let mut counters = FenceCounters::default();
        counters.advance_submitted(1);
        counters.advance_submitted(2);
        counters.observe_completed(2);
        counters.observe_completed(1);
        assert_eq!(counters.completed(), 2);
    }

    #[test]
    #[should_panic(expected = "signaled in order")]
    fn test_skipping_a_value_panics() {
        let mut counters = FenceCounters::default();
        counters.advance_submitted(2);
    }
}

// Deferred release
//
// Objects the GPU may still be reading are parked here until the frame being
// recorded is signaled, then move into that frame's ring slot.

use std::sync::Arc;

use parking_lot::Mutex;

/// Something whose destruction has been deferred. Destroying it is dropping it.
pub type Retired = Box<dyn Send>;

/// Objects retired while the current frame is recorded.
///
/// At Signal the whole list moves into that frame's ring slot, so nothing retired
/// during recording can end up waiting on the wrong fence value. Handles are cheap to
/// clone and can be given to any subsystem that owns GPU objects.
#[derive(Clone, Default)]
pub struct ReleaseQueue {
    pending: Arc<Mutex<Vec<Retired>>>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destroy `object` no earlier than the fence value of the frame being recorded.
    pub fn defer<T: Send + 'static>(&self, object: T) {
        self.pending.lock().push(Box::new(object));
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap the pending list out, leaving it empty.
    pub(crate) fn take(&self) -> Vec<Retired> {
        std::mem::take(&mut *self.pending.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_take_moves_ownership() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let queue = ReleaseQueue::new();
        let handle = queue.clone();
        handle.defer(Counted(dropped.clone()));
        queue.defer(Counted(dropped.clone()));
        assert_eq!(queue.len(), 2);

        let taken = queue.take();
        assert!(queue.is_empty());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(taken);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }
}

//! Single-slot, latest-wins frame holder.
//!
//! The background acquirer publishes into the slot and the controller takes from
//! it. There is no queue: a publish replaces whatever is held, so a slow consumer
//! loses stale frames instead of falling behind.
//!
//! The lock is held only long enough to swap an `Arc`; frames are dropped and
//! unwrapped outside of it, so neither side can stall the other on pixel work.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::frame::Frame;

#[derive(Debug, Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    frame: Option<Arc<Frame>>,
    published: u64,
    overwritten: u64,
}

/// Counters describing slot traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Frames written by the producer.
    pub published: u64,
    /// Frames replaced before anyone took them.
    pub overwritten: u64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot contents with `frame`.
    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        let previous = {
            let mut state = self.lock();
            state.published += 1;
            let previous = state.frame.replace(frame);
            if previous.is_some() {
                state.overwritten += 1;
            }
            previous
        };
        drop(previous);
    }

    /// Most recent frame without consuming it. Repeated calls may return the same frame.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.lock().frame.clone()
    }

    /// Take ownership of the most recent frame, leaving the slot empty until the
    /// next publish.
    pub fn take(&self) -> Option<Frame> {
        let frame = self.lock().frame.take()?;
        Some(Arc::unwrap_or_clone(frame))
    }

    pub fn stats(&self) -> SlotStats {
        let state = self.lock();
        SlotStats {
            published: state.published,
            overwritten: state.overwritten,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // A panic while holding the lock cannot leave a half-written frame behind
        // (the swap is a single pointer move), so poisoned state is still valid.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! CurrentKeyframe: single-writer, many-reader handoff of the active
//! reference keyframe.

use std::sync::Arc;

use parking_lot::Mutex;

use super::frame::Frame;

/// Single-slot cell holding the active reference keyframe.
///
/// Non-empty after initialization. `set` replaces atomically: any `get`
/// after it returns sees the new value, while in-flight tracking that
/// already took the old `Arc` completes against the old keyframe.
#[derive(Default)]
pub struct CurrentKeyframe {
    slot: Mutex<Option<Arc<Frame>>>,
}

impl CurrentKeyframe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<Frame>> {
        self.slot.lock().clone()
    }

    pub fn set(&self, kf: Arc<Frame>) {
        *self.slot.lock() = Some(kf);
    }
}

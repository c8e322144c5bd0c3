//! TrackingReference: the cached import of a keyframe used as the fixed
//! side of SE(3)/Sim(3) estimation.

use std::sync::Arc;

use crate::map::{Frame, FrameId};

/// Cached tracking reference.
///
/// Importing snapshots the keyframe handle (the tracker reads its pyramid
/// and depth hypotheses through it); re-importing after a depth update or a
/// keyframe switch is what makes updated poses and depth visible to the
/// tracker.
#[derive(Default)]
pub struct TrackingReference {
    keyframe: Option<Arc<Frame>>,
}

impl TrackingReference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn import_frame(&mut self, keyframe: &Arc<Frame>) {
        self.keyframe = Some(Arc::clone(keyframe));
    }

    pub fn invalidate(&mut self) {
        self.keyframe = None;
    }

    pub fn is_valid(&self) -> bool {
        self.keyframe.is_some()
    }

    pub fn frame_id(&self) -> Option<FrameId> {
        self.keyframe.as_ref().map(|kf| kf.id())
    }

    pub fn keyframe(&self) -> Option<&Arc<Frame>> {
        self.keyframe.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::ImagePyramid;

    #[test]
    fn test_import_and_invalidate() {
        let kf = Frame::new(FrameId(4), 0.0, ImagePyramid::build(2, 2, vec![0.0; 4], 1));
        let mut reference = TrackingReference::new();
        assert!(!reference.is_valid());

        reference.import_frame(&kf);
        assert!(reference.is_valid());
        assert_eq!(reference.frame_id(), Some(FrameId(4)));

        reference.invalidate();
        assert!(!reference.is_valid());
        assert_eq!(reference.frame_id(), None);
    }
}

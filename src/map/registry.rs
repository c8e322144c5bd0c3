//! PoseRegistry: the ordered, append-only log of every tracked frame's pose.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SlamError;

use super::pose::FramePose;

/// Append-only registry of frame poses in tracking-completion order.
///
/// The last element is the most recently tracked pose and seeds the initial
/// guess for the next SE(3) tracking pass. Ids are strictly increasing; a
/// frame that failed tracking is simply absent.
#[derive(Default)]
pub struct PoseRegistry {
    poses: Mutex<Vec<Arc<FramePose>>>,
}

impl PoseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, pose: Arc<FramePose>) -> Result<(), SlamError> {
        let mut poses = self.poses.lock();
        if let Some(last) = poses.last() {
            if pose.frame_id() <= last.frame_id() {
                return Err(SlamError::OutOfOrderPose {
                    last: last.frame_id(),
                    got: pose.frame_id(),
                });
            }
        }
        poses.push(pose);
        Ok(())
    }

    pub fn last(&self) -> Option<Arc<FramePose>> {
        self.poses.lock().last().cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<FramePose>> {
        self.poses.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.poses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::FrameId;

    #[test]
    fn test_append_in_order() {
        let registry = PoseRegistry::new();
        registry.append(Arc::new(FramePose::new(FrameId(0)))).unwrap();
        registry.append(Arc::new(FramePose::new(FrameId(3)))).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.last().map(|p| p.frame_id()), Some(FrameId(3)));
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let registry = PoseRegistry::new();
        registry.append(Arc::new(FramePose::new(FrameId(5)))).unwrap();
        let err = registry.append(Arc::new(FramePose::new(FrameId(5))));
        assert!(matches!(
            err,
            Err(SlamError::OutOfOrderPose {
                last: FrameId(5),
                got: FrameId(5),
            })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = PoseRegistry::new();
        registry.append(Arc::new(FramePose::new(FrameId(1)))).unwrap();
        let snap = registry.snapshot();
        registry.append(Arc::new(FramePose::new(FrameId(2)))).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}

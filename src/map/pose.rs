//! FramePose: the mutable pose record owned by a frame.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::geometry::Sim3;

use super::frame::FrameId;

#[derive(Debug, Clone)]
struct PoseState {
    cam_to_world: Sim3,
    tracking_parent: Option<FrameId>,
}

/// Pose record of one frame: a camera-to-world similarity, the id of the
/// keyframe it was tracked against, and a registered-to-graph marker.
///
/// The value may be rewritten by Optimization after the frame was tracked;
/// single reads are consistent through the interior lock, multi-pose reads
/// take the system-wide pose-consistency lock on top.
#[derive(Debug)]
pub struct FramePose {
    frame_id: FrameId,
    state: RwLock<PoseState>,
    registered_to_graph: AtomicBool,
}

impl FramePose {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            state: RwLock::new(PoseState {
                cam_to_world: Sim3::identity(),
                tracking_parent: None,
            }),
            registered_to_graph: AtomicBool::new(false),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn cam_to_world(&self) -> Sim3 {
        self.state.read().cam_to_world.clone()
    }

    pub fn set_cam_to_world(&self, cam_to_world: Sim3) {
        self.state.write().cam_to_world = cam_to_world;
    }

    pub fn tracking_parent(&self) -> Option<FrameId> {
        self.state.read().tracking_parent
    }

    /// Record a tracking result: parent keyframe and the resulting pose,
    /// updated together.
    pub fn set_tracked(&self, parent: FrameId, cam_to_world: Sim3) {
        let mut state = self.state.write();
        state.tracking_parent = Some(parent);
        state.cam_to_world = cam_to_world;
    }

    pub fn is_registered_to_graph(&self) -> bool {
        self.registered_to_graph.load(Ordering::SeqCst)
    }

    pub fn set_registered_to_graph(&self) {
        self.registered_to_graph.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_new_pose_is_identity() {
        let pose = FramePose::new(FrameId(7));
        assert_eq!(pose.frame_id(), FrameId(7));
        assert_eq!(pose.cam_to_world(), Sim3::identity());
        assert_eq!(pose.tracking_parent(), None);
        assert!(!pose.is_registered_to_graph());
    }

    #[test]
    fn test_set_tracked_updates_both_fields() {
        let pose = FramePose::new(FrameId(9));
        let mut sim3 = Sim3::identity();
        sim3.translation = Vector3::new(1.0, 0.0, 0.0);
        pose.set_tracked(FrameId(2), sim3.clone());
        assert_eq!(pose.tracking_parent(), Some(FrameId(2)));
        assert_eq!(pose.cam_to_world(), sim3);
    }
}

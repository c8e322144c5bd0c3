//! Shared core of one system instance: the map structures, the
//! pose-consistency lock, lifecycle flags and the output sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SlamError;
use crate::geometry::{Sim3, Sim3f, SE3};
use crate::kernels::OutputSink;
use crate::map::{CurrentKeyframe, Frame, KeyFrameGraph, PoseRegistry};

use super::config::Settings;
use super::latch::Latch;

/// State shared by every worker of a system instance.
pub(crate) struct SystemCore {
    pub conf: Settings,

    pub graph: Arc<KeyFrameGraph>,
    pub all_frame_poses: PoseRegistry,
    pub current_keyframe: CurrentKeyframe,

    /// Serializes pose composition in tracking against pose write-back by
    /// optimization. Individual pose cells carry their own locks; this one
    /// makes multi-pose reads atomic. Shared holds must not span blocking
    /// I/O; the exclusive hold spans only the optimization write-back.
    pub pose_consistency: RwLock<()>,

    pub initialized: AtomicBool,
    pub shutdown: AtomicBool,

    pub output: Arc<dyn OutputSink>,

    pub full_reconstraint_done: Latch,
    pub final_optimization_done: Latch,
    pub optimization_merged: Latch,
    pub finalized: Latch,
}

impl SystemCore {
    pub fn new(conf: Settings, output: Arc<dyn OutputSink>) -> Self {
        Self {
            conf,
            graph: Arc::new(KeyFrameGraph::new()),
            all_frame_poses: PoseRegistry::new(),
            current_keyframe: CurrentKeyframe::new(),
            pose_consistency: RwLock::new(()),
            initialized: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            output,
            full_reconstraint_done: Latch::new(),
            final_optimization_done: Latch::new(),
            optimization_merged: Latch::new(),
            finalized: Latch::new(),
        }
    }

    /// Register a tracked frame's pose in the registry.
    pub fn store_pose(&self, frame: &Arc<Frame>) -> Result<(), SlamError> {
        frame.pose().set_registered_to_graph();
        self.all_frame_poses.append(Arc::clone(frame.pose()))
    }

    /// Pose of the most recently tracked frame.
    pub fn current_pose_estimate(&self) -> Option<SE3> {
        let _guard = self.pose_consistency.read();
        self.all_frame_poses.last().map(|p| p.cam_to_world().to_se3())
    }

    /// Pose of the most recently tracked frame with scale, as 32-bit floats.
    pub fn current_pose_estimate_scale(&self) -> Option<Sim3f> {
        let _guard = self.pose_consistency.read();
        self.all_frame_poses
            .last()
            .map(|p| Sim3f::from(&p.cam_to_world()))
    }

    /// Materialized poses of every tracked frame, read consistently against
    /// optimization write-back.
    pub fn all_poses(&self) -> Vec<Sim3> {
        let _guard = self.pose_consistency.read();
        self.all_frame_poses
            .snapshot()
            .iter()
            .map(|p| p.cam_to_world())
            .collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

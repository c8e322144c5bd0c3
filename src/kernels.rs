//! Contracts of the external numerical collaborators.
//!
//! The coordination core never touches pixels: SE(3)/Sim(3) trackers, the
//! depth-map estimator, the pose-graph solver and the optional appearance
//! index are injected as trait objects. A [`SlamKernels`] factory builds
//! fresh instances so `full_reset` can rebuild a whole system, and so each
//! relocalization worker gets its own tracker.

use std::sync::Arc;

use crate::geometry::{Matrix7, Sim3, Sim3f, SE3};
use crate::map::{Frame, FrameId, KeyFrameGraph};
use crate::tracking::TrackingReference;

/// Result of one SE(3) tracking pass of a frame against a reference.
#[derive(Debug, Clone)]
pub struct Se3TrackingResult {
    /// Estimated reference-to-frame transform.
    pub ref_to_frame: SE3,
    /// Final photometric residual.
    pub residual: f32,
    /// Fraction of reference points usable in the frame.
    pub point_usage: f32,
    pub good_count: f32,
    pub bad_count: f32,
    /// The estimate left the basin of convergence.
    pub diverged: bool,
    pub tracking_was_good: bool,
}

impl Se3TrackingResult {
    /// Good-pixel ratio good / (good + bad); 0 when nothing was compared.
    pub fn good_per_goodbad(&self) -> f32 {
        let total = self.good_count + self.bad_count;
        if total > 0.0 {
            self.good_count / total
        } else {
            0.0
        }
    }
}

/// Direct image alignment over SE(3).
///
/// `initial` is the estimated frame-to-reference transform; the result's
/// `ref_to_frame` is its refined inverse.
pub trait Se3Tracker: Send {
    fn track(
        &mut self,
        reference: &TrackingReference,
        frame: &Frame,
        initial: &SE3,
    ) -> Se3TrackingResult;
}

/// Result of one Sim(3) tracking pass, used for constraint verification.
#[derive(Debug, Clone)]
pub struct Sim3TrackingResult {
    /// Estimated reference-to-frame similarity.
    pub ref_to_frame: Sim3,
    pub residual: f32,
    /// Information matrix of the estimate over the Sim(3) tangent space.
    pub information: Matrix7,
    pub diverged: bool,
    pub tracking_was_good: bool,
}

/// Direct image alignment over Sim(3). Same estimate conventions as
/// [`Se3Tracker`].
pub trait Sim3Tracker: Send {
    fn track(
        &mut self,
        reference: &TrackingReference,
        frame: &Frame,
        initial: &Sim3,
    ) -> Sim3TrackingResult;
}

/// Semi-dense depth estimation over the current keyframe.
pub trait DepthMap: Send {
    /// Seed the first keyframe with random hypotheses.
    fn random_init(&mut self, frame: &Arc<Frame>);

    /// Seed the first keyframe from the inverse-depth field it carries.
    fn gt_depth_init(&mut self, frame: &Arc<Frame>);

    /// Promote `frame` to the new keyframe, propagating hypotheses from the
    /// previous one.
    fn create_keyframe(&mut self, frame: &Arc<Frame>);

    /// Re-activate a previously created keyframe as the active one.
    fn set_from_existing_kf(&mut self, keyframe: &Arc<Frame>);

    /// Refine the active keyframe from one tracked frame. Returns true when
    /// the hypothesis field changed.
    fn update_keyframe(&mut self, frame: &Arc<Frame>) -> bool;

    /// Debug visualization of the active depth map, if one is maintained.
    fn visualization(&self) -> Option<Vec<u8>> {
        None
    }
}

/// One vertex of the pose-graph problem.
#[derive(Debug, Clone)]
pub struct GraphVertex {
    pub id: FrameId,
    pub pose: Sim3,
}

/// One edge of the pose-graph problem.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub from: FrameId,
    pub to: FrameId,
    pub measurement: Sim3,
    pub information: Matrix7,
}

/// Nonlinear pose-graph solver. Returns the updated vertex poses.
pub trait PoseGraphSolver: Send {
    fn optimize(
        &mut self,
        vertices: &[GraphVertex],
        edges: &[GraphEdge],
        iterations: usize,
    ) -> Vec<GraphVertex>;
}

/// Optional appearance-based loop detection index.
pub trait AppearanceIndex: Send {
    fn add(&mut self, frame: &Arc<Frame>);
    fn query(&mut self, frame: &Arc<Frame>) -> Option<FrameId>;
}

/// Sink for the system's fire-and-forget publications.
pub trait OutputSink: Send + Sync {
    fn publish_tracked_frame(&self, _frame: &Arc<Frame>) {}
    fn publish_pose(&self, _pose: Sim3f) {}
    fn publish_keyframe(&self, _keyframe: &Arc<Frame>) {}
    fn publish_depth_image(&self, _data: &[u8]) {}
    fn publish_keyframe_graph(&self, _graph: &KeyFrameGraph) {}
}

/// Output sink that drops everything.
pub struct NullOutput;

impl OutputSink for NullOutput {}

/// Factory for the numerical collaborators of one system instance.
pub trait SlamKernels: Send + Sync {
    fn se3_tracker(&self) -> Box<dyn Se3Tracker>;
    fn sim3_tracker(&self) -> Box<dyn Sim3Tracker>;
    fn depth_map(&self) -> Box<dyn DepthMap>;
    fn pose_graph_solver(&self) -> Box<dyn PoseGraphSolver>;

    /// Appearance index, absent by default.
    fn appearance_index(&self) -> Option<Box<dyn AppearanceIndex>> {
        None
    }
}

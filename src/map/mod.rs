//! Shared map structures: frames, keyframe graph, pose registry.

pub mod current;
pub mod frame;
pub mod graph;
pub mod pose;
pub mod registry;

pub use current::CurrentKeyframe;
pub use frame::{DepthHypotheses, Frame, FrameId, ImagePyramid, PyramidLevel};
pub use graph::{Constraint, KeyFrameGraph};
pub use pose::FramePose;
pub use registry::PoseRegistry;

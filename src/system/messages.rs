//! Inter-thread message types.
//!
//! These are the typed events flowing between the tracking, mapping,
//! constraint-search and optimization workers.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::map::Frame;

/// Messages consumed by the mapping thread.
pub enum MappingMsg {
    /// Seed the depth map from the first frame. `done` acknowledges that
    /// depth initialization finished.
    Init {
        frame: Arc<Frame>,
        done: Sender<()>,
    },

    /// A successfully tracked frame to fold into the current keyframe's
    /// depth map. `mapped` carries the block-until-mapped acknowledgment
    /// when the submitter asked for one.
    TrackedFrame {
        frame: Arc<Frame>,
        mapped: Option<Sender<()>>,
    },

    /// Promote this tracked frame to the new keyframe: propagate depth,
    /// register it in the graph, hand it to constraint search.
    PromoteKeyframe { frame: Arc<Frame> },

    /// Re-activate a previously created keyframe as the depth reference.
    ReactivateKeyframe { keyframe: Arc<Frame> },

    /// Optimization wrote back updated poses; merge them into the current
    /// keyframe's frame of reference.
    MergeOptimization,
}

/// Messages consumed by the constraint-search thread.
pub enum ConstraintMsg {
    /// A new keyframe entered the graph; search for edges from it.
    NewKeyframe(Arc<Frame>),

    /// Revisit every keyframe to densify the edge set (finalization).
    FullReConstraintTrack,
}

/// Messages consumed by the optimization thread.
pub enum OptimizationMsg {
    /// A batch of new constraints was added; run an incremental pass.
    NewConstraints,

    /// Run the deep final pass (finalization).
    FinalOptimization,
}

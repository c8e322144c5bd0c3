//! Error kinds for the SLAM coordination core.
//!
//! Recoverable numerical failures (tracking loss, a discarded relocalization
//! attempt, a diverged solver pass) are absorbed inside the owning thread and
//! reported through state flags; only structural invariant violations are
//! surfaced to callers as errors.

use thiserror::Error;

use crate::map::FrameId;

/// Errors raised by the coordination core.
#[derive(Debug, Error)]
pub enum SlamError {
    /// `track_frame` was called before `initialize`.
    #[error("system is not initialized")]
    NotInitialized,

    /// Tracker divergence or sustained bad tracking. Recovered through the
    /// relocalizer; never surfaced to `track_frame` callers.
    #[error("tracking lost")]
    TrackingLost,

    /// A relocalization attempt produced a low-quality result and was
    /// discarded; the system stays in the tracking-bad state.
    #[error("relocalization failed")]
    RelocalizationFailed,

    /// A keyframe with this id is already registered in the graph.
    #[error("keyframe {0} is already in the graph")]
    DuplicateKeyframe(FrameId),

    /// An edge referenced a keyframe that is not in the graph.
    #[error("keyframe {0} is not in the graph")]
    UnknownKeyframe(FrameId),

    /// A pose was appended out of frame-id order.
    #[error("pose for frame {got} appended after frame {last}")]
    OutOfOrderPose { last: FrameId, got: FrameId },

    /// The pose-graph solver produced non-finite values.
    #[error("pose-graph solver diverged")]
    SolverDiverged,

    /// A submission arrived after shutdown was requested.
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

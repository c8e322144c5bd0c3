//! Concurrent coordination core of a monocular direct visual SLAM system.
//!
//! Given a calibrated stream of grayscale frames, the system estimates the
//! camera's pose per frame and maintains a keyframe graph with semi-dense
//! inverse-depth estimates, connected by verified Sim(3) constraints.
//!
//! The crate covers the coordination engine only: the tracking front end,
//! the mapping, constraint-search and optimization workers, the relocalizer
//! pool and the shared structures binding them. The pixel-level numerics
//! (SE(3)/Sim(3) trackers, depth estimation, the pose-graph solver) are
//! injected through the traits in [`kernels`].

pub mod constraints;
pub mod error;
pub mod geometry;
pub mod kernels;
pub mod map;
pub mod mapping;
pub mod optimization;
pub mod system;
pub mod tracking;

pub use error::SlamError;
pub use system::{CameraIntrinsics, ImageSize, Settings, SlamSystem};

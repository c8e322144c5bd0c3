//! System facade and thread orchestration.

pub mod config;
pub(crate) mod core;
pub mod latch;
pub(crate) mod messages;
pub mod slam_system;

pub use config::{CameraIntrinsics, ImageSize, Settings};
pub use latch::Latch;
pub use slam_system::SlamSystem;

//! Geometry utilities: SE(3) and Sim(3) transforms.

pub mod se3;
pub mod sim3;

pub use se3::SE3;
pub use sim3::{Sim3, Sim3f};

use nalgebra::{SMatrix, SVector};

/// 7-vector in the Sim(3) tangent space: [rotation (3), translation (3), log-scale (1)].
pub type Vector7 = SVector<f64, 7>;

/// 7x7 information matrix over the Sim(3) tangent space.
pub type Matrix7 = SMatrix<f64, 7, 7>;

//! System configuration.

use serde::{Deserialize, Serialize};

/// Resolution of the tracked pyramid base.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

impl ImageSize {
    pub fn area(&self) -> usize {
        self.width * self.height
    }
}

/// Pinhole intrinsics of the (undistorted) camera.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Horizontal field of view in radians.
    pub fn fov_x(&self, width: usize) -> f64 {
        2.0 * (width as f64 / (2.0 * self.fx)).atan()
    }

    /// Vertical field of view in radians.
    pub fn fov_y(&self, height: usize) -> f64 {
        2.0 * (height as f64 / (2.0 * self.fy)).atan()
    }
}

/// Configuration of one SLAM system instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Mapping must be enabled to initialize.
    pub do_mapping: bool,

    /// Enables constraint search, optimization and the id→keyframe registry.
    /// With this off the system runs as plain visual odometry.
    pub slam_enabled: bool,

    /// Re-use an existing keyframe on keyframe switch when one is close
    /// enough, instead of creating a new one.
    pub do_kf_reactivation: bool,

    /// Publish keyframes immediately on creation.
    pub continuous_pc_output: bool,

    /// Compute and publish the debug depth visualization.
    pub display_depth_map: bool,

    pub slam_image: ImageSize,
    pub camera: CameraIntrinsics,

    /// Number of pyramid levels built per frame.
    pub pyramid_levels: usize,

    /// Frames that must be mapped onto the current keyframe before a
    /// keyframe switch is considered.
    pub min_num_mapped: usize,

    /// Number of keyframes in the relaxed-threshold init phase.
    pub init_phase_count: usize,

    /// Relocalizer worker pool size.
    pub relocalize_threads: usize,

    /// Distance weight of the reference-frame score.
    pub kf_dist_weight: f32,

    /// Usage weight of the reference-frame score.
    pub kf_usage_weight: f32,

    /// Minimum good-per-goodbad pixel ratio considered healthy tracking.
    pub min_good_per_goodbad: f32,

    /// Residual gate for accepting a Sim(3) constraint, per direction.
    pub constraint_residual_gate: f32,

    /// Gate on the information-weighted reciprocal consistency error of a
    /// constraint candidate.
    pub constraint_consistency_gate: f64,

    /// Solver iterations per incremental optimization pass.
    pub optimization_iterations: usize,

    /// Solver iterations for the final pass at shutdown.
    pub final_optimization_iterations: usize,
}

impl Settings {
    /// Acceptance ratio for a relocalization attempt:
    /// 1 − 0.75·(1 − min_good_per_goodbad).
    pub fn relocalization_min_ratio(&self) -> f32 {
        1.0 - 0.75 * (1.0 - self.min_good_per_goodbad)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            do_mapping: true,
            slam_enabled: true,
            do_kf_reactivation: true,
            continuous_pc_output: false,
            display_depth_map: false,
            slam_image: ImageSize {
                width: 640,
                height: 480,
            },
            camera: CameraIntrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
            },
            pyramid_levels: 5,
            min_num_mapped: 5,
            init_phase_count: 5,
            relocalize_threads: 4,
            kf_dist_weight: 4.0,
            kf_usage_weight: 3.0,
            min_good_per_goodbad: 0.5,
            constraint_residual_gate: 1.5,
            constraint_consistency_gate: 1.0,
            optimization_iterations: 10,
            final_optimization_iterations: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relocalization_ratio() {
        let conf = Settings::default();
        assert!((conf.relocalization_min_ratio() - 0.625).abs() < 1e-6);
    }

    #[test]
    fn test_fov_from_intrinsics() {
        let conf = Settings::default();
        let fov = conf.camera.fov_x(conf.slam_image.width);
        // 640 px at fx = 500 is a bit over 65 degrees.
        assert!(fov > 1.0 && fov < 1.3);
    }
}

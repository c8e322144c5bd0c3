//! SE3: 6-DOF rigid-body transformation (rotation + translation).

use nalgebra::{UnitQuaternion, Vector3, Vector6};

/// Rigid-body transform. Transforms points as: p' = R * p + t.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation (no rotation, no translation).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a translation only.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Inverse transformation: T^{-1} = [R^T | -R^T*t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a single point: p' = R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Tangent-space coordinates [rotation_vec (3), translation (3)].
    ///
    /// Uses the rotation's scaled axis and the plain translation; adequate
    /// for thresholding pose discrepancies, which is all callers do with it.
    pub fn log(&self) -> Vector6<f64> {
        let rot_vec = self.rotation.scaled_axis();
        Vector6::new(
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_transform() {
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_eq!(SE3::identity().transform_point(&p), p);
    }

    #[test]
    fn test_inverse_round_trip() {
        let se3 = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.1, -0.2, 0.3)),
            Vector3::new(1.0, 2.0, 3.0),
        );
        let round = se3.compose(&se3.inverse());
        assert!(round.translation.norm() < 1e-12);
        assert!(round.rotation.angle() < 1e-12);
    }

    #[test]
    fn test_compose_rotation_then_translation() {
        let rot = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, FRAC_PI_2)),
            Vector3::zeros(),
        );
        let trans = SE3::from_translation(Vector3::new(1.0, 0.0, 0.0));
        let p = trans.compose(&rot).transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert!((p - Vector3::new(1.0, 1.0, 0.0)).norm() < 1e-12);
    }
}

//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Keyframe poses and constraint measurements are similarities; per-frame
//! tracking works in SE(3) and is lifted back with `from_se3`.

use nalgebra::{UnitQuaternion, Vector3};

use super::{Vector7, SE3};

/// 7-DOF similarity transformation.
///
/// Transforms points as: p' = s * R * p + t
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Identity transformation (no rotation, no translation, scale = 1).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from SE3 with scale = 1.0.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Convert to SE3, dropping the scale from the rotation/translation pair.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation,
        }
    }

    /// Inverse transformation.
    ///
    /// For Sim3: S = [sR | t; 0 | 1]
    /// Inverse: S^{-1} = [(1/s)R^T | -(1/s)R^T*t; 0 | 1]
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// Compose two Sim3 transforms: self ∘ other.
    ///
    /// For S1 = [s1*R1 | t1] and S2 = [s2*R2 | t2]:
    /// S1 ∘ S2 = [s1*s2*R1*R2 | s1*R1*t2 + t1]
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    /// Transform a single point: p' = s * R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Viewing direction of a camera with this cam-to-world pose: the
    /// rotated optical axis (camera z).
    pub fn viewing_direction(&self) -> Vector3<f64> {
        self.rotation * Vector3::z()
    }

    /// Log map: tangent coordinates [rotation_vec (3), translation (3), log_scale (1)].
    pub fn log(&self) -> Vector7 {
        let rot_vec = self.rotation.scaled_axis();
        Vector7::from_column_slice(&[
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ])
    }

    /// Exponential map: construct from a tangent vector.
    pub fn exp(tangent: &Vector7) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(
                tangent[0], tangent[1], tangent[2],
            )),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|v| v.is_finite())
            && self.rotation.coords.iter().all(|v| v.is_finite())
            && self.scale.is_finite()
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// Sim(3) as 32-bit floats, the wire form used for pose publications.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3f {
    /// Quaternion coefficients (w, x, y, z).
    pub rotation: [f32; 4],
    pub translation: [f32; 3],
    pub scale: f32,
}

impl From<&Sim3> for Sim3f {
    fn from(sim3: &Sim3) -> Self {
        let q = sim3.rotation.quaternion();
        Self {
            rotation: [q.w as f32, q.i as f32, q.j as f32, q.k as f32],
            translation: [
                sim3.translation.x as f32,
                sim3.translation.y as f32,
                sim3.translation.z as f32,
            ],
            scale: sim3.scale as f32,
        }
    }
}

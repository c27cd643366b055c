//! Rigid-body transform in SE(3).

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// A rotation + translation pair.
///
/// Keyframe poses are stored as world-to-camera transforms (`T_cw`): applying
/// the transform to a world point yields camera coordinates. The same type is
/// used for relative transforms such as the right-camera extrinsic.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_rotation_matrix(r: &Matrix3<f64>, t: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(*r),
        );
        Self {
            rotation,
            translation: t,
        }
    }

    /// Apply the transform to a point.
    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Inverse transform: (R, t)⁻¹ = (Rᵀ, -Rᵀ t).
    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition: `self ∘ other`, so that
    /// `T_ac = T_ab.compose(&T_bc)` maps c-frame points to the a-frame.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}

//! Preintegrated inertial motion between two keyframes.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use crate::geometry::skew;

use super::ImuBias;

/// Aggregated IMU measurements between two keyframes.
///
/// Stores the motion deltas together with the bias estimate they were
/// integrated at and the first-order bias Jacobians following Forster et al.
/// This allows cheap correction when the bias estimate changes without
/// re-integrating raw samples.
#[derive(Debug, Clone)]
pub struct Preintegrated {
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,

    /// Bias used during integration.
    pub bias: ImuBias,

    /// Jacobian ∂(ΔR)/∂(bg).
    pub j_r_bg: Matrix3<f64>,
    /// Jacobian ∂(Δv)/∂(bg).
    pub j_v_bg: Matrix3<f64>,
    /// Jacobian ∂(Δv)/∂(ba).
    pub j_v_ba: Matrix3<f64>,
    /// Jacobian ∂(Δp)/∂(bg).
    pub j_p_bg: Matrix3<f64>,
    /// Jacobian ∂(Δp)/∂(ba).
    pub j_p_ba: Matrix3<f64>,
}

impl Preintegrated {
    pub fn identity() -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            bias: ImuBias::zero(),
            j_r_bg: Matrix3::zeros(),
            j_v_bg: Matrix3::zeros(),
            j_v_ba: Matrix3::zeros(),
            j_p_bg: Matrix3::zeros(),
            j_p_ba: Matrix3::zeros(),
        }
    }

    /// Velocity delta corrected to a new bias estimate.
    ///
    /// First-order: Δv' = Δv + J_v_bg δbg + J_v_ba δba.
    pub fn updated_delta_velocity(&self, bias: &ImuBias) -> Vector3<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        let dba = bias.accel - self.bias.accel;
        self.delta_vel + self.j_v_bg * dbg + self.j_v_ba * dba
    }

    /// Rotation delta corrected to a new bias estimate.
    pub fn updated_delta_rotation(&self, bias: &ImuBias) -> UnitQuaternion<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        self.delta_rot * UnitQuaternion::from_scaled_axis(self.j_r_bg * dbg)
    }

    /// Position delta corrected to a new bias estimate.
    pub fn updated_delta_position(&self, bias: &ImuBias) -> Vector3<f64> {
        let dbg = bias.gyro - self.bias.gyro;
        let dba = bias.accel - self.bias.accel;
        self.delta_pos + self.j_p_bg * dbg + self.j_p_ba * dba
    }

    /// Prepend `prev` to this preintegration.
    ///
    /// Used when a redundant keyframe is culled: the motion accumulated up to
    /// the culled keyframe is folded into the preintegration of its
    /// successor, keeping the temporal chain consistent. The deltas compose
    /// on the manifold and the bias Jacobians compose to first order.
    pub fn merge_previous(&mut self, prev: &Preintegrated) {
        let r_a = prev.delta_rot.to_rotation_matrix().into_inner();
        let r_b_t = self
            .delta_rot
            .to_rotation_matrix()
            .into_inner()
            .transpose();

        // Jacobian composition (first order, right perturbation).
        let j_r_bg = r_b_t * prev.j_r_bg + self.j_r_bg;
        let j_v_bg =
            prev.j_v_bg + r_a * self.j_v_bg - r_a * skew(&self.delta_vel) * prev.j_r_bg;
        let j_v_ba = prev.j_v_ba + r_a * self.j_v_ba;
        let j_p_bg = prev.j_p_bg
            + prev.j_v_bg * self.dt
            + r_a * self.j_p_bg
            - r_a * skew(&self.delta_pos) * prev.j_r_bg;
        let j_p_ba = prev.j_p_ba + prev.j_v_ba * self.dt + r_a * self.j_p_ba;

        // Mean composition.
        let delta_pos = prev.delta_pos + prev.delta_vel * self.dt + r_a * self.delta_pos;
        let delta_vel = prev.delta_vel + r_a * self.delta_vel;
        let delta_rot = prev.delta_rot * self.delta_rot;

        self.delta_rot = delta_rot;
        self.delta_vel = delta_vel;
        self.delta_pos = delta_pos;
        self.dt += prev.dt;
        self.bias = prev.bias;
        self.j_r_bg = j_r_bg;
        self.j_v_bg = j_v_bg;
        self.j_v_ba = j_v_ba;
        self.j_p_bg = j_p_bg;
        self.j_p_ba = j_p_ba;
    }
}

//! The bundle adjustment contract the mapper calls out to.
//!
//! Solver internals live outside this crate; the mapper only fixes the
//! interface: what each call receives, what it writes back into the map, and
//! that every call cooperates with the abort flag.

use std::sync::atomic::AtomicBool;

use nalgebra::{SMatrix, UnitQuaternion};

use crate::imu::ImuBias;
use crate::map::{KeyFrameId, Map};

/// 9x9 information matrix over the inertial state [δθ, δv, δp].
pub type InertialInfo = SMatrix<f64, 9, 9>;

/// Counts reported by a local bundle adjustment run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaStats {
    pub fixed_keyframes: usize,
    pub optimized_keyframes: usize,
    pub map_points: usize,
    pub edges: usize,
}

/// State estimated by the inertial-only optimization.
#[derive(Debug, Clone)]
pub struct InertialParams {
    /// Rotation aligning the gravity-aligned frame to the world frame.
    pub rwg: UnitQuaternion<f64>,
    /// Map scale estimate.
    pub scale: f64,
    /// Common bias estimate over the initialization window.
    pub bias: ImuBias,
    /// Information prior over the inertial state.
    pub info: InertialInfo,
}

impl InertialParams {
    pub fn new(rwg: UnitQuaternion<f64>) -> Self {
        Self {
            rwg,
            scale: 1.0,
            bias: ImuBias::zero(),
            info: InertialInfo::zeros(),
        }
    }
}

/// Back-end solver consumed by the mapping thread.
///
/// Implementations must poll `abort` between outer iterations and return
/// early (with whatever partial state is consistent) when it is raised.
pub trait Optimizer: Send + Sync {
    /// Local visual BA around `current`: optimizes the covisibility
    /// neighborhood, fixing the older keyframes that observe its landmarks,
    /// and writes refined poses and landmark positions into the map.
    fn local_bundle_adjustment(
        &self,
        map: &mut Map,
        current: KeyFrameId,
        abort: &AtomicBool,
    ) -> BaStats;

    /// Local visual-inertial BA over the recent temporal window, including
    /// IMU residuals between consecutive keyframes. `large` widens the
    /// window when the tracker is rich in inliers; `first_stage` marks the
    /// runs before the second inertial refinement settled.
    fn local_inertial_ba(
        &self,
        map: &mut Map,
        current: KeyFrameId,
        abort: &AtomicBool,
        large: bool,
        first_stage: bool,
    ) -> BaStats;

    /// Inertial-only optimization over all keyframes: estimates gravity
    /// direction, scale and a common bias under the given priors, updating
    /// `params` in place. Keyframe velocities are refined unless
    /// `fix_velocities` is set. Returns false when the problem is too weak
    /// to solve.
    fn inertial_optimization(
        &self,
        map: &mut Map,
        params: &mut InertialParams,
        monocular: bool,
        prior_g: f64,
        prior_a: f64,
        fix_velocities: bool,
    ) -> bool;

    /// Full inertial BA over the whole map. Results are not committed to
    /// the live poses: the solver writes per-entity scratch state
    /// (`tcw_gba`, `vwb_gba`, `bias_gba`, `pos_gba`) stamped with
    /// `ba_global_for_kf = gba_kf`, and the mapper propagates it through the
    /// spanning tree afterwards.
    fn full_inertial_ba(
        &self,
        map: &mut Map,
        iterations: usize,
        gba_kf: KeyFrameId,
        priors: Option<(f64, f64)>,
        abort: &AtomicBool,
    );
}

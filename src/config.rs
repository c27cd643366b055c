//! Runtime configuration for the local mapping thread.

use anyhow::{bail, Result};

/// Sensor configuration the mapper was launched with.
///
/// Mirrors the options the front end is built from: a monocular or stereo
/// rig, optionally fused with an IMU.
#[derive(Debug, Clone)]
pub struct MappingConfig {
    /// Single camera (no stereo depth on incoming keyframes).
    pub monocular: bool,

    /// IMU measurements are available and keyframes carry preintegrations.
    pub inertial: bool,

    /// Reject triangulated landmarks beyond `far_points_threshold`.
    pub far_points: bool,

    /// Distance cutoff in meters, only meaningful when `far_points` is set.
    pub far_points_threshold: f64,

    /// Sequence name, used only for log context.
    pub seq_name: String,
}

impl MappingConfig {
    /// Visual-only monocular setup.
    pub fn monocular() -> Self {
        Self {
            monocular: true,
            inertial: false,
            far_points: false,
            far_points_threshold: 0.0,
            seq_name: String::new(),
        }
    }

    /// Visual-only stereo / RGB-D setup.
    pub fn stereo() -> Self {
        Self {
            monocular: false,
            ..Self::monocular()
        }
    }

    /// Enable inertial processing.
    pub fn with_imu(mut self) -> Self {
        self.inertial = true;
        self
    }

    /// Enable the far-point cutoff for triangulated landmarks.
    pub fn with_far_points(mut self, threshold: f64) -> Self {
        self.far_points = true;
        self.far_points_threshold = threshold;
        self
    }

    /// Validate the configuration before the mapping thread is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.far_points && self.far_points_threshold <= 0.0 {
            bail!(
                "far-point filtering enabled with non-positive threshold {}",
                self.far_points_threshold
            );
        }
        Ok(())
    }

    /// Distance beyond which triangulated points are discarded.
    ///
    /// Infinite when far-point filtering is disabled.
    pub fn far_point_cutoff(&self) -> f64 {
        if self.far_points {
            self.far_points_threshold
        } else {
            f64::INFINITY
        }
    }
}

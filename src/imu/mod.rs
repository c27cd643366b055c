//! IMU types consumed by the mapper.
//!
//! The sample-rate integration happens in the front end; the mapper receives
//! finished preintegrations between consecutive keyframes and only composes,
//! bias-corrects, and re-anchors them.

pub mod preintegration;

use nalgebra::Vector3;

pub use preintegration::Preintegrated;

/// Gravity vector in the world frame (m/s²).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// Gyroscope and accelerometer bias estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }

    pub fn new(gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self { gyro, accel }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

//! Camera models.
//!
//! The mapper never touches raw images; it only needs to move between pixel
//! coordinates and bearing rays. Both supported models expose the same
//! capability pair (`project`, `unproject`) behind a tagged enum so the
//! triangulator can stay agnostic of the lens.

use nalgebra::{Vector2, Vector3};

/// Classic pinhole intrinsics.
#[derive(Debug, Clone, Copy)]
pub struct Pinhole {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Kannala-Brandt equidistant fisheye model (4 distortion coefficients).
#[derive(Debug, Clone, Copy)]
pub struct Fisheye {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k: [f64; 4],
}

/// A calibrated camera.
#[derive(Debug, Clone, Copy)]
pub enum CameraModel {
    Pinhole(Pinhole),
    Fisheye(Fisheye),
}

impl CameraModel {
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self::Pinhole(Pinhole { fx, fy, cx, cy })
    }

    pub fn fisheye(fx: f64, fy: f64, cx: f64, cy: f64, k: [f64; 4]) -> Self {
        Self::Fisheye(Fisheye { fx, fy, cx, cy, k })
    }

    pub fn fx(&self) -> f64 {
        match self {
            Self::Pinhole(p) => p.fx,
            Self::Fisheye(f) => f.fx,
        }
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// The caller is responsible for checking the point is in front of the
    /// camera; projection of a point with `z <= 0` is meaningless.
    pub fn project(&self, p: &Vector3<f64>) -> Vector2<f64> {
        match self {
            Self::Pinhole(c) => Vector2::new(
                c.fx * p.x / p.z + c.cx,
                c.fy * p.y / p.z + c.cy,
            ),
            Self::Fisheye(c) => {
                let r = (p.x * p.x + p.y * p.y).sqrt();
                if r < 1e-12 {
                    return Vector2::new(c.cx, c.cy);
                }
                let theta = r.atan2(p.z);
                let theta2 = theta * theta;
                let d = theta
                    * (1.0
                        + theta2 * (c.k[0] + theta2 * (c.k[1] + theta2 * (c.k[2] + theta2 * c.k[3]))));
                Vector2::new(c.fx * d * p.x / r + c.cx, c.fy * d * p.y / r + c.cy)
            }
        }
    }

    /// Back-project a pixel to a bearing ray with unit depth.
    pub fn unproject(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        match self {
            Self::Pinhole(c) => Vector3::new(
                (uv.x - c.cx) / c.fx,
                (uv.y - c.cy) / c.fy,
                1.0,
            ),
            Self::Fisheye(c) => {
                let mx = (uv.x - c.cx) / c.fx;
                let my = (uv.y - c.cy) / c.fy;
                let d = (mx * mx + my * my).sqrt();
                if d < 1e-12 {
                    return Vector3::new(0.0, 0.0, 1.0);
                }
                // Invert theta*(1 + k1 θ² + k2 θ⁴ + k3 θ⁶ + k4 θ⁸) = d by Newton.
                let mut theta = d;
                for _ in 0..10 {
                    let theta2 = theta * theta;
                    let f = theta
                        * (1.0
                            + theta2
                                * (c.k[0] + theta2 * (c.k[1] + theta2 * (c.k[2] + theta2 * c.k[3]))))
                        - d;
                    let df = 1.0
                        + theta2
                            * (3.0 * c.k[0]
                                + theta2
                                    * (5.0 * c.k[1] + theta2 * (7.0 * c.k[2] + theta2 * 9.0 * c.k[3])));
                    let step = f / df;
                    theta -= step;
                    if step.abs() < 1e-12 {
                        break;
                    }
                }
                let scale = theta.tan() / d;
                Vector3::new(mx * scale, my * scale, 1.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pinhole_roundtrip() {
        let cam = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0);
        let p = Vector3::new(0.3, -0.2, 4.0);
        let uv = cam.project(&p);
        let ray = cam.unproject(&uv);
        // The ray points at the same direction as p.
        assert_relative_eq!(ray.x * p.z, p.x, epsilon = 1e-9);
        assert_relative_eq!(ray.y * p.z, p.y, epsilon = 1e-9);
    }

    #[test]
    fn test_pinhole_principal_point() {
        let cam = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0);
        let uv = cam.project(&Vector3::new(0.0, 0.0, 10.0));
        assert_relative_eq!(uv.x, 320.0);
        assert_relative_eq!(uv.y, 240.0);
    }

    #[test]
    fn test_fisheye_roundtrip() {
        let cam = CameraModel::fisheye(280.0, 280.0, 376.0, 240.0, [-0.01, 0.02, -0.002, 0.0003]);
        let p = Vector3::new(0.8, 0.4, 1.5);
        let uv = cam.project(&p);
        let ray = cam.unproject(&uv);
        let dir = p / p.norm();
        let ray_dir = ray / ray.norm();
        assert_relative_eq!(ray_dir.x, dir.x, epsilon = 1e-6);
        assert_relative_eq!(ray_dir.y, dir.y, epsilon = 1e-6);
        assert_relative_eq!(ray_dir.z, dir.z, epsilon = 1e-6);
    }
}

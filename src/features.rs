//! Feature primitives shared by keyframes and the matcher.
//!
//! Feature extraction itself happens in the front end; the mapper only
//! consumes undistorted keypoints, their binary descriptors and the ORB
//! scale pyramid parameters they were detected with.

use std::sync::Arc;

use nalgebra::Vector2;

/// Descriptor distances below this are considered a confident match.
pub const TH_LOW: u32 = 50;

/// An undistorted keypoint.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    /// Pixel position in the undistorted image.
    pub pt: Vector2<f64>,
    /// Pyramid level the feature was detected at.
    pub octave: i32,
}

impl KeyPoint {
    pub fn new(u: f64, v: f64, octave: i32) -> Self {
        Self {
            pt: Vector2::new(u, v),
            octave,
        }
    }
}

/// A 256-bit binary feature descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    pub fn zeros() -> Self {
        Self([0u8; 32])
    }

    /// Hamming distance to another descriptor.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Scale pyramid parameters of the feature extractor.
///
/// Shared by every keyframe of a session; lookups are by pyramid level.
#[derive(Debug)]
pub struct ScalePyramid {
    pub n_levels: u32,
    pub scale_factor: f64,
    /// Scale of each level: `scale_factor^level`.
    pub scale_factors: Vec<f64>,
    /// Squared pixel sigma of each level.
    pub level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(n_levels: u32, scale_factor: f64) -> Arc<Self> {
        let scale_factors: Vec<f64> = (0..n_levels)
            .map(|l| scale_factor.powi(l as i32))
            .collect();
        let level_sigma2 = scale_factors.iter().map(|s| s * s).collect();
        Arc::new(Self {
            n_levels,
            scale_factor,
            scale_factors,
            level_sigma2,
        })
    }

    /// Standard ORB pyramid: 8 levels, factor 1.2.
    pub fn standard() -> Arc<Self> {
        Self::new(8, 1.2)
    }

    pub fn scale(&self, level: i32) -> f64 {
        let level = level.clamp(0, self.n_levels as i32 - 1) as usize;
        self.scale_factors[level]
    }

    pub fn sigma2(&self, level: i32) -> f64 {
        let level = level.clamp(0, self.n_levels as i32 - 1) as usize;
        self.level_sigma2[level]
    }

    /// Ratio between the coarsest and finest level scales.
    pub fn scale_range(&self) -> f64 {
        self.scale_factors[self.n_levels as usize - 1]
    }

    /// Predict the pyramid level a landmark at `dist` would be detected at,
    /// given the maximum distance of its scale-invariance band.
    pub fn predict_level(&self, max_distance: f64, dist: f64) -> i32 {
        if dist <= 0.0 {
            return 0;
        }
        let ratio = max_distance / dist;
        let level = (ratio.ln() / self.scale_factor.ln()).ceil() as i32;
        level.clamp(0, self.n_levels as i32 - 1)
    }
}

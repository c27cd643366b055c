//! Payload handed from the tracking thread to the mapper for each keyframe.

use std::sync::Arc;

use nalgebra::Vector3;

use crate::camera::CameraModel;
use crate::features::{Descriptor, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::imu::{ImuBias, Preintegrated};
use crate::map::MapPointId;

/// Everything the mapper needs to turn a tracked frame into a keyframe.
///
/// Feature slots are ordered left-camera first, then right-camera; the
/// parallel vectors (`descriptors`, `matched_map_points`) span all slots
/// while `u_right`/`depth` cover left features only.
pub struct KeyFrameData {
    /// Timestamp in seconds.
    pub timestamp: f64,

    /// World-to-camera pose estimate from tracking.
    pub pose: SE3,

    /// Body velocity estimate (world frame).
    pub velocity: Vector3<f64>,
    pub imu_bias: ImuBias,
    /// Preintegrated IMU motion since the previous keyframe.
    pub imu_preintegrated: Option<Preintegrated>,

    pub keypoints: Vec<KeyPoint>,
    pub keypoints_right: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,

    /// Right-image column per left feature; negative when unavailable.
    pub u_right: Vec<f64>,
    /// Stereo depth per left feature; negative when unavailable.
    pub depth: Vec<f64>,

    /// Landmarks the tracker matched, one entry per feature slot.
    pub matched_map_points: Vec<Option<MapPointId>>,

    pub camera: Arc<CameraModel>,
    pub camera2: Option<Arc<CameraModel>>,
    /// Right-from-left extrinsic of a two-camera rig.
    pub t_rl: Option<SE3>,

    pub stereo_baseline: f64,
    /// Baseline times focal length.
    pub bf: f64,
    /// Depth bound below which stereo points count as close.
    pub th_depth: f64,

    pub pyramid: Arc<ScalePyramid>,
}

impl KeyFrameData {
    pub fn new(
        timestamp: f64,
        pose: SE3,
        camera: Arc<CameraModel>,
        pyramid: Arc<ScalePyramid>,
    ) -> Self {
        Self {
            timestamp,
            pose,
            velocity: Vector3::zeros(),
            imu_bias: ImuBias::zero(),
            imu_preintegrated: None,
            keypoints: Vec::new(),
            keypoints_right: Vec::new(),
            descriptors: Vec::new(),
            u_right: Vec::new(),
            depth: Vec::new(),
            matched_map_points: Vec::new(),
            camera,
            camera2: None,
            t_rl: None,
            stereo_baseline: 0.0,
            bf: 0.0,
            th_depth: f64::INFINITY,
            pyramid,
        }
    }

    /// Append a left-camera feature. Must be called before any right-camera
    /// feature to keep the slot ordering.
    pub fn push_feature(&mut self, kp: KeyPoint, desc: Descriptor, u_right: f64, depth: f64) {
        debug_assert!(self.keypoints_right.is_empty());
        self.keypoints.push(kp);
        self.descriptors.push(desc);
        self.u_right.push(u_right);
        self.depth.push(depth);
        self.matched_map_points.push(None);
    }

    /// Append a right-camera feature of a two-camera rig.
    pub fn push_right_feature(&mut self, kp: KeyPoint, desc: Descriptor) {
        self.keypoints_right.push(kp);
        self.descriptors.push(desc);
        self.matched_map_points.push(None);
    }

    pub fn num_slots(&self) -> usize {
        self.keypoints.len() + self.keypoints_right.len()
    }
}

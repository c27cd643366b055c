//! KeyFrame: a camera observation promoted to a vertex of the map graph.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;

use crate::camera::CameraModel;
use crate::features::{Descriptor, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::imu::{ImuBias, Preintegrated};
use crate::system::messages::KeyFrameData;

use super::types::{KeyFrameId, MapPointId};

/// A keyframe of the map.
///
/// Feature slots are indexed `0..num_slots()`: indices below `n_left()`
/// address left-camera keypoints, the rest address right-camera keypoints of
/// a stereo rig. Per-slot state (descriptor, landmark association) uses the
/// same indexing on both sides.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    /// Timestamp in seconds.
    pub timestamp: f64,

    /// World-to-camera transform of the left camera.
    tcw: SE3,

    /// Body velocity in the world frame, valid once the IMU is initialized.
    pub velocity: Vector3<f64>,
    pub imu_bias: ImuBias,
    /// Preintegrated IMU motion from `prev_kf` to this keyframe.
    pub imu_preintegrated: Option<Preintegrated>,
    /// Set once this keyframe has taken part in an inertial optimization.
    pub imu_ready: bool,

    // Features.
    keys: Vec<KeyPoint>,
    keys_right: Vec<KeyPoint>,
    descriptors: Vec<Descriptor>,
    /// Right-image column of each left feature, negative when unavailable.
    pub u_right: Vec<f64>,
    /// Stereo depth of each left feature, negative when unavailable.
    pub depth: Vec<f64>,
    pub pyramid: Arc<ScalePyramid>,

    // Rig.
    pub camera: Arc<CameraModel>,
    pub camera2: Option<Arc<CameraModel>>,
    /// Right-from-left extrinsic of the rig.
    pub t_rl: Option<SE3>,
    pub stereo_baseline: f64,
    /// Baseline times focal length.
    pub bf: f64,
    /// Depth below which a stereo point counts as close.
    pub th_depth: f64,

    /// Landmark associated with each feature slot.
    map_point_ids: Vec<Option<MapPointId>>,

    // Temporal chain (inertial operation).
    pub prev_kf: Option<KeyFrameId>,
    pub next_kf: Option<KeyFrameId>,

    // Covisibility graph.
    covisibility_weights: HashMap<KeyFrameId, usize>,
    /// Weight-descending view of `covisibility_weights`, rebuilt eagerly.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    first_connection: bool,

    // Spanning tree.
    pub parent_id: Option<KeyFrameId>,
    pub children_ids: HashSet<KeyFrameId>,

    // Status.
    pub is_bad: bool,
    /// Fusion dedup mark: last keyframe this one was a fuse target for.
    pub fuse_target_for_kf: Option<KeyFrameId>,
    /// Generation mark of the last global BA that touched this keyframe.
    pub ba_global_for_kf: Option<KeyFrameId>,

    // Scratch state written by a global inertial BA and committed during
    // spanning-tree propagation.
    pub tcw_gba: Option<SE3>,
    pub tcw_bef_gba: Option<SE3>,
    pub vwb_gba: Option<Vector3<f64>>,
    pub bias_gba: Option<ImuBias>,
}

impl KeyFrame {
    pub(crate) fn from_data(id: KeyFrameId, data: KeyFrameData) -> Self {
        let n_slots = data.keypoints.len() + data.keypoints_right.len();
        debug_assert_eq!(data.descriptors.len(), n_slots);

        Self {
            id,
            timestamp: data.timestamp,
            tcw: data.pose,
            velocity: data.velocity,
            imu_bias: data.imu_bias,
            imu_preintegrated: data.imu_preintegrated,
            imu_ready: false,
            u_right: data.u_right,
            depth: data.depth,
            keys: data.keypoints,
            keys_right: data.keypoints_right,
            descriptors: data.descriptors,
            pyramid: data.pyramid,
            camera: data.camera,
            camera2: data.camera2,
            t_rl: data.t_rl,
            stereo_baseline: data.stereo_baseline,
            bf: data.bf,
            th_depth: data.th_depth,
            map_point_ids: vec![None; n_slots],
            prev_kf: None,
            next_kf: None,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            first_connection: true,
            parent_id: None,
            children_ids: HashSet::new(),
            is_bad: false,
            fuse_target_for_kf: None,
            ba_global_for_kf: None,
            tcw_gba: None,
            tcw_bef_gba: None,
            vwb_gba: None,
            bias_gba: None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pose
    // ─────────────────────────────────────────────────────────────────────

    /// World-to-camera transform.
    pub fn pose(&self) -> SE3 {
        self.tcw.clone()
    }

    pub fn set_pose(&mut self, tcw: SE3) {
        self.tcw = tcw;
    }

    /// Camera-to-world transform.
    pub fn pose_inverse(&self) -> SE3 {
        self.tcw.inverse()
    }

    /// Left camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.tcw.inverse().translation
    }

    /// Body position used by the inertial bookkeeping.
    ///
    /// The body-from-camera extrinsic lives in the front end; within the
    /// mapper the camera center stands in for the body position.
    pub fn imu_position(&self) -> Vector3<f64> {
        self.camera_center()
    }

    /// World-to-camera transform of the right camera, when the rig has one.
    pub fn right_pose(&self) -> Option<SE3> {
        self.t_rl.as_ref().map(|t_rl| t_rl.compose(&self.tcw))
    }

    pub fn right_camera_center(&self) -> Option<Vector3<f64>> {
        self.right_pose().map(|trw| trw.inverse().translation)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Features
    // ─────────────────────────────────────────────────────────────────────

    pub fn n_left(&self) -> usize {
        self.keys.len()
    }

    pub fn num_slots(&self) -> usize {
        self.keys.len() + self.keys_right.len()
    }

    pub fn has_right_camera(&self) -> bool {
        self.camera2.is_some()
    }

    pub fn is_right_slot(&self, slot: usize) -> bool {
        slot >= self.keys.len()
    }

    pub fn keypoint(&self, slot: usize) -> &KeyPoint {
        if slot < self.keys.len() {
            &self.keys[slot]
        } else {
            &self.keys_right[slot - self.keys.len()]
        }
    }

    pub fn descriptor(&self, slot: usize) -> &Descriptor {
        &self.descriptors[slot]
    }

    pub fn octave(&self, slot: usize) -> i32 {
        self.keypoint(slot).octave
    }

    pub fn sigma2(&self, slot: usize) -> f64 {
        self.pyramid.sigma2(self.octave(slot))
    }

    /// Camera observing the given slot.
    pub fn camera_for_slot(&self, slot: usize) -> &CameraModel {
        if self.is_right_slot(slot) {
            self.camera2.as_deref().unwrap_or(&self.camera)
        } else {
            &self.camera
        }
    }

    /// Pose of the camera observing the given slot.
    pub fn pose_for_slot(&self, slot: usize) -> SE3 {
        if self.is_right_slot(slot) {
            self.right_pose().unwrap_or_else(|| self.pose())
        } else {
            self.pose()
        }
    }

    /// Center of the camera observing the given slot.
    pub fn center_for_slot(&self, slot: usize) -> Vector3<f64> {
        if self.is_right_slot(slot) {
            self.right_camera_center()
                .unwrap_or_else(|| self.camera_center())
        } else {
            self.camera_center()
        }
    }

    /// A left slot has a stereo measurement when its disparity or depth is
    /// valid and the rig is not a two-camera one.
    pub fn has_stereo(&self, slot: usize) -> bool {
        slot < self.keys.len()
            && self.camera2.is_none()
            && (self.u_right.get(slot).is_some_and(|u| *u >= 0.0)
                || self.depth.get(slot).is_some_and(|d| *d > 0.0))
    }

    pub fn stereo_depth(&self, slot: usize) -> Option<f64> {
        self.depth.get(slot).copied().filter(|d| *d > 0.0)
    }

    /// Back-project a left feature through its stereo depth to a world point.
    pub fn unproject_stereo(&self, slot: usize) -> Option<Vector3<f64>> {
        let z = self.stereo_depth(slot)?;
        let ray = self.camera.unproject(&self.keys[slot].pt);
        Some(self.pose_inverse().transform(&(ray * z)))
    }

    /// Indices of features within `radius` pixels of `(u, v)`.
    ///
    /// Searches the requested rig side; returned indices are feature slots
    /// (right-side hits are offset by `n_left`). Level bounds are inclusive.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        right: bool,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        let (keys, offset) = if right {
            (&self.keys_right, self.keys.len())
        } else {
            (&self.keys, 0)
        };

        let radius_sq = radius * radius;
        let mut slots = Vec::new();
        for (i, kp) in keys.iter().enumerate() {
            if min_level.is_some_and(|l| kp.octave < l) {
                continue;
            }
            if max_level.is_some_and(|l| kp.octave > l) {
                continue;
            }
            let du = kp.pt.x - u;
            let dv = kp.pt.y - v;
            if du * du + dv * dv <= radius_sq {
                slots.push(offset + i);
            }
        }
        slots
    }

    // ─────────────────────────────────────────────────────────────────────
    // Landmark associations
    // ─────────────────────────────────────────────────────────────────────

    pub fn map_point(&self, slot: usize) -> Option<MapPointId> {
        self.map_point_ids.get(slot).copied().flatten()
    }

    pub fn set_map_point(&mut self, slot: usize, mp_id: MapPointId) -> Option<MapPointId> {
        if slot >= self.map_point_ids.len() {
            return None;
        }
        self.map_point_ids[slot].replace(mp_id)
    }

    pub fn erase_map_point_at(&mut self, slot: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(slot).and_then(|s| s.take())
    }

    /// All (slot, landmark) associations.
    pub fn map_point_slots(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(i, mp)| mp.map(|id| (i, id)))
    }

    pub fn num_tracked_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility graph
    // ─────────────────────────────────────────────────────────────────────

    pub fn add_connection(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.rebuild_ordered();
    }

    pub fn erase_connection(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.rebuild_ordered();
        }
    }

    /// Replace the whole neighbor set at once.
    pub fn set_connections(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
        self.rebuild_ordered();
    }

    pub fn connection_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn connections(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// The `n` covisible keyframes sharing the most landmarks, best first.
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// All covisible keyframes ordered by weight.
    pub fn covisibles_ordered(&self) -> Vec<KeyFrameId> {
        self.ordered_covisibles.iter().map(|(id, _)| *id).collect()
    }

    /// Re-sort the ordered view from the current weights.
    pub fn update_best_covisibles(&mut self) {
        self.rebuild_ordered();
    }

    fn rebuild_ordered(&mut self) {
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Tie-break by id so traversal order is deterministic.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }

    pub(crate) fn take_first_connection(&mut self) -> bool {
        std::mem::take(&mut self.first_connection)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Spanning tree
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("n_features", &self.num_slots())
            .field("n_tracked", &self.num_tracked_points())
            .field("n_covisibles", &self.covisibility_weights.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::messages::KeyFrameData;
    use nalgebra::UnitQuaternion;

    fn test_keyframe(id: u64, n_features: usize) -> KeyFrame {
        let camera = Arc::new(CameraModel::pinhole(500.0, 500.0, 320.0, 240.0));
        let mut data = KeyFrameData::new(id as f64 * 0.5, SE3::identity(), camera, ScalePyramid::standard());
        for i in 0..n_features {
            data.push_feature(KeyPoint::new(10.0 * i as f64, 10.0, 0), Descriptor::zeros(), -1.0, -1.0);
        }
        KeyFrame::from_data(KeyFrameId(id), data)
    }

    #[test]
    fn test_slot_association() {
        let mut kf = test_keyframe(1, 10);

        assert_eq!(kf.set_map_point(3, MapPointId(100)), None);
        assert_eq!(kf.map_point(3), Some(MapPointId(100)));
        assert_eq!(kf.map_point(4), None);
        assert_eq!(kf.num_tracked_points(), 1);

        let prev = kf.set_map_point(3, MapPointId(200));
        assert_eq!(prev, Some(MapPointId(100)));

        assert_eq!(kf.erase_map_point_at(3), Some(MapPointId(200)));
        assert_eq!(kf.map_point(3), None);
    }

    #[test]
    fn test_best_covisibles_ordering() {
        let mut kf = test_keyframe(1, 0);
        kf.add_connection(KeyFrameId(2), 50);
        kf.add_connection(KeyFrameId(3), 100);
        kf.add_connection(KeyFrameId(4), 25);

        let best = kf.best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId(3), KeyFrameId(2)]);

        kf.erase_connection(KeyFrameId(3));
        assert_eq!(kf.best_covisibles(2), vec![KeyFrameId(2), KeyFrameId(4)]);
    }

    #[test]
    fn test_no_self_connection() {
        let mut kf = test_keyframe(1, 0);
        kf.add_connection(KeyFrameId(1), 100);
        assert_eq!(kf.connection_weight(KeyFrameId(1)), 0);
    }

    #[test]
    fn test_features_in_area() {
        let kf = test_keyframe(1, 10);
        // Features are at x = 0, 10, 20, ..., y = 10.
        let hits = kf.features_in_area(20.0, 10.0, 10.5, false, None, None);
        assert_eq!(hits, vec![1, 2, 3]);
        let none = kf.features_in_area(500.0, 500.0, 5.0, false, None, None);
        assert!(none.is_empty());
    }

    #[test]
    fn test_camera_center() {
        let camera = Arc::new(CameraModel::pinhole(500.0, 500.0, 320.0, 240.0));
        let tcw = SE3::new(UnitQuaternion::identity(), Vector3::new(-1.0, 0.0, 0.0));
        let data = KeyFrameData::new(0.0, tcw, camera, ScalePyramid::standard());
        let kf = KeyFrame::from_data(KeyFrameId(0), data);
        // T_cw maps world (1,0,0) to the origin, so the center is (1,0,0).
        assert!((kf.camera_center() - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
    }
}

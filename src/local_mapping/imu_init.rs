//! Inertial bootstrap: gravity/scale estimation, staged refinement, and the
//! propagation of globally optimized state through the spanning tree.

use std::collections::VecDeque;

use nalgebra::{UnitQuaternion, Vector3};
use tracing::{debug, info, warn};

use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::optimizer::InertialParams;

use super::local_mapper::LocalMapper;

/// Keyframes required before an initialization attempt.
const MIN_KEYFRAMES: usize = 10;

/// Minimum observed time span in seconds.
const MIN_TIME_MONO: f64 = 2.0;
const MIN_TIME_STEREO: f64 = 1.0;

/// Scale estimates below this are useless; the attempt is abandoned.
const MIN_INERTIAL_SCALE: f64 = 0.1;

/// Monocular scale corrections smaller than this are noise, not signal.
const SCALE_REFINE_TOLERANCE: f64 = 0.002;

impl LocalMapper {
    /// One inertial initialization / refinement pass.
    ///
    /// The first successful call estimates gravity direction and per-keyframe
    /// velocities, aligns the map with gravity and marks it IMU-initialized;
    /// later calls (the staged refinements) re-run the inertial optimization
    /// with tighter priors. With `run_fiba` a full inertial BA follows,
    /// propagated through the spanning tree.
    pub(super) fn initialize_imu(&mut self, prior_g: f64, prior_a: f64, run_fiba: bool) {
        if self.state.reset_pending() {
            return;
        }
        let min_time = if self.config.monocular {
            MIN_TIME_MONO
        } else {
            MIN_TIME_STEREO
        };

        let Some(mut current) = self.current_kf else {
            return;
        };
        {
            let atlas = self.atlas.read();
            let map = atlas.active_map();
            if map.num_keyframes() < MIN_KEYFRAMES {
                return;
            }
            let chain = map.temporal_chain(current);
            if chain.len() < MIN_KEYFRAMES {
                return;
            }
            let first_ts = map.keyframe(chain[0]).map(|kf| kf.timestamp).unwrap_or(0.0);
            let current_ts = map.keyframe(current).map(|kf| kf.timestamp).unwrap_or(0.0);
            if current_ts - first_ts < min_time {
                return;
            }
        }

        self.state.set_initializing(true);

        // Fold any queued keyframes into the attempt.
        while let Ok(data) = self.queue.try_recv() {
            current = self.process_new_keyframe(data);
        }

        let mut atlas = self.atlas.write();
        let map = atlas.active_map_mut();
        let chain = map.temporal_chain(current);
        let first_ts = map.keyframe(chain[0]).map(|kf| kf.timestamp).unwrap_or(0.0);
        let current_ts = map.keyframe(current).map(|kf| kf.timestamp).unwrap_or(0.0);

        let mut params = if !map.is_imu_initialized() {
            let Some(rwg) = estimate_gravity_and_velocities(map, &chain) else {
                self.state.set_initializing(false);
                return;
            };
            self.t_init = current_ts - first_ts;
            InertialParams::new(rwg)
        } else {
            let mut params = InertialParams::new(UnitQuaternion::identity());
            params.bias = map
                .keyframe(current)
                .map(|kf| kf.imu_bias)
                .unwrap_or_default();
            params
        };

        let solved = self.optimizer.inertial_optimization(
            map,
            &mut params,
            self.config.monocular,
            prior_g,
            prior_a,
            false,
        );
        if !solved || params.scale < MIN_INERTIAL_SCALE {
            warn!(scale = params.scale, "inertial initialization produced unusable scale");
            self.state.set_initializing(false);
            return;
        }

        // Commit: align the map with gravity and rescale it.
        if (params.scale - 1.0).abs() > 1e-5 || !self.config.monocular {
            let twg = SE3::new(params.rwg.inverse(), Vector3::zeros());
            map.apply_scaled_rotation(&twg, params.scale, true);
            let first_bias = map
                .keyframe(chain[0])
                .map(|kf| kf.imu_bias)
                .unwrap_or_default();
            self.tracker.update_frame_imu(params.scale, first_bias, current);
        }

        if !map.is_imu_initialized() {
            for &kf_id in &chain {
                if let Some(kf) = map.keyframe_mut(kf_id) {
                    kf.imu_ready = true;
                }
            }
            map.set_imu_initialized();
            info!(
                keyframes = chain.len(),
                span = current_ts - first_ts,
                "IMU initialized"
            );
        }
        self.tracker.update_frame_imu(1.0, params.bias, current);

        if run_fiba {
            let priors = (prior_a != 0.0).then_some((prior_g, prior_a));
            self.optimizer
                .full_inertial_ba(map, 100, current, priors, self.state.abort_flag());
            debug!(gba = %current, "full inertial BA finished, propagating");
            propagate_global_ba(map, current);
        }

        map.increase_change_index();
        drop(atlas);

        // Keyframes that queued up during the long optimization are stale
        // against the re-aligned map; drop them.
        let mut discarded = 0;
        while self.queue.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "stale keyframes dropped after inertial initialization");
        }

        self.init_attempts += 1;
        self.state.set_initializing(false);
    }

    /// Periodic monocular scale refinement.
    ///
    /// Re-runs the inertial optimization with an identity gravity prior and
    /// unit scale; the map is only touched when the estimated correction is
    /// meaningful.
    pub(super) fn scale_refinement(&mut self) {
        if self.state.reset_pending() {
            return;
        }
        while let Ok(data) = self.queue.try_recv() {
            self.process_new_keyframe(data);
        }
        let Some(current) = self.current_kf else {
            return;
        };

        let mut params = InertialParams::new(UnitQuaternion::identity());
        let mut atlas = self.atlas.write();
        let map = atlas.active_map_mut();

        let solved = self.optimizer.inertial_optimization(
            map,
            &mut params,
            self.config.monocular,
            0.0,
            0.0,
            true,
        );
        if !solved || params.scale < MIN_INERTIAL_SCALE {
            warn!(scale = params.scale, "scale refinement produced unusable scale");
            self.state.set_initializing(false);
            return;
        }

        if (params.scale - 1.0).abs() > SCALE_REFINE_TOLERANCE || !self.config.monocular {
            let tgw = SE3::new(params.rwg.inverse(), Vector3::zeros());
            map.apply_scaled_rotation(&tgw, params.scale, true);
            let bias = map
                .keyframe(current)
                .map(|kf| kf.imu_bias)
                .unwrap_or_default();
            self.tracker.update_frame_imu(params.scale, bias, current);
            info!(scale = params.scale, "map rescaled");
        }
        map.increase_change_index();
        drop(atlas);

        let mut discarded = 0;
        while self.queue.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "stale keyframes dropped after scale refinement");
        }
    }
}

/// Estimate the gravity direction from the preintegrated velocity deltas and
/// seed per-keyframe velocities from pose differences.
///
/// Returns the rotation aligning the gravity-aligned frame with the world,
/// or `None` when the chain carries no usable preintegrations.
fn estimate_gravity_and_velocities(map: &mut Map, chain: &[KeyFrameId]) -> Option<UnitQuaternion<f64>> {
    let mut dir_g = Vector3::zeros();
    let mut used = 0usize;

    for &kf_id in chain {
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        let (Some(preint), Some(prev_id)) = (kf.imu_preintegrated.clone(), kf.prev_kf) else {
            continue;
        };
        let bias = kf.imu_bias;
        let kf_pos = kf.imu_position();
        let Some(prev) = map.keyframe(prev_id) else {
            continue;
        };
        let prev_rot = prev.pose_inverse().rotation;
        let prev_pos = prev.imu_position();

        // Gravity leaks into the preintegrated velocity delta with the
        // opposite sign.
        dir_g -= prev_rot * preint.updated_delta_velocity(&bias);
        used += 1;

        if preint.dt > 1e-9 {
            let vel = (kf_pos - prev_pos) / preint.dt;
            map.keyframe_mut(kf_id).unwrap().velocity = vel;
            map.keyframe_mut(prev_id).unwrap().velocity = vel;
        }
    }

    if used < 2 || dir_g.norm() < 1e-9 {
        return None;
    }
    let dir_g = dir_g.normalize();

    let g_ref = Vector3::new(0.0, 0.0, -1.0);
    let axis = g_ref.cross(&dir_g);
    let angle = g_ref.dot(&dir_g).clamp(-1.0, 1.0).acos();
    let norm = axis.norm();
    if norm < 1e-12 {
        return Some(UnitQuaternion::identity());
    }
    Some(UnitQuaternion::from_scaled_axis(axis * (angle / norm)))
}

/// Commit the results of a full inertial BA.
///
/// Keyframes the solver stamped carry their optimized state already; the
/// rest inherit their parent's correction breadth-first from the map
/// origins. Landmarks follow either their own optimized position or their
/// reference keyframe's correction.
pub(super) fn propagate_global_ba(map: &mut Map, gba_id: KeyFrameId) {
    let mut pending: VecDeque<KeyFrameId> = map.origins().iter().copied().collect();

    while let Some(kf_id) = pending.pop_front() {
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        if kf.is_bad {
            continue;
        }
        let children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
        let twc = kf.pose_inverse();
        let tcw_gba = kf.tcw_gba.clone().unwrap_or_else(|| kf.pose());

        for child_id in children {
            let Some(child) = map.keyframe(child_id) else {
                continue;
            };
            if child.is_bad {
                continue;
            }
            if child.ba_global_for_kf != Some(gba_id) {
                let t_child_parent = child.pose().compose(&twc);
                let child_gba = t_child_parent.compose(&tcw_gba);
                let r_cor = child_gba.rotation.inverse() * child.pose().rotation;
                let velocity = r_cor * child.velocity;
                let bias = child.imu_bias;

                let child = map.keyframe_mut(child_id).unwrap();
                child.tcw_gba = Some(child_gba);
                child.vwb_gba = Some(velocity);
                child.bias_gba = Some(bias);
                child.ba_global_for_kf = Some(gba_id);
            }
            pending.push_back(child_id);
        }

        let kf = map.keyframe_mut(kf_id).unwrap();
        let live_pose = kf.pose();
        kf.tcw_bef_gba = Some(live_pose);
        kf.set_pose(tcw_gba);
        if kf.imu_ready {
            if let Some(velocity) = kf.vwb_gba {
                kf.velocity = velocity;
            }
            if let Some(bias) = kf.bias_gba {
                kf.imu_bias = bias;
            }
        }
    }

    // Landmarks.
    let mp_ids: Vec<MapPointId> = map.map_points().map(|mp| mp.id).collect();
    for mp_id in mp_ids {
        let corrected = {
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.ba_global_for_kf == Some(gba_id) {
                mp.pos_gba
            } else {
                let Some(reference) = map.keyframe(mp.reference_kf) else {
                    continue;
                };
                if reference.ba_global_for_kf != Some(gba_id) && reference.tcw_bef_gba.is_none() {
                    continue;
                }
                // Move through the reference keyframe's correction: map to
                // the pre-BA camera, back-project with the post-BA pose.
                reference
                    .tcw_bef_gba
                    .as_ref()
                    .map(|t_bef| reference.pose_inverse().transform(&t_bef.transform(&mp.position())))
            }
        };
        if let Some(position) = corrected {
            map.map_point_mut(mp_id).unwrap().set_position(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingConfig;
    use crate::features::{Descriptor, KeyPoint};
    use crate::imu::{ImuBias, Preintegrated};
    use crate::local_mapping::local_mapper::tests::{keyframe_at, StubOptimizer};
    use crate::local_mapping::local_mapper::LocalMapper;
    use crate::map::Atlas;
    use crate::optimizer::{BaStats, Optimizer};
    use crate::system::messages::KeyFrameData;
    use crate::system::{TrackerLink, TrackingState};
    use nalgebra::Vector3;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct RecordingTracker {
        scaled_updates: AtomicU32,
        updates: AtomicU32,
    }

    impl RecordingTracker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scaled_updates: AtomicU32::new(0),
                updates: AtomicU32::new(0),
            })
        }
    }

    impl TrackerLink for RecordingTracker {
        fn matches_inliers(&self) -> u32 {
            0
        }

        fn state(&self) -> TrackingState {
            TrackingState::Ok
        }

        fn update_frame_imu(&self, scale: f64, _bias: ImuBias, _anchor: crate::map::KeyFrameId) {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if (scale - 1.0).abs() > 1e-12 {
                self.scaled_updates.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn inertial_mapper(
        optimizer: Arc<dyn Optimizer>,
        tracker: Arc<dyn TrackerLink>,
    ) -> LocalMapper {
        let atlas = Arc::new(RwLock::new(Atlas::new()));
        let (mapper, _handle) = LocalMapper::new(
            MappingConfig::monocular().with_imu(),
            atlas,
            optimizer,
            tracker,
            None,
        )
        .unwrap();
        mapper
    }

    /// Insert `n` keyframes 0.25 s apart moving along +x, with stationary
    /// preintegrations (gravity leak only).
    fn insert_chain(mapper: &mut LocalMapper, n: usize) -> Vec<crate::map::KeyFrameId> {
        let mut ids = Vec::new();
        for i in 0..n {
            let mut data = keyframe_at(
                i as f64 * 0.25,
                Vector3::new(0.05 * i as f64, 0.0, 0.0),
                &[],
            );
            if i > 0 {
                let mut preint = Preintegrated::identity();
                preint.dt = 0.25;
                preint.delta_vel = Vector3::new(0.0, 0.0, 9.81 * 0.25);
                data.imu_preintegrated = Some(preint);
            }
            ids.push(mapper.process_new_keyframe(data));
        }
        ids
    }

    #[test]
    fn test_first_initialization_marks_map() {
        let optimizer = Arc::new(StubOptimizer::with_scale(1.0));
        let tracker = RecordingTracker::new();
        let mut mapper = inertial_mapper(optimizer.clone(), tracker.clone());
        let ids = insert_chain(&mut mapper, 11);

        mapper.initialize_imu(1e2, 1e10, true);

        let atlas = mapper.atlas.read();
        let map = atlas.active_map();
        assert!(map.is_imu_initialized());
        for &id in &ids {
            assert!(map.keyframe(id).unwrap().imu_ready);
        }
        // Velocities seeded from pose differences: 0.05 m per 0.25 s.
        let v = map.keyframe(ids[5]).unwrap().velocity;
        assert!((v - Vector3::new(0.2, 0.0, 0.0)).norm() < 1e-9);

        assert!((mapper.t_init - 2.5).abs() < 1e-9);
        assert_eq!(mapper.init_attempts, 1);
        assert_eq!(optimizer.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(optimizer.fiba_calls.load(Ordering::SeqCst), 1);
        assert!(tracker.updates.load(Ordering::SeqCst) >= 1);
        assert!(!mapper.state.is_initializing());
    }

    #[test]
    fn test_too_few_keyframes_aborts_early() {
        let optimizer = Arc::new(StubOptimizer::with_scale(1.0));
        let mut mapper = inertial_mapper(optimizer.clone(), RecordingTracker::new());
        insert_chain(&mut mapper, 5);

        mapper.initialize_imu(1e2, 1e10, true);

        assert_eq!(optimizer.init_calls.load(Ordering::SeqCst), 0);
        assert!(!mapper.atlas.read().active_map().is_imu_initialized());
    }

    #[test]
    fn test_unusable_scale_abandons_attempt() {
        let optimizer = Arc::new(StubOptimizer::with_scale(0.05));
        let mut mapper = inertial_mapper(optimizer.clone(), RecordingTracker::new());
        let ids = insert_chain(&mut mapper, 11);

        let pose_before = {
            let atlas = mapper.atlas.read();
            atlas.active_map().keyframe(ids[3]).unwrap().pose()
        };

        mapper.initialize_imu(1e2, 1e10, true);

        let atlas = mapper.atlas.read();
        let map = atlas.active_map();
        // The map is untouched and the attempt abandoned.
        assert!(!map.is_imu_initialized());
        assert_eq!(map.keyframe(ids[3]).unwrap().pose(), pose_before);
        assert!(!mapper.state.is_initializing());
        assert_eq!(optimizer.fiba_calls.load(Ordering::SeqCst), 0);
        assert_eq!(mapper.init_attempts, 0);
    }

    #[test]
    fn test_scale_refinement_within_tolerance_is_noop() {
        let optimizer = Arc::new(StubOptimizer::with_scale(1.001));
        let tracker = RecordingTracker::new();
        let mut mapper = inertial_mapper(optimizer.clone(), tracker.clone());
        let ids = insert_chain(&mut mapper, 11);
        mapper.atlas.write().active_map_mut().set_imu_initialized();

        let pose_before = {
            let atlas = mapper.atlas.read();
            atlas.active_map().keyframe(ids[7]).unwrap().pose()
        };

        mapper.scale_refinement();

        let atlas = mapper.atlas.read();
        assert_eq!(atlas.active_map().keyframe(ids[7]).unwrap().pose(), pose_before);
        assert_eq!(tracker.scaled_updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_scale_refinement_applies_large_correction() {
        let optimizer = Arc::new(StubOptimizer::with_scale(1.5));
        let tracker = RecordingTracker::new();
        let mut mapper = inertial_mapper(optimizer.clone(), tracker.clone());
        let ids = insert_chain(&mut mapper, 11);
        mapper.atlas.write().active_map_mut().set_imu_initialized();

        let center_before = {
            let atlas = mapper.atlas.read();
            atlas.active_map().keyframe(ids[10]).unwrap().camera_center()
        };

        mapper.scale_refinement();

        let atlas = mapper.atlas.read();
        let center_after = atlas.active_map().keyframe(ids[10]).unwrap().camera_center();
        assert!((center_after - center_before * 1.5).norm() < 1e-9);
        assert_eq!(tracker.scaled_updates.load(Ordering::SeqCst), 1);
    }

    /// Full-BA stub: stamps only the origin with a shifted pose; the
    /// propagation must carry the correction to every descendant and every
    /// landmark.
    struct ShiftingOptimizer {
        shift: Vector3<f64>,
    }

    impl Optimizer for ShiftingOptimizer {
        fn local_bundle_adjustment(
            &self,
            _map: &mut Map,
            _current: crate::map::KeyFrameId,
            _abort: &AtomicBool,
        ) -> BaStats {
            BaStats::default()
        }

        fn local_inertial_ba(
            &self,
            _map: &mut Map,
            _current: crate::map::KeyFrameId,
            _abort: &AtomicBool,
            _large: bool,
            _first_stage: bool,
        ) -> BaStats {
            BaStats::default()
        }

        fn inertial_optimization(
            &self,
            _map: &mut Map,
            params: &mut InertialParams,
            _monocular: bool,
            _prior_g: f64,
            _prior_a: f64,
            _fix_velocities: bool,
        ) -> bool {
            params.scale = 1.0;
            true
        }

        fn full_inertial_ba(
            &self,
            map: &mut Map,
            _iterations: usize,
            gba_kf: crate::map::KeyFrameId,
            _priors: Option<(f64, f64)>,
            _abort: &AtomicBool,
        ) {
            let origin = map.origin_id().unwrap();
            let kf = map.keyframe_mut(origin).unwrap();
            let mut pose = kf.pose();
            pose.translation += self.shift;
            kf.tcw_gba = Some(pose);
            kf.ba_global_for_kf = Some(gba_kf);
        }
    }

    #[test]
    fn test_global_ba_propagates_through_spanning_tree() {
        let shift = Vector3::new(0.3, -0.1, 0.2);
        let optimizer = Arc::new(ShiftingOptimizer { shift });
        let mut mapper = inertial_mapper(optimizer, RecordingTracker::new());

        // A shared landmark links every keyframe into the spanning tree.
        let landmark_pos = Vector3::new(0.0, 0.0, 10.0);
        let mp = {
            let mut atlas = mapper.atlas.write();
            atlas.active_map_mut().create_map_point(
                landmark_pos,
                Descriptor::zeros(),
                crate::map::KeyFrameId(0),
            )
        };

        let mut ids = Vec::new();
        for i in 0..11 {
            let mut data: KeyFrameData = keyframe_at(
                i as f64 * 0.25,
                Vector3::new(0.05 * i as f64, 0.0, 0.0),
                &[(KeyPoint::new(320.0, 240.0, 0), Descriptor::zeros(), Some(mp))],
            );
            if i > 0 {
                let mut preint = Preintegrated::identity();
                preint.dt = 0.25;
                preint.delta_vel = Vector3::new(0.0, 0.0, 9.81 * 0.25);
                data.imu_preintegrated = Some(preint);
            }
            ids.push(mapper.process_new_keyframe(data));
        }

        let centers_before: Vec<Vector3<f64>> = {
            let atlas = mapper.atlas.read();
            ids.iter()
                .map(|id| atlas.active_map().keyframe(*id).unwrap().camera_center())
                .collect()
        };

        mapper.initialize_imu(1e2, 1e10, true);

        let atlas = mapper.atlas.read();
        let map = atlas.active_map();
        // Identity rotation and unit scale: the only change is the FIBA
        // shift, carried from the origin to every keyframe via the tree.
        for (id, before) in ids.iter().zip(&centers_before) {
            let after = map.keyframe(*id).unwrap().camera_center();
            assert!(
                (after - (before - shift)).norm() < 1e-9,
                "keyframe {id} not propagated"
            );
            assert!(
                map.keyframe(*id).unwrap().tcw_bef_gba.is_some(),
                "keyframe {id} not committed"
            );
        }
        // The landmark follows its reference keyframe's correction.
        let mp_pos = map.map_point(mp).unwrap().position();
        assert!((mp_pos - (landmark_pos - shift)).norm() < 1e-9);
    }
}

//! The mapping worker and its control plane.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::MappingConfig;
use crate::map::{Atlas, KeyFrameId, MapPointId};
use crate::optimizer::Optimizer;
use crate::system::messages::KeyFrameData;
use crate::system::shared_state::SharedState;
use crate::system::{TrackerLink, TrackingState};

use super::keyframe_culling::keyframe_culling;
use super::search_in_neighbors::search_in_neighbors;
use super::triangulation::create_new_map_points;

/// Pause between control-loop iterations and while stopped.
const LOOP_SLEEP: Duration = Duration::from_millis(3);

/// Found-ratio below which a probationary landmark is discarded.
const MIN_FOUND_RATIO: f64 = 0.25;

/// Keyframes a fresh landmark stays on probation.
const PROBATION_KEYFRAMES: u64 = 3;

/// Inlier counts above which the inertial BA window widens.
const LARGE_BA_INLIERS_MONO: u32 = 75;
const LARGE_BA_INLIERS_STEREO: u32 = 100;

/// Control plane of a running mapper, shared with the tracker and the loop
/// closer.
#[derive(Clone)]
pub struct LocalMappingHandle {
    state: Arc<SharedState>,
    sender: Sender<KeyFrameData>,
    queue: Receiver<KeyFrameData>,
    current: Arc<Mutex<Option<(KeyFrameId, f64)>>>,
}

impl LocalMappingHandle {
    /// Enqueue a keyframe from the tracker. Any in-flight bundle adjustment
    /// is asked to wind down so the new keyframe gets processed promptly.
    pub fn insert_keyframe(&self, data: KeyFrameData) {
        let _ = self.sender.send(data);
        self.state.raise_abort_ba();
    }

    pub fn accept_keyframes(&self) -> bool {
        self.state.accepts_keyframes()
    }

    pub fn set_accept_keyframes(&self, flag: bool) {
        self.state.set_accept_keyframes(flag);
    }

    pub fn request_stop(&self) {
        self.state.request_stop();
    }

    /// Attempt the transition into the stopped state. Normally the worker
    /// drives this between pipeline passes; exposed for collaborators that
    /// coordinate a stop themselves.
    pub fn stop(&self) -> bool {
        self.state.try_stop()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested()
    }

    /// Resume after a stop, dropping whatever was queued meanwhile.
    pub fn release(&self) {
        while self.queue.try_recv().is_ok() {}
        self.state.release();
    }

    pub fn set_not_stop(&self, flag: bool) -> bool {
        self.state.set_not_stop(flag)
    }

    pub fn interrupt_ba(&self) {
        self.state.raise_abort_ba();
    }

    /// Request a full reset and wait for the worker to acknowledge it.
    pub fn request_reset(&self) {
        self.state.request_reset();
        while self.state.reset_pending() && !self.state.is_finished() {
            thread::sleep(LOOP_SLEEP);
        }
    }

    /// Request a reset of the active map and wait for the acknowledgment.
    pub fn request_reset_active_map(&self) {
        self.state.request_reset_active_map();
        while self.state.reset_pending() && !self.state.is_finished() {
            thread::sleep(LOOP_SLEEP);
        }
    }

    pub fn request_finish(&self) {
        self.state.request_finish();
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_initializing(&self) -> bool {
        self.state.is_initializing()
    }

    pub fn current_kf(&self) -> Option<KeyFrameId> {
        self.current.lock().map(|(id, _)| id)
    }

    pub fn current_kf_time(&self) -> f64 {
        self.current.lock().map(|(_, ts)| ts).unwrap_or(0.0)
    }

    pub fn queued_keyframes(&self) -> usize {
        self.queue.len()
    }
}

/// The local mapping worker.
pub struct LocalMapper {
    pub(super) config: MappingConfig,
    pub(super) atlas: Arc<RwLock<Atlas>>,
    pub(super) state: Arc<SharedState>,
    pub(super) optimizer: Arc<dyn Optimizer>,
    pub(super) tracker: Arc<dyn TrackerLink>,
    pub(super) queue: Receiver<KeyFrameData>,
    pub(super) lc_queue: Option<Sender<KeyFrameId>>,

    /// Landmarks on probation since the last culling pass.
    pub(super) recent_map_points: VecDeque<MapPointId>,

    pub(super) current_kf: Option<KeyFrameId>,
    pub(super) current_info: Arc<Mutex<Option<(KeyFrameId, f64)>>>,

    /// Accumulated well-moving time since the inertial bootstrap started.
    pub(super) t_init: f64,
    /// Completed inertial initialization attempts.
    pub(super) init_attempts: u32,
}

impl LocalMapper {
    /// Build a mapper and its control handle.
    pub fn new(
        config: MappingConfig,
        atlas: Arc<RwLock<Atlas>>,
        optimizer: Arc<dyn Optimizer>,
        tracker: Arc<dyn TrackerLink>,
        lc_queue: Option<Sender<KeyFrameId>>,
    ) -> Result<(Self, LocalMappingHandle)> {
        config.validate()?;

        let (sender, receiver) = unbounded();
        let state = Arc::new(SharedState::new());
        let current_info = Arc::new(Mutex::new(None));

        let handle = LocalMappingHandle {
            state: Arc::clone(&state),
            sender,
            queue: receiver.clone(),
            current: Arc::clone(&current_info),
        };
        let mapper = Self {
            config,
            atlas,
            state,
            optimizer,
            tracker,
            queue: receiver,
            lc_queue,
            recent_map_points: VecDeque::new(),
            current_kf: None,
            current_info,
            t_init: 0.0,
            init_attempts: 0,
        };
        Ok((mapper, handle))
    }

    /// Spawn the worker on its own thread.
    pub fn spawn(mut self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("local-mapping".into())
            .spawn(move || self.run())
            .expect("failed to spawn local mapping thread")
    }

    /// The control loop. Returns when finish is requested.
    pub fn run(&mut self) {
        info!(seq = %self.config.seq_name, "local mapping started");

        loop {
            // The tracker sees the mapper as busy until the pass ends.
            self.state.set_accept_keyframes(false);

            if !self.queue.is_empty() && !self.state.bad_imu() {
                self.process_pipeline();
            } else if self.state.try_stop() && !self.state.bad_imu() {
                while self.state.is_stopped() && !self.state.finish_requested() {
                    thread::sleep(LOOP_SLEEP);
                }
                if self.state.finish_requested() {
                    break;
                }
            }

            self.reset_if_requested();
            self.state.set_accept_keyframes(true);

            if self.state.finish_requested() {
                break;
            }
            thread::sleep(LOOP_SLEEP);
        }

        self.state.set_finished();
        info!("local mapping finished");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Per-keyframe pipeline
    // ─────────────────────────────────────────────────────────────────────

    fn process_pipeline(&mut self) {
        let Ok(data) = self.queue.try_recv() else {
            return;
        };

        let kf_id = self.process_new_keyframe(data);
        self.map_point_culling(kf_id);
        self.triangulate(kf_id);
        self.state.clear_abort_ba();

        if self.queue.is_empty() {
            self.fuse_in_neighbors(kf_id);
        }

        if self.queue.is_empty() && !self.state.stop_requested() {
            self.run_local_ba(kf_id);

            let imu_pending = self.config.inertial && {
                let atlas = self.atlas.read();
                !atlas.active_map().is_imu_initialized()
            };
            if imu_pending {
                let (prior_g, prior_a) = if self.config.monocular {
                    (1e2, 1e10)
                } else {
                    (1e2, 1e5)
                };
                self.initialize_imu(prior_g, prior_a, true);
            }

            self.cull_keyframes(kf_id);
            self.inertial_stages();
        }

        if let Some(lc) = &self.lc_queue {
            let _ = lc.send(kf_id);
        }
    }

    /// Integrate a queued keyframe into the map graph.
    pub(super) fn process_new_keyframe(&mut self, mut data: KeyFrameData) -> KeyFrameId {
        let matched = std::mem::take(&mut data.matched_map_points);

        let mut atlas = self.atlas.write();
        let map = atlas.active_map_mut();
        let kf_id = map.create_keyframe(data);

        // Attach the landmarks the tracker matched and refresh their
        // derived state.
        for (slot, matched_id) in matched.iter().enumerate() {
            let Some(matched_id) = matched_id else {
                continue;
            };
            let Some(mp_id) = map.resolve_replaced(*matched_id) else {
                continue;
            };
            let already_listed = map.map_point(mp_id).is_some_and(|mp| mp.observes(kf_id));
            if already_listed {
                // Stereo landmarks the tracker pre-registered go on
                // probation.
                self.recent_map_points.push_back(mp_id);
            } else {
                map.associate(kf_id, slot, mp_id);
                map.update_normal_and_depth(mp_id);
                map.compute_distinctive_descriptor(mp_id);
            }
        }

        // Seed landmarks for close stereo features that went unmatched.
        let seeds: Vec<usize> = {
            let kf = map.keyframe(kf_id).unwrap();
            (0..kf.n_left())
                .filter(|&slot| {
                    kf.map_point(slot).is_none() && kf.stereo_depth(slot).is_some()
                })
                .collect()
        };
        for slot in seeds {
            let kf = map.keyframe(kf_id).unwrap();
            let Some(position) = kf.unproject_stereo(slot) else {
                continue;
            };
            let descriptor = *kf.descriptor(slot);
            let mp_id = map.create_map_point(position, descriptor, kf_id);
            map.associate(kf_id, slot, mp_id);
            map.update_normal_and_depth(mp_id);
            self.recent_map_points.push_back(mp_id);
        }

        map.update_connections(kf_id);

        let timestamp = map.keyframe(kf_id).unwrap().timestamp;
        drop(atlas);

        self.current_kf = Some(kf_id);
        *self.current_info.lock() = Some((kf_id, timestamp));
        debug!(kf = %kf_id, "keyframe inserted");
        kf_id
    }

    /// Probation pass over recently created landmarks.
    pub(super) fn map_point_culling(&mut self, current_kf: KeyFrameId) {
        let th_obs = if self.config.monocular { 2 } else { 3 };

        let mut atlas = self.atlas.write();
        let map = atlas.active_map_mut();

        self.recent_map_points.retain(|&mp_id| {
            let Some(mp) = map.map_point(mp_id) else {
                return false;
            };
            if mp.is_bad {
                return false;
            }
            let age = current_kf.0.saturating_sub(mp.first_kf_id.0);
            if mp.found_ratio() < MIN_FOUND_RATIO {
                map.set_map_point_bad(mp_id);
                false
            } else if age >= 2 && map.map_point(mp_id).unwrap().observation_count() <= th_obs {
                // Enough keyframes have passed and still only the creators
                // ever saw it.
                map.set_map_point_bad(mp_id);
                false
            } else if age >= PROBATION_KEYFRAMES {
                // Graduated: stays in the map, leaves probation.
                false
            } else {
                true
            }
        });
    }

    fn triangulate(&mut self, kf_id: KeyFrameId) {
        let queue = self.queue.clone();
        let has_new = move || !queue.is_empty();

        let mut atlas = self.atlas.write();
        let map = atlas.active_map_mut();
        let created = create_new_map_points(
            map,
            kf_id,
            &self.config,
            self.tracker.state(),
            &has_new,
            &mut self.recent_map_points,
        );
        if created > 0 {
            debug!(kf = %kf_id, created, "triangulated new landmarks");
        }
    }

    fn fuse_in_neighbors(&mut self, kf_id: KeyFrameId) {
        let state = Arc::clone(&self.state);
        let abort = move || state.abort_ba();

        let mut atlas = self.atlas.write();
        let map = atlas.active_map_mut();
        let stats = search_in_neighbors(map, kf_id, &self.config, &abort);
        if stats.replaced > 0 || stats.added > 0 {
            debug!(
                kf = %kf_id,
                fused = stats.replaced,
                added = stats.added,
                "neighborhood fusion"
            );
        }
    }

    /// Local BA, preceded in inertial operation by the motion bookkeeping
    /// that drives the bootstrap schedule.
    pub(super) fn run_local_ba(&mut self, kf_id: KeyFrameId) {
        let mut atlas = self.atlas.write();
        let map = atlas.active_map_mut();
        if map.num_keyframes() <= 2 {
            return;
        }

        if self.config.inertial && map.is_imu_initialized() {
            // Travel over the last two keyframe intervals.
            let recent_motion = map.keyframe(kf_id).and_then(|kf| {
                let prev = map.keyframe(kf.prev_kf?)?;
                let prev_prev = map.keyframe(prev.prev_kf?)?;
                let dist = (prev.camera_center() - kf.camera_center()).norm()
                    + (prev_prev.camera_center() - prev.camera_center()).norm();
                Some((dist, kf.timestamp - prev.timestamp))
            });

            if let Some((dist, dt)) = recent_motion {
                if dist > 0.05 {
                    self.t_init += dt;
                }
                if !map.is_inertial_ba2_done() && self.t_init < 10.0 && dist < 0.02 {
                    warn!("not enough motion for inertial initialization, resetting active map");
                    self.state.request_reset_active_map();
                    self.state.set_bad_imu(true);
                }
            }

            let inliers = self.tracker.matches_inliers();
            let large = (inliers > LARGE_BA_INLIERS_MONO && self.config.monocular)
                || (inliers > LARGE_BA_INLIERS_STEREO && !self.config.monocular);
            let first_stage = !map.is_inertial_ba2_done();
            self.optimizer.local_inertial_ba(
                map,
                kf_id,
                self.state.abort_flag(),
                large,
                first_stage,
            );
        } else {
            self.optimizer
                .local_bundle_adjustment(map, kf_id, self.state.abort_flag());
        }
    }

    fn cull_keyframes(&mut self, kf_id: KeyFrameId) {
        let abort = self.state.abort_ba();
        let mut atlas = self.atlas.write();
        let map = atlas.active_map_mut();
        let culled = keyframe_culling(map, kf_id, &self.config, abort);
        if culled > 0 {
            info!(kf = %kf_id, culled, "redundant keyframes removed");
        }
    }

    /// Staged inertial refinement and the periodic monocular scale passes.
    pub(super) fn inertial_stages(&mut self) {
        if !self.config.inertial || self.t_init >= 50.0 {
            return;
        }
        let (initialized, ba1_done, ba2_done, keyframes) = {
            let atlas = self.atlas.read();
            let map = atlas.active_map();
            (
                map.is_imu_initialized(),
                map.is_inertial_ba1_done(),
                map.is_inertial_ba2_done(),
                map.num_keyframes(),
            )
        };
        if !initialized || self.tracker.state() != TrackingState::Ok {
            return;
        }

        if !ba1_done {
            if self.t_init > 5.0 {
                info!("starting inertial refinement stage 1");
                self.atlas.write().active_map_mut().set_inertial_ba1_done();
                self.initialize_imu(1.0, 1e5, true);
            }
        } else if !ba2_done && self.t_init > 15.0 {
            info!("starting inertial refinement stage 2");
            self.atlas.write().active_map_mut().set_inertial_ba2_done();
            self.initialize_imu(0.0, 0.0, true);
        }

        let in_window = [25.0, 35.0, 45.0, 55.0, 65.0, 75.0]
            .iter()
            .any(|t| self.t_init > *t && self.t_init < t + 0.5);
        if keyframes <= 200 && in_window && self.config.monocular {
            self.scale_refinement();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reset handling
    // ─────────────────────────────────────────────────────────────────────

    pub(super) fn reset_if_requested(&mut self) {
        let (full, active_map) = self.state.take_reset();
        if !full && !active_map {
            return;
        }
        info!(full, active_map, "resetting local mapping state");

        while self.queue.try_recv().is_ok() {}
        self.recent_map_points.clear();
        self.current_kf = None;
        *self.current_info.lock() = None;

        // Inertial bootstrap starts over.
        self.t_init = 0.0;
        self.init_attempts = 0;
        self.state.set_bad_imu(false);
        self.state.clear_abort_ba();
    }
}

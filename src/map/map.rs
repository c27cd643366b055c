//! Map: the arena owning keyframes and landmarks plus their graph relations.
//!
//! All topology mutations go through `&mut Map`; the single writer lock
//! around the active map is what makes a mutation appear atomic to the
//! optimizer and the other threads.

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use crate::features::Descriptor;
use crate::geometry::SE3;
use crate::system::messages::KeyFrameData;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    next_kf_id: u64,
    next_mp_id: u64,

    /// Keyframes with no spanning-tree parent (roots of propagation).
    origins: Vec<KeyFrameId>,

    /// Tail of the temporal chain.
    last_keyframe_id: Option<KeyFrameId>,

    imu_initialized: bool,
    inertial_ba1_done: bool,
    inertial_ba2_done: bool,

    /// Bumped whenever the map changes in a way the tracker must notice.
    change_index: u64,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            origins: Vec::new(),
            last_keyframe_id: None,
            imu_initialized: false,
            inertial_ba1_done: false,
            inertial_ba2_done: false,
            change_index: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inertial state
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_imu_initialized(&self) -> bool {
        self.imu_initialized
    }

    pub fn set_imu_initialized(&mut self) {
        self.imu_initialized = true;
    }

    pub fn is_inertial_ba1_done(&self) -> bool {
        self.inertial_ba1_done
    }

    pub fn set_inertial_ba1_done(&mut self) {
        self.inertial_ba1_done = true;
    }

    pub fn is_inertial_ba2_done(&self) -> bool {
        self.inertial_ba2_done
    }

    pub fn set_inertial_ba2_done(&mut self) {
        self.inertial_ba2_done = true;
    }

    pub fn change_index(&self) -> u64 {
        self.change_index
    }

    pub fn increase_change_index(&mut self) {
        self.change_index += 1;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Entity management
    // ─────────────────────────────────────────────────────────────────────

    /// Build a keyframe from tracker data and link it into the temporal
    /// chain. Ids grow monotonically, so the chain is id- and
    /// timestamp-monotone by construction.
    pub fn create_keyframe(&mut self, data: KeyFrameData) -> KeyFrameId {
        let id = KeyFrameId(self.next_kf_id);
        self.next_kf_id += 1;

        let mut kf = KeyFrame::from_data(id, data);
        if let Some(prev_id) = self.last_keyframe_id {
            kf.prev_kf = Some(prev_id);
            if let Some(prev) = self.keyframes.get_mut(&prev_id) {
                prev.next_kf = Some(id);
            }
        } else {
            self.origins.push(id);
        }

        self.keyframes.insert(id, kf);
        self.last_keyframe_id = Some(id);
        id
    }

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, first_kf_id));
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// Live (non-bad) keyframes.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values().filter(|kf| !kf.is_bad)
    }

    /// Live (non-bad) landmarks.
    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values().filter(|mp| !mp.is_bad)
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes().count()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points().count()
    }

    pub fn origins(&self) -> &[KeyFrameId] {
        &self.origins
    }

    pub fn origin_id(&self) -> Option<KeyFrameId> {
        self.origins.first().copied()
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.last_keyframe_id
    }

    /// Follow the `replaced_by` forwarding chain to a live landmark.
    ///
    /// The chain is finite (each hop was created by exactly one fusion and
    /// points to a strictly newer survivor), so this terminates.
    pub fn resolve_replaced(&self, mut id: MapPointId) -> Option<MapPointId> {
        loop {
            let mp = self.map_points.get(&id)?;
            if !mp.is_bad {
                return Some(id);
            }
            id = mp.replaced_by?;
        }
    }

    /// Temporal chain from the map origin up to `kf_id`, oldest first.
    pub fn temporal_chain(&self, kf_id: KeyFrameId) -> Vec<KeyFrameId> {
        let mut chain = Vec::new();
        let mut cursor = Some(kf_id);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.keyframes.get(&id).and_then(|kf| kf.prev_kf);
        }
        chain.reverse();
        chain
    }

    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.origins.clear();
        self.last_keyframe_id = None;
        self.imu_initialized = false;
        self.inertial_ba1_done = false;
        self.inertial_ba2_done = false;
        self.change_index += 1;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Associations
    // ─────────────────────────────────────────────────────────────────────

    /// Bind a keyframe feature slot to a landmark, both directions.
    ///
    /// No edge is added when either entity is bad. Covisibility weights are
    /// refreshed lazily by [`Map::update_connections`].
    pub fn associate(&mut self, kf_id: KeyFrameId, slot: usize, mp_id: MapPointId) -> bool {
        let right = match self.keyframes.get(&kf_id) {
            Some(kf) if !kf.is_bad && slot < kf.num_slots() => kf.is_right_slot(slot),
            _ => return false,
        };
        match self.map_points.get_mut(&mp_id) {
            Some(mp) if !mp.is_bad => mp.add_observation(kf_id, slot, right),
            _ => return false,
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(slot, mp_id);
        }
        true
    }

    /// Unbind one feature slot from its landmark.
    ///
    /// Dropping to two or fewer observing slots marks the landmark bad: a
    /// landmark that cannot be re-triangulated carries no information.
    pub fn erase_association(&mut self, kf_id: KeyFrameId, slot: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point_at(slot)?;
        let right = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.is_right_slot(slot))
            .unwrap_or(false);

        let mut make_bad = false;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if let Some(mut obs) = mp.erase_observation(kf_id) {
                // Keep the other rig side if it still observes the point.
                if right {
                    obs.right = None;
                } else {
                    obs.left = None;
                }
                if obs.count() > 0 {
                    if let Some(kept) = obs.left {
                        mp.add_observation(kf_id, kept, false);
                    }
                    if let Some(kept) = obs.right {
                        mp.add_observation(kf_id, kept, true);
                    }
                }
            }
            make_bad = !mp.is_bad && mp.observation_count() <= 2;
        }
        if make_bad {
            self.set_map_point_bad(mp_id);
        }
        Some(mp_id)
    }

    /// Mark a landmark bad and tear down its incident edges.
    pub fn set_map_point_bad(&mut self, mp_id: MapPointId) {
        let observations = match self.map_points.get_mut(&mp_id) {
            Some(mp) if !mp.is_bad => {
                mp.is_bad = true;
                mp.take_observations()
            }
            _ => return,
        };
        for (kf_id, obs) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if let Some(slot) = obs.left {
                    kf.erase_map_point_at(slot);
                }
                if let Some(slot) = obs.right {
                    kf.erase_map_point_at(slot);
                }
            }
        }
    }

    /// Merge the landmark `old` into `survivor`.
    ///
    /// Every observer of `old` is re-pointed at `survivor`; observers that
    /// already see `survivor` drop the duplicate slot instead. `old` becomes
    /// a tombstone forwarding to `survivor`.
    pub fn replace_map_point(&mut self, old_id: MapPointId, survivor_id: MapPointId) -> bool {
        if old_id == survivor_id {
            return false;
        }
        if !self
            .map_points
            .get(&survivor_id)
            .is_some_and(|mp| !mp.is_bad)
        {
            return false;
        }

        let (old_obs, visible, found) = match self.map_points.get_mut(&old_id) {
            Some(mp) if !mp.is_bad => {
                mp.is_bad = true;
                mp.replaced_by = Some(survivor_id);
                (mp.take_observations(), mp.visible, mp.found)
            }
            _ => return false,
        };

        for (kf_id, obs) in old_obs {
            let already = self
                .map_points
                .get(&survivor_id)
                .is_some_and(|mp| mp.observes(kf_id));

            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                continue;
            };
            if already {
                if let Some(slot) = obs.left {
                    kf.erase_map_point_at(slot);
                }
                if let Some(slot) = obs.right {
                    kf.erase_map_point_at(slot);
                }
            } else {
                if let Some(slot) = obs.left {
                    kf.set_map_point(slot, survivor_id);
                }
                if let Some(slot) = obs.right {
                    kf.set_map_point(slot, survivor_id);
                }
                if let Some(mp) = self.map_points.get_mut(&survivor_id) {
                    if let Some(slot) = obs.left {
                        mp.add_observation(kf_id, slot, false);
                    }
                    if let Some(slot) = obs.right {
                        mp.add_observation(kf_id, slot, true);
                    }
                }
            }
        }

        if let Some(mp) = self.map_points.get_mut(&survivor_id) {
            mp.increase_visible(visible);
            mp.increase_found(found);
        }
        self.compute_distinctive_descriptor(survivor_id);
        true
    }

    /// Mark a keyframe bad: tear down observations and covisibility edges,
    /// hand its spanning-tree children to its parent, and splice the
    /// temporal chain around it.
    ///
    /// Map origins refuse removal.
    pub fn set_keyframe_bad(&mut self, kf_id: KeyFrameId) {
        if self.origins.contains(&kf_id) {
            return;
        }
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        if kf.is_bad {
            return;
        }

        let slots: Vec<usize> = kf.map_point_slots().map(|(slot, _)| slot).collect();
        for slot in slots {
            self.erase_association(kf_id, slot);
        }

        let kf = self.keyframes.get_mut(&kf_id).unwrap();
        let neighbors: Vec<KeyFrameId> = kf.connections().keys().copied().collect();
        let parent = kf.parent_id;
        let children: Vec<KeyFrameId> = kf.children_ids.drain().collect();
        let prev = kf.prev_kf.take();
        let next = kf.next_kf.take();
        kf.set_connections(HashMap::new());
        kf.is_bad = true;

        for other in neighbors {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_connection(kf_id);
            }
        }

        if let Some(parent_id) = parent {
            for child in &children {
                if let Some(child_kf) = self.keyframes.get_mut(child) {
                    child_kf.set_parent(parent_id);
                }
            }
            if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                parent_kf.erase_child(kf_id);
                for child in &children {
                    parent_kf.add_child(*child);
                }
            }
        }

        if let Some(prev_id) = prev {
            if let Some(prev_kf) = self.keyframes.get_mut(&prev_id) {
                prev_kf.next_kf = next;
            }
        }
        if let Some(next_id) = next {
            if let Some(next_kf) = self.keyframes.get_mut(&next_id) {
                next_kf.prev_kf = prev;
            }
        }
        if self.last_keyframe_id == Some(kf_id) {
            self.last_keyframe_id = prev;
        }

        debug!(kf = %kf_id, "keyframe removed from graph");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility
    // ─────────────────────────────────────────────────────────────────────

    /// Recompute the covisibility neighborhood of `kf_id` from its landmark
    /// observations and mirror the weights on the neighbors.
    ///
    /// On a keyframe's first connection its spanning-tree parent becomes the
    /// top covisible.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        if kf.is_bad {
            return;
        }

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.map_point_slots() {
            let Some(mp) = self.map_points.get(&mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            for other in mp.observations().keys() {
                if *other == kf_id {
                    continue;
                }
                if self.keyframes.get(other).is_some_and(|o| !o.is_bad) {
                    *counter.entry(*other).or_insert(0) += 1;
                }
            }
        }

        if counter.is_empty() {
            return;
        }

        let stale: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| {
                kf.connections()
                    .keys()
                    .filter(|id| !counter.contains_key(id))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for other in stale {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_connection(kf_id);
            }
        }

        for (&other, &weight) in &counter {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.add_connection(kf_id, weight);
            }
        }

        let best = counter
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, _)| *id);

        let kf = self.keyframes.get_mut(&kf_id).unwrap();
        kf.set_connections(counter);
        let needs_parent = kf.take_first_connection() && !self.origins.contains(&kf_id);
        if needs_parent {
            if let Some(parent_id) = best {
                self.keyframes
                    .get_mut(&kf_id)
                    .unwrap()
                    .set_parent(parent_id);
                if let Some(parent) = self.keyframes.get_mut(&parent_id) {
                    parent.add_child(kf_id);
                }
            }
        }
    }

    /// Best covisible neighbors of `kf_id`, skipping bad entries.
    pub fn best_covisibles(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return Vec::new();
        };
        kf.covisibles_ordered()
            .into_iter()
            .filter(|id| self.keyframes.get(id).is_some_and(|kf| !kf.is_bad))
            .take(n)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Derived landmark state
    // ─────────────────────────────────────────────────────────────────────

    /// Median depth of the keyframe's landmarks in its camera frame.
    pub fn scene_median_depth(&self, kf_id: KeyFrameId, q: usize) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let tcw = kf.pose();
        let r = tcw.rotation_matrix();
        let rz = Vector3::new(r[(2, 0)], r[(2, 1)], r[(2, 2)]);
        let tz = tcw.translation.z;

        let mut depths: Vec<f64> = kf
            .map_point_slots()
            .filter_map(|(_, mp_id)| self.map_points.get(&mp_id))
            .filter(|mp| !mp.is_bad)
            .map(|mp| rz.dot(&mp.position()) + tz)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Some(depths[(depths.len() - 1) / q.max(1)])
    }

    /// Re-elect the landmark's representative descriptor: the observing
    /// descriptor with the least median distance to all the others.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) -> bool {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return false;
        };
        if mp.is_bad {
            return false;
        }

        let mut descriptors: Vec<Descriptor> = Vec::new();
        for (kf_id, obs) in mp.observations() {
            let Some(kf) = self.keyframes.get(kf_id) else {
                continue;
            };
            if kf.is_bad {
                continue;
            }
            if let Some(slot) = obs.left {
                descriptors.push(*kf.descriptor(slot));
            }
            if let Some(slot) = obs.right {
                descriptors.push(*kf.descriptor(slot));
            }
        }
        if descriptors.is_empty() {
            return false;
        }

        let mut best_median = u32::MAX;
        let mut best_idx = 0;
        for (i, di) in descriptors.iter().enumerate() {
            let mut dists: Vec<u32> = descriptors.iter().map(|dj| di.distance(dj)).collect();
            dists.sort_unstable();
            let median = dists[(dists.len() - 1) / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }

        let chosen = descriptors[best_idx];
        let mp = self.map_points.get_mut(&mp_id).unwrap();
        let changed = mp.descriptor != chosen;
        mp.descriptor = chosen;
        changed
    }

    /// Refresh the landmark's mean viewing direction and its
    /// scale-invariance distance band from the reference observation.
    pub fn update_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        if mp.is_bad {
            return;
        }
        let position = mp.position();
        let reference = mp.reference_kf;

        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        for (kf_id, obs) in mp.observations() {
            let Some(kf) = self.keyframes.get(kf_id) else {
                continue;
            };
            if obs.left.is_some() {
                let dir = position - kf.camera_center();
                if dir.norm() > 1e-12 {
                    normal_sum += dir / dir.norm();
                    n += 1;
                }
            }
            if obs.right.is_some() {
                if let Some(center) = kf.right_camera_center() {
                    let dir = position - center;
                    if dir.norm() > 1e-12 {
                        normal_sum += dir / dir.norm();
                        n += 1;
                    }
                }
            }
        }

        let band = self.map_points.get(&mp_id).and_then(|mp| {
            let kf = self.keyframes.get(&reference)?;
            let obs = mp.observation(reference)?;
            let slot = obs.left.or(obs.right)?;
            let dist = (position - kf.center_for_slot(slot)).norm();
            let level = kf.octave(slot);
            let max_distance = dist * kf.pyramid.scale(level);
            let min_distance = max_distance / kf.pyramid.scale_range();
            Some((min_distance, max_distance))
        });

        let mp = self.map_points.get_mut(&mp_id).unwrap();
        if n > 0 {
            mp.normal = normal_sum / n as f64;
        }
        if let Some((min_distance, max_distance)) = band {
            mp.min_distance = min_distance;
            mp.max_distance = max_distance;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Global similarity
    // ─────────────────────────────────────────────────────────────────────

    /// Apply a scaled rigid transform to the whole map.
    ///
    /// `t_yw` maps the old world frame into the new one; `s` rescales
    /// translations and landmark positions. Velocities are rotated, and also
    /// rescaled when `scaled_vel` is set.
    pub fn apply_scaled_rotation(&mut self, t_yw: &SE3, s: f64, scaled_vel: bool) {
        let r_yw = t_yw.rotation;
        let t_trans = t_yw.translation;

        for kf in self.keyframes.values_mut() {
            let mut twc = kf.pose_inverse();
            twc.translation *= s;
            let tyc = t_yw.compose(&twc);
            kf.set_pose(tyc.inverse());

            let vel = r_yw * kf.velocity;
            kf.velocity = if scaled_vel { vel * s } else { vel };
        }

        let mp_ids: Vec<MapPointId> = self.map_points.keys().copied().collect();
        for mp_id in &mp_ids {
            let mp = self.map_points.get_mut(mp_id).unwrap();
            let pos = s * (r_yw * mp.position()) + t_trans;
            mp.set_position(pos);
        }
        for mp_id in mp_ids {
            self.update_normal_and_depth(mp_id);
        }
        self.change_index += 1;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("keyframes", &self.num_keyframes())
            .field("map_points", &self.num_map_points())
            .field("imu_initialized", &self.imu_initialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::features::{Descriptor, KeyPoint, ScalePyramid};
    use crate::system::messages::KeyFrameData;
    use nalgebra::UnitQuaternion;
    use std::sync::Arc;

    fn insert_kf(map: &mut Map, ts: f64, n_features: usize) -> KeyFrameId {
        let camera = Arc::new(CameraModel::pinhole(500.0, 500.0, 320.0, 240.0));
        let mut data = KeyFrameData::new(ts, SE3::identity(), camera, ScalePyramid::standard());
        for i in 0..n_features {
            data.push_feature(
                KeyPoint::new(5.0 * i as f64, 5.0, 0),
                Descriptor::zeros(),
                -1.0,
                -1.0,
            );
        }
        map.create_keyframe(data)
    }

    fn observe(map: &mut Map, kf: KeyFrameId, slot: usize, mp: MapPointId) {
        assert!(map.associate(kf, slot, mp));
    }

    #[test]
    fn test_temporal_chain_monotone() {
        let mut map = Map::new();
        let a = insert_kf(&mut map, 0.0, 0);
        let b = insert_kf(&mut map, 0.5, 0);
        let c = insert_kf(&mut map, 1.0, 0);

        let chain = map.temporal_chain(c);
        assert_eq!(chain, vec![a, b, c]);
        for pair in chain.windows(2) {
            let kf0 = map.keyframe(pair[0]).unwrap();
            let kf1 = map.keyframe(pair[1]).unwrap();
            assert!(kf0.id < kf1.id);
            assert!(kf0.timestamp < kf1.timestamp);
        }
        assert_eq!(map.origins(), &[a]);
    }

    #[test]
    fn test_update_connections_matches_intersections() {
        let mut map = Map::new();
        let a = insert_kf(&mut map, 0.0, 8);
        let b = insert_kf(&mut map, 0.5, 8);
        let c = insert_kf(&mut map, 1.0, 8);

        // a and b share 3 points, a and c share 1.
        for slot in 0..3 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), Descriptor::zeros(), a);
            observe(&mut map, a, slot, mp);
            observe(&mut map, b, slot, mp);
        }
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), Descriptor::zeros(), a);
        observe(&mut map, a, 3, mp);
        observe(&mut map, c, 3, mp);

        map.update_connections(a);
        let kf_a = map.keyframe(a).unwrap();
        assert_eq!(kf_a.connection_weight(b), 3);
        assert_eq!(kf_a.connection_weight(c), 1);
        // Weights are mirrored on the neighbors.
        assert_eq!(map.keyframe(b).unwrap().connection_weight(a), 3);
        assert_eq!(map.keyframe(c).unwrap().connection_weight(a), 1);
        assert_eq!(map.best_covisibles(a, 1), vec![b]);
    }

    #[test]
    fn test_spanning_tree_parent_from_first_connection() {
        let mut map = Map::new();
        let a = insert_kf(&mut map, 0.0, 4);
        let b = insert_kf(&mut map, 0.5, 4);

        for slot in 0..3 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), Descriptor::zeros(), a);
            observe(&mut map, a, slot, mp);
            observe(&mut map, b, slot, mp);
        }
        map.update_connections(b);

        let kf_b = map.keyframe(b).unwrap();
        assert_eq!(kf_b.parent_id, Some(a));
        assert!(map.keyframe(a).unwrap().children_ids.contains(&b));
        // Origins never get a parent.
        map.update_connections(a);
        assert_eq!(map.keyframe(a).unwrap().parent_id, None);
    }

    #[test]
    fn test_replace_map_point_semantics() {
        let mut map = Map::new();
        let kfs: Vec<KeyFrameId> = (0..5).map(|i| insert_kf(&mut map, i as f64, 6)).collect();

        let survivor = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), Descriptor::zeros(), kfs[0]);
        let loser = map.create_map_point(Vector3::new(0.0, 0.1, 4.0), Descriptor::zeros(), kfs[3]);

        // Survivor seen by kfs 0..3 at slot 0; loser by kfs 3..5 at slot 1.
        for &kf in &kfs[..3] {
            observe(&mut map, kf, 0, survivor);
        }
        for &kf in &kfs[3..] {
            observe(&mut map, kf, 1, loser);
        }
        // Shared observer: kf 3 also sees the survivor.
        observe(&mut map, kfs[3], 0, survivor);

        assert!(map.replace_map_point(loser, survivor));

        let old = map.map_point(loser).unwrap();
        assert!(old.is_bad);
        assert_eq!(old.replaced_by, Some(survivor));

        let kept = map.map_point(survivor).unwrap();
        // kfs[0..4] already counted, kfs[4] re-pointed; the duplicate in
        // kfs[3] is dropped rather than double-counted.
        assert_eq!(kept.observer_count(), 5);
        assert_eq!(map.keyframe(kfs[4]).unwrap().map_point(1), Some(survivor));
        assert_eq!(map.keyframe(kfs[3]).unwrap().map_point(1), None);
        assert_eq!(map.resolve_replaced(loser), Some(survivor));
    }

    #[test]
    fn test_replace_is_terminal() {
        let mut map = Map::new();
        let kf = insert_kf(&mut map, 0.0, 4);
        let a = map.create_map_point(Vector3::zeros(), Descriptor::zeros(), kf);
        let b = map.create_map_point(Vector3::zeros(), Descriptor::zeros(), kf);
        observe(&mut map, kf, 0, a);
        assert!(map.replace_map_point(a, b));
        // A tombstone cannot win or lose another fusion.
        assert!(!map.replace_map_point(a, b));
        assert!(!map.replace_map_point(b, a));
    }

    #[test]
    fn test_set_keyframe_bad_reparents_children() {
        let mut map = Map::new();
        let a = insert_kf(&mut map, 0.0, 8);
        let b = insert_kf(&mut map, 0.5, 8);
        let c = insert_kf(&mut map, 1.0, 8);

        for slot in 0..4 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), Descriptor::zeros(), a);
            observe(&mut map, a, slot, mp);
            observe(&mut map, b, slot, mp);
            observe(&mut map, c, slot, mp);
        }
        map.update_connections(b);
        map.update_connections(c);
        assert_eq!(map.keyframe(b).unwrap().parent_id, Some(a));
        assert_eq!(map.keyframe(c).unwrap().parent_id, Some(b));

        map.set_keyframe_bad(b);

        let kf_b = map.keyframe(b).unwrap();
        assert!(kf_b.is_bad);
        assert!(kf_b.connections().is_empty());
        assert_eq!(kf_b.num_tracked_points(), 0);
        // c adopted b's parent.
        assert_eq!(map.keyframe(c).unwrap().parent_id, Some(a));
        assert!(map.keyframe(a).unwrap().children_ids.contains(&c));
        // No surviving keyframe still holds an edge to b.
        for kf in map.keyframes() {
            assert_eq!(kf.connection_weight(b), 0);
        }
        // Temporal chain spliced around b.
        assert_eq!(map.keyframe(a).unwrap().next_kf, Some(c));
        assert_eq!(map.keyframe(c).unwrap().prev_kf, Some(a));
    }

    #[test]
    fn test_origin_refuses_removal() {
        let mut map = Map::new();
        let a = insert_kf(&mut map, 0.0, 0);
        map.set_keyframe_bad(a);
        assert!(!map.keyframe(a).unwrap().is_bad);
    }

    #[test]
    fn test_erase_association_decays_to_bad() {
        let mut map = Map::new();
        let kfs: Vec<KeyFrameId> = (0..3).map(|i| insert_kf(&mut map, i as f64, 4)).collect();
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), Descriptor::zeros(), kfs[0]);
        for &kf in &kfs {
            observe(&mut map, kf, 0, mp);
        }

        map.erase_association(kfs[0], 0);
        // Two slots left: the landmark is no longer worth keeping.
        assert!(map.map_point(mp).unwrap().is_bad);
        for &kf in &kfs[1..] {
            assert_eq!(map.keyframe(kf).unwrap().map_point(0), None);
        }
    }

    #[test]
    fn test_scene_median_depth() {
        let mut map = Map::new();
        let kf = insert_kf(&mut map, 0.0, 8);
        for (slot, z) in [4.0, 8.0, 12.0, 16.0, 20.0].iter().enumerate() {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, *z), Descriptor::zeros(), kf);
            observe(&mut map, kf, slot, mp);
        }
        // Median with q = 2 picks depths[(5-1)/2] = 12.
        assert_eq!(map.scene_median_depth(kf, 2), Some(12.0));
        let empty = insert_kf(&mut map, 1.0, 0);
        assert_eq!(map.scene_median_depth(empty, 2), None);
    }

    #[test]
    fn test_apply_scaled_rotation_roundtrip() {
        let mut map = Map::new();
        let camera = Arc::new(CameraModel::pinhole(500.0, 500.0, 320.0, 240.0));
        let mut data = KeyFrameData::new(
            0.0,
            SE3::new(
                UnitQuaternion::from_euler_angles(0.05, -0.1, 0.2),
                Vector3::new(0.3, -0.4, 1.0),
            ),
            camera,
            ScalePyramid::standard(),
        );
        data.push_feature(KeyPoint::new(10.0, 10.0, 0), Descriptor::zeros(), -1.0, -1.0);
        let kf = map.create_keyframe(data);
        let mp = map.create_map_point(Vector3::new(1.0, -2.0, 7.0), Descriptor::zeros(), kf);
        map.associate(kf, 0, mp);

        let pose_before = map.keyframe(kf).unwrap().pose();
        let pos_before = map.map_point(mp).unwrap().position();

        let rot = UnitQuaternion::from_euler_angles(0.1, 0.2, -0.3);
        let s = 2.5;
        map.apply_scaled_rotation(&SE3::new(rot, Vector3::zeros()), s, true);
        map.apply_scaled_rotation(&SE3::new(rot.inverse(), Vector3::zeros()), 1.0 / s, true);

        let pose_after = map.keyframe(kf).unwrap().pose();
        let pos_after = map.map_point(mp).unwrap().position();
        assert!((pose_after.translation - pose_before.translation).norm() < 1e-5);
        assert!(pose_after.rotation.angle_to(&pose_before.rotation) < 1e-5);
        assert!((pos_after - pos_before).norm() < 1e-5);
    }

    #[test]
    fn test_distinctive_descriptor_is_median_central() {
        let mut map = Map::new();
        let camera = Arc::new(CameraModel::pinhole(500.0, 500.0, 320.0, 240.0));

        // Three keyframes observing one point with different descriptors:
        // two identical, one far away. The central one must win.
        let mut mk = |ts: f64, desc: Descriptor| {
            let mut data =
                KeyFrameData::new(ts, SE3::identity(), camera.clone(), ScalePyramid::standard());
            data.push_feature(KeyPoint::new(0.0, 0.0, 0), desc, -1.0, -1.0);
            map.create_keyframe(data)
        };
        let near = Descriptor::zeros();
        let mut far = Descriptor::zeros();
        far.0.iter_mut().for_each(|b| *b = 0xFF);

        let a = mk(0.0, near);
        let b = mk(1.0, near);
        let c = mk(2.0, far);

        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 5.0), far, a);
        map.associate(a, 0, mp);
        map.associate(b, 0, mp);
        map.associate(c, 0, mp);

        map.compute_distinctive_descriptor(mp);
        assert_eq!(map.map_point(mp).unwrap().descriptor, near);
    }

    #[test]
    fn test_update_normal_and_depth_uses_reference() {
        let mut map = Map::new();
        let kf = insert_kf(&mut map, 0.0, 2);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 10.0), Descriptor::zeros(), kf);
        map.associate(kf, 0, mp);
        map.update_normal_and_depth(mp);

        let mp = map.map_point(mp).unwrap();
        // Observation at level 0, distance 10: max = 10, min = 10 / 1.2^7.
        assert!((mp.max_distance - 10.0).abs() < 1e-9);
        assert!((mp.min_distance - 10.0 / 1.2f64.powi(7)).abs() < 1e-9);
        assert!((mp.normal - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-9);
    }
}

//! MapPoint: a 3D landmark observed by one or more keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::features::Descriptor;

use super::types::{KeyFrameId, MapPointId};

/// Feature slots of one keyframe observing a landmark.
///
/// Either side may be absent; a stereo rig can see the same landmark with
/// both its cameras.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl Observation {
    pub fn count(&self) -> usize {
        self.left.is_some() as usize + self.right.is_some() as usize
    }
}

/// A 3D landmark.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,
    position: Vector3<f64>,

    /// Mean viewing direction (unit, world frame).
    pub normal: Vector3<f64>,

    /// Representative descriptor: the observing descriptor with the smallest
    /// median Hamming distance to all the others.
    pub descriptor: Descriptor,

    /// Observing keyframes and the feature slots that see this landmark.
    observations: HashMap<KeyFrameId, Observation>,

    /// Scale-invariance distance band derived from the reference
    /// observation's pyramid level.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Times the tracker predicted this landmark in view.
    pub visible: u32,
    /// Times the tracker actually matched it.
    pub found: u32,

    /// Keyframe this landmark was created from.
    pub first_kf_id: KeyFrameId,
    /// Reference keyframe; observes this landmark unless the landmark is bad.
    pub reference_kf: KeyFrameId,

    pub is_bad: bool,
    /// Forwarding pointer left behind when this landmark lost a fusion.
    pub replaced_by: Option<MapPointId>,

    /// Fusion dedup mark: last keyframe this point was a fuse candidate for.
    pub fuse_candidate_for_kf: Option<KeyFrameId>,
    /// Generation mark of the last global BA that optimized this landmark.
    pub ba_global_for_kf: Option<KeyFrameId>,
    /// Position written by a global BA, committed during propagation.
    pub pos_gba: Option<Vector3<f64>>,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            normal: Vector3::zeros(),
            descriptor,
            observations: HashMap::new(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible: 1,
            found: 1,
            first_kf_id,
            reference_kf: first_kf_id,
            is_bad: false,
            replaced_by: None,
            fuse_candidate_for_kf: None,
            ba_global_for_kf: None,
            pos_gba: None,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    pub fn set_position(&mut self, position: Vector3<f64>) {
        self.position = position;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observations
    // ─────────────────────────────────────────────────────────────────────

    /// Record that `kf_id` observes this landmark at the given slot.
    ///
    /// `right` selects the rig side; observations are append-only per
    /// (keyframe, side) and re-adding the same side overwrites the slot.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, slot: usize, right: bool) {
        let entry = self.observations.entry(kf_id).or_default();
        if right {
            entry.right = Some(slot);
        } else {
            entry.left = Some(slot);
        }
    }

    /// Remove every slot of `kf_id`; returns the removed entry.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> Option<Observation> {
        let obs = self.observations.remove(&kf_id)?;
        if self.reference_kf == kf_id {
            if let Some(next) = self.observations.keys().min() {
                self.reference_kf = *next;
            }
        }
        Some(obs)
    }

    pub fn observation(&self, kf_id: KeyFrameId) -> Option<Observation> {
        self.observations.get(&kf_id).copied()
    }

    pub fn observes(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    pub fn observations(&self) -> &HashMap<KeyFrameId, Observation> {
        &self.observations
    }

    pub fn take_observations(&mut self) -> HashMap<KeyFrameId, Observation> {
        std::mem::take(&mut self.observations)
    }

    /// Number of feature slots observing this landmark.
    pub fn observation_count(&self) -> usize {
        self.observations.values().map(|o| o.count()).sum()
    }

    /// Number of distinct keyframes observing this landmark.
    pub fn observer_count(&self) -> usize {
        self.observations.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tracking statistics
    // ─────────────────────────────────────────────────────────────────────

    pub fn increase_visible(&mut self, n: u32) {
        self.visible += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found += n;
    }

    pub fn found_ratio(&self) -> f64 {
        if self.visible == 0 {
            1.0
        } else {
            self.found as f64 / self.visible as f64
        }
    }

    /// Whether a viewing distance lies in the scale-invariance band.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_point() -> MapPoint {
        MapPoint::new(
            MapPointId(1),
            Vector3::new(1.0, 2.0, 3.0),
            Descriptor::zeros(),
            KeyFrameId(0),
        )
    }

    #[test]
    fn test_observation_slots() {
        let mut mp = test_point();
        mp.add_observation(KeyFrameId(1), 5, false);
        mp.add_observation(KeyFrameId(1), 12, true);
        mp.add_observation(KeyFrameId(2), 7, false);

        assert_eq!(mp.observer_count(), 2);
        assert_eq!(mp.observation_count(), 3);
        assert_eq!(
            mp.observation(KeyFrameId(1)),
            Some(Observation {
                left: Some(5),
                right: Some(12)
            })
        );

        let removed = mp.erase_observation(KeyFrameId(1)).unwrap();
        assert_eq!(removed.count(), 2);
        assert_eq!(mp.observation_count(), 1);
        assert!(mp.erase_observation(KeyFrameId(1)).is_none());
    }

    #[test]
    fn test_reference_moves_on_erase() {
        let mut mp = test_point();
        mp.add_observation(KeyFrameId(0), 0, false);
        mp.add_observation(KeyFrameId(4), 1, false);
        assert_eq!(mp.reference_kf, KeyFrameId(0));

        mp.erase_observation(KeyFrameId(0));
        assert_eq!(mp.reference_kf, KeyFrameId(4));
    }

    #[test]
    fn test_found_ratio() {
        let mut mp = test_point();
        mp.visible = 0;
        mp.found = 0;
        assert_eq!(mp.found_ratio(), 1.0);

        mp.visible = 4;
        mp.found = 1;
        assert!((mp.found_ratio() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_distance_range() {
        let mut mp = test_point();
        mp.min_distance = 0.5;
        mp.max_distance = 10.0;
        assert!(mp.is_in_distance_range(5.0));
        assert!(!mp.is_in_distance_range(0.3));
        assert!(!mp.is_in_distance_range(15.0));
    }
}

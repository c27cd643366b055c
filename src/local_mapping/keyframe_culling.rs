//! Redundant keyframe removal.

use tracing::debug;

use crate::config::MappingConfig;
use crate::map::{KeyFrameId, Map};

/// Length of the optimizable temporal window walked back from the current
/// keyframe.
const ND: usize = 21;

/// A landmark counts as redundantly observed when at least this many other
/// keyframes see it at a compatible scale.
const MIN_OTHER_OBSERVERS: usize = 3;

/// Remove keyframes whose close landmarks are overwhelmingly observed
/// elsewhere at the same or finer pyramid scale.
///
/// Visual operation removes redundant keyframes outright. Inertial
/// operation instead keeps the temporal chain healthy: a candidate is only
/// dropped when its neighbors are close in time (or the map still awaits the
/// second inertial refinement and the keyframe barely moved), and its
/// preintegration is folded into its successor first.
///
/// Returns the number of keyframes removed.
pub fn keyframe_culling(
    map: &mut Map,
    current_id: KeyFrameId,
    config: &MappingConfig,
    abort_ba: bool,
) -> usize {
    let redundant_th = if !config.inertial || config.monocular {
        0.9
    } else {
        0.5
    };
    let imu_initialized = map.is_imu_initialized();

    if let Some(kf) = map.keyframe_mut(current_id) {
        kf.update_best_covisibles();
    }
    let local_kfs = map
        .keyframe(current_id)
        .map(|kf| kf.covisibles_ordered())
        .unwrap_or_default();

    // Last keyframe of the optimizable window: Nd hops back along `prev`.
    let last_window_id = if config.inertial {
        let mut aux = current_id;
        let mut hops = 0;
        while hops < ND {
            match map.keyframe(aux).and_then(|kf| kf.prev_kf) {
                Some(prev) => {
                    aux = prev;
                    hops += 1;
                }
                None => break,
            }
        }
        Some(aux)
    } else {
        None
    };

    let origin = map.origin_id();
    let mut culled = 0usize;
    let mut visited = 0usize;

    for kf_id in local_kfs {
        visited += 1;
        if Some(kf_id) == origin {
            continue;
        }
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        if kf.is_bad {
            continue;
        }

        if is_redundant(map, kf_id, config, redundant_th) {
            if config.inertial {
                if map.num_keyframes() <= ND {
                    continue;
                }
                // The last two keyframes stay regardless.
                if kf_id.0 + 2 > current_id.0 {
                    continue;
                }
                let kf = map.keyframe(kf_id).unwrap();
                if let (Some(prev_id), Some(next_id)) = (kf.prev_kf, kf.next_kf) {
                    let (Some(prev), Some(next)) =
                        (map.keyframe(prev_id), map.keyframe(next_id))
                    else {
                        continue;
                    };
                    let gap = next.timestamp - prev.timestamp;
                    let in_window =
                        imu_initialized && kf_id < last_window_id.unwrap_or(kf_id) && gap < 3.0;
                    let barely_moved = !map.is_inertial_ba2_done()
                        && (kf.imu_position() - prev.imu_position()).norm() < 0.02
                        && gap < 3.0;
                    if in_window || gap < 0.5 || barely_moved {
                        drop_with_preintegration_merge(map, kf_id, next_id);
                        culled += 1;
                    }
                }
            } else {
                map.set_keyframe_bad(kf_id);
                culled += 1;
            }
        }

        if (culled > 20 && abort_ba) || visited > 100 {
            break;
        }
    }

    if culled > 0 {
        debug!(current = %current_id, culled, visited, "keyframe culling pass");
    }
    culled
}

/// A keyframe is redundant when at least `redundant_th` of its close
/// landmarks are seen by enough other keyframes at a pyramid level no
/// coarser than one above its own observation.
fn is_redundant(
    map: &Map,
    kf_id: KeyFrameId,
    config: &MappingConfig,
    redundant_th: f64,
) -> bool {
    let Some(kf) = map.keyframe(kf_id) else {
        return false;
    };

    let mut n_points = 0usize;
    let mut n_redundant = 0usize;

    for (slot, mp_id) in kf.map_point_slots() {
        let Some(mp) = map.map_point(mp_id) else {
            continue;
        };
        if mp.is_bad {
            continue;
        }
        // Depth-gate stereo rigs to close points; right-camera slots carry
        // no depth and are skipped with them.
        if !config.monocular {
            if kf.is_right_slot(slot) {
                continue;
            }
            match kf.stereo_depth(slot) {
                Some(depth) if depth <= kf.th_depth => {}
                _ => continue,
            }
        }

        n_points += 1;
        if mp.observer_count() <= MIN_OTHER_OBSERVERS {
            continue;
        }
        let scale_level = kf.octave(slot);

        let mut others = 0usize;
        for (other_id, obs) in mp.observations() {
            if *other_id == kf_id {
                continue;
            }
            let Some(other) = map.keyframe(*other_id) else {
                continue;
            };
            // The finer of the observing slots decides the level.
            let mut level = i32::MAX;
            if let Some(s) = obs.left {
                level = level.min(other.octave(s));
            }
            if let Some(s) = obs.right {
                level = level.min(other.octave(s));
            }
            if level <= scale_level + 1 {
                others += 1;
                if others >= MIN_OTHER_OBSERVERS {
                    break;
                }
            }
        }
        if others >= MIN_OTHER_OBSERVERS {
            n_redundant += 1;
        }
    }

    n_points > 0 && (n_redundant as f64) > redundant_th * (n_points as f64)
}

/// Fold the keyframe's preintegration into its successor, splice the
/// temporal chain, and drop the keyframe from the graph.
fn drop_with_preintegration_merge(map: &mut Map, kf_id: KeyFrameId, next_id: KeyFrameId) {
    let preint = map
        .keyframe(kf_id)
        .and_then(|kf| kf.imu_preintegrated.clone());
    if let Some(preint) = preint {
        if let Some(next) = map.keyframe_mut(next_id) {
            if let Some(next_preint) = next.imu_preintegrated.as_mut() {
                next_preint.merge_previous(&preint);
            }
        }
    }
    map.set_keyframe_bad(kf_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use crate::features::{Descriptor, KeyPoint, ScalePyramid};
    use crate::geometry::SE3;
    use crate::imu::Preintegrated;
    use crate::system::messages::KeyFrameData;
    use nalgebra::{UnitQuaternion, Vector3};
    use std::sync::Arc;

    fn camera() -> Arc<CameraModel> {
        Arc::new(CameraModel::pinhole(500.0, 500.0, 320.0, 240.0))
    }

    fn insert_kf(map: &mut Map, ts: f64, center: Vector3<f64>, n_features: usize) -> KeyFrameId {
        let tcw = SE3::new(UnitQuaternion::identity(), -center);
        let mut data = KeyFrameData::new(ts, tcw, camera(), ScalePyramid::standard());
        for i in 0..n_features {
            data.push_feature(
                KeyPoint::new(3.0 * i as f64, 5.0, 0),
                Descriptor::zeros(),
                -1.0,
                -1.0,
            );
        }
        map.create_keyframe(data)
    }

    /// Five keyframes all observing the same `n` landmarks: every keyframe
    /// beyond the origin is redundant in visual mode.
    fn redundant_scene(map: &mut Map, n: usize) -> Vec<KeyFrameId> {
        let kfs: Vec<KeyFrameId> = (0..5)
            .map(|i| insert_kf(map, i as f64 * 0.25, Vector3::new(0.05 * i as f64, 0.0, 0.0), n))
            .collect();
        for slot in 0..n {
            let mp = map.create_map_point(
                Vector3::new(slot as f64 * 0.1, 0.0, 8.0),
                Descriptor::zeros(),
                kfs[0],
            );
            for &kf in &kfs {
                map.associate(kf, slot, mp);
            }
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }
        kfs
    }

    #[test]
    fn test_visual_redundant_keyframe_removed() {
        let mut map = Map::new();
        let kfs = redundant_scene(&mut map, 20);
        let current = *kfs.last().unwrap();

        let culled = keyframe_culling(&mut map, current, &MappingConfig::monocular(), false);
        assert!(culled > 0);

        // The current keyframe and the origin survive.
        assert!(!map.keyframe(kfs[0]).unwrap().is_bad);
        assert!(!map.keyframe(current).unwrap().is_bad);

        // Every surviving keyframe's edges point only at survivors, and the
        // spanning tree still reaches the origin.
        let removed: Vec<KeyFrameId> = kfs
            .iter()
            .copied()
            .filter(|id| map.keyframe(*id).unwrap().is_bad)
            .collect();
        assert!(!removed.is_empty());
        for kf in map.keyframes() {
            for dead in &removed {
                assert_eq!(kf.connection_weight(*dead), 0);
            }
            let mut cursor = kf.id;
            let mut steps = 0;
            while let Some(parent) = map.keyframe(cursor).unwrap().parent_id {
                cursor = parent;
                steps += 1;
                assert!(steps < 100, "parent chain must terminate");
            }
            assert_eq!(cursor, kfs[0]);
        }
    }

    #[test]
    fn test_partial_redundancy_kept() {
        // Landmarks seen by only two keyframes are not redundant; with a
        // low shared fraction the keyframe stays.
        let mut map = Map::new();
        let a = insert_kf(&mut map, 0.0, Vector3::zeros(), 10);
        let b = insert_kf(&mut map, 0.25, Vector3::new(0.05, 0.0, 0.0), 10);
        for slot in 0..10 {
            let mp = map.create_map_point(
                Vector3::new(slot as f64 * 0.1, 0.0, 8.0),
                Descriptor::zeros(),
                a,
            );
            map.associate(a, slot, mp);
            map.associate(b, slot, mp);
        }
        map.update_connections(a);
        map.update_connections(b);

        let culled = keyframe_culling(&mut map, b, &MappingConfig::monocular(), false);
        assert_eq!(culled, 0);
        assert!(!map.keyframe(a).unwrap().is_bad);
    }

    fn inertial_config() -> MappingConfig {
        MappingConfig::stereo().with_imu()
    }

    /// Build an inertial chain of `n` keyframes all sharing landmarks, with
    /// preintegrations between consecutive keyframes.
    fn inertial_scene(map: &mut Map, n: usize, dt: f64) -> Vec<KeyFrameId> {
        let mut kfs = Vec::new();
        for i in 0..n {
            let tcw = SE3::new(
                UnitQuaternion::identity(),
                -Vector3::new(0.05 * i as f64, 0.0, 0.0),
            );
            let mut data = KeyFrameData::new(i as f64 * dt, tcw, camera(), ScalePyramid::standard());
            data.stereo_baseline = 0.1;
            data.bf = 50.0;
            data.th_depth = 40.0;
            for f in 0..12 {
                let kp = KeyPoint::new(3.0 * f as f64, 5.0, 0);
                data.push_feature(kp, Descriptor::zeros(), 10.0, 8.0);
            }
            if i > 0 {
                let mut preint = Preintegrated::identity();
                preint.dt = dt;
                data.imu_preintegrated = Some(preint);
            }
            kfs.push(map.create_keyframe(data));
        }
        for slot in 0..12 {
            let mp = map.create_map_point(
                Vector3::new(slot as f64 * 0.1, 0.0, 8.0),
                Descriptor::zeros(),
                kfs[0],
            );
            for &kf in &kfs {
                map.associate(kf, slot, mp);
            }
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }
        kfs
    }

    #[test]
    fn test_inertial_keeps_recent_keyframes() {
        let mut map = Map::new();
        let kfs = inertial_scene(&mut map, 25, 0.1);
        map.set_imu_initialized();
        let current = *kfs.last().unwrap();

        keyframe_culling(&mut map, current, &inertial_config(), false);

        // No keyframe newer than current - 2 may be removed.
        for &kf_id in &kfs {
            if kf_id.0 + 2 > current.0 {
                assert!(!map.keyframe(kf_id).unwrap().is_bad);
            }
        }
    }

    #[test]
    fn test_inertial_merges_preintegration_into_next() {
        let mut map = Map::new();
        // 0.1 s gaps: well under the 0.5 s unconditional-merge bound.
        let kfs = inertial_scene(&mut map, 25, 0.1);
        map.set_imu_initialized();
        let current = *kfs.last().unwrap();

        let culled = keyframe_culling(&mut map, current, &inertial_config(), false);
        assert!(culled > 0);

        // Every removed keyframe's motion was folded into a survivor: the
        // chain's total preintegrated time is preserved.
        let chain = map.temporal_chain(current);
        let total: f64 = chain
            .iter()
            .filter_map(|id| map.keyframe(*id).unwrap().imu_preintegrated.as_ref())
            .map(|p| p.dt)
            .sum();
        let expected = 0.1 * (kfs.len() - 1) as f64;
        assert!((total - expected).abs() < 1e-9);

        // The chain is still monotone in id and timestamp.
        for pair in chain.windows(2) {
            let a = map.keyframe(pair[0]).unwrap();
            let b = map.keyframe(pair[1]).unwrap();
            assert!(a.id < b.id && a.timestamp < b.timestamp);
        }
    }

    #[test]
    fn test_inertial_small_map_untouched() {
        let mut map = Map::new();
        let kfs = inertial_scene(&mut map, 10, 0.1);
        map.set_imu_initialized();
        let current = *kfs.last().unwrap();

        // Fewer keyframes than the optimizable window: nothing is culled.
        let culled = keyframe_culling(&mut map, current, &inertial_config(), false);
        assert_eq!(culled, 0);
    }

    #[test]
    fn test_redundancy_requires_close_depth_for_stereo() {
        let mut map = Map::new();
        // Stereo features with depth beyond th_depth are not counted, so
        // the keyframe cannot become redundant.
        let mut kfs = Vec::new();
        for i in 0..5 {
            let tcw = SE3::new(
                UnitQuaternion::identity(),
                -Vector3::new(0.05 * i as f64, 0.0, 0.0),
            );
            let mut data =
                KeyFrameData::new(i as f64 * 0.25, tcw, camera(), ScalePyramid::standard());
            data.th_depth = 40.0;
            for f in 0..10 {
                // Depth 80: far beyond the close-point bound.
                data.push_feature(
                    KeyPoint::new(3.0 * f as f64, 5.0, 0),
                    Descriptor::zeros(),
                    10.0,
                    80.0,
                );
            }
            kfs.push(map.create_keyframe(data));
        }
        for slot in 0..10 {
            let mp = map.create_map_point(
                Vector3::new(slot as f64 * 0.1, 0.0, 80.0),
                Descriptor::zeros(),
                kfs[0],
            );
            for &kf in &kfs {
                map.associate(kf, slot, mp);
            }
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }

        let culled = keyframe_culling(
            &mut map,
            *kfs.last().unwrap(),
            &MappingConfig::stereo(),
            false,
        );
        assert_eq!(culled, 0);
    }

    #[test]
    fn test_probation_survivor_not_double_counted() {
        // A landmark with exactly three observers in total has at most two
        // other observers per keyframe, below the redundancy bar.
        let mut map = Map::new();
        let kfs: Vec<KeyFrameId> = (0..3)
            .map(|i| insert_kf(&mut map, i as f64 * 0.25, Vector3::new(0.05 * i as f64, 0.0, 0.0), 6))
            .collect();
        for slot in 0..6 {
            let mp = map.create_map_point(
                Vector3::new(slot as f64 * 0.1, 0.0, 8.0),
                Descriptor::zeros(),
                kfs[0],
            );
            for &kf in &kfs {
                map.associate(kf, slot, mp);
            }
        }
        for &kf in &kfs {
            map.update_connections(kf);
        }

        assert!(!is_redundant(&map, kfs[1], &MappingConfig::monocular(), 0.9));
    }
}

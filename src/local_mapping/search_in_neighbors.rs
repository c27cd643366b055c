//! Two-way landmark fusion across the covisibility neighborhood.

use tracing::trace;

use crate::config::MappingConfig;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matcher::{fuse, FuseStats};

/// First-order neighbors considered for fusion.
const NN_MONO: usize = 30;
const NN_STEREO: usize = 10;

/// Second-order neighbors pulled in per first-order neighbor.
const NN_SECOND_ORDER: usize = 20;

/// Minimum target-set size for inertial rigs, padded temporally.
const MIN_TARGETS_INERTIAL: usize = 20;

/// Fuse duplicate landmarks between the current keyframe and its first- and
/// second-order covisible neighborhood (temporally padded when inertial).
///
/// Runs a forward pass (current keyframe's landmarks projected into each
/// target) and a backward pass (the union of the targets' landmarks
/// projected into the current keyframe), then refreshes the affected
/// landmark descriptors, normals and the covisibility edges. When `abort`
/// reports queued work the pass winds down after the current target.
pub fn search_in_neighbors(
    map: &mut Map,
    current_id: KeyFrameId,
    config: &MappingConfig,
    abort: &dyn Fn() -> bool,
) -> FuseStats {
    let mut stats = FuseStats::default();
    let nn = if config.monocular { NN_MONO } else { NN_STEREO };

    // First-order targets, deduplicated by the per-keyframe fusion mark.
    let mut targets: Vec<KeyFrameId> = Vec::new();
    for id in map.best_covisibles(current_id, nn) {
        if mark_fuse_target(map, id, current_id) {
            targets.push(id);
        }
    }

    // Second-order extension.
    let first_order = targets.len();
    for i in 0..first_order {
        for id in map.best_covisibles(targets[i], NN_SECOND_ORDER) {
            if id == current_id {
                continue;
            }
            if mark_fuse_target(map, id, current_id) {
                targets.push(id);
            }
        }
        if abort() {
            break;
        }
    }

    // Temporal padding for inertial rigs.
    if config.inertial {
        let mut cursor = map.keyframe(current_id).and_then(|kf| kf.prev_kf);
        while targets.len() < MIN_TARGETS_INERTIAL {
            let Some(id) = cursor else {
                break;
            };
            if mark_fuse_target(map, id, current_id) {
                targets.push(id);
            }
            cursor = map.keyframe(id).and_then(|kf| kf.prev_kf);
        }
    }

    if targets.is_empty() {
        return stats;
    }

    // Forward pass: current keyframe's landmarks into every target.
    let current_points: Vec<MapPointId> = map
        .keyframe(current_id)
        .map(|kf| kf.map_point_slots().map(|(_, mp)| mp).collect())
        .unwrap_or_default();

    for &target in &targets {
        stats.absorb(fuse(map, target, &current_points, false));
        if map.keyframe(target).is_some_and(|kf| kf.has_right_camera()) {
            stats.absorb(fuse(map, target, &current_points, true));
        }
        if abort() {
            return stats;
        }
    }

    // Backward pass: the targets' landmark union into the current keyframe.
    let mut candidates: Vec<MapPointId> = Vec::new();
    for &target in &targets {
        let points: Vec<MapPointId> = map
            .keyframe(target)
            .map(|kf| kf.map_point_slots().map(|(_, mp)| mp).collect())
            .unwrap_or_default();
        for mp_id in points {
            let Some(mp) = map.map_point_mut(mp_id) else {
                continue;
            };
            if mp.is_bad || mp.fuse_candidate_for_kf == Some(current_id) {
                continue;
            }
            mp.fuse_candidate_for_kf = Some(current_id);
            candidates.push(mp_id);
        }
    }

    stats.absorb(fuse(map, current_id, &candidates, false));
    if map
        .keyframe(current_id)
        .is_some_and(|kf| kf.has_right_camera())
    {
        stats.absorb(fuse(map, current_id, &candidates, true));
    }

    // Refresh derived state of everything the current keyframe now sees.
    let touched: Vec<MapPointId> = map
        .keyframe(current_id)
        .map(|kf| kf.map_point_slots().map(|(_, mp)| mp).collect())
        .unwrap_or_default();
    for mp_id in touched {
        map.compute_distinctive_descriptor(mp_id);
        map.update_normal_and_depth(mp_id);
    }
    map.update_connections(current_id);

    trace!(
        current = %current_id,
        targets = targets.len(),
        fused = stats.replaced,
        added = stats.added,
        "neighborhood fusion pass"
    );
    stats
}

/// Mark a keyframe as a fusion target of `current`; false when it is bad,
/// already marked, or missing.
fn mark_fuse_target(map: &mut Map, id: KeyFrameId, current: KeyFrameId) -> bool {
    let Some(kf) = map.keyframe_mut(id) else {
        return false;
    };
    if kf.is_bad || kf.fuse_target_for_kf == Some(current) {
        return false;
    }
    kf.fuse_target_for_kf = Some(current);
    true
}

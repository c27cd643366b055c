//! Landmark creation by pairwise triangulation against covisible neighbors.

use std::collections::VecDeque;

use tracing::trace;

use crate::config::MappingConfig;
use crate::geometry::triangulate;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::matcher::search_for_triangulation;
use crate::system::TrackingState;

/// Neighbors considered for triangulation.
const NN_MONO: usize = 30;
const NN_STEREO: usize = 10;

/// Minimum baseline-to-scene-depth ratio for a monocular pair.
const MIN_BASELINE_DEPTH_RATIO: f64 = 0.01;

/// Parallax caps: pure-rotation pairs above these cosines cannot be
/// triangulated reliably.
const MAX_COS_PARALLAX_INERTIAL: f64 = 0.9996;
const MAX_COS_PARALLAX_VISUAL: f64 = 0.9998;

/// χ² reprojection gates (2 and 3 DOF).
const CHI2_MONO: f64 = 5.991;
const CHI2_STEREO: f64 = 7.815;

/// Triangulate new landmarks between the current keyframe and its best
/// covisible (and, when inertial, temporal) neighbors.
///
/// Cooperative: after the first neighbor the pass returns early as soon as
/// `has_new_keyframes` reports queued work, keeping the loop responsive.
/// Created landmarks enter `recent` for probation. Returns the number of
/// landmarks created.
pub fn create_new_map_points(
    map: &mut Map,
    current_id: KeyFrameId,
    config: &MappingConfig,
    tracker_state: TrackingState,
    has_new_keyframes: &dyn Fn() -> bool,
    recent: &mut VecDeque<MapPointId>,
) -> usize {
    let nn = if config.monocular { NN_MONO } else { NN_STEREO };
    let mut neighbors = map.best_covisibles(current_id, nn);

    // Inertial rigs pad sparse covisibility with the temporal chain.
    if config.inertial {
        let mut cursor = map.keyframe(current_id).and_then(|kf| kf.prev_kf);
        let mut padded = 0;
        while neighbors.len() <= nn && padded < nn {
            let Some(prev_id) = cursor else {
                break;
            };
            if !neighbors.contains(&prev_id) {
                neighbors.push(prev_id);
            }
            cursor = map.keyframe(prev_id).and_then(|kf| kf.prev_kf);
            padded += 1;
        }
    }

    let coarse = config.inertial
        && tracker_state == TrackingState::RecentlyLost
        && map.is_inertial_ba2_done();

    let (pyramid, max_cos_parallax) = {
        let Some(kf) = map.keyframe(current_id) else {
            return 0;
        };
        let cap = if config.inertial {
            MAX_COS_PARALLAX_INERTIAL
        } else {
            MAX_COS_PARALLAX_VISUAL
        };
        (kf.pyramid.clone(), cap)
    };
    let ratio_factor = 1.5 * pyramid.scale_factor;
    let far_cutoff = config.far_point_cutoff();

    let mut created = 0;

    for (i, &neighbor_id) in neighbors.iter().enumerate() {
        // Keep the queue latency bounded: new work preempts triangulation.
        if i > 0 && has_new_keyframes() {
            return created;
        }
        let (Some(kf1), Some(kf2)) = (map.keyframe(current_id), map.keyframe(neighbor_id))
        else {
            continue;
        };
        if kf2.is_bad {
            continue;
        }

        // Baseline gate.
        let baseline = (kf2.camera_center() - kf1.camera_center()).norm();
        if !config.monocular {
            if baseline < kf2.stereo_baseline {
                continue;
            }
        } else {
            let Some(median_depth) = map.scene_median_depth(neighbor_id, 2) else {
                continue;
            };
            if baseline / median_depth < MIN_BASELINE_DEPTH_RATIO {
                continue;
            }
        }

        let matches = search_for_triangulation(map, current_id, neighbor_id, coarse);
        trace!(
            current = %current_id,
            neighbor = %neighbor_id,
            candidates = matches.len(),
            "triangulating pair"
        );

        for (idx1, idx2) in matches {
            let Some(candidate) =
                triangulate_candidate(map, current_id, neighbor_id, idx1, idx2, config, max_cos_parallax, ratio_factor, far_cutoff)
            else {
                continue;
            };

            let descriptor = *map.keyframe(current_id).unwrap().descriptor(idx1);
            let mp_id = map.create_map_point(candidate, descriptor, current_id);
            map.associate(current_id, idx1, mp_id);
            map.associate(neighbor_id, idx2, mp_id);
            map.compute_distinctive_descriptor(mp_id);
            map.update_normal_and_depth(mp_id);
            recent.push_back(mp_id);
            created += 1;
        }
    }

    created
}

/// Run one candidate pair through the full gate sequence; `Some(point)` only
/// for a geometrically sound new landmark.
#[allow(clippy::too_many_arguments)]
fn triangulate_candidate(
    map: &Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    idx1: usize,
    idx2: usize,
    config: &MappingConfig,
    max_cos_parallax: f64,
    ratio_factor: f64,
    far_cutoff: f64,
) -> Option<nalgebra::Vector3<f64>> {
    let kf1 = map.keyframe(kf1_id)?;
    let kf2 = map.keyframe(kf2_id)?;

    let kp1 = *kf1.keypoint(idx1);
    let kp2 = *kf2.keypoint(idx2);
    let pose1 = kf1.pose_for_slot(idx1);
    let pose2 = kf2.pose_for_slot(idx2);
    let center1 = kf1.center_for_slot(idx1);
    let center2 = kf2.center_for_slot(idx2);
    let stereo1 = kf1.has_stereo(idx1);
    let stereo2 = kf2.has_stereo(idx2);

    // Rays in world coordinates for the parallax angle.
    let xn1 = kf1.camera_for_slot(idx1).unproject(&kp1.pt);
    let xn2 = kf2.camera_for_slot(idx2).unproject(&kp2.pt);
    let ray1 = pose1.rotation.inverse() * xn1;
    let ray2 = pose2.rotation.inverse() * xn2;
    let cos_rays = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());

    // Stereo parallax of each side; out-of-range sentinel prefers the
    // two-view estimate when neither side is stereo.
    let sentinel = cos_rays + 1.0;
    let cos_stereo1 = kf1
        .stereo_depth(idx1)
        .filter(|_| stereo1)
        .map(|z| (2.0 * (kf1.stereo_baseline / 2.0).atan2(z)).cos())
        .unwrap_or(sentinel);
    let cos_stereo2 = kf2
        .stereo_depth(idx2)
        .filter(|_| stereo2)
        .map(|z| (2.0 * (kf2.stereo_baseline / 2.0).atan2(z)).cos())
        .unwrap_or(sentinel);
    let cos_stereo = cos_stereo1.min(cos_stereo2);

    // Estimator choice: two-view DLT when the pair's parallax beats the
    // rigs' own, otherwise the stereo side with the wider angle.
    let x3d = if cos_rays < cos_stereo
        && cos_rays > 0.0
        && (stereo1 || stereo2 || cos_rays < max_cos_parallax)
    {
        triangulate(&xn1, &xn2, &pose1, &pose2)?
    } else if stereo1 && cos_stereo1 < cos_stereo2 {
        kf1.unproject_stereo(idx1)?
    } else if stereo2 && cos_stereo2 < cos_stereo1 {
        kf2.unproject_stereo(idx2)?
    } else {
        return None;
    };

    // Both cameras must see the point in front of them.
    let p_cam1 = pose1.transform(&x3d);
    if p_cam1.z <= 0.0 {
        return None;
    }
    let p_cam2 = pose2.transform(&x3d);
    if p_cam2.z <= 0.0 {
        return None;
    }

    // Reprojection gates, scaled by the observed feature's level sigma.
    if !reprojection_ok(kf1, idx1, &kp1, &p_cam1, stereo1) {
        return None;
    }
    if !reprojection_ok(kf2, idx2, &kp2, &p_cam2, stereo2) {
        return None;
    }

    // Scale consistency between the two observations.
    let dist1 = (x3d - center1).norm();
    let dist2 = (x3d - center2).norm();
    if dist1 == 0.0 || dist2 == 0.0 {
        return None;
    }
    if config.far_points && (dist1 >= far_cutoff || dist2 >= far_cutoff) {
        return None;
    }
    let ratio_dist = dist2 / dist1;
    let ratio_octave = kf1.pyramid.scale(kp1.octave) / kf2.pyramid.scale(kp2.octave);
    if ratio_dist * ratio_factor < ratio_octave || ratio_dist > ratio_octave * ratio_factor {
        return None;
    }

    Some(x3d)
}

fn reprojection_ok(
    kf: &crate::map::KeyFrame,
    slot: usize,
    kp: &crate::features::KeyPoint,
    p_cam: &nalgebra::Vector3<f64>,
    stereo: bool,
) -> bool {
    let sigma2 = kf.sigma2(slot);
    let uv = kf.camera_for_slot(slot).project(p_cam);
    let err_u = uv.x - kp.pt.x;
    let err_v = uv.y - kp.pt.y;

    if stereo {
        let kp_ur = kf.u_right[slot];
        let ur = uv.x - kf.bf / p_cam.z;
        let err_r = ur - kp_ur;
        err_u * err_u + err_v * err_v + err_r * err_r <= CHI2_STEREO * sigma2
    } else {
        err_u * err_u + err_v * err_v <= CHI2_MONO * sigma2
    }
}

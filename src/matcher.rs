//! Descriptor matching against the map: epipolar-constrained candidate
//! search for triangulation and projection-based landmark fusion.
//!
//! Place-recognition style matching (vocabulary trees) belongs to the front
//! end; here candidates are scanned directly with cheap geometric gates
//! applied before descriptor distances.

use nalgebra::{Matrix3, Vector3};
use tracing::trace;

use crate::features::TH_LOW;
use crate::geometry::{skew, SE3};
use crate::map::{KeyFrameId, Map, MapPointId};

/// Best-to-second-best ratio for accepting a triangulation match.
const NN_RATIO: f64 = 0.6;

/// χ² gate (1 DOF) on the distance to the epipolar line.
const CHI2_EPIPOLAR: f64 = 3.84;

/// χ² gates for reprojection checks (2 and 3 DOF).
const CHI2_MONO: f64 = 5.991;
const CHI2_STEREO: f64 = 7.815;

/// Search radius multiplier for projection-based fusion.
const FUSE_RADIUS: f64 = 3.0;

/// Candidate matches between two keyframes for triangulation.
///
/// Pairs features that have no landmark yet, whose descriptors agree (with
/// the ratio test), and that respect the epipolar geometry between the two
/// views. `coarse` relaxes the epipole-proximity rejection used to suppress
/// low-parallax pairs. Returned pairs are (slot in `kf1`, slot in `kf2`).
pub fn search_for_triangulation(
    map: &Map,
    kf1_id: KeyFrameId,
    kf2_id: KeyFrameId,
    coarse: bool,
) -> Vec<(usize, usize)> {
    let (Some(kf1), Some(kf2)) = (map.keyframe(kf1_id), map.keyframe(kf2_id)) else {
        return Vec::new();
    };

    let mut matches = Vec::new();
    let mut taken2 = vec![false; kf2.num_slots()];

    for slot1 in 0..kf1.num_slots() {
        if kf1.map_point(slot1).is_some() {
            continue;
        }
        let kp1 = kf1.keypoint(slot1);
        let d1 = kf1.descriptor(slot1);
        let pose1 = kf1.pose_for_slot(slot1);
        let cam1 = kf1.camera_for_slot(slot1);
        let stereo1 = kf1.has_stereo(slot1);
        let ray1 = cam1.unproject(&kp1.pt);

        // Epipole of camera 1 in each of kf2's cameras, for the
        // low-parallax rejection below.
        let c1_world = pose1.inverse().translation;

        let mut best = (u32::MAX, None::<usize>);
        let mut second = u32::MAX;

        for slot2 in 0..kf2.num_slots() {
            if taken2[slot2] || kf2.map_point(slot2).is_some() {
                continue;
            }
            let kp2 = kf2.keypoint(slot2);
            let pose2 = kf2.pose_for_slot(slot2);
            let cam2 = kf2.camera_for_slot(slot2);
            let stereo2 = kf2.has_stereo(slot2);

            // Points matched next to the epipole triangulate with near-zero
            // parallax; reject them unless a stereo side or coarse mode
            // allows it.
            if !stereo1 && !stereo2 && !coarse {
                let c1_in_cam2 = pose2.transform(&c1_world);
                if c1_in_cam2.z > 0.0 {
                    let epipole = cam2.project(&c1_in_cam2);
                    let dx = epipole.x - kp2.pt.x;
                    let dy = epipole.y - kp2.pt.y;
                    if dx * dx + dy * dy < 100.0 * kf2.pyramid.scale(kp2.octave) {
                        continue;
                    }
                }
            }

            // Distance of kp2 to the epipolar line of kp1, in pixels.
            let ray2 = cam2.unproject(&kp2.pt);
            let dist_px = epipolar_distance(&ray1, &ray2, &pose1, &pose2, cam2.fx());
            if dist_px * dist_px >= CHI2_EPIPOLAR * kf2.sigma2(slot2) {
                continue;
            }

            let dist = d1.distance(kf2.descriptor(slot2));
            if dist < best.0 {
                second = best.0;
                best = (dist, Some(slot2));
            } else if dist < second {
                second = dist;
            }
        }

        if let (dist, Some(slot2)) = best {
            if dist <= TH_LOW && (second == u32::MAX || (dist as f64) < NN_RATIO * second as f64) {
                matches.push((slot1, slot2));
                taken2[slot2] = true;
            }
        }
    }

    trace!(
        kf1 = %kf1_id,
        kf2 = %kf2_id,
        matches = matches.len(),
        "triangulation candidate search"
    );
    matches
}

/// Distance (approximately in pixels) of the ray `xn2` to the epipolar line
/// induced by `xn1`, evaluated in camera 2's normalized plane.
fn epipolar_distance(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    tcw1: &SE3,
    tcw2: &SE3,
    fx2: f64,
) -> f64 {
    // Relative motion mapping camera-2 coordinates into camera 1.
    let t12 = tcw1.compose(&tcw2.inverse());
    let e12: Matrix3<f64> = skew(&t12.translation) * t12.rotation_matrix();

    // Line of xn1 in camera 2's normalized plane.
    let line = e12.transpose() * xn1;
    let den = (line.x * line.x + line.y * line.y).sqrt();
    if den < 1e-12 {
        return f64::INFINITY;
    }
    (line.dot(xn2)).abs() / den * fx2
}

/// Result counts of a fusion pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuseStats {
    /// Landmark pairs merged.
    pub replaced: usize,
    /// Fresh observations attached.
    pub added: usize,
}

impl FuseStats {
    pub fn absorb(&mut self, other: FuseStats) {
        self.replaced += other.replaced;
        self.added += other.added;
    }
}

/// Project landmarks into a keyframe and fuse them with what it sees.
///
/// For every candidate landmark that projects onto an unclaimed feature with
/// a compatible descriptor, the observation is attached; when the feature
/// already holds a different landmark, the two are merged keeping the one
/// with more observations. `right` runs the pass against the rig's right
/// camera.
pub fn fuse(map: &mut Map, kf_id: KeyFrameId, candidates: &[MapPointId], right: bool) -> FuseStats {
    let mut stats = FuseStats::default();

    for &raw_id in candidates {
        let Some(mp_id) = map.resolve_replaced(raw_id) else {
            continue;
        };

        // Projection data under an immutable borrow; mutations follow.
        let Some(target) = project_for_fusion(map, kf_id, mp_id, right) else {
            continue;
        };

        match target.existing {
            Some(existing_id) if existing_id != mp_id => {
                let (keep, lose) = {
                    let obs_new = map.map_point(mp_id).map_or(0, |mp| mp.observation_count());
                    let obs_old = map
                        .map_point(existing_id)
                        .map_or(0, |mp| mp.observation_count());
                    if obs_new > obs_old {
                        (mp_id, existing_id)
                    } else {
                        (existing_id, mp_id)
                    }
                };
                if map.replace_map_point(lose, keep) {
                    stats.replaced += 1;
                }
            }
            Some(_) => {}
            None => {
                if map.associate(kf_id, target.slot, mp_id) {
                    stats.added += 1;
                }
            }
        }
    }

    stats
}

struct FuseTarget {
    slot: usize,
    existing: Option<MapPointId>,
}

/// Find the feature slot a landmark fuses into, if any.
fn project_for_fusion(
    map: &Map,
    kf_id: KeyFrameId,
    mp_id: MapPointId,
    right: bool,
) -> Option<FuseTarget> {
    let kf = map.keyframe(kf_id)?;
    if kf.is_bad {
        return None;
    }
    let mp = map.map_point(mp_id)?;
    if mp.is_bad || mp.observes(kf_id) {
        return None;
    }

    let (pose, camera, center) = if right {
        (
            kf.right_pose()?,
            kf.camera2.as_deref()?,
            kf.right_camera_center()?,
        )
    } else {
        (kf.pose(), kf.camera.as_ref(), kf.camera_center())
    };

    let pos = mp.position();
    let p_cam = pose.transform(&pos);
    if p_cam.z <= 0.0 {
        return None;
    }
    let uv = camera.project(&p_cam);

    let po = pos - center;
    let dist = po.norm();
    if !(0.8 * mp.min_distance..=1.2 * mp.max_distance).contains(&dist) {
        return None;
    }
    // Viewing-angle gate, once the landmark has a settled normal.
    if mp.normal.norm() > 0.5 && po.dot(&mp.normal) < 0.5 * dist {
        return None;
    }

    let level = kf.pyramid.predict_level(mp.max_distance, dist);
    let radius = FUSE_RADIUS * kf.pyramid.scale(level);
    let slots = kf.features_in_area(uv.x, uv.y, radius, right, Some(level - 1), Some(level));

    let inv_z = 1.0 / p_cam.z;
    let mut best = (u32::MAX, None::<usize>);
    for slot in slots {
        let kp = kf.keypoint(slot);
        let sigma2 = kf.sigma2(slot);

        let eu = uv.x - kp.pt.x;
        let ev = uv.y - kp.pt.y;
        let stereo_col = (!right)
            .then(|| kf.u_right.get(slot).copied())
            .flatten()
            .filter(|u| *u >= 0.0);
        let ok = match stereo_col {
            Some(kp_ur) => {
                let ur = uv.x - kf.bf * inv_z;
                let er = ur - kp_ur;
                eu * eu + ev * ev + er * er <= CHI2_STEREO * sigma2
            }
            None => eu * eu + ev * ev <= CHI2_MONO * sigma2,
        };
        if !ok {
            continue;
        }

        let dist = mp.descriptor.distance(kf.descriptor(slot));
        if dist < best.0 {
            best = (dist, Some(slot));
        }
    }

    let (dist, slot) = best;
    let slot = slot?;
    if dist > TH_LOW {
        return None;
    }
    Some(FuseTarget {
        slot,
        existing: kf.map_point(slot),
    })
}

//! Two-view triangulation by the direct linear transform.

use nalgebra::{Matrix4, SMatrix, Vector3};

use super::SE3;

/// Triangulate a 3D world point from two bearing observations.
///
/// `xn1`/`xn2` are normalized camera rays (unit depth) and `tcw1`/`tcw2` the
/// world-to-camera poses of the observing cameras. Returns `None` when the
/// homogeneous solution degenerates.
pub fn triangulate(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    tcw1: &SE3,
    tcw2: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(tcw1);
    let p2 = projection_matrix(tcw2);

    // Each view contributes two rows of A·X = 0.
    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    // The solution is the right singular vector of the smallest singular value.
    let svd = a.svd(true, true);
    let v = svd.v_t?.transpose();
    let x_h = v.column(3);

    if x_h[3].abs() < 1e-10 {
        return None;
    }

    Some(Vector3::new(
        x_h[0] / x_h[3],
        x_h[1] / x_h[3],
        x_h[2] / x_h[3],
    ))
}

/// Build the 3x4 projection matrix [R | t] of a world-to-camera pose.
fn projection_matrix(tcw: &SE3) -> SMatrix<f64, 3, 4> {
    let r = tcw.rotation_matrix();
    let mut p = SMatrix::<f64, 3, 4>::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(&tcw.translation);
    p
}

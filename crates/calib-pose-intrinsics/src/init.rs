//! Closed-form initialization from plane homographies.

use calib_pose_core::{
    collinearity_score, estimate_homography, CameraMatrix, CorrespondenceSet, Homography,
    ImageSize,
};
use nalgebra::{DMatrix, Matrix3, Point2};
use serde::Serialize;

/// Why a view was left out of the solve.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
pub enum ViewRejection {
    #[error("only {0} correspondences (need >= 4)")]
    TooFewPoints(usize),
    #[error("object points are not on the z = 0 plane")]
    NonPlanar,
    #[error("object points are (nearly) collinear")]
    Collinear,
    #[error("homography estimation failed")]
    Homography,
}

const PLANARITY_TOL: f64 = 1e-9;
const COLLINEARITY_MIN: f64 = 1e-6;

/// Object plane -> pixel homography of one view.
pub fn view_homography(view: &CorrespondenceSet) -> Result<Homography, ViewRejection> {
    if view.len() < 4 {
        return Err(ViewRejection::TooFewPoints(view.len()));
    }
    if !view.is_planar(PLANARITY_TOL) {
        return Err(ViewRejection::NonPlanar);
    }
    let plane: Vec<Point2<f64>> = view
        .object_points()
        .iter()
        .map(|p| Point2::new(p.x, p.y))
        .collect();
    if collinearity_score(&plane) < COLLINEARITY_MIN
        || collinearity_score(view.image_points()) < COLLINEARITY_MIN
    {
        return Err(ViewRejection::Collinear);
    }
    estimate_homography(&plane, view.image_points()).ok_or(ViewRejection::Homography)
}

/// Isotropic pixel conditioning `p' = s * (p - c)`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PixelConditioner {
    pub center: Point2<f64>,
    pub scale: f64,
}

impl PixelConditioner {
    pub(crate) fn from_views<'a>(views: impl IntoIterator<Item = &'a CorrespondenceSet>) -> Self {
        let pts: Vec<Point2<f64>> = views
            .into_iter()
            .flat_map(|v| v.image_points().iter().copied())
            .collect();
        let n = pts.len().max(1) as f64;
        let c = pts.iter().fold(Point2::origin(), |acc, p| acc + p.coords / n);
        let mean_dist = pts.iter().map(|p| (p - c).norm()).sum::<f64>() / n;
        let scale = if mean_dist > 1e-12 { 1.0 / mean_dist } else { 1.0 };
        Self { center: c, scale }
    }

    pub(crate) fn from_image(size: ImageSize) -> Self {
        Self {
            center: size.center(),
            scale: 1.0 / size.width.max(size.height).max(1) as f64,
        }
    }

    fn matrix(&self) -> Matrix3<f64> {
        let s = self.scale;
        Matrix3::new(
            s, 0.0, -s * self.center.x, //
            0.0, s, -s * self.center.y, //
            0.0, 0.0, 1.0,
        )
    }

    /// Apply to `H` and scale the result to unit Frobenius norm.
    fn condition(&self, h: &Matrix3<f64>) -> Option<Matrix3<f64>> {
        let hc = self.matrix() * h;
        let n = hc.norm();
        (n > 1e-15 && n.is_finite()).then(|| hc / n)
    }

    fn restore(&self, fx: f64, fy: f64, cx: f64, cy: f64) -> Option<CameraMatrix> {
        CameraMatrix::new(
            fx / self.scale,
            fy / self.scale,
            cx / self.scale + self.center.x,
            cy / self.scale + self.center.y,
        )
        .ok()
    }
}

/// Null vector (smallest eigenvalue) of `A^T A`.
fn null_vector(a: &DMatrix<f64>) -> Option<Vec<f64>> {
    let ata = a.transpose() * a;
    let eig = ata.symmetric_eigen();
    let (idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v = eig.eigenvectors.column(idx);
    v.iter().all(|x| x.is_finite()).then(|| v.iter().copied().collect())
}

/// Zero-skew intrinsics from at least two plane homographies.
///
/// Solves the five unknowns `(B11, B22, B13, B23, B33)` of the image of the
/// absolute conic `B ~ K^-T K^-1` from the two orthonormality constraints
/// each homography contributes.
pub(crate) fn zhang_zero_skew(
    homographies: &[Matrix3<f64>],
    cond: &PixelConditioner,
) -> Option<CameraMatrix> {
    if homographies.len() < 2 {
        return None;
    }

    // v_ij restricted to the zero-skew unknowns
    let v = |h: &Matrix3<f64>, i: usize, j: usize| -> [f64; 5] {
        let (a, b) = (h.column(i), h.column(j));
        [
            a[0] * b[0],
            a[1] * b[1],
            a[2] * b[0] + a[0] * b[2],
            a[2] * b[1] + a[1] * b[2],
            a[2] * b[2],
        ]
    };

    let mut a = DMatrix::<f64>::zeros(2 * homographies.len(), 5);
    for (k, h) in homographies.iter().enumerate() {
        let h = cond.condition(h)?;
        let v12 = v(&h, 0, 1);
        let v11 = v(&h, 0, 0);
        let v22 = v(&h, 1, 1);
        for c in 0..5 {
            a[(2 * k, c)] = v12[c];
            a[(2 * k + 1, c)] = v11[c] - v22[c];
        }
    }

    let mut b = null_vector(&a)?;
    if b[0] < 0.0 {
        b.iter_mut().for_each(|x| *x = -*x);
    }
    let [b11, b22, b13, b23, b33] = [b[0], b[1], b[2], b[3], b[4]];
    if b11 <= 1e-15 || b22 <= 1e-15 {
        return None;
    }

    let cx = -b13 / b11;
    let cy = -b23 / b22;
    let lambda = b33 - (b13 * b13 / b11 + b23 * b23 / b22);
    if lambda.is_nan() || lambda <= 0.0 {
        return None;
    }
    let fx = (lambda / b11).sqrt();
    let fy = (lambda / b22).sqrt();
    log::debug!("zhang init (conditioned): fx={fx:.4} fy={fy:.4} cx={cx:.4} cy={cy:.4}");
    cond.restore(fx, fy, cx, cy)
}

/// Intrinsics with the principal point pinned at the image center; needs
/// only one homography.
pub(crate) fn centered_principal_point(
    homographies: &[Matrix3<f64>],
    size: ImageSize,
) -> Option<CameraMatrix> {
    if homographies.is_empty() {
        return None;
    }
    let cond = PixelConditioner::from_image(size);

    // B = diag(B11, B22, B33) once the principal point is at the origin
    let mut a = DMatrix::<f64>::zeros(2 * homographies.len(), 3);
    for (k, h) in homographies.iter().enumerate() {
        let h = cond.condition(h)?;
        let (h1, h2) = (h.column(0), h.column(1));
        for c in 0..3 {
            a[(2 * k, c)] = h1[c] * h2[c];
            a[(2 * k + 1, c)] = h1[c] * h1[c] - h2[c] * h2[c];
        }
    }

    let b = null_vector(&a)?;
    let fx2 = b[2] / b[0];
    let fy2 = b[2] / b[1];
    let valid = |f2: f64| f2.is_finite() && f2 > 0.0;
    if !valid(fx2) || !valid(fy2) {
        return None;
    }
    cond.restore(fx2.sqrt(), fy2.sqrt(), 0.0, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use calib_pose_core::{synthetic, CameraModel, ChessboardSpec, ExtrinsicPose};
    use nalgebra::{Point3, Vector3};

    fn truth() -> CameraMatrix {
        CameraMatrix::new(900.0, 880.0, 640.0, 360.0).unwrap()
    }

    fn views(count: usize) -> Vec<CorrespondenceSet> {
        let board = ChessboardSpec::new(9, 6, 0.025).unwrap();
        let poses = synthetic::orbit_poses(count, board.center(), 0.55, 25.0);
        synthetic::project_views(&CameraModel::pinhole(truth()), &board.object_points(), &poses)
            .unwrap()
    }

    fn homographies(views: &[CorrespondenceSet]) -> Vec<Matrix3<f64>> {
        views.iter().map(|v| view_homography(v).unwrap().h).collect()
    }

    #[test]
    fn zero_skew_closed_form_recovers_intrinsics() {
        let views = views(3);
        let cond = PixelConditioner::from_views(&views);
        let k = zhang_zero_skew(&homographies(&views), &cond).expect("init");
        assert!((k.fx() - 900.0).abs() < 1e-3, "fx {}", k.fx());
        assert!((k.fy() - 880.0).abs() < 1e-3, "fy {}", k.fy());
        assert!((k.cx() - 640.0).abs() < 1e-3, "cx {}", k.cx());
        assert!((k.cy() - 360.0).abs() < 1e-3, "cy {}", k.cy());
    }

    #[test]
    fn closed_form_needs_two_views() {
        let views = views(1);
        let cond = PixelConditioner::from_views(&views);
        assert!(zhang_zero_skew(&homographies(&views), &cond).is_none());
    }

    #[test]
    fn centered_init_from_single_view() {
        let k_true = CameraMatrix::new(800.0, 800.0, 399.5, 299.5).unwrap();
        let board = ChessboardSpec::new(9, 6, 0.025).unwrap();
        let pose = ExtrinsicPose::from_rvec_tvec(
            Vector3::new(0.35, -0.25, 0.05),
            Vector3::new(-0.1, -0.06, 0.6),
        );
        let view = synthetic::project_views(
            &CameraModel::pinhole(k_true),
            &board.object_points(),
            &[pose],
        )
        .unwrap();
        let k = centered_principal_point(&homographies(&view), ImageSize::new(800, 600))
            .expect("init");
        assert!((k.fx() - 800.0).abs() < 1e-3, "fx {}", k.fx());
        assert!((k.fy() - 800.0).abs() < 1e-3, "fy {}", k.fy());
        assert!((k.cx() - 399.5).abs() < 1e-9);
    }

    #[test]
    fn rejects_degenerate_views() {
        let line = CorrespondenceSet::new(
            (0..5).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect(),
            (0..5).map(|i| Point2::new(i as f64 * 10.0, 5.0)).collect(),
        )
        .unwrap();
        assert_eq!(view_homography(&line).unwrap_err(), ViewRejection::Collinear);

        let lifted = CorrespondenceSet::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.3),
                Point3::new(1.0, 1.0, 0.0),
            ],
            vec![Point2::origin(); 4],
        )
        .unwrap();
        assert_eq!(view_homography(&lifted).unwrap_err(), ViewRejection::NonPlanar);

        let three = CorrespondenceSet::new(vec![Point3::origin(); 3], vec![Point2::origin(); 3])
            .unwrap();
        assert_eq!(view_homography(&three).unwrap_err(), ViewRejection::TooFewPoints(3));
    }
}

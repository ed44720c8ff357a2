use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector3};

/// Plane-to-image projective map `p_dst ~ H * p_src`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        let w = v[2];
        if w.abs() < 1e-15 {
            return None;
        }
        Some(Point2::new(v[0] / w, v[1] / w))
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }
}

fn hartley_normalization(cx: f64, cy: f64, mean_dist: f64) -> Matrix3<f64> {
    let s = if mean_dist > 1e-12 {
        (2.0_f64).sqrt() / mean_dist
    } else {
        1.0
    };

    Matrix3::<f64>::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

// translate to centroid, scale so mean distance = sqrt(2)
fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = pts.len() as f64;
    let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), p| (ax + p.x, ay + p.y));
    let (cx, cy) = (sx / n, sy / n);

    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let t = hartley_normalization(cx, cy, mean_dist);
    let out = pts
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v[0], v[1])
        })
        .collect();
    (out, t)
}

fn normalize_homography(h: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let s = h[(2, 2)];
    if s.abs() < 1e-12 || !s.is_finite() {
        return None;
    }
    Some(h / s)
}

fn denormalize_homography(
    hn: Matrix3<f64>,
    t_src: Matrix3<f64>,
    t_dst: Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let t_dst_inv = t_dst.try_inverse()?;
    Some(t_dst_inv * hn * t_src)
}

/// Ratio of the smaller to the larger principal spread of `pts`, in `[0, 1]`.
/// Near zero means the points are (nearly) collinear.
pub fn collinearity_score(pts: &[Point2<f64>]) -> f64 {
    if pts.len() < 3 {
        return 0.0;
    }
    let n = pts.len() as f64;
    let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), p| (ax + p.x, ay + p.y));
    let (cx, cy) = (sx / n, sy / n);

    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in pts {
        let dx = p.x - cx;
        let dy = p.y - cy;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let tr = sxx + syy;
    if tr <= 0.0 {
        return 0.0;
    }
    let det = sxx * syy - sxy * sxy;
    let disc = ((tr * tr) * 0.25 - det).max(0.0).sqrt();
    let l_max = tr * 0.5 + disc;
    let l_min = (tr * 0.5 - disc).max(0.0);
    l_min / l_max
}

/// Estimate `H` such that `dst ~ H * src` from at least 4 correspondences.
///
/// Uses the normalized DLT; the exactly-determined 4-point case goes through
/// [`homography_from_4pt`].
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }

    if src.len() == 4 {
        let s: &[Point2<f64>; 4] = src.try_into().ok()?;
        let d: &[Point2<f64>; 4] = dst.try_into().ok()?;
        return homography_from_4pt(s, d);
    }

    let (s, ts) = normalize_points(src);
    let (d, td) = normalize_points(dst);

    // two rows per pair: [p^T 0 -u p^T] and [0 p^T -v p^T], p = (x, y, 1)
    let mut a = DMatrix::<f64>::zeros(2 * s.len(), 9);
    for (k, (p, q)) in s.iter().zip(&d).enumerate() {
        let ph = [p.x, p.y, 1.0];
        for c in 0..3 {
            a[(2 * k, c)] = ph[c];
            a[(2 * k, 6 + c)] = -q.x * ph[c];
            a[(2 * k + 1, 3 + c)] = ph[c];
            a[(2 * k + 1, 6 + c)] = -q.y * ph[c];
        }
    }

    // null vector of A: right singular vector of the smallest singular value
    let v_t = a.svd(false, true).v_t?;
    let h = v_t.row(v_t.nrows().checked_sub(1)?);
    let hn = Matrix3::from_iterator((0..9).map(|i| h[(i % 3) * 3 + i / 3]));

    let h_den = normalize_homography(denormalize_homography(hn, ts, td)?)?;
    Some(Homography::new(h_den))
}

/// Compute `H` such that `dst ~ H * src` from exactly four correspondences.
///
/// Corner order must be consistent between `src` and `dst`.
pub fn homography_from_4pt(
    src: &[Point2<f64>; 4],
    dst: &[Point2<f64>; 4],
) -> Option<Homography> {
    // fix h33 = 1; eight unknowns, two equations per corner
    let (src_n, t_src) = normalize_points(src);
    let (dst_n, t_dst) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for (k, (p, q)) in src_n.iter().zip(&dst_n).enumerate() {
        let (ru, rv) = (2 * k, 2 * k + 1);
        for (c, v) in [p.x, p.y, 1.0].into_iter().enumerate() {
            a[(ru, c)] = v;
            a[(rv, 3 + c)] = v;
        }
        a[(ru, 6)] = -q.x * p.x;
        a[(ru, 7)] = -q.x * p.y;
        a[(rv, 6)] = -q.y * p.x;
        a[(rv, 7)] = -q.y * p.y;
        b[ru] = q.x;
        b[rv] = q.y;
    }

    let sol = a.lu().solve(&b)?;
    if sol.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let hn = Matrix3::new(
        sol[0], sol[1], sol[2], //
        sol[3], sol[4], sol[5], //
        sol[6], sol[7], 1.0,
    );

    let h_den = normalize_homography(denormalize_homography(hn, t_src, t_dst)?)?;
    Some(Homography::new(h_den))
}

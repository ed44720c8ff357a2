//! Pinhole camera with Brown-Conrady radial-tangential distortion.
//!
//! Projection pipeline: extrinsic transform, perspective divide, distortion
//! in normalized coordinates, then the intrinsic matrix.

use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::ExtrinsicPose;

/// Invalid camera parameters.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraModelError {
    #[error("focal lengths must be finite and positive (fx={fx}, fy={fy})")]
    InvalidFocalLength { fx: f64, fy: f64 },
    #[error("principal point must be finite (cx={cx}, cy={cy})")]
    InvalidPrincipalPoint { cx: f64, cy: f64 },
    #[error("camera matrix violates the [fx 0 cx; 0 fy cy; 0 0 1] pattern at ({row}, {col})")]
    ZeroPattern { row: usize, col: usize },
    #[error("distortion coefficient {index} is not finite")]
    NonFiniteDistortion { index: usize },
}

/// Image dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn center(&self) -> Point2<f64> {
        Point2::new(
            (self.width as f64 - 1.0) * 0.5,
            (self.height as f64 - 1.0) * 0.5,
        )
    }
}

/// Axis-aligned integer pixel rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Intrinsic matrix `[fx 0 cx; 0 fy cy; 0 0 1]` (zero skew).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCameraMatrix")]
pub struct CameraMatrix {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
}

#[derive(Deserialize)]
struct RawCameraMatrix {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
}

impl TryFrom<RawCameraMatrix> for CameraMatrix {
    type Error = CameraModelError;

    fn try_from(raw: RawCameraMatrix) -> Result<Self, Self::Error> {
        Self::new(raw.fx, raw.fy, raw.cx, raw.cy)
    }
}

impl CameraMatrix {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, CameraModelError> {
        if !(fx.is_finite() && fy.is_finite() && fx > 0.0 && fy > 0.0) {
            return Err(CameraModelError::InvalidFocalLength { fx, fy });
        }
        if !(cx.is_finite() && cy.is_finite()) {
            return Err(CameraModelError::InvalidPrincipalPoint { cx, cy });
        }
        Ok(Self { fx, fy, cx, cy })
    }

    /// Validate a full 3x3 matrix against the fixed zero pattern.
    pub fn from_matrix(k: &Matrix3<f64>) -> Result<Self, CameraModelError> {
        const TOL: f64 = 1e-9;
        for (row, col, expected) in [(0, 1, 0.0), (1, 0, 0.0), (2, 0, 0.0), (2, 1, 0.0), (2, 2, 1.0)]
        {
            let v: f64 = k[(row, col)];
            if !v.is_finite() || (v - expected).abs() > TOL {
                return Err(CameraModelError::ZeroPattern { row, col });
            }
        }
        Self::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)])
    }

    /// Row-major `[fx, 0, cx, 0, fy, cy, 0, 0, 1]`.
    pub fn from_row_major(v: &[f64; 9]) -> Result<Self, CameraModelError> {
        Self::from_matrix(&Matrix3::from_row_slice(v))
    }

    pub fn to_row_major(&self) -> [f64; 9] {
        [self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0]
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.fx
    }
    #[inline]
    pub fn fy(&self) -> f64 {
        self.fy
    }
    #[inline]
    pub fn cx(&self) -> f64 {
        self.cx
    }
    #[inline]
    pub fn cy(&self) -> f64 {
        self.cy
    }

    #[inline]
    pub fn normalized_to_pixel(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::new(self.fx * p.x + self.cx, self.fy * p.y + self.cy)
    }

    #[inline]
    pub fn pixel_to_normalized(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }
}

/// Radial `k1, k2, k3` and tangential `p1, p2` coefficients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistortionCoeffs {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl DistortionCoeffs {
    pub const LEN: usize = 5;

    pub fn zero() -> Self {
        Self::default()
    }

    /// From the conventional `[k1, k2, p1, p2, k3]` order.
    pub fn from_array(v: [f64; 5]) -> Result<Self, CameraModelError> {
        if let Some(index) = v.iter().position(|c| !c.is_finite()) {
            return Err(CameraModelError::NonFiniteDistortion { index });
        }
        Ok(Self {
            k1: v[0],
            k2: v[1],
            p1: v[2],
            p2: v[3],
            k3: v[4],
        })
    }

    pub fn to_array(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        self.to_array().iter().all(|c| *c == 0.0)
    }

    /// Apply distortion to normalized coordinates.
    pub fn distort(&self, p: Point2<f64>) -> Point2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        Point2::new(x * radial + x_tan, y * radial + y_tan)
    }

    /// Invert [`Self::distort`] by fixed-point iteration.
    pub fn undistort(&self, pd: Point2<f64>, cfg: UndistortConfig) -> Option<Point2<f64>> {
        let (mut x, mut y) = (pd.x, pd.y);

        for _ in 0..cfg.max_iters.max(1) {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
            if !radial.is_finite() || radial.abs() < 1e-12 {
                return None;
            }

            let dx_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            let x_next = (pd.x - dx_tan) / radial;
            let y_next = (pd.y - dy_tan) / radial;
            if !x_next.is_finite() || !y_next.is_finite() {
                return None;
            }

            let step = ((x_next - x).powi(2) + (y_next - y).powi(2)).sqrt();
            x = x_next;
            y = y_next;
            if step <= cfg.eps.max(0.0) {
                break;
            }
        }

        Some(Point2::new(x, y))
    }
}

/// Fixed-point undistortion settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndistortConfig {
    /// Maximum fixed-point iterations.
    pub max_iters: usize,
    /// Stop when the update norm (normalized units) drops below this value.
    pub eps: f64,
}

impl Default for UndistortConfig {
    fn default() -> Self {
        Self {
            max_iters: 20,
            eps: 1e-12,
        }
    }
}

/// Number of samples per image edge used by
/// [`CameraModel::optimal_new_camera_matrix`].
const BORDER_SAMPLES: usize = 16;

/// Intrinsics plus distortion. Immutable once produced by calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub matrix: CameraMatrix,
    pub distortion: DistortionCoeffs,
}

impl CameraModel {
    pub fn new(matrix: CameraMatrix, distortion: DistortionCoeffs) -> Self {
        Self { matrix, distortion }
    }

    pub fn pinhole(matrix: CameraMatrix) -> Self {
        Self::new(matrix, DistortionCoeffs::zero())
    }

    /// Project a camera-space point. `None` if it is not in front of the camera.
    pub fn project_camera_point(&self, pc: &Point3<f64>) -> Option<Point2<f64>> {
        if pc.z.is_nan() || pc.z <= 1e-12 {
            return None;
        }
        let xn = Point2::new(pc.x / pc.z, pc.y / pc.z);
        let xd = self.distortion.distort(xn);
        let px = self.matrix.normalized_to_pixel(xd);
        (px.x.is_finite() && px.y.is_finite()).then_some(px)
    }

    /// Project an object-space point seen under `pose` into pixels.
    pub fn project(&self, point: &Point3<f64>, pose: &ExtrinsicPose) -> Option<Point2<f64>> {
        self.project_camera_point(&pose.transform_point(point))
    }

    /// Map a distorted pixel to undistorted normalized coordinates
    /// (`x/z`, `y/z` of the viewing ray).
    pub fn undistort(&self, pixel: Point2<f64>) -> Option<Point2<f64>> {
        self.undistort_with(pixel, UndistortConfig::default())
    }

    pub fn undistort_with(&self, pixel: Point2<f64>, cfg: UndistortConfig) -> Option<Point2<f64>> {
        let pd = self.matrix.pixel_to_normalized(pixel);
        self.distortion.undistort(pd, cfg)
    }

    /// Undistort into the pixel frame of the same camera matrix.
    pub fn undistort_pixel(&self, pixel: Point2<f64>) -> Option<Point2<f64>> {
        self.undistort(pixel)
            .map(|n| self.matrix.normalized_to_pixel(n))
    }

    /// Camera matrix for the undistorted image plus its valid-pixel region.
    ///
    /// `alpha = 0` keeps only valid pixels (largest inscribed rectangle),
    /// `alpha = 1` keeps every source pixel (bounding rectangle); values in
    /// between interpolate. `alpha` is clamped into `[0, 1]`.
    pub fn optimal_new_camera_matrix(
        &self,
        size: ImageSize,
        alpha: f64,
    ) -> Option<(CameraMatrix, PixelRect)> {
        if size.width < 2 || size.height < 2 {
            return None;
        }
        let alpha = if alpha.is_finite() {
            alpha.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let w = size.width as f64 - 1.0;
        let h = size.height as f64 - 1.0;

        let edge = |from: (f64, f64), to: (f64, f64)| -> Option<Vec<Point2<f64>>> {
            (0..BORDER_SAMPLES)
                .map(|k| {
                    let t = k as f64 / (BORDER_SAMPLES - 1) as f64;
                    let p = Point2::new(
                        from.0 + (to.0 - from.0) * t,
                        from.1 + (to.1 - from.1) * t,
                    );
                    self.undistort(p)
                })
                .collect()
        };

        let top = edge((0.0, 0.0), (w, 0.0))?;
        let bottom = edge((0.0, h), (w, h))?;
        let left = edge((0.0, 0.0), (0.0, h))?;
        let right = edge((w, 0.0), (w, h))?;

        let inner = NormRect {
            x0: left.iter().map(|p| p.x).fold(f64::MIN, f64::max),
            x1: right.iter().map(|p| p.x).fold(f64::MAX, f64::min),
            y0: top.iter().map(|p| p.y).fold(f64::MIN, f64::max),
            y1: bottom.iter().map(|p| p.y).fold(f64::MAX, f64::min),
        };
        let all = || top.iter().chain(&bottom).chain(&left).chain(&right);
        let outer = NormRect {
            x0: all().map(|p| p.x).fold(f64::MAX, f64::min),
            x1: all().map(|p| p.x).fold(f64::MIN, f64::max),
            y0: all().map(|p| p.y).fold(f64::MAX, f64::min),
            y1: all().map(|p| p.y).fold(f64::MIN, f64::max),
        };
        if inner.width() <= 0.0 || inner.height() <= 0.0 {
            return None;
        }

        let (fx0, fy0, cx0, cy0) = inner.fit(w, h);
        let (fx1, fy1, cx1, cy1) = outer.fit(w, h);
        let lerp = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;
        let new = CameraMatrix::new(lerp(fx0, fx1), lerp(fy0, fy1), lerp(cx0, cx1), lerp(cy0, cy1))
            .ok()?;

        // valid region: the inscribed rectangle seen through the new matrix
        let tl = new.normalized_to_pixel(Point2::new(inner.x0, inner.y0));
        let br = new.normalized_to_pixel(Point2::new(inner.x1, inner.y1));
        const SNAP: f64 = 1e-6;
        let x0 = (tl.x - SNAP).ceil().clamp(0.0, w);
        let y0 = (tl.y - SNAP).ceil().clamp(0.0, h);
        let x1 = (br.x + SNAP).floor().clamp(0.0, w);
        let y1 = (br.y + SNAP).floor().clamp(0.0, h);
        let roi = PixelRect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0 + 1.0).max(0.0) as u32,
            height: (y1 - y0 + 1.0).max(0.0) as u32,
        };

        Some((new, roi))
    }
}

#[derive(Clone, Copy, Debug)]
struct NormRect {
    x0: f64,
    x1: f64,
    y0: f64,
    y1: f64,
}

impl NormRect {
    fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    /// Intrinsics that map this rectangle onto `[0, w] x [0, h]`.
    fn fit(&self, w: f64, h: f64) -> (f64, f64, f64, f64) {
        let fx = w / self.width();
        let fy = h / self.height();
        (fx, fy, -fx * self.x0, -fy * self.y0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn model(distortion: DistortionCoeffs) -> CameraModel {
        CameraModel::new(
            CameraMatrix::new(800.0, 800.0, 400.0, 300.0).expect("matrix"),
            distortion,
        )
    }

    fn barrel() -> DistortionCoeffs {
        DistortionCoeffs {
            k1: -0.25,
            k2: 0.08,
            p1: 0.001,
            p2: -0.0005,
            k3: 0.0,
        }
    }

    #[test]
    fn camera_matrix_invariants() {
        assert!(CameraMatrix::new(0.0, 800.0, 0.0, 0.0).is_err());
        assert!(CameraMatrix::new(800.0, -1.0, 0.0, 0.0).is_err());
        assert!(CameraMatrix::new(800.0, 800.0, f64::NAN, 0.0).is_err());

        let k = CameraMatrix::new(810.0, 790.0, 401.0, 299.0).unwrap();
        let back = CameraMatrix::from_row_major(&k.to_row_major()).unwrap();
        assert_eq!(back, k);

        let mut skewed = k.matrix();
        skewed[(0, 1)] = 0.5;
        assert_eq!(
            CameraMatrix::from_matrix(&skewed),
            Err(CameraModelError::ZeroPattern { row: 0, col: 1 })
        );
    }

    #[test]
    fn deserializing_validates_camera_matrix() {
        let ok: CameraMatrix =
            serde_json::from_str(r#"{"fx":800,"fy":800,"cx":400,"cy":300}"#).unwrap();
        assert_eq!(ok.fx(), 800.0);
        assert!(serde_json::from_str::<CameraMatrix>(r#"{"fx":-1,"fy":800,"cx":0,"cy":0}"#)
            .is_err());
    }

    #[test]
    fn pinhole_projection_matches_similar_triangles() {
        let m = model(DistortionCoeffs::zero());
        let px = m
            .project(&Point3::new(0.1, -0.05, 2.0), &ExtrinsicPose::identity())
            .expect("in front");
        assert_abs_diff_eq!(px.x, 400.0 + 800.0 * 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(px.y, 300.0 - 800.0 * 0.025, epsilon = 1e-12);

        assert!(m
            .project(&Point3::new(0.0, 0.0, -1.0), &ExtrinsicPose::identity())
            .is_none());
    }

    #[test]
    fn undistort_inverts_project() {
        let m = model(barrel());
        let pose = ExtrinsicPose::identity();
        for &(x, y) in &[(0.0, 0.0), (0.2, -0.1), (-0.3, 0.25), (0.35, 0.3)] {
            let p = Point3::new(x, y, 1.0);
            let px = m.project(&p, &pose).expect("visible");
            let n = m.undistort(px).expect("converges");
            // normalized units; 1e-4 px at f = 800 is 1.25e-7
            assert_abs_diff_eq!(n.x, x, epsilon = 1e-4 / 800.0);
            assert_abs_diff_eq!(n.y, y, epsilon = 1e-4 / 800.0);
        }
    }

    #[test]
    fn undistort_pixel_is_identity_without_distortion() {
        let m = model(DistortionCoeffs::zero());
        let p = Point2::new(123.5, 456.25);
        let u = m.undistort_pixel(p).unwrap();
        assert_abs_diff_eq!(u, p, epsilon = 1e-9);
    }

    #[test]
    fn optimal_matrix_without_distortion_keeps_full_frame() {
        let m = model(DistortionCoeffs::zero());
        let size = ImageSize::new(800, 600);
        for alpha in [0.0, 1.0] {
            let (k, roi) = m.optimal_new_camera_matrix(size, alpha).expect("valid");
            assert_abs_diff_eq!(k.fx(), 800.0, epsilon = 1e-9);
            assert_abs_diff_eq!(k.cx(), 400.0, epsilon = 1e-9);
            assert_eq!(
                roi,
                PixelRect {
                    x: 0,
                    y: 0,
                    width: 800,
                    height: 600
                }
            );
        }
    }

    #[test]
    fn optimal_matrix_with_barrel_distortion_crops_for_alpha_zero() {
        let m = model(barrel());
        let size = ImageSize::new(800, 600);
        let (k0, roi0) = m.optimal_new_camera_matrix(size, 0.0).expect("alpha 0");
        let (k1, roi1) = m.optimal_new_camera_matrix(size, 1.0).expect("alpha 1");

        // keeping every source pixel needs a shorter focal length
        assert!(k1.fx() < k0.fx());
        assert!(roi0.width <= 800 && roi0.height <= 600);
        assert!(roi1.width <= roi0.width);
        assert!(roi1.x >= roi0.x);

        // the inscribed rectangle maps back inside the source image
        let corner = Point2::new(roi0.x as f64, roi0.y as f64);
        let ray = k0.pixel_to_normalized(corner);
        let src = m.matrix.normalized_to_pixel(m.distortion.distort(ray));
        assert!(src.x >= -1.0 && src.y >= -1.0);
    }

    #[test]
    fn serde_round_trip() {
        let m = model(barrel());
        let json = serde_json::to_string(&m).unwrap();
        let back: CameraModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}

//! Planar chessboard geometry.

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::{CorrespondenceError, CorrespondenceSet};

/// Chessboard described by its **inner corner** counts and square size.
///
/// Object points lie on `z = 0`, row-major with the column index fastest,
/// which is the order chessboard corner detectors report them in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChessboardSpec {
    pub inner_cols: u32,
    pub inner_rows: u32,
    /// Square side in world units (metres by convention).
    pub square_size: f64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BoardSpecError {
    #[error("inner_cols and inner_rows must be >= 2 (got {cols}x{rows})")]
    InvalidSize { cols: u32, rows: u32 },
    #[error("square_size must be finite and > 0 (got {0})")]
    InvalidSquareSize(f64),
    #[error("expected {expected} corners, got {got}")]
    CornerCount { expected: usize, got: usize },
    #[error("corner ({i}, {j}) lies outside the board")]
    OutOfGrid { i: u32, j: u32 },
    #[error("corner ({i}, {j}) appears more than once")]
    DuplicateCorner { i: u32, j: u32 },
    #[error(transparent)]
    Correspondence(#[from] CorrespondenceError),
}

impl Default for ChessboardSpec {
    fn default() -> Self {
        Self {
            inner_cols: 9,
            inner_rows: 6,
            square_size: 0.025,
        }
    }
}

impl ChessboardSpec {
    pub fn new(inner_cols: u32, inner_rows: u32, square_size: f64) -> Result<Self, BoardSpecError> {
        let spec = Self {
            inner_cols,
            inner_rows,
            square_size,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), BoardSpecError> {
        if self.inner_cols < 2 || self.inner_rows < 2 {
            return Err(BoardSpecError::InvalidSize {
                cols: self.inner_cols,
                rows: self.inner_rows,
            });
        }
        if !self.square_size.is_finite() || self.square_size <= 0.0 {
            return Err(BoardSpecError::InvalidSquareSize(self.square_size));
        }
        Ok(())
    }

    #[inline]
    pub fn corner_count(&self) -> usize {
        self.inner_cols as usize * self.inner_rows as usize
    }

    /// Object point of inner corner `(i, j)` (column, row).
    #[inline]
    pub fn point(&self, i: u32, j: u32) -> Point3<f64> {
        Point3::new(
            i as f64 * self.square_size,
            j as f64 * self.square_size,
            0.0,
        )
    }

    /// All inner corners in detector order.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        (0..self.inner_rows)
            .flat_map(|j| (0..self.inner_cols).map(move |i| self.point(i, j)))
            .collect()
    }

    /// Board center on the `z = 0` plane.
    pub fn center(&self) -> Point3<f64> {
        Point3::new(
            (self.inner_cols - 1) as f64 * self.square_size * 0.5,
            (self.inner_rows - 1) as f64 * self.square_size * 0.5,
            0.0,
        )
    }
}

impl CorrespondenceSet {
    /// Pair a full detection (every inner corner, detector order) with the
    /// board geometry.
    pub fn from_grid(
        spec: &ChessboardSpec,
        image: Vec<Point2<f64>>,
    ) -> Result<Self, BoardSpecError> {
        spec.validate()?;
        let expected = spec.corner_count();
        if image.len() != expected {
            return Err(BoardSpecError::CornerCount {
                expected,
                got: image.len(),
            });
        }
        Ok(Self::new(spec.object_points(), image)?)
    }

    /// Pair a partial detection given as `(i, j, pixel)` labels.
    pub fn from_labeled(
        spec: &ChessboardSpec,
        labeled: &[(u32, u32, Point2<f64>)],
    ) -> Result<Self, BoardSpecError> {
        spec.validate()?;
        let mut seen = vec![false; spec.corner_count()];
        let mut object = Vec::with_capacity(labeled.len());
        let mut image = Vec::with_capacity(labeled.len());
        for &(i, j, px) in labeled {
            if i >= spec.inner_cols || j >= spec.inner_rows {
                return Err(BoardSpecError::OutOfGrid { i, j });
            }
            let idx = j as usize * spec.inner_cols as usize + i as usize;
            if std::mem::replace(&mut seen[idx], true) {
                return Err(BoardSpecError::DuplicateCorner { i, j });
            }
            object.push(spec.point(i, j));
            image.push(px);
        }
        Ok(Self::new(object, image)?)
    }
}

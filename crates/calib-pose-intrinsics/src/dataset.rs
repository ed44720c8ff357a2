//! Accumulates chessboard detections across a capture session.

use calib_pose_core::{BoardSpecError, ChessboardSpec, CorrespondenceSet, ImageSize};
use nalgebra::Point2;

use crate::{Calibration, CalibrationError, CalibrationSolver};

/// Detections for one board, image by image.
#[derive(Clone, Debug)]
pub struct CalibrationDataset {
    board: ChessboardSpec,
    image_size: Option<ImageSize>,
    views: Vec<CorrespondenceSet>,
    /// Source image index of each accepted view.
    sources: Vec<usize>,
    attempted: usize,
}

impl CalibrationDataset {
    pub fn new(board: ChessboardSpec) -> Result<Self, BoardSpecError> {
        board.validate()?;
        Ok(Self {
            board,
            image_size: None,
            views: Vec::new(),
            sources: Vec::new(),
            attempted: 0,
        })
    }

    pub fn with_image_size(mut self, size: ImageSize) -> Self {
        self.image_size = Some(size);
        self
    }

    pub fn board(&self) -> &ChessboardSpec {
        &self.board
    }

    pub fn image_size(&self) -> Option<ImageSize> {
        self.image_size
    }

    /// Record one image. `None` means the detector found no board.
    ///
    /// Returns whether the image produced a view. A detection with the wrong
    /// corner count is counted as rejected and reported as an error.
    pub fn add_detection(
        &mut self,
        corners: Option<Vec<Point2<f64>>>,
    ) -> Result<bool, BoardSpecError> {
        let source = self.attempted;
        self.attempted += 1;
        let Some(corners) = corners else {
            log::debug!("image {source}: no chessboard");
            return Ok(false);
        };
        let view = CorrespondenceSet::from_grid(&self.board, corners)?;
        self.push(source, view);
        Ok(true)
    }

    /// Record a partial detection labeled with inner-corner coordinates.
    pub fn add_labeled(
        &mut self,
        labeled: &[(u32, u32, Point2<f64>)],
    ) -> Result<bool, BoardSpecError> {
        let source = self.attempted;
        self.attempted += 1;
        if labeled.is_empty() {
            return Ok(false);
        }
        let view = CorrespondenceSet::from_labeled(&self.board, labeled)?;
        self.push(source, view);
        Ok(true)
    }

    fn push(&mut self, source: usize, view: CorrespondenceSet) {
        log::debug!("image {source}: {} corners", view.len());
        self.views.push(view);
        self.sources.push(source);
    }

    pub fn views(&self) -> &[CorrespondenceSet] {
        &self.views
    }

    /// Source image index of accepted view `k`.
    pub fn source_of(&self, k: usize) -> Option<usize> {
        self.sources.get(k).copied()
    }

    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn accepted(&self) -> usize {
        self.views.len()
    }

    pub fn rejected(&self) -> usize {
        self.attempted - self.views.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "found chessboards in {} out of {} images",
            self.accepted(),
            self.attempted
        )
    }

    /// Solve over the accepted views. The dataset image size fills in the
    /// solver's when the latter has none.
    pub fn calibrate(&self, solver: &CalibrationSolver) -> Result<Calibration, CalibrationError> {
        log::info!("{}", self.summary());
        if solver.params().image_size.is_none() && self.image_size.is_some() {
            let mut params = solver.params().clone();
            params.image_size = self.image_size;
            return CalibrationSolver::new(params).solve(&self.views);
        }
        solver.solve(&self.views)
    }
}

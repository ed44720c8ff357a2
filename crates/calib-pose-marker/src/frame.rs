//! Per-frame marker batches.

use calib_pose_core::{CameraModel, ImageSize};
use nalgebra::Point2;

use crate::{
    MarkerObservation, MarkerOutcome, MarkerPoseReport, Move, PoseError, PoseEstimator,
};

/// Half-width of the centered band, in pixels, inside which no move is
/// suggested along an axis.
pub const DEAD_ZONE_PX: f64 = 50.0;

/// Mean of the corner pixels.
pub fn marker_center(corners: &[Point2<f64>]) -> Point2<f64> {
    if corners.is_empty() {
        return Point2::origin();
    }
    let n = corners.len() as f64;
    let (sx, sy) = corners
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point2::new(sx / n, sy / n)
}

/// Camera moves that bring `center` toward the middle of a `size` frame.
///
/// Horizontal hint first, then vertical; each axis is silent inside
/// [`DEAD_ZONE_PX`] of the frame center.
pub fn centering_moves(center: Point2<f64>, size: ImageSize) -> Vec<Move> {
    let fcx = f64::from(size.width) / 2.0;
    let fcy = f64::from(size.height) / 2.0;
    let mut moves = Vec::with_capacity(2);

    if center.x < fcx - DEAD_ZONE_PX {
        moves.push(Move::Right);
    } else if center.x > fcx + DEAD_ZONE_PX {
        moves.push(Move::Left);
    }
    if center.y < fcy - DEAD_ZONE_PX {
        moves.push(Move::Down);
    } else if center.y > fcy + DEAD_ZONE_PX {
        moves.push(Move::Up);
    }
    moves
}

impl PoseEstimator {
    /// Estimate every marker of one frame independently. A rejected marker
    /// never affects its neighbours; outcomes keep the input order.
    pub fn estimate_frame(
        &self,
        markers: &[MarkerObservation],
        length: f64,
        model: &CameraModel,
        image_size: Option<ImageSize>,
    ) -> Vec<MarkerOutcome> {
        markers
            .iter()
            .map(|m| match self.estimate(&m.corners, length, model) {
                Ok(est) => {
                    let center = marker_center(&m.corners);
                    let moves = image_size
                        .map(|size| centering_moves(center, size))
                        .unwrap_or_default();
                    log::debug!(
                        "marker {}: distance {:.3}, rms {:.3} px",
                        m.id,
                        est.pose.distance(),
                        est.reprojection_rms
                    );
                    MarkerOutcome::Pose(MarkerPoseReport {
                        id: m.id,
                        pose: est.pose,
                        euler: est.pose.euler(),
                        distance: est.pose.distance(),
                        center,
                        reprojection_rms: est.reprojection_rms,
                        moves,
                    })
                }
                Err(PoseError::DegenerateMarker(reason)) => {
                    log::debug!("marker {} rejected: {reason}", m.id);
                    MarkerOutcome::Rejected { id: m.id, reason }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centering_follows_dead_zone() {
        let size = ImageSize::new(800, 600);
        assert!(centering_moves(Point2::new(400.0, 300.0), size).is_empty());
        assert!(centering_moves(Point2::new(449.0, 251.0), size).is_empty());
        assert_eq!(
            centering_moves(Point2::new(100.0, 300.0), size),
            vec![Move::Right]
        );
        assert_eq!(
            centering_moves(Point2::new(700.0, 500.0), size),
            vec![Move::Left, Move::Up]
        );
        assert_eq!(
            centering_moves(Point2::new(400.0, 20.0), size),
            vec![Move::Down]
        );
    }

    #[test]
    fn center_is_corner_mean() {
        let c = marker_center(&[
            Point2::new(0.0, 0.0),
            Point2::new(4.0, 0.0),
            Point2::new(4.0, 2.0),
            Point2::new(0.0, 2.0),
        ]);
        assert_eq!(c, Point2::new(2.0, 1.0));
    }
}

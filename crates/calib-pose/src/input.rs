//! JSON inputs produced by an external corner or marker detector.

use std::{fs, path::Path};

use calib_pose_core::{BoardSpecError, ChessboardSpec, ImageSize};
use calib_pose_intrinsics::CalibrationDataset;
use calib_pose_marker::MarkerObservation;
use nalgebra::Point2;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum InputError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Board(#[from] BoardSpecError),
}

pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, InputError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<(), InputError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

/// Chessboard detections over a capture session.
///
/// Each entry of `views` is one image: the full row-major corner list, or
/// `null` when no board was found.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewsFile {
    pub board: ChessboardSpec,
    #[serde(default)]
    pub image_size: Option<ImageSize>,
    pub views: Vec<Option<Vec<Point2<f64>>>>,
}

impl ViewsFile {
    /// Build a dataset. Images whose corner count does not match the board
    /// are logged and counted as misses.
    pub fn into_dataset(self) -> Result<CalibrationDataset, InputError> {
        let mut dataset = CalibrationDataset::new(self.board)?;
        if let Some(size) = self.image_size {
            dataset = dataset.with_image_size(size);
        }
        for (index, corners) in self.views.into_iter().enumerate() {
            if let Err(err) = dataset.add_detection(corners) {
                log::warn!("image {index} skipped: {err}");
            }
        }
        Ok(dataset)
    }
}

/// Marker detections of one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameFile {
    #[serde(default)]
    pub image_size: Option<ImageSize>,
    pub markers: Vec<MarkerObservation>,
}

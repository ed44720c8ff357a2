//! Persisted camera model.
//!
//! The on-disk record mirrors the conventional calibration dump: a row-major
//! 3x3 camera matrix, five distortion coefficients in `[k1, k2, p1, p2, k3]`
//! order and, optionally, the per-view extrinsics and RMS error that came out
//! of the solve.

use std::{fs, path::Path};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::{CameraMatrix, CameraModel, CameraModelError, DistortionCoeffs, ExtrinsicPose, ImageSize};

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid camera model: {0}")]
    Invalid(String),
}

impl From<CameraModelError> for LoadError {
    fn from(err: CameraModelError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Serialized camera model plus optional solve by-products.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub camera_matrix: [f64; 9],
    pub dist_coeffs: [f64; 5],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<ImageSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rms: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rvecs: Vec<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tvecs: Vec<[f64; 3]>,
}

impl CalibrationRecord {
    pub fn from_model(model: &CameraModel) -> Self {
        Self {
            camera_matrix: model.matrix.to_row_major(),
            dist_coeffs: model.distortion.to_array(),
            image_size: None,
            rms: None,
            rvecs: Vec::new(),
            tvecs: Vec::new(),
        }
    }

    pub fn with_image_size(mut self, size: ImageSize) -> Self {
        self.image_size = Some(size);
        self
    }

    pub fn with_rms(mut self, rms: f64) -> Self {
        self.rms = Some(rms);
        self
    }

    pub fn with_poses<'a>(mut self, poses: impl IntoIterator<Item = &'a ExtrinsicPose>) -> Self {
        let (rvecs, tvecs) = poses
            .into_iter()
            .map(|p| {
                let r = p.rvec();
                let t = p.translation;
                ([r.x, r.y, r.z], [t.x, t.y, t.z])
            })
            .unzip();
        self.rvecs = rvecs;
        self.tvecs = tvecs;
        self
    }

    /// Validate and rebuild the camera model.
    pub fn model(&self) -> Result<CameraModel, LoadError> {
        let matrix = CameraMatrix::from_row_major(&self.camera_matrix)?;
        let distortion = DistortionCoeffs::from_array(self.dist_coeffs)?;
        Ok(CameraModel::new(matrix, distortion))
    }

    /// Stored per-view poses, if any.
    pub fn poses(&self) -> Result<Vec<ExtrinsicPose>, LoadError> {
        if self.rvecs.len() != self.tvecs.len() {
            return Err(LoadError::Invalid(format!(
                "{} rotation vectors but {} translation vectors",
                self.rvecs.len(),
                self.tvecs.len()
            )));
        }
        Ok(self
            .rvecs
            .iter()
            .zip(&self.tvecs)
            .map(|(r, t)| ExtrinsicPose::from_rvec_tvec(Vector3::from(*r), Vector3::from(*t)))
            .collect())
    }

    fn validate(&self) -> Result<(), LoadError> {
        self.model()?;
        self.poses()?;
        if let Some(rms) = self.rms {
            if !rms.is_finite() || rms < 0.0 {
                return Err(LoadError::Invalid(format!("rms must be finite and >= 0, got {rms}")));
            }
        }
        Ok(())
    }

    /// Load and validate a record from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, LoadError> {
        let record: Self = serde_json::from_str(raw)?;
        record.validate()?;
        Ok(record)
    }

    /// Write this record to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Load only the camera model from a record file.
pub fn load_camera_model(path: impl AsRef<Path>) -> Result<CameraModel, LoadError> {
    CalibrationRecord::load_json(path)?.model()
}

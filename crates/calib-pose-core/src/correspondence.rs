use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Object-space / image-space point pairs observed in a single view.
///
/// Both sequences always have the same, non-zero length. Object points of a
/// checkerboard view lie on the `z = 0` plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCorrespondences", into = "RawCorrespondences")]
pub struct CorrespondenceSet {
    object: Vec<Point3<f64>>,
    image: Vec<Point2<f64>>,
}

/// Errors raised while building a [`CorrespondenceSet`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CorrespondenceError {
    #[error("correspondence set is empty")]
    Empty,
    #[error("object points ({object}) and image points ({image}) differ in length")]
    LengthMismatch { object: usize, image: usize },
    #[error("non-finite coordinate at index {index}")]
    NonFinite { index: usize },
}

impl CorrespondenceSet {
    /// Pair object points with their image observations.
    pub fn new(
        object: Vec<Point3<f64>>,
        image: Vec<Point2<f64>>,
    ) -> Result<Self, CorrespondenceError> {
        if object.len() != image.len() {
            return Err(CorrespondenceError::LengthMismatch {
                object: object.len(),
                image: image.len(),
            });
        }
        if object.is_empty() {
            return Err(CorrespondenceError::Empty);
        }
        for (index, (o, i)) in object.iter().zip(&image).enumerate() {
            let finite = o.coords.iter().chain(i.coords.iter()).all(|v| v.is_finite());
            if !finite {
                return Err(CorrespondenceError::NonFinite { index });
            }
        }
        Ok(Self { object, image })
    }

    /// Build from `(object, image)` pairs.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (Point3<f64>, Point2<f64>)>,
    ) -> Result<Self, CorrespondenceError> {
        let (object, image) = pairs.into_iter().unzip();
        Self::new(object, image)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.object.len()
    }

    /// Always `false`; kept for API symmetry with slices.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.object.is_empty()
    }

    #[inline]
    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object
    }

    #[inline]
    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Point3<f64>, &Point2<f64>)> {
        self.object.iter().zip(self.image.iter())
    }

    /// True if every object point lies on `z = 0` within `tol`.
    pub fn is_planar(&self, tol: f64) -> bool {
        self.object.iter().all(|p| p.z.abs() <= tol)
    }
}

#[derive(Serialize, Deserialize)]
struct RawCorrespondences {
    object: Vec<[f64; 3]>,
    image: Vec<[f64; 2]>,
}

impl TryFrom<RawCorrespondences> for CorrespondenceSet {
    type Error = CorrespondenceError;

    fn try_from(raw: RawCorrespondences) -> Result<Self, Self::Error> {
        Self::new(
            raw.object.iter().map(|p| Point3::from(*p)).collect(),
            raw.image.iter().map(|p| Point2::from(*p)).collect(),
        )
    }
}

impl From<CorrespondenceSet> for RawCorrespondences {
    fn from(set: CorrespondenceSet) -> Self {
        Self {
            object: set.object.iter().map(|p| [p.x, p.y, p.z]).collect(),
            image: set.image.iter().map(|p| [p.x, p.y]).collect(),
        }
    }
}

use nalgebra::{DVector, Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::{Error, PatternSize, Result, object_points};

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for PixelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pinhole intrinsic matrix
///
/// ```text
/// [fx  s cx]
/// [ 0 fy cy]
/// [ 0  0  1]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraMatrix(pub Matrix3<f64>);

impl Default for CameraMatrix {
    fn default() -> Self {
        Self(Matrix3::identity())
    }
}

impl CameraMatrix {
    /// Build from nine values in row-major order.
    pub fn from_row_major(values: &[f64; 9]) -> Self {
        Self(Matrix3::from_row_slice(values))
    }

    /// The nine values in row-major order.
    pub fn to_row_major(&self) -> [f64; 9] {
        let m = &self.0;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ]
    }

    pub fn fx(&self) -> f64 {
        self.0[(0, 0)]
    }
    pub fn fy(&self) -> f64 {
        self.0[(1, 1)]
    }
    pub fn cx(&self) -> f64 {
        self.0[(0, 2)]
    }
    pub fn cy(&self) -> f64 {
        self.0[(1, 2)]
    }
}

impl std::fmt::Display for CameraMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let m = &self.0;
        write!(f, "[")?;
        for r in 0..3 {
            if r > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}, {}, {}", m[(r, 0)], m[(r, 1)], m[(r, 2)])?;
        }
        write!(f, "]")
    }
}

/// Lens distortion coefficients in OpenCV order
/// `(k1, k2, p1, p2[, k3[, k4, k5, k6]])`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistortionCoefficients(pub DVector<f64>);

impl DistortionCoefficients {
    /// Length of the classic radial-tangential model.
    pub const STANDARD_LEN: usize = 5;
    /// Length handed to the solver as the initial guess (rational model size).
    pub const SOLVER_LEN: usize = 8;

    pub fn zeros(len: usize) -> Self {
        Self(DVector::zeros(len))
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self(DVector::from_column_slice(values))
    }

    pub fn as_slice(&self) -> &[f64] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for DistortionCoefficients {
    fn default() -> Self {
        Self::zeros(Self::STANDARD_LEN)
    }
}

impl std::fmt::Display for DistortionCoefficients {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

/// Board pose relative to the camera as a Rodrigues rotation vector and a
/// translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardPose {
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

/// Detected chessboard corners of one image together with the reference grid
/// they correspond to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerBoardData {
    pattern: PatternSize,
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl CheckerBoardData {
    pub fn new(pattern: PatternSize, square_size: f64, image_points: Vec<Point2<f64>>) -> Result<Self> {
        if image_points.len() != pattern.count() {
            return Err(Error::CornerCountMismatch {
                expected: pattern.count(),
                got: image_points.len(),
            });
        }
        Ok(Self {
            pattern,
            object_points: object_points(pattern, square_size),
            image_points,
        })
    }

    pub fn pattern(&self) -> PatternSize {
        self.pattern
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image_points
    }
}

/// Output of the calibration solver.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// RMS re-projection error reported by the solver.
    pub rms: f64,
    pub camera_matrix: CameraMatrix,
    pub distortion: DistortionCoefficients,
    /// One pose per chessboard view, in input order.
    pub poses: Vec<BoardPose>,
}

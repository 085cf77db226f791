//! Camera calibration from chessboard views.
//!
//! This crate holds everything about a calibration run that does not need a
//! vision library: the chessboard reference grid, the camera model types,
//! the mean reprojection error, and persistence of the results. Corner
//! detection, the calibration solver, point projection and undistortion are
//! provided by an implementation of [`CalibrationBackend`].

mod backend;
pub mod matrix_io;
mod pattern;
mod reprojection;
mod types;
mod yaml;

pub use crate::backend::{CalibrationBackend, compute_reprojection_error};
pub use crate::matrix_io::MatrixFileFormat;
pub use crate::pattern::{DEFAULT_SQUARE_SIZE, PatternSize, object_points};
pub use crate::reprojection::mean_reprojection_error;
pub use crate::types::{
    BoardPose, CalibrationResult, CameraMatrix, CheckerBoardData, DistortionCoefficients,
    PixelSize,
};
pub use crate::yaml::{CalibrationSummary, load_yaml, save_yaml};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    IoPath {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid pattern size \"{0}\" (expected \"cols,rows\" with both at least 2)")]
    InvalidPattern(String),
    #[error("unknown matrix file format \"{0}\" (expected \"flat\" or \"header\")")]
    UnknownMatrixFormat(String),
    #[error("expected {expected} corners for the pattern, got {got}")]
    CornerCountMismatch { expected: usize, got: usize },
    #[error("no chessboard correspondences")]
    NoCorrespondences,
    #[error("{boards} chessboard views but {poses} poses")]
    PoseCountMismatch { boards: usize, poses: usize },
    #[error("projected {got} points, expected {expected}")]
    ProjectionCountMismatch { expected: usize, got: usize },
    #[error("{path}: not a matrix file with header")]
    BadMagic { path: String },
    #[error("{path}: stored shape {found:?} does not match destination {expected:?}")]
    ShapeMismatch {
        path: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("{path}: read {got} of {expected} values")]
    Truncated {
        path: String,
        expected: usize,
        got: usize,
    },
    #[error("{source}")]
    SerdeYaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    pub(crate) fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Backend(Box::new(err))
    }
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send + Sync>() {}
    implements::<Error>();
}

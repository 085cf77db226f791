use image::{DynamicImage, GrayImage, RgbImage};
use nalgebra::{Point2, Point3};

use crate::{
    BoardPose, CalibrationResult, CameraMatrix, CheckerBoardData, DistortionCoefficients,
    PatternSize, PixelSize, Result, mean_reprojection_error,
};

/// Vision primitives needed by a calibration run.
pub trait CalibrationBackend {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Human readable name and version of the underlying library.
    fn version(&self) -> String;

    /// Locate the inner corners of a chessboard.
    ///
    /// Returns `None` when the full pattern is not visible. When found, the
    /// corners are refined to sub-pixel accuracy and ordered row by row.
    fn find_chessboard_corners(
        &self,
        image: &GrayImage,
        pattern: PatternSize,
    ) -> std::result::Result<Option<Vec<Point2<f64>>>, Self::Error>;

    /// Color copy of `image` with the detected corners drawn on it.
    fn draw_chessboard_corners(
        &self,
        image: &GrayImage,
        pattern: PatternSize,
        corners: &[Point2<f64>],
    ) -> std::result::Result<RgbImage, Self::Error>;

    /// Solve for intrinsics, distortion and one pose per board.
    fn calibrate_camera(
        &self,
        boards: &[CheckerBoardData],
        image_size: PixelSize,
    ) -> std::result::Result<CalibrationResult, Self::Error>;

    /// Map reference points through a board pose and the camera model.
    fn project_points(
        &self,
        object_points: &[Point3<f64>],
        pose: &BoardPose,
        camera_matrix: &CameraMatrix,
        distortion: &DistortionCoefficients,
    ) -> std::result::Result<Vec<Point2<f64>>, Self::Error>;

    /// Remove lens distortion, keeping the image size.
    fn undistort(
        &self,
        image: &DynamicImage,
        camera_matrix: &CameraMatrix,
        distortion: &DistortionCoefficients,
    ) -> std::result::Result<DynamicImage, Self::Error>;
}

/// [`mean_reprojection_error`] of a solver result, projecting with `backend`.
pub fn compute_reprojection_error<B: CalibrationBackend>(
    backend: &B,
    boards: &[CheckerBoardData],
    result: &CalibrationResult,
) -> Result<f64> {
    mean_reprojection_error(boards, &result.poses, |pts, pose| {
        backend.project_points(pts, pose, &result.camera_matrix, &result.distortion)
    })
}

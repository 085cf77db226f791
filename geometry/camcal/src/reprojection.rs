use nalgebra::{Point2, Point3};

use crate::{BoardPose, CheckerBoardData, Error, Result};

/// Root-mean-square pixel distance between detected corners and the corners
/// re-projected through the calibrated model.
///
/// `project` maps a board's reference points through one pose. The error is
/// pooled over every corner of every board:
///
/// `sqrt(sum of squared distances / total number of points)`
pub fn mean_reprojection_error<F, E>(
    boards: &[CheckerBoardData],
    poses: &[BoardPose],
    mut project: F,
) -> Result<f64>
where
    F: FnMut(&[Point3<f64>], &BoardPose) -> std::result::Result<Vec<Point2<f64>>, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    if boards.len() != poses.len() {
        return Err(Error::PoseCountMismatch {
            boards: boards.len(),
            poses: poses.len(),
        });
    }

    let mut total_err = 0.0;
    let mut total_points = 0usize;
    for (board, pose) in boards.iter().zip(poses) {
        let projected = project(board.object_points(), pose).map_err(Error::backend)?;
        let detected = board.image_points();
        if projected.len() != detected.len() {
            return Err(Error::ProjectionCountMismatch {
                expected: detected.len(),
                got: projected.len(),
            });
        }
        total_err += detected
            .iter()
            .zip(&projected)
            .map(|(d, p)| (d - p).norm_squared())
            .sum::<f64>();
        total_points += detected.len();
    }

    if total_points == 0 {
        return Err(Error::NoCorrespondences);
    }
    Ok((total_err / total_points as f64).sqrt())
}

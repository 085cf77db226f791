use std::{io::Write, path::Path};

use serde::{Deserialize, Serialize};

use crate::{CalibrationResult, Error, PatternSize, PixelSize, Result};

/// Human readable record of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub image_width: u32,
    pub image_height: u32,
    pub pattern: PatternSize,
    pub square_size: f64,
    pub images_used: usize,
    pub rms: f64,
    pub mean_reprojection_error: f64,
    /// Row-major camera matrix.
    pub camera_matrix: [f64; 9],
    pub distortion_coefficients: Vec<f64>,
}

impl CalibrationSummary {
    pub fn new(
        size: PixelSize,
        pattern: PatternSize,
        square_size: f64,
        images_used: usize,
        result: &CalibrationResult,
        mean_reprojection_error: f64,
    ) -> Self {
        Self {
            image_width: size.width,
            image_height: size.height,
            pattern,
            square_size,
            images_used,
            rms: result.rms,
            mean_reprojection_error,
            camera_matrix: result.camera_matrix.to_row_major(),
            distortion_coefficients: result.distortion.as_slice().to_vec(),
        }
    }
}

pub fn save_yaml<P: AsRef<Path>>(
    path: P,
    pkg_name: &str,
    local: chrono::DateTime<chrono::Local>,
    summary: &CalibrationSummary,
) -> Result<()> {
    let path = path.as_ref();
    let io_err = |source| Error::IoPath {
        path: path.display().to_string(),
        source,
    };
    let mut f = std::fs::File::create(path).map_err(io_err)?;
    f.write_all(
        format!(
            "# Saved by {} at {}\n\
                        # Mean reprojection error: {:.2}\n",
            pkg_name, local, summary.mean_reprojection_error
        )
        .as_bytes(),
    )
    .map_err(io_err)?;
    serde_yaml::to_writer(f, summary)?;
    Ok(())
}

pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<CalibrationSummary> {
    let path = path.as_ref();
    let f = std::fs::File::open(path).map_err(|source| Error::IoPath {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_yaml::from_reader(f)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CameraMatrix, DistortionCoefficients};

    #[test]
    fn yaml_has_comment_header_and_loads_back() {
        let result = CalibrationResult {
            rms: 0.31,
            camera_matrix: CameraMatrix::from_row_major(&[
                810.0, 0.0, 319.5, 0.0, 812.0, 239.5, 0.0, 0.0, 1.0,
            ]),
            distortion: DistortionCoefficients::from_slice(&[-0.2, 0.1, 0.0, 0.0, 0.01]),
            poses: vec![],
        };
        let summary = CalibrationSummary::new(
            PixelSize::new(640, 480),
            PatternSize::default(),
            50.0,
            12,
            &result,
            0.456,
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.yaml");
        save_yaml(&path, "camcal-test", chrono::Local::now(), &summary).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Saved by camcal-test at "));
        assert!(text.contains("# Mean reprojection error: 0.46\n"));

        let loaded = load_yaml(&path).unwrap();
        assert_eq!(loaded, summary);
    }
}

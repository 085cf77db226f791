use std::path::{Path, PathBuf};

use camcal::{
    CalibrationBackend, CalibrationResult, CalibrationSummary, CameraMatrix, CheckerBoardData,
    DEFAULT_SQUARE_SIZE, DistortionCoefficients, MatrixFileFormat, PatternSize, PixelSize,
    matrix_io::{load_double_mat, save_double_mat},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use eyre::{self as anyhow, Context, Result};
use image::ImageFormat;
use tracing::{debug, info, warn};

pub const DEFAULT_IN_MASK: &str = "../resources/2015*.jpg";
pub const DEFAULT_OUT_DIR: &str = "../output/";
pub const CAMERA_MATRIX_FILE: &str = "camera-matrix.bin";
pub const DIST_COEFS_FILE: &str = "dist-coefs.bin";
pub const SUMMARY_FILE: &str = "calibration.yaml";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Glob matching the chessboard images
    #[arg(default_value = DEFAULT_IN_MASK)]
    pub in_mask: String,
    /// Directory receiving debug images and calibration files (created if
    /// missing)
    #[arg(default_value = DEFAULT_OUT_DIR)]
    pub out_dir: Utf8PathBuf,
    /// Chessboard size in inner corners as "cols,rows" (e.g. 8x6 checks
    /// would be 7,5 corners)
    #[arg(default_value_t = PatternSize::default())]
    pub pattern: PatternSize,
    /// Distance between neighbouring corners on the board
    #[arg(long, default_value_t = DEFAULT_SQUARE_SIZE)]
    pub square_size: f64,
    /// Layout of the saved matrix files ("flat" or "header")
    #[arg(long, default_value_t = MatrixFileFormat::Flat)]
    pub matrix_format: MatrixFileFormat,
}

/// All regular files matching `mask`, sorted.
pub fn get_image_files(mask: &str) -> Result<Vec<PathBuf>> {
    let mut paths = vec![];
    for path in glob::glob_with(
        mask,
        glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: true,
        },
    )
    .with_context(|| format!("invalid input mask \"{mask}\""))?
    {
        let path = path?;
        if path.is_file() {
            paths.push(path);
        } else {
            debug!("skipping non-file {}", path.display());
        }
    }

    if paths.is_empty() {
        anyhow::bail!("no files match \"{mask}\"");
    }

    paths.sort();
    Ok(paths)
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Chessboards found in a set of images.
#[derive(Debug, Default)]
pub struct Correspondences {
    pub boards: Vec<CheckerBoardData>,
    /// Size of the first image in which a chessboard was found.
    pub image_size: Option<PixelSize>,
}

impl Correspondences {
    /// Number of images that passed detection.
    pub fn passed(&self) -> usize {
        self.boards.len()
    }
}

/// Detect chessboards in every file, saving `<stem>_output.bmp` with the
/// corners drawn for each image in which the full pattern was found.
pub fn get_points<B: CalibrationBackend>(
    backend: &B,
    fnames: &[PathBuf],
    out_dir: &Utf8Path,
    pattern: PatternSize,
    square_size: f64,
) -> Result<Correspondences> {
    info!("Attempting to find {pattern} chessboard.");
    let mut found = Correspondences::default();
    for fname in fnames.iter() {
        debug!("Processing image: {}", fname.display());
        let gray = image::open(fname)
            .with_context(|| format!("Opening {}", fname.display()))?
            .to_luma8();

        let Some(corners) = backend.find_chessboard_corners(&gray, pattern)? else {
            warn!("Chessboard not found in: {}", fname.display());
            continue;
        };

        let size = PixelSize::new(gray.width(), gray.height());
        match found.image_size {
            None => found.image_size = Some(size),
            Some(first) if first != size => {
                warn!(
                    "{} is {size}, calibrating with the size of the first image ({first})",
                    fname.display()
                );
            }
            Some(_) => {}
        }

        let annotated = backend.draw_chessboard_corners(&gray, pattern, &corners)?;
        let out_name = out_dir.join(format!("{}_output.bmp", stem(fname)));
        debug!("Writing image: {out_name}");
        annotated
            .save_with_format(&out_name, ImageFormat::Bmp)
            .with_context(|| format!("Saving {out_name}"))?;

        found
            .boards
            .push(CheckerBoardData::new(pattern, square_size, corners)?);
    }
    info!("Images passed findChessboardCorners: {}", found.passed());
    Ok(found)
}

/// Run the solver over all detected boards and compute the mean
/// reprojection error of the result.
pub fn calibrate<B: CalibrationBackend>(
    backend: &B,
    found: &Correspondences,
) -> Result<(CalibrationResult, f64)> {
    let Some(size) = found.image_size else {
        anyhow::bail!("no image passed chessboard detection, nothing to calibrate");
    };
    let result = backend
        .calibrate_camera(&found.boards, size)
        .wrap_err("calibrating camera")?;
    info!("Calibration RMS: {}", result.rms);
    info!("Camera matrix: {}", result.camera_matrix);
    info!("Distortion coefficients: {}", result.distortion);

    let mean_error = camcal::compute_reprojection_error(backend, &found.boards, &result)?;
    info!("Mean reprojection error: {mean_error}");
    Ok((result, mean_error))
}

pub fn save_calibration(
    out_dir: &Utf8Path,
    camera_matrix: &CameraMatrix,
    distortion: &DistortionCoefficients,
    format: MatrixFileFormat,
) -> Result<()> {
    save_double_mat(out_dir.join(CAMERA_MATRIX_FILE), &camera_matrix.0, format)?;
    save_double_mat(out_dir.join(DIST_COEFS_FILE), &distortion.0, format)?;
    info!("Saved {CAMERA_MATRIX_FILE} and {DIST_COEFS_FILE} to {out_dir}");
    Ok(())
}

/// Read back the files written by [`save_calibration`].
///
/// The files carry no shape, so the number of distortion coefficients must
/// be supplied. Elements missing from a short file keep their initial value
/// (identity matrix, zero coefficients).
pub fn load_calibration(
    out_dir: &Utf8Path,
    dist_len: usize,
    format: MatrixFileFormat,
) -> Result<(CameraMatrix, DistortionCoefficients)> {
    let mut camera_matrix = CameraMatrix::default();
    load_double_mat(out_dir.join(CAMERA_MATRIX_FILE), &mut camera_matrix.0, format)?;
    let mut distortion = DistortionCoefficients::zeros(dist_len);
    load_double_mat(out_dir.join(DIST_COEFS_FILE), &mut distortion.0, format)?;
    info!("Loaded camera matrix: {camera_matrix}");
    info!("Loaded distortion coefficients: {distortion}");
    Ok((camera_matrix, distortion))
}

/// Undistort every file, saving `<stem>_undistort_output.bmp`. Images are
/// read with their original channels.
pub fn undistort_all<B: CalibrationBackend>(
    backend: &B,
    fnames: &[PathBuf],
    out_dir: &Utf8Path,
    camera_matrix: &CameraMatrix,
    distortion: &DistortionCoefficients,
) -> Result<usize> {
    for fname in fnames.iter() {
        debug!("Reading image: {}", fname.display());
        let img = image::open(fname).with_context(|| format!("Opening {}", fname.display()))?;
        let undistorted = backend.undistort(&img, camera_matrix, distortion)?;
        let out_name = out_dir.join(format!("{}_undistort_output.bmp", stem(fname)));
        debug!("Writing image: {out_name}");
        undistorted
            .save_with_format(&out_name, ImageFormat::Bmp)
            .with_context(|| format!("Saving {out_name}"))?;
    }
    Ok(fnames.len())
}

pub fn run_cal<B: CalibrationBackend>(cli: Cli, backend: &B) -> Result<()> {
    let start = std::time::Instant::now();
    info!("{}", backend.version());
    info!("Input mask: {}", cli.in_mask);
    info!("Output dir: {}", cli.out_dir);
    info!("Pattern size: {}", cli.pattern);

    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("Creating output directory {}", cli.out_dir))?;

    let fnames = get_image_files(&cli.in_mask)?;
    let found = get_points(
        backend,
        &fnames,
        &cli.out_dir,
        cli.pattern,
        cli.square_size,
    )?;
    let (result, mean_error) = calibrate(backend, &found)?;

    save_calibration(
        &cli.out_dir,
        &result.camera_matrix,
        &result.distortion,
        cli.matrix_format,
    )?;

    if let Some(size) = found.image_size {
        let summary = CalibrationSummary::new(
            size,
            cli.pattern,
            cli.square_size,
            found.passed(),
            &result,
            mean_error,
        );
        let summary_file = cli.out_dir.join(SUMMARY_FILE);
        camcal::save_yaml(
            &summary_file,
            env!["CARGO_PKG_NAME"],
            chrono::Local::now(),
            &summary,
        )?;
        info!("Saved calibration summary to file: {summary_file}");
    }

    let (camera_matrix, distortion) =
        load_calibration(&cli.out_dir, result.distortion.len(), cli.matrix_format)?;

    // Second pass over the same mask.
    let fnames = get_image_files(&cli.in_mask)?;
    let n = undistort_all(backend, &fnames, &cli.out_dir, &camera_matrix, &distortion)?;
    info!("Undistorted {n} images");

    info!("Elapsed time: {:.3} seconds", start.elapsed().as_secs_f64());
    Ok(())
}

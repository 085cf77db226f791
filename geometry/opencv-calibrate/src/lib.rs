//! OpenCV implementation of [`camcal::CalibrationBackend`].
//!
//! Images cross the boundary as contiguous 8-bit buffers copied into owned
//! [`Mat`] values, so every OpenCV allocation is released when the `Mat` is
//! dropped.

use camcal::{
    BoardPose, CalibrationBackend, CalibrationResult, CameraMatrix, CheckerBoardData,
    DistortionCoefficients, PatternSize, PixelSize,
};
use image::{DynamicImage, GrayImage, ImageBuffer, Pixel, RgbImage};
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use opencv::{
    calib3d,
    core::{
        CV_8UC1, CV_8UC2, CV_8UC3, CV_8UC4, CV_64F, Mat, Point2d, Point2f, Point3d, Point3f,
        Scalar, Size, TermCriteria, TermCriteria_Type, Vector,
    },
    imgproc,
    prelude::*,
};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("image dimension {0} too large for OpenCV")]
    Dimension(u32),
    #[error("pixel buffer has {got} bytes, expected {expected}")]
    BufferSize { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send + Sync>() {}
    implements::<Error>();
}

/// Sub-pixel refinement search window (half size 5 in each direction).
const SUBPIX_WINDOW: (i32, i32) = (5, 5);
const SUBPIX_MAX_ITER: i32 = 30;
const SUBPIX_EPSILON: f64 = 0.1;

/// Number of distortion coefficients handed to the solver as the initial
/// guess. The solver may return fewer.
const INITIAL_DIST_LEN: usize = DistortionCoefficients::SOLVER_LEN;

/// Calibration backend using the system OpenCV library.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpencvBackend {}

impl OpencvBackend {
    pub fn new() -> Self {
        Self {}
    }
}

fn cv_dim(v: u32) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::Dimension(v))
}

fn cv_size(width: u32, height: u32) -> Result<Size> {
    Ok(Size::new(cv_dim(width)?, cv_dim(height)?))
}

fn pattern_size(pattern: PatternSize) -> Result<Size> {
    cv_size(pattern.cols, pattern.rows)
}

fn subpix_criteria() -> Result<TermCriteria> {
    Ok(TermCriteria::new(
        TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
        SUBPIX_MAX_ITER,
        SUBPIX_EPSILON,
    )?)
}

/// Copy a packed 8-bit buffer into a new `Mat` of the given type.
fn bytes_to_mat(width: u32, height: u32, typ: i32, data: &[u8]) -> Result<Mat> {
    let mut mat =
        Mat::new_rows_cols_with_default(cv_dim(height)?, cv_dim(width)?, typ, Scalar::all(0.0))?;
    let dst = mat.data_bytes_mut()?;
    if dst.len() != data.len() {
        return Err(Error::BufferSize {
            expected: dst.len(),
            got: data.len(),
        });
    }
    dst.copy_from_slice(data);
    Ok(mat)
}

fn mat_bytes(mat: &Mat) -> Result<Vec<u8>> {
    if mat.is_continuous() {
        Ok(mat.data_bytes()?.to_vec())
    } else {
        let packed = mat.try_clone()?;
        Ok(packed.data_bytes()?.to_vec())
    }
}

fn buffer_from_mat<P>(mat: &Mat, width: u32, height: u32) -> Result<ImageBuffer<P, Vec<u8>>>
where
    P: Pixel<Subpixel = u8>,
{
    let bytes = mat_bytes(mat)?;
    let got = bytes.len();
    ImageBuffer::from_raw(width, height, bytes).ok_or(Error::BufferSize {
        expected: width as usize * height as usize * P::CHANNEL_COUNT as usize,
        got,
    })
}

fn row_mat(values: &[f64]) -> Result<Mat> {
    let cols = i32::try_from(values.len()).map_err(|_| Error::Dimension(u32::MAX))?;
    let mut mat = Mat::new_rows_cols_with_default(1, cols, CV_64F, Scalar::all(0.0))?;
    for (i, v) in values.iter().enumerate() {
        *mat.at_mut::<f64>(i as i32)? = *v;
    }
    Ok(mat)
}

fn row_values(mat: &Mat) -> Result<Vec<f64>> {
    (0..mat.total())
        .map(|i| mat.at::<f64>(i as i32).copied().map_err(Error::from))
        .collect()
}

fn camera_to_mat(k: &CameraMatrix) -> Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(3, 3, CV_64F, Scalar::all(0.0))?;
    for r in 0..3 {
        for c in 0..3 {
            *mat.at_2d_mut::<f64>(r as i32, c as i32)? = k.0[(r, c)];
        }
    }
    Ok(mat)
}

fn camera_from_mat(mat: &Mat) -> Result<CameraMatrix> {
    let mut k = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            k[(r, c)] = *mat.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(CameraMatrix(k))
}

fn vec3_from_mat(mat: &Mat) -> Result<Vector3<f64>> {
    let v = row_values(mat)?;
    if v.len() != 3 {
        return Err(Error::BufferSize {
            expected: 3,
            got: v.len(),
        });
    }
    Ok(Vector3::new(v[0], v[1], v[2]))
}

fn object_points_f32(pts: &[Point3<f64>]) -> Vector<Point3f> {
    pts.iter()
        .map(|p| Point3f::new(p.x as f32, p.y as f32, p.z as f32))
        .collect()
}

fn image_points_f32(pts: &[Point2<f64>]) -> Vector<Point2f> {
    pts.iter()
        .map(|p| Point2f::new(p.x as f32, p.y as f32))
        .collect()
}

/// Pixel layouts passed to OpenCV without conversion.
#[derive(Debug, Clone, Copy)]
enum Layout {
    Gray,
    GrayAlpha,
    Rgb,
    Rgba,
}

fn dynamic_to_mat(image: &DynamicImage) -> Result<(Mat, Layout)> {
    let (w, h) = (image.width(), image.height());
    let converted;
    let image = match image {
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageRgba8(_) => image,
        other => {
            // OpenCV undistortion here is limited to 8-bit channels.
            debug!("converting {:?} image to 8 bits per channel", other.color());
            let color = other.color();
            converted = match (color.has_color(), color.has_alpha()) {
                (false, false) => DynamicImage::ImageLuma8(other.to_luma8()),
                (false, true) => DynamicImage::ImageLumaA8(other.to_luma_alpha8()),
                (true, false) => DynamicImage::ImageRgb8(other.to_rgb8()),
                (true, true) => DynamicImage::ImageRgba8(other.to_rgba8()),
            };
            &converted
        }
    };
    let (typ, layout) = match image {
        DynamicImage::ImageLuma8(_) => (CV_8UC1, Layout::Gray),
        DynamicImage::ImageLumaA8(_) => (CV_8UC2, Layout::GrayAlpha),
        DynamicImage::ImageRgb8(_) => (CV_8UC3, Layout::Rgb),
        _ => (CV_8UC4, Layout::Rgba),
    };
    Ok((bytes_to_mat(w, h, typ, image.as_bytes())?, layout))
}

fn mat_to_dynamic(mat: &Mat, width: u32, height: u32, layout: Layout) -> Result<DynamicImage> {
    Ok(match layout {
        Layout::Gray => DynamicImage::ImageLuma8(buffer_from_mat(mat, width, height)?),
        Layout::GrayAlpha => DynamicImage::ImageLumaA8(buffer_from_mat(mat, width, height)?),
        Layout::Rgb => DynamicImage::ImageRgb8(buffer_from_mat(mat, width, height)?),
        Layout::Rgba => DynamicImage::ImageRgba8(buffer_from_mat(mat, width, height)?),
    })
}

impl CalibrationBackend for OpencvBackend {
    type Error = Error;

    fn version(&self) -> String {
        format!("OpenCV {}", opencv::core::CV_VERSION)
    }

    fn find_chessboard_corners(
        &self,
        image: &GrayImage,
        pattern: PatternSize,
    ) -> Result<Option<Vec<Point2<f64>>>> {
        let gray = bytes_to_mat(image.width(), image.height(), CV_8UC1, image.as_raw())?;
        let size = pattern_size(pattern)?;
        let mut corners = Vector::<Point2f>::new();
        if !calib3d::find_chessboard_corners_def(&gray, size, &mut corners)? {
            return Ok(None);
        }
        imgproc::corner_sub_pix(
            &gray,
            &mut corners,
            Size::new(SUBPIX_WINDOW.0, SUBPIX_WINDOW.1),
            Size::new(-1, -1),
            subpix_criteria()?,
        )?;
        Ok(Some(
            corners
                .iter()
                .map(|p| Point2::new(p.x as f64, p.y as f64))
                .collect(),
        ))
    }

    fn draw_chessboard_corners(
        &self,
        image: &GrayImage,
        pattern: PatternSize,
        corners: &[Point2<f64>],
    ) -> Result<RgbImage> {
        let (w, h) = image.dimensions();
        let gray = bytes_to_mat(w, h, CV_8UC1, image.as_raw())?;
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(&gray, &mut bgr, imgproc::COLOR_GRAY2BGR)?;
        calib3d::draw_chessboard_corners(
            &mut bgr,
            pattern_size(pattern)?,
            &image_points_f32(corners),
            true,
        )?;
        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;
        buffer_from_mat(&rgb, w, h)
    }

    fn calibrate_camera(
        &self,
        boards: &[CheckerBoardData],
        image_size: PixelSize,
    ) -> Result<CalibrationResult> {
        let object_points: Vector<Vector<Point3f>> = boards
            .iter()
            .map(|b| object_points_f32(b.object_points()))
            .collect();
        let image_points: Vector<Vector<Point2f>> = boards
            .iter()
            .map(|b| image_points_f32(b.image_points()))
            .collect();

        let mut camera = camera_to_mat(&CameraMatrix::default())?;
        let mut dist = row_mat(&[0.0; INITIAL_DIST_LEN])?;
        let mut rvecs = Vector::<Mat>::new();
        let mut tvecs = Vector::<Mat>::new();

        debug!(
            "calibrating from {} views of {} points",
            boards.len(),
            boards.first().map(|b| b.object_points().len()).unwrap_or(0)
        );
        let rms = calib3d::calibrate_camera_def(
            &object_points,
            &image_points,
            cv_size(image_size.width, image_size.height)?,
            &mut camera,
            &mut dist,
            &mut rvecs,
            &mut tvecs,
        )?;

        let poses = rvecs
            .iter()
            .zip(tvecs.iter())
            .map(|(r, t)| {
                Ok(BoardPose {
                    rvec: vec3_from_mat(&r)?,
                    tvec: vec3_from_mat(&t)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CalibrationResult {
            rms,
            camera_matrix: camera_from_mat(&camera)?,
            distortion: DistortionCoefficients::from_slice(&row_values(&dist)?),
            poses,
        })
    }

    fn project_points(
        &self,
        object_points: &[Point3<f64>],
        pose: &BoardPose,
        camera_matrix: &CameraMatrix,
        distortion: &DistortionCoefficients,
    ) -> Result<Vec<Point2<f64>>> {
        let obj: Vector<Point3d> = object_points
            .iter()
            .map(|p| Point3d::new(p.x, p.y, p.z))
            .collect();
        let rvec = row_mat(pose.rvec.as_slice())?;
        let tvec = row_mat(pose.tvec.as_slice())?;
        let camera = camera_to_mat(camera_matrix)?;
        let dist = row_mat(distortion.as_slice())?;
        let mut projected = Vector::<Point2d>::new();
        calib3d::project_points_def(&obj, &rvec, &tvec, &camera, &dist, &mut projected)?;
        Ok(projected.iter().map(|p| Point2::new(p.x, p.y)).collect())
    }

    fn undistort(
        &self,
        image: &DynamicImage,
        camera_matrix: &CameraMatrix,
        distortion: &DistortionCoefficients,
    ) -> Result<DynamicImage> {
        let (w, h) = (image.width(), image.height());
        let (src, layout) = dynamic_to_mat(image)?;
        let camera = camera_to_mat(camera_matrix)?;
        let dist = row_mat(distortion.as_slice())?;
        // alpha = 0: only valid pixels remain in the output
        let new_camera =
            calib3d::get_optimal_new_camera_matrix_def(&camera, &dist, cv_size(w, h)?, 0.0)?;
        let mut dst = Mat::default();
        calib3d::undistort(&src, &mut dst, &camera, &dist, &new_camera)?;
        mat_to_dynamic(&dst, w, h, layout)
    }
}

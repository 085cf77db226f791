use opencv::{
    core::{CV_8UC1, CV_8UC3, CV_8UC4, Mat, Scalar},
    highgui,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::{debug, warn};

use crate::{CaptureTarget, DisplayImage, Error, Frame, FrameSize, FrameSource, Result, Surface};

const KEY_ESC: i32 = 27;

/// Camera or stream opened through OpenCV's videoio.
pub struct OpencvCapture {
    cap: VideoCapture,
    mat: Mat,
}

impl OpencvCapture {
    pub fn open(target: &CaptureTarget) -> Result<Self> {
        let cap = match target {
            CaptureTarget::Index(idx) => VideoCapture::new(*idx, videoio::CAP_ANY)?,
            CaptureTarget::Url(url) => VideoCapture::from_file(url, videoio::CAP_ANY)?,
        };
        Ok(Self {
            cap,
            mat: Mat::default(),
        })
    }
}

impl FrameSource for OpencvCapture {
    fn frame_size(&self) -> Result<FrameSize> {
        // `as` saturates, so negative or NaN sizes become 0
        let width = self.cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let height = self.cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        Ok(FrameSize::new(width, height))
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if !self.cap.read(&mut self.mat)? || self.mat.empty() {
            return Ok(None);
        }
        let channels = u8::try_from(self.mat.channels()).map_err(|_| Error::Channels(0))?;
        let data = if self.mat.is_continuous() {
            self.mat.data_bytes()?.to_vec()
        } else {
            self.mat.try_clone()?.data_bytes()?.to_vec()
        };
        Ok(Some(Frame {
            width: self.mat.cols() as u32,
            height: self.mat.rows() as u32,
            channels,
            data,
        }))
    }
}

impl Drop for OpencvCapture {
    fn drop(&mut self) {
        if let Err(e) = self.cap.release() {
            warn!("releasing capture device failed: {e}");
        } else {
            debug!("capture device released");
        }
    }
}

/// HighGUI window. Esc or closing the window ends the view.
pub struct HighguiSurface {
    window: String,
    mat: Mat,
}

impl HighguiSurface {
    pub fn new(title: &str) -> Result<Self> {
        highgui::named_window(title, highgui::WINDOW_AUTOSIZE)?;
        Ok(Self {
            window: title.to_string(),
            mat: Mat::default(),
        })
    }
}

impl Surface for HighguiSurface {
    fn paint(&mut self, image: &DisplayImage) -> Result<()> {
        let typ = match image.channels() {
            1 => CV_8UC1,
            3 => CV_8UC3,
            4 => CV_8UC4,
            c => return Err(Error::Channels(c)),
        };
        let (rows, cols) = (image.height() as i32, image.width() as i32);
        if self.mat.rows() != rows || self.mat.cols() != cols || self.mat.typ() != typ {
            self.mat = Mat::new_rows_cols_with_default(rows, cols, typ, Scalar::all(0.0))?;
        }
        self.mat.data_bytes_mut()?.copy_from_slice(image.data());
        highgui::imshow(&self.window, &self.mat)?;
        Ok(())
    }

    fn poll_exit(&mut self) -> Result<bool> {
        if highgui::wait_key(1)? == KEY_ESC {
            return Ok(true);
        }
        let visible = highgui::get_window_property(&self.window, highgui::WND_PROP_VISIBLE)?;
        Ok(visible < 1.0)
    }
}

impl Drop for HighguiSurface {
    fn drop(&mut self) {
        if let Err(e) = highgui::destroy_window(&self.window) {
            warn!("closing window failed: {e}");
        }
    }
}

//! Live view of a video capture device.
//!
//! A background thread pulls frames from a [`FrameSource`], copies each one
//! into the shared [`Canvas`] and sends a repaint request over a channel. The
//! thread that owns the [`Surface`] waits for those requests and paints the
//! canvas while holding its lock.

use std::{
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

#[cfg(feature = "opencv")]
mod opencv_source;
#[cfg(feature = "opencv")]
pub use opencv_source::{HighguiSurface, OpencvCapture};

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to open device {0}")]
    DeviceOpen(String),
    #[error("camera index out of range: {0}")]
    InvalidIndex(String),
    #[error("frame buffer has {got} bytes, expected {expected}")]
    FrameLength { expected: usize, got: usize },
    #[error("unsupported channel count {0}")]
    Channels(u8),
    #[error("capture thread panicked")]
    CaptureThreadPanicked,
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

// ---------------------------
// capture target

static INDEX_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    // optional sign, then one or more digits
    regex::Regex::new(r"^-?\d+$").expect("valid regex")
});

/// What to open: a camera by index, or anything else the capture library
/// accepts by name (device path, file, stream URL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    Index(i32),
    Url(String),
}

impl std::str::FromStr for CaptureTarget {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        if INDEX_RE.is_match(s) {
            let idx = s.parse().map_err(|_| Error::InvalidIndex(s.to_string()))?;
            Ok(CaptureTarget::Index(idx))
        } else {
            Ok(CaptureTarget::Url(s.to_string()))
        }
    }
}

impl std::fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CaptureTarget::Index(idx) => write!(f, "{idx}"),
            CaptureTarget::Url(url) => write!(f, "{url}"),
        }
    }
}

// ---------------------------
// frames

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Capture backends report a zero size for devices that failed to open.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl std::fmt::Display for FrameSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Packed 8-bit pixels straight from the capture device, rows top to
/// bottom, channels interleaved in the device's order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

fn packed_len(width: u32, height: u32, channels: u8) -> usize {
    width as usize * height as usize * channels as usize
}

/// Image ready for painting, with the same dimensions and pixel layout as
/// the frame it was converted from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayImage {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<u8>,
}

impl DisplayImage {
    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn channels(&self) -> u8 {
        self.channels
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Copy a frame into a display image. No resizing, no colour conversion.
pub fn convert(frame: &Frame) -> Result<DisplayImage> {
    if frame.channels == 0 || frame.channels > 4 {
        return Err(Error::Channels(frame.channels));
    }
    let expected = packed_len(frame.width, frame.height, frame.channels);
    if frame.data.len() != expected {
        return Err(Error::FrameLength {
            expected,
            got: frame.data.len(),
        });
    }
    Ok(DisplayImage {
        width: frame.width,
        height: frame.height,
        channels: frame.channels,
        data: frame.data.clone(),
    })
}

// ---------------------------
// canvas

/// Most recent display image, shared between the capture thread and the
/// painting thread.
#[derive(Clone, Default)]
pub struct Canvas {
    inner: Arc<Mutex<Option<DisplayImage>>>,
}

impl Canvas {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DisplayImage>> {
        // A panic while holding the lock leaves a complete image behind.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update(&self, image: DisplayImage) {
        *self.lock() = Some(image);
    }

    /// Paint the current image, if any. Returns whether anything was drawn.
    pub fn paint<U: Surface + ?Sized>(&self, surface: &mut U) -> Result<bool> {
        let guard = self.lock();
        match guard.as_ref() {
            Some(image) => {
                surface.paint(image)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn snapshot(&self) -> Option<DisplayImage> {
        self.lock().clone()
    }
}

// ---------------------------
// traits

/// A capture device.
pub trait FrameSource: Send {
    /// Frame size reported by the device. Zero when it could not be opened.
    fn frame_size(&self) -> Result<FrameSize>;
    /// Block until the next frame. `Ok(None)` means the stream has ended.
    fn read_frame(&mut self) -> Result<Option<Frame>>;
}

/// A window the images are drawn into.
pub trait Surface {
    fn paint(&mut self, image: &DisplayImage) -> Result<()>;
    /// Process pending window events. Returns true once the user asked to
    /// quit.
    fn poll_exit(&mut self) -> Result<bool>;
}

// ---------------------------
// capture thread

/// Read, convert and request a repaint until the source fails or ends, the
/// repaint receiver goes away, or `stop` is set. Returns the number of
/// frames delivered.
pub fn capture_loop<S: FrameSource + ?Sized>(
    source: &mut S,
    canvas: &Canvas,
    repaint_tx: &Sender<u64>,
    stop: &AtomicBool,
) -> u64 {
    let mut n_frames = 0;
    loop {
        if stop.load(Ordering::SeqCst) {
            debug!("capture stop requested");
            break;
        }
        let frame = match source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("capture stream ended");
                break;
            }
            Err(e) => {
                warn!("reading frame failed: {e}");
                break;
            }
        };
        match convert(&frame) {
            Ok(image) => canvas.update(image),
            Err(e) => {
                error!("cannot display frame: {e}");
                break;
            }
        }
        n_frames += 1;
        if repaint_tx.send(n_frames).is_err() {
            debug!("repaint receiver gone");
            break;
        }
    }
    n_frames
}

/// Owns the capture thread and, through it, the frame source.
pub struct CaptureThread<S: FrameSource + 'static> {
    handle: Option<JoinHandle<(S, u64)>>,
    stop: Arc<AtomicBool>,
}

impl<S: FrameSource + 'static> CaptureThread<S> {
    pub fn spawn(source: S, canvas: Canvas, repaint_tx: Sender<u64>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let mut source = source;
                let n_frames = capture_loop(&mut source, &canvas, &repaint_tx, &stop2);
                (source, n_frames)
            })?;
        Ok(Self {
            handle: Some(handle),
            stop,
        })
    }

    /// Ask the capture loop to finish after the frame it is reading.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the capture loop, then release the source.
    pub fn join(mut self) -> Result<u64> {
        let handle = self.handle.take().ok_or(Error::CaptureThreadPanicked)?;
        let (source, n_frames) = handle.join().map_err(|_| Error::CaptureThreadPanicked)?;
        drop(source);
        debug!("capture source released");
        Ok(n_frames)
    }
}

impl<S: FrameSource + 'static> Drop for CaptureThread<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.request_stop();
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

/// How long the painting thread waits for a repaint request before it
/// handles window events again.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Show frames from `source` until the stream ends or the user quits.
///
/// The surface is created with `open_surface` only after the source reported
/// a usable frame size. Returns the number of captured frames.
pub fn run_viewer<S, U, F>(source: S, open_surface: F) -> Result<u64>
where
    S: FrameSource + 'static,
    U: Surface,
    F: FnOnce(FrameSize) -> Result<U>,
{
    let frame_size = source.frame_size()?;
    if !frame_size.is_valid() {
        error!("Unable to open device");
        return Err(Error::DeviceOpen(format!("(reported size {frame_size})")));
    }
    info!("Resolution: {frame_size}");
    info!("Press [Esc] to exit");

    let mut surface = open_surface(frame_size)?;
    let canvas = Canvas::default();
    let (repaint_tx, repaint_rx) = crossbeam_channel::unbounded();
    let capture = CaptureThread::spawn(source, canvas.clone(), repaint_tx)?;

    loop {
        if surface.poll_exit()? {
            info!("exit requested");
            capture.request_stop();
            break;
        }
        match repaint_rx.recv_timeout(POLL_INTERVAL) {
            Ok(_) => {
                // only the latest image matters
                while repaint_rx.try_recv().is_ok() {}
                canvas.paint(&mut surface)?;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Close the receiving end so a capture loop blocked on it exits.
    drop(repaint_rx);
    let n_frames = capture.join()?;
    info!("captured {n_frames} frames");
    Ok(n_frames)
}

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use capture_ui::{
    Canvas, CaptureThread, DisplayImage, Error, Frame, FrameSize, FrameSource, Surface,
    capture_loop, run_viewer,
};
use tracing_test::traced_test;

enum Step {
    Frame(Frame),
    End,
    Fail,
}

/// Scripted source. Counts reads and records when it is dropped.
struct ScriptedSource {
    size: FrameSize,
    steps: VecDeque<Step>,
    reads: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
}

impl ScriptedSource {
    fn new(size: FrameSize, steps: Vec<Step>) -> Self {
        Self {
            size,
            steps: steps.into(),
            reads: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn frame_size(&self) -> capture_ui::Result<FrameSize> {
        Ok(self.size)
    }

    fn read_frame(&mut self) -> capture_ui::Result<Option<Frame>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            Some(Step::Frame(f)) => Ok(Some(f)),
            Some(Step::Fail) => Err(std::io::Error::other("device unplugged").into()),
            Some(Step::End) | None => Ok(None),
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// Endless source of identical frames.
struct Endless {
    frame: Frame,
}

impl FrameSource for Endless {
    fn frame_size(&self) -> capture_ui::Result<FrameSize> {
        Ok(FrameSize::new(self.frame.width, self.frame.height))
    }
    fn read_frame(&mut self) -> capture_ui::Result<Option<Frame>> {
        std::thread::sleep(std::time::Duration::from_millis(1));
        Ok(Some(self.frame.clone()))
    }
}

#[derive(Default)]
struct RecordingSurface {
    painted: Vec<DisplayImage>,
    /// Report an exit request once this many frames were painted.
    exit_after: Option<usize>,
}

impl Surface for RecordingSurface {
    fn paint(&mut self, image: &DisplayImage) -> capture_ui::Result<()> {
        self.painted.push(image.clone());
        Ok(())
    }
    fn poll_exit(&mut self) -> capture_ui::Result<bool> {
        Ok(self.exit_after.is_some_and(|n| self.painted.len() >= n))
    }
}

fn frame(value: u8) -> Frame {
    Frame {
        width: 4,
        height: 2,
        channels: 3,
        data: vec![value; 4 * 2 * 3],
    }
}

#[test]
fn failing_first_read_ends_immediately() {
    let mut source = ScriptedSource::new(
        FrameSize::new(4, 2),
        vec![Step::Fail, Step::Frame(frame(1))],
    );
    let canvas = Canvas::default();
    let (tx, rx) = crossbeam_channel::unbounded();
    let stop = AtomicBool::new(false);

    let n = capture_loop(&mut source, &canvas, &tx, &stop);

    assert_eq!(n, 0);
    assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    assert!(canvas.snapshot().is_none());
    assert!(rx.try_recv().is_err());
}

#[test]
fn each_frame_is_converted_and_repainted() {
    let mut source = ScriptedSource::new(
        FrameSize::new(4, 2),
        vec![Step::Frame(frame(1)), Step::Frame(frame(2)), Step::End],
    );
    let canvas = Canvas::default();
    let (tx, rx) = crossbeam_channel::unbounded();
    let stop = AtomicBool::new(false);

    let n = capture_loop(&mut source, &canvas, &tx, &stop);

    assert_eq!(n, 2);
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2]);
    let latest = canvas.snapshot().unwrap();
    assert_eq!(latest.data(), frame(2).data.as_slice());
}

#[test]
fn stop_flag_is_checked_before_reading() {
    let mut source = ScriptedSource::new(FrameSize::new(4, 2), vec![Step::Frame(frame(1))]);
    let canvas = Canvas::default();
    let (tx, _rx) = crossbeam_channel::unbounded();
    let stop = AtomicBool::new(true);

    assert_eq!(capture_loop(&mut source, &canvas, &tx, &stop), 0);
    assert_eq!(source.reads.load(Ordering::SeqCst), 0);
}

#[test]
fn malformed_frame_ends_loop() {
    let mut bad = frame(0);
    bad.data.pop();
    let mut source = ScriptedSource::new(
        FrameSize::new(4, 2),
        vec![Step::Frame(bad), Step::Frame(frame(1))],
    );
    let canvas = Canvas::default();
    let (tx, rx) = crossbeam_channel::unbounded();
    let stop = AtomicBool::new(false);

    assert_eq!(capture_loop(&mut source, &canvas, &tx, &stop), 0);
    assert!(canvas.snapshot().is_none());
    assert!(rx.try_recv().is_err());
}

#[test]
fn join_releases_source() {
    let source = ScriptedSource::new(FrameSize::new(4, 2), vec![Step::Frame(frame(7)), Step::End]);
    let dropped = source.dropped.clone();
    let canvas = Canvas::default();
    let (tx, rx) = crossbeam_channel::unbounded();

    let capture = CaptureThread::spawn(source, canvas.clone(), tx).unwrap();
    let n = capture.join().unwrap();

    assert_eq!(n, 1);
    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(rx.recv().unwrap(), 1);
    assert_eq!(canvas.snapshot().unwrap().data()[0], 7);
}

#[test]
#[traced_test]
fn viewer_paints_until_stream_ends() {
    let source = ScriptedSource::new(
        FrameSize::new(4, 2),
        vec![Step::Frame(frame(1)), Step::Frame(frame(2)), Step::Frame(frame(3))],
    );
    let dropped = source.dropped.clone();
    let painted = Arc::new(Mutex::new(Vec::new()));
    let mut opened = None;

    let n = run_viewer(source, |size| {
        opened = Some(size);
        Ok(PaintLog(painted.clone()))
    })
    .unwrap();

    assert_eq!(n, 3);
    assert_eq!(opened, Some(FrameSize::new(4, 2)));
    assert!(dropped.load(Ordering::SeqCst));
    // repaint requests may be coalesced, but the last frame is always shown
    let painted = painted.lock().unwrap();
    assert!(!painted.is_empty() && painted.len() <= 3);
    assert_eq!(*painted.last().unwrap(), 3);
    assert!(logs_contain("Resolution: 4x2"));
    assert!(logs_contain("Press [Esc] to exit"));
}

/// Surface that keeps the first byte of every painted image.
struct PaintLog(Arc<Mutex<Vec<u8>>>);

impl Surface for PaintLog {
    fn paint(&mut self, image: &DisplayImage) -> capture_ui::Result<()> {
        self.0.lock().unwrap().push(image.data()[0]);
        Ok(())
    }
    fn poll_exit(&mut self) -> capture_ui::Result<bool> {
        Ok(false)
    }
}

#[test]
fn viewer_exits_on_request() {
    let source = Endless { frame: frame(9) };
    let n = run_viewer(source, |_| {
        Ok(RecordingSurface {
            exit_after: Some(2),
            ..Default::default()
        })
    })
    .unwrap();
    assert!(n >= 2);
}

#[test]
#[traced_test]
fn zero_frame_size_is_fatal() {
    let source = ScriptedSource::new(FrameSize::new(0, 0), vec![Step::Frame(frame(1))]);
    let reads = source.reads.clone();
    let mut opened = false;
    let r = run_viewer(source, |_| {
        opened = true;
        Ok(RecordingSurface::default())
    });
    assert!(matches!(r, Err(Error::DeviceOpen(_))));
    assert!(!opened);
    assert_eq!(reads.load(Ordering::SeqCst), 0);
    assert!(logs_contain("Unable to open device"));
}

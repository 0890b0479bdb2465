//! Video segment recording.
//!
//! A channel has at most one open encoding session. The session is opened on
//! the first fire event, receives every frame until its deadline and is then
//! closed. The encoder itself sits behind [`VideoSink`]; the default backend
//! pipes raw RGB frames into an `ffmpeg` child process.

use crate::detection::Frame;
use image::imageops::{self, FilterType};
use image::RgbImage;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by the encoding backend.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Failed to start encoder for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Encoder exited with status {code:?} for {path}: {stderr}")]
    EncoderExit {
        path: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Segment writer already closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Geometry and rate of an encoding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

/// An open encoding session.
pub trait SegmentWriter: Send {
    /// Append one frame. The image always matches the session's size.
    fn write_frame(&mut self, image: &RgbImage) -> Result<(), SegmentError>;

    /// Flush and close the session.
    fn finish(self: Box<Self>) -> Result<(), SegmentError>;
}

/// Factory for encoding sessions.
pub trait VideoSink: Send + Sync {
    fn open(&self, path: &Path, spec: SegmentSpec) -> Result<Box<dyn SegmentWriter>, SegmentError>;
}

/// Paths of segments currently being written.
///
/// Shared between the recorders and the retention sweeper so that a file is
/// never deleted while its encoder still holds it.
#[derive(Debug, Clone, Default)]
pub struct ActiveSegments {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ActiveSegments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &Path) {
        self.paths.lock().insert(path.to_path_buf());
    }

    pub fn remove(&self, path: &Path) {
        self.paths.lock().remove(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }
}

/// Recording state of one channel.
#[derive(Default)]
pub struct SegmentRecorder {
    writer: Option<Box<dyn SegmentWriter>>,
    /// Locked in by the first segment and reused afterwards
    spec: Option<SegmentSpec>,
    deadline: Option<Instant>,
    path: Option<PathBuf>,
    frames_written: u64,
}

impl SegmentRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn spec(&self) -> Option<SegmentSpec> {
        self.spec
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Open a new segment at `path` lasting `duration` from `now`.
    ///
    /// Size and rate come from the previous segment when there was one,
    /// otherwise from `frame`, rounded down to even dimensions for yuv420p.
    pub fn open(
        &mut self,
        sink: &dyn VideoSink,
        active: &ActiveSegments,
        path: &Path,
        frame: &Frame,
        now: Instant,
        duration: Duration,
    ) -> Result<SegmentSpec, SegmentError> {
        let spec = match self.spec {
            Some(spec) => spec,
            None => {
                let (width, height) = (frame.width() & !1, frame.height() & !1);
                if width == 0 || height == 0 {
                    return Err(SegmentError::InvalidDimensions {
                        width: frame.width(),
                        height: frame.height(),
                    });
                }
                SegmentSpec {
                    fps: frame.fps(),
                    width,
                    height,
                }
            }
        };

        let writer = sink.open(path, spec)?;

        active.insert(path);
        self.writer = Some(writer);
        self.spec = Some(spec);
        self.deadline = Some(now + duration);
        self.path = Some(path.to_path_buf());
        self.frames_written = 0;

        info!(
            path = %path.display(),
            fps = spec.fps,
            width = spec.width,
            height = spec.height,
            "Segment writer opened"
        );

        Ok(spec)
    }

    /// Append a frame to the open segment, resizing it when needed.
    pub fn append(&mut self, frame: &Frame) {
        let (Some(writer), Some(spec)) = (self.writer.as_mut(), self.spec) else {
            return;
        };

        if frame.width() == 0 || frame.height() == 0 {
            debug!("Skipping empty frame");
            return;
        }

        let result = if frame.width() != spec.width || frame.height() != spec.height {
            let resized = imageops::resize(&frame.image, spec.width, spec.height, FilterType::Triangle);
            writer.write_frame(&resized)
        } else {
            writer.write_frame(&frame.image)
        };

        match result {
            Ok(()) => self.frames_written += 1,
            Err(e) => warn!(error = %e, "Failed to append frame to segment"),
        }
    }

    /// Whether the open segment has reached its deadline.
    pub fn is_due(&self, now: Instant) -> bool {
        self.is_recording() && self.deadline.map_or(false, |deadline| now >= deadline)
    }

    /// Close the open segment and return its path.
    pub fn close(&mut self, active: &ActiveSegments) -> Option<PathBuf> {
        let writer = self.writer.take()?;
        let path = self.path.take();
        self.deadline = None;

        if let Err(e) = writer.finish() {
            warn!(error = %e, "Segment writer did not close cleanly");
        }

        if let Some(path) = &path {
            active.remove(path);
            debug!(
                path = %path.display(),
                frames = self.frames_written,
                "Segment writer closed"
            );
        }

        path
    }
}

/// How long a freshly spawned encoder must stay alive to count as opened.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(200);

const STARTUP_POLL: Duration = Duration::from_millis(10);
const STDERR_TAIL_CHARS: usize = 512;

/// Encoder backend that pipes raw frames into `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegSink {
    binary: PathBuf,
    codec: String,
    startup_grace: Duration,
}

impl FfmpegSink {
    pub fn new(binary: impl Into<PathBuf>, codec: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            codec: codec.into(),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    fn command(&self, path: &Path, spec: SegmentSpec) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{}x{}", spec.width, spec.height))
            .arg("-r")
            .arg(spec.fps.to_string())
            .args(["-i", "-", "-an", "-c:v"])
            .arg(&self.codec)
            .args(["-pix_fmt", "yuv420p", "-movflags", "+faststart"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl VideoSink for FfmpegSink {
    fn open(&self, path: &Path, spec: SegmentSpec) -> Result<Box<dyn SegmentWriter>, SegmentError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut child = self
            .command(path, spec)
            .spawn()
            .map_err(|source| SegmentError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        let stderr = drain_stderr(&mut child);

        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SegmentError::Closed);
        };

        // An encoder that rejects its arguments exits right away
        let deadline = Instant::now() + self.startup_grace;
        loop {
            if let Some(status) = child.try_wait()? {
                drop(stdin);
                return Err(SegmentError::EncoderExit {
                    path: path.to_path_buf(),
                    code: status.code(),
                    stderr: join_stderr(stderr),
                });
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(STARTUP_POLL);
        }

        Ok(Box::new(FfmpegWriter {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stderr,
            path: path.to_path_buf(),
        }))
    }
}

/// Collect the encoder's stderr on a side thread so the pipe never fills.
fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut stderr = child.stderr.take()?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        let text = String::from_utf8_lossy(&buf);
        let text = text.trim();
        let start = text
            .char_indices()
            .rev()
            .nth(STDERR_TAIL_CHARS - 1)
            .map_or(0, |(i, _)| i);
        text[start..].to_string()
    }))
}

fn join_stderr(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

struct FfmpegWriter {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<JoinHandle<String>>,
    path: PathBuf,
}

impl SegmentWriter for FfmpegWriter {
    fn write_frame(&mut self, image: &RgbImage) -> Result<(), SegmentError> {
        let stdin = self.stdin.as_mut().ok_or(SegmentError::Closed)?;
        stdin.write_all(image.as_raw())?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), SegmentError> {
        // Closing stdin is the end-of-stream signal
        let flushed = match self.stdin.take() {
            Some(mut stdin) => stdin.flush(),
            None => Ok(()),
        };

        let status = self.child.wait()?;
        let stderr = join_stderr(self.stderr.take());
        if !status.success() {
            return Err(SegmentError::EncoderExit {
                path: self.path.clone(),
                code: status.code(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!(path = %self.path.display(), stderr = %stderr, "Encoder diagnostics");
        }
        flushed?;
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        // Dropped without finish(): don't leave the encoder behind
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records what the recorder asked of the encoder.
    #[derive(Debug, Default)]
    pub(crate) struct SinkLog {
        pub opened: Vec<(PathBuf, SegmentSpec)>,
        pub frames: Vec<(u32, u32)>,
        pub finished: Vec<PathBuf>,
    }

    /// In-memory sink that creates an empty file per segment.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSink {
        pub log: Arc<Mutex<SinkLog>>,
        pub fail_open: bool,
    }

    struct FakeWriter {
        log: Arc<Mutex<SinkLog>>,
        path: PathBuf,
    }

    impl VideoSink for FakeSink {
        fn open(&self, path: &Path, spec: SegmentSpec) -> Result<Box<dyn SegmentWriter>, SegmentError> {
            if self.fail_open {
                return Err(SegmentError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "encoder unavailable",
                )));
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, b"")?;
            self.log.lock().opened.push((path.to_path_buf(), spec));
            Ok(Box::new(FakeWriter {
                log: self.log.clone(),
                path: path.to_path_buf(),
            }))
        }
    }

    impl SegmentWriter for FakeWriter {
        fn write_frame(&mut self, image: &RgbImage) -> Result<(), SegmentError> {
            self.log.lock().frames.push((image.width(), image.height()));
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), SegmentError> {
            self.log.lock().finished.push(self.path.clone());
            Ok(())
        }
    }

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(RgbImage::new(width, height))
    }

    #[test]
    fn test_open_locks_in_spec() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::default();
        let active = ActiveSegments::new();
        let mut recorder = SegmentRecorder::new();
        let now = Instant::now();

        let path = dir.path().join("a.mp4");
        let spec = recorder
            .open(&sink, &active, &path, &frame(64, 48), now, Duration::from_secs(10))
            .unwrap();
        assert_eq!(spec, SegmentSpec { fps: 25, width: 64, height: 48 });
        assert!(recorder.is_recording());
        assert!(active.contains(&path));
        assert_eq!(recorder.deadline(), Some(now + Duration::from_secs(10)));

        assert_eq!(recorder.close(&active), Some(path.clone()));
        assert!(!recorder.is_recording());
        assert!(active.is_empty());

        // A later segment reuses the first geometry
        let second = dir.path().join("b.mp4");
        let spec = recorder
            .open(&sink, &active, &second, &frame(32, 32), now, Duration::from_secs(1))
            .unwrap();
        assert_eq!(spec.width, 64);
        assert_eq!(spec.height, 48);
    }

    #[test]
    fn test_open_rejects_empty_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SegmentRecorder::new();
        let result = recorder.open(
            &FakeSink::default(),
            &ActiveSegments::new(),
            &dir.path().join("x.mp4"),
            &frame(0, 0),
            Instant::now(),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(SegmentError::InvalidDimensions { .. })));
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_append_resizes_to_locked_size() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::default();
        let active = ActiveSegments::new();
        let mut recorder = SegmentRecorder::new();

        recorder
            .open(
                &sink,
                &active,
                &dir.path().join("a.mp4"),
                &frame(40, 30),
                Instant::now(),
                Duration::from_secs(5),
            )
            .unwrap();
        recorder.append(&frame(40, 30));
        recorder.append(&frame(80, 60));

        assert_eq!(sink.log.lock().frames, vec![(40, 30), (40, 30)]);
    }

    #[test]
    fn test_is_due_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SegmentRecorder::new();
        let now = Instant::now();
        recorder
            .open(
                &FakeSink::default(),
                &ActiveSegments::new(),
                &dir.path().join("a.mp4"),
                &frame(8, 8),
                now,
                Duration::from_secs(10),
            )
            .unwrap();

        assert!(!recorder.is_due(now + Duration::from_secs(9)));
        assert!(recorder.is_due(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_open_rounds_odd_geometry_to_even() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::default();
        let active = ActiveSegments::new();
        let mut recorder = SegmentRecorder::new();

        let spec = recorder
            .open(&sink, &active, &dir.path().join("a.mp4"), &frame(641, 481), Instant::now(), Duration::from_secs(1))
            .unwrap();
        assert_eq!((spec.width, spec.height), (640, 480));

        recorder.append(&frame(641, 481));
        assert_eq!(sink.log.lock().frames, vec![(640, 480)]);

        let mut tiny = SegmentRecorder::new();
        let result = tiny.open(&sink, &active, &dir.path().join("b.mp4"), &frame(1, 5), Instant::now(), Duration::from_secs(1));
        assert!(matches!(result, Err(SegmentError::InvalidDimensions { width: 1, height: 5 })));
    }

    /// Executable shell script standing in for `ffmpeg`.
    #[cfg(unix)]
    pub(crate) fn stub_encoder(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ffmpeg.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_sink_reports_encoder_that_exits_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_encoder(dir.path(), "echo 'Unknown encoder' >&2\nexit 1");
        let sink = FfmpegSink::new(binary, "nope").with_startup_grace(Duration::from_secs(2));

        let spec = SegmentSpec { fps: 25, width: 4, height: 4 };
        let err = sink.open(&dir.path().join("ch_0/a.mp4"), spec).err().unwrap();

        match err {
            SegmentError::EncoderExit { code, stderr, .. } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("Unknown encoder"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_sink_reports_failed_finish() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_encoder(dir.path(), "cat > /dev/null\necho 'muxer failed' >&2\nexit 3");
        let sink = FfmpegSink::new(binary, "libx264").with_startup_grace(Duration::from_millis(50));

        let spec = SegmentSpec { fps: 25, width: 4, height: 4 };
        let mut writer = sink.open(&dir.path().join("a.mp4"), spec).unwrap();
        writer.write_frame(&RgbImage::new(4, 4)).unwrap();

        match writer.finish() {
            Err(SegmentError::EncoderExit { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "muxer failed");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_ffmpeg_sink_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FfmpegSink::new(dir.path().join("no-such-ffmpeg"), "libx264");
        let spec = SegmentSpec { fps: 25, width: 4, height: 4 };
        assert!(matches!(
            sink.open(&dir.path().join("a.mp4"), spec),
            Err(SegmentError::Spawn { .. })
        ));
    }
}

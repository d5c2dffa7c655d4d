//! Sources backed by the `ffmpeg`/`ffprobe` command line tools.
//!
//! Using child processes keeps the default build free of native codec
//! libraries. Cameras stream rawvideo from a long-running `ffmpeg` process;
//! files are probed once and then sampled frame by frame with `-ss`.

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    source::{CameraSource, FrameDecoder, FrameStream},
    types::{CaptureError, ClipInfo, Frame, FrameFormat},
};

/// How long `attach` waits for the first frame before giving up on a camera.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Sent once by the reader: `Ok` on the first frame, or the error that ended
/// the stream before any frame arrived.
type FirstFrame = Result<(), CaptureError>;

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

/// Live camera read through `ffmpeg -f video4linux2` (or any URI ffmpeg can open).
pub struct FfmpegCamera {
    uri: String,
    target_size: (i32, i32),
    queue_size: usize,
    first_frame_timeout: Duration,
    child: Arc<Mutex<Option<Child>>>,
    stop: Arc<AtomicBool>,
}

impl FfmpegCamera {
    pub fn new(uri: impl Into<String>, target_size: (i32, i32)) -> Self {
        Self {
            uri: uri.into(),
            target_size,
            queue_size: 2,
            first_frame_timeout: FIRST_FRAME_TIMEOUT,
            child: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_command(&self) -> Command {
        let (width, height) = self.target_size;
        let scale_arg = format!("scale={width}:{height}");

        let (is_v4l, ffmpeg_uri) = if let Some(index) = parse_device_index(&self.uri) {
            (true, format!("/dev/video{index}"))
        } else {
            (false, self.uri.clone())
        };

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay");

        if is_v4l {
            cmd.arg("-f")
                .arg("video4linux2")
                .arg("-video_size")
                .arg(format!("{width}x{height}"));
        }

        cmd.arg("-i")
            .arg(&ffmpeg_uri)
            .arg("-an")
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd
    }
}

impl CameraSource for FfmpegCamera {
    fn describe(&self) -> String {
        format!("ffmpeg:{}", self.uri)
    }

    /// Start `ffmpeg` and return once it has delivered a frame. A URI that
    /// opens but never produces video fails here rather than in the stream.
    fn attach(&mut self) -> Result<FrameStream, CaptureError> {
        if let Some(index) = parse_device_index(&self.uri) {
            check_device_readable(&format!("/dev/video{index}"))?;
        }

        let mut cmd = self.build_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CaptureError::Other(anyhow!("ffmpeg binary not found")),
            _ => CaptureError::Other(err.into()),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        self.stop.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.child.lock() {
            *guard = Some(child);
        }

        let spawned = spawn_reader(
            stdout,
            self.target_size,
            self.stop.clone(),
            self.child.clone(),
            self.queue_size,
        );
        let (rx, first_frame) = match spawned {
            Ok(reader) => reader,
            Err(err) => {
                self.detach();
                return Err(CaptureError::Other(err.into()));
            }
        };

        if let Err(err) = await_first_frame(&self.uri, &first_frame, self.first_frame_timeout) {
            self.detach();
            return Err(err);
        }
        Ok(rx)
    }

    fn detach(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        kill_child(&self.child);
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.detach();
    }
}

fn check_device_readable(path: &str) -> Result<(), CaptureError> {
    match std::fs::File::open(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            Err(CaptureError::PermissionDenied {
                uri: path.to_string(),
            })
        }
        Err(_) => Err(CaptureError::Open {
            uri: path.to_string(),
        }),
    }
}

fn kill_child(child: &Mutex<Option<Child>>) {
    if let Ok(mut guard) = child.lock() {
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn spawn_reader(
    stdout: impl Read + Send + 'static,
    target_size: (i32, i32),
    stop: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    queue_size: usize,
) -> io::Result<(FrameStream, Receiver<FirstFrame>)> {
    let (tx, rx) = bounded(queue_size);
    let (first_tx, first_rx) = bounded(1);
    thread::Builder::new()
        .name("ingest-ffmpeg-camera".into())
        .spawn(move || {
            let mut first_frame = Some(first_tx);
            if let Err(err) = rawvideo_loop(stdout, target_size, &stop, &tx, &mut first_frame) {
                match first_frame.take() {
                    Some(first_frame) => {
                        let _ = first_frame.send(Err(err));
                    }
                    None if !stop.load(Ordering::SeqCst) => {
                        let _ = tx.send(Err(err));
                    }
                    None => {}
                }
            }
            kill_child(&child);
        })?;
    Ok((rx, first_rx))
}

fn await_first_frame(
    uri: &str,
    first_frame: &Receiver<FirstFrame>,
    timeout: Duration,
) -> Result<(), CaptureError> {
    match first_frame.recv_timeout(timeout) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            warn!(uri, "camera ended before its first frame: {err}");
            Err(CaptureError::Open {
                uri: uri.to_string(),
            })
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                uri,
                timeout_ms = timeout.as_millis() as u64,
                "no frame from camera"
            );
            Err(CaptureError::Open {
                uri: uri.to_string(),
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Open {
            uri: uri.to_string(),
        }),
    }
}

fn rawvideo_loop(
    mut stdout: impl Read,
    target_size: (i32, i32),
    stop: &AtomicBool,
    tx: &Sender<Result<Frame, CaptureError>>,
    first_frame: &mut Option<Sender<FirstFrame>>,
) -> Result<(), CaptureError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];

    while !stop.load(Ordering::Relaxed) {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let timestamp_ms = Utc::now().timestamp_millis();
                if let Some(first_frame) = first_frame.take() {
                    let _ = first_frame.send(Ok(()));
                }
                if tx
                    .send(Ok(Frame {
                        data: buffer.clone(),
                        width: target_size.0,
                        height: target_size.1,
                        timestamp_ms,
                        format: FrameFormat::Bgr8,
                    }))
                    .is_err()
                {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CaptureError::Stream("ffmpeg closed its output".into()));
            }
            Err(err) => return Err(CaptureError::Other(err.into())),
        }
    }

    Ok(())
}

/// Video file sampled by timestamp through `ffmpeg -ss`.
pub struct FfmpegFileDecoder {
    path: PathBuf,
    target_size: Option<(i32, i32)>,
    output_size: (i32, i32),
}

impl FfmpegFileDecoder {
    /// `target_size` rescales decoded frames; `None` keeps the native size.
    pub fn new(path: impl Into<PathBuf>, target_size: Option<(i32, i32)>) -> Self {
        Self {
            path: path.into(),
            target_size,
            output_size: (0, 0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameDecoder for FfmpegFileDecoder {
    fn describe(&self) -> String {
        format!("ffmpeg-file:{}", self.path.display())
    }

    fn open(&mut self) -> Result<ClipInfo, CaptureError> {
        let mut info = probe_clip(&self.path)?;
        if let Some((width, height)) = self.target_size {
            info.width = width;
            info.height = height;
        }
        self.output_size = (info.width, info.height);
        debug!(
            path = %self.path.display(),
            duration_ms = info.duration.as_millis() as u64,
            fps = info.frame_rate,
            "opened clip"
        );
        Ok(info)
    }

    fn frame_at(&mut self, at: Duration) -> Result<Frame, CaptureError> {
        let (width, height) = self.output_size;
        if width <= 0 || height <= 0 {
            return Err(CaptureError::Other(anyhow!("decoder used before open")));
        }

        let output = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-ss")
            .arg(format!("{:.3}", at.as_secs_f64()))
            .arg("-i")
            .arg(&self.path)
            .arg("-frames:v")
            .arg("1")
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={width}:{height}"))
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| CaptureError::Other(err.into()))?;

        let expected = (width as usize) * (height as usize) * 3;
        if !output.status.success() || output.stdout.len() != expected {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Decode {
                at,
                reason: format!(
                    "ffmpeg returned {} bytes (expected {expected}){}",
                    output.stdout.len(),
                    stderr
                        .lines()
                        .next()
                        .map(|line| format!(": {line}"))
                        .unwrap_or_default()
                ),
            });
        }

        Ok(Frame {
            data: output.stdout,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn close(&mut self) {
        self.output_size = (0, 0);
    }
}

/// Inspect a file with `ffprobe` and return its video properties.
pub fn probe_clip(path: &Path) -> Result<ClipInfo, CaptureError> {
    let display = path.display().to_string();
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(CaptureError::Open { uri: display }),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            return Err(CaptureError::PermissionDenied { uri: display });
        }
        Err(_) => return Err(CaptureError::Open { uri: display }),
    }

    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,avg_frame_rate,r_frame_rate,duration:format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CaptureError::Other(anyhow!("ffprobe binary not found")),
            _ => CaptureError::Other(err.into()),
        })?;

    if !output.status.success() {
        return Err(CaptureError::Open { uri: display });
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
        .ok_or(CaptureError::NoVideoTrack { path: display })
}

/// Parse `key=value` lines emitted by `ffprobe -of default=noprint_wrappers=1`.
pub(crate) fn parse_probe_output(text: &str) -> Option<ClipInfo> {
    let mut width = None;
    let mut height = None;
    let mut avg_rate = None;
    let mut raw_rate = None;
    let mut duration = None;

    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "width" => width = value.parse::<i32>().ok(),
            "height" => height = value.parse::<i32>().ok(),
            "avg_frame_rate" => avg_rate = parse_frame_rate(value),
            "r_frame_rate" => raw_rate = parse_frame_rate(value),
            "duration" => {
                // The stream and the container both report a duration; keep the first usable one.
                if duration.is_none() {
                    duration = value
                        .parse::<f64>()
                        .ok()
                        .filter(|secs| secs.is_finite() && *secs >= 0.0);
                }
            }
            _ => {}
        }
    }

    let width = width.filter(|w| *w > 0)?;
    let height = height.filter(|h| *h > 0)?;
    let frame_rate = avg_rate.or(raw_rate).unwrap_or_else(|| {
        warn!("clip reports no frame rate; assuming 30 fps");
        30.0
    });

    Some(ClipInfo {
        duration: Duration::from_secs_f64(duration.unwrap_or(0.0)),
        frame_rate,
        width,
        height,
    })
}

/// Parse a rational (`30000/1001`) or decimal frame rate.
pub(crate) fn parse_frame_rate(value: &str) -> Option<f64> {
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse::<f64>().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Output that stays silent until its sender is dropped.
    struct Silent(Receiver<()>);

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    fn no_child() -> Arc<Mutex<Option<Child>>> {
        Arc::new(Mutex::new(None))
    }

    #[test]
    fn first_frame_is_kept_for_the_stream() {
        let output = Cursor::new(vec![7u8; 2 * 2 * 3]);
        let stop = Arc::new(AtomicBool::new(false));
        let (stream, first_frame) = spawn_reader(output, (2, 2), stop, no_child(), 2).unwrap();

        await_first_frame("cam", &first_frame, Duration::from_secs(5)).unwrap();
        let frame = stream.recv().unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (2, 2));
        assert_eq!(frame.data, vec![7u8; 12]);
        assert!(matches!(stream.recv(), Ok(Err(CaptureError::Stream(_)))));
    }

    #[test]
    fn output_ending_before_a_frame_fails_to_open() {
        let output = Cursor::new(vec![0u8; 5]);
        let stop = Arc::new(AtomicBool::new(false));
        let (stream, first_frame) = spawn_reader(output, (2, 2), stop, no_child(), 2).unwrap();

        let err = await_first_frame("rtsp://cam", &first_frame, Duration::from_secs(5));
        assert!(matches!(err, Err(CaptureError::Open { uri }) if uri == "rtsp://cam"));
        assert!(stream.recv().is_err());
    }

    #[test]
    fn silent_output_times_out() {
        let (hold, silent) = bounded::<()>(0);
        let stop = Arc::new(AtomicBool::new(false));
        let (_stream, first_frame) =
            spawn_reader(Silent(silent), (2, 2), stop.clone(), no_child(), 2).unwrap();

        let err = await_first_frame("rtsp://cam", &first_frame, Duration::from_millis(20));
        assert!(matches!(err, Err(CaptureError::Open { .. })));
        stop.store(true, Ordering::SeqCst);
        drop(hold);
    }

    #[test]
    fn device_index_forms() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam"), None);
    }

    #[test]
    fn frame_rates() {
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn probe_output_is_parsed() {
        let text = "width=1280\nheight=720\nr_frame_rate=30/1\navg_frame_rate=30/1\nduration=N/A\nduration=12.500000\n";
        let info = parse_probe_output(text).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!(info.frame_rate, 30.0);
        assert_eq!(info.duration, Duration::from_millis(12_500));
    }

    #[test]
    fn probe_without_video_stream() {
        assert!(parse_probe_output("duration=3.0\n").is_none());
    }
}

//! OpenCV-backed camera capture and file sampling.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::warn;

use crate::{
    ffmpeg::parse_device_index,
    source::{CameraSource, FrameDecoder, FrameStream},
    types::{CaptureError, ClipInfo, Frame, FrameFormat},
};

fn cv_err(err: opencv::Error) -> CaptureError {
    CaptureError::Other(err.into())
}

/// Camera opened through OpenCV's V4L (or default) backend.
pub struct OpenCvCamera {
    uri: String,
    target_size: (i32, i32),
    fps: f64,
    stop: Arc<AtomicBool>,
}

impl OpenCvCamera {
    pub fn new(uri: impl Into<String>, target_size: (i32, i32)) -> Self {
        Self {
            uri: uri.into(),
            target_size,
            fps: 30.0,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl CameraSource for OpenCvCamera {
    fn describe(&self) -> String {
        format!("opencv:{}", self.uri)
    }

    fn attach(&mut self) -> Result<FrameStream, CaptureError> {
        // Open on the caller's thread so a missing device fails the session start.
        let mut cap = open_video_capture(&self.uri)?;
        configure_camera(&mut cap, self.target_size, self.fps);

        let (tx, rx) = bounded(2);
        self.stop.store(false, Ordering::SeqCst);
        let stop = self.stop.clone();
        let target_size = self.target_size;
        thread::Builder::new()
            .name("ingest-opencv-camera".into())
            .spawn(move || {
                if let Err(err) = capture_loop(cap, target_size, &stop, &tx) {
                    if !stop.load(Ordering::SeqCst) {
                        let _ = tx.send(Err(err));
                    }
                }
            })
            .map_err(|err| CaptureError::Other(err.into()))?;
        Ok(rx)
    }

    fn detach(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for OpenCvCamera {
    fn drop(&mut self) {
        self.detach();
    }
}

fn capture_loop(
    mut cap: VideoCapture,
    target_size: (i32, i32),
    stop: &AtomicBool,
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut frame = Mat::default();
    let mut scratch = Mat::default();

    while !stop.load(Ordering::Relaxed) {
        if !cap.read(&mut frame).map_err(cv_err)? {
            return Err(CaptureError::Stream("camera returned no frame".into()));
        }
        if frame.size().map_err(cv_err)?.width <= 0 {
            continue;
        }

        let data = mat_to_bgr(&frame, &mut scratch, target_size)?;
        if tx
            .send(Ok(Frame {
                data,
                width: target_size.0,
                height: target_size.1,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            }))
            .is_err()
        {
            break;
        }
    }

    let _ = cap.release();
    Ok(())
}

fn mat_to_bgr(
    frame: &Mat,
    scratch: &mut Mat,
    target_size: (i32, i32),
) -> Result<Vec<u8>, CaptureError> {
    let (target_w, target_h) = target_size;
    let size = frame.size().map_err(cv_err)?;
    let working = if size.width != target_w || size.height != target_h {
        opencv::imgproc::resize(
            frame,
            scratch,
            core::Size {
                width: target_w,
                height: target_h,
            },
            0.0,
            0.0,
            opencv::imgproc::INTER_LINEAR,
        )
        .map_err(cv_err)?;
        &*scratch
    } else {
        frame
    };
    Ok(working.data_bytes().map_err(cv_err)?.to_vec())
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(cv_err)? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(cv_err)? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}

/// Video file sampled by seeking OpenCV's capture to each timestamp.
pub struct OpenCvFileDecoder {
    path: String,
    target_size: Option<(i32, i32)>,
    output_size: (i32, i32),
    cap: Option<VideoCapture>,
    frame: Mat,
    scratch: Mat,
}

impl OpenCvFileDecoder {
    pub fn new(path: impl Into<String>, target_size: Option<(i32, i32)>) -> Self {
        Self {
            path: path.into(),
            target_size,
            output_size: (0, 0),
            cap: None,
            frame: Mat::default(),
            scratch: Mat::default(),
        }
    }
}

impl FrameDecoder for OpenCvFileDecoder {
    fn describe(&self) -> String {
        format!("opencv-file:{}", self.path)
    }

    fn open(&mut self) -> Result<ClipInfo, CaptureError> {
        let cap = VideoCapture::from_file(&self.path, videoio::CAP_ANY).map_err(|_| {
            CaptureError::Open {
                uri: self.path.clone(),
            }
        })?;
        if !cap.is_opened().map_err(cv_err)? {
            return Err(CaptureError::Open {
                uri: self.path.clone(),
            });
        }

        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).map_err(cv_err)? as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).map_err(cv_err)? as i32;
        if width <= 0 || height <= 0 {
            return Err(CaptureError::NoVideoTrack {
                path: self.path.clone(),
            });
        }
        let frame_rate = cap.get(videoio::CAP_PROP_FPS).map_err(cv_err)?;
        let frame_count = cap.get(videoio::CAP_PROP_FRAME_COUNT).map_err(cv_err)?;
        let duration = if frame_rate > 0.0 && frame_count > 0.0 {
            Duration::from_secs_f64(frame_count / frame_rate)
        } else {
            Duration::ZERO
        };

        self.output_size = self.target_size.unwrap_or((width, height));
        self.cap = Some(cap);
        Ok(ClipInfo {
            duration,
            frame_rate,
            width: self.output_size.0,
            height: self.output_size.1,
        })
    }

    fn frame_at(&mut self, at: Duration) -> Result<Frame, CaptureError> {
        let cap = self
            .cap
            .as_mut()
            .ok_or_else(|| CaptureError::Other(anyhow::anyhow!("decoder used before open")))?;
        let decode_err = |reason: String| CaptureError::Decode { at, reason };

        cap.set(videoio::CAP_PROP_POS_MSEC, at.as_secs_f64() * 1000.0)
            .map_err(|err| decode_err(err.to_string()))?;
        if !cap
            .read(&mut self.frame)
            .map_err(|err| decode_err(err.to_string()))?
        {
            return Err(decode_err("no frame at position".into()));
        }

        let data = mat_to_bgr(&self.frame, &mut self.scratch, self.output_size)
            .map_err(|err| decode_err(err.to_string()))?;
        Ok(Frame {
            data,
            width: self.output_size.0,
            height: self.output_size.1,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn close(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            let _ = cap.release();
        }
    }
}

//! Source abstraction shared by camera and looping-file inputs.
//!
//! A [`FrameSource`] is chosen once when a session starts. Cameras push frames
//! on their own schedule over a channel; file decoders are pulled by timestamp
//! and paced by the caller.

use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::types::{CaptureError, ClipInfo, Frame};

/// Channel of frames (or per-frame failures) produced by a push source.
pub type FrameStream = Receiver<Result<Frame, CaptureError>>;

/// Push-style source such as a live camera.
pub trait CameraSource: Send {
    /// Human readable identifier used in logs.
    fn describe(&self) -> String;

    /// Open the device and begin streaming frames.
    ///
    /// Failures to open the device must be reported here rather than on the
    /// returned stream so callers can refuse to start a session.
    fn attach(&mut self) -> Result<FrameStream, CaptureError>;

    /// Stop streaming and release the device. Must be idempotent.
    fn detach(&mut self);
}

/// Pull-style source that yields the frame at a requested timestamp.
pub trait FrameDecoder: Send {
    fn describe(&self) -> String;

    /// Open the file and report clip properties.
    fn open(&mut self) -> Result<ClipInfo, CaptureError>;

    /// Decode the frame displayed at `at`. Errors are per frame.
    fn frame_at(&mut self, at: Duration) -> Result<Frame, CaptureError>;

    fn close(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    LiveCamera,
    FileLoop,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::LiveCamera => "camera",
            SourceKind::FileLoop => "file",
        }
    }
}

/// Frame source selected at session start.
pub enum FrameSource {
    LiveCamera(Box<dyn CameraSource>),
    FileLoop(Box<dyn FrameDecoder>),
}

impl FrameSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            FrameSource::LiveCamera(_) => SourceKind::LiveCamera,
            FrameSource::FileLoop(_) => SourceKind::FileLoop,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FrameSource::LiveCamera(camera) => camera.describe(),
            FrameSource::FileLoop(decoder) => decoder.describe(),
        }
    }

    /// Attach the underlying device or file.
    pub fn attach(self) -> Result<AttachedSource, CaptureError> {
        match self {
            FrameSource::LiveCamera(mut camera) => {
                let stream = camera.attach()?;
                Ok(AttachedSource::Live { camera, stream })
            }
            FrameSource::FileLoop(mut decoder) => {
                let info = decoder.open()?;
                Ok(AttachedSource::File { decoder, info })
            }
        }
    }
}

/// A source that has been successfully attached and is ready to pump.
pub enum AttachedSource {
    Live {
        camera: Box<dyn CameraSource>,
        stream: FrameStream,
    },
    File {
        decoder: Box<dyn FrameDecoder>,
        info: ClipInfo,
    },
}

impl AttachedSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            AttachedSource::Live { .. } => SourceKind::LiveCamera,
            AttachedSource::File { .. } => SourceKind::FileLoop,
        }
    }

    pub fn detach(&mut self) {
        match self {
            AttachedSource::Live { camera, .. } => camera.detach(),
            AttachedSource::File { decoder, .. } => decoder.close(),
        }
    }
}

/// Playback position for a looping clip.
///
/// The cursor advances one frame interval per request whether or not the
/// frame decoded, and wraps to the start instead of reaching the clip
/// duration: the last frame starts before the end, so `duration` itself is
/// never requested.
#[derive(Clone, Debug)]
pub struct LoopCursor {
    duration: Duration,
    interval: Duration,
    position: Duration,
    wraps: u64,
}

impl LoopCursor {
    pub fn new(duration: Duration, interval: Duration) -> Self {
        Self {
            duration,
            interval: interval.max(Duration::from_millis(1)),
            position: Duration::ZERO,
            wraps: 0,
        }
    }

    /// Timestamp of the next frame to request.
    pub fn position(&self) -> Duration {
        self.position
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of times playback has looped back to the start.
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    /// Move to the next frame and return its timestamp.
    pub fn advance(&mut self) -> Duration {
        let next = self.position.saturating_add(self.interval);
        if next >= self.duration {
            self.position = Duration::ZERO;
            self.wraps = self.wraps.saturating_add(1);
        } else {
            self.position = next;
        }
        self.position
    }
}

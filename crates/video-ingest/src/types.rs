use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
///
/// Frames are immutable once produced; downstream stages share them behind an
/// `Arc` so the last holder frees the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
    Rgb8,
    Rgba8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 | FrameFormat::Rgb8 => 3,
            FrameFormat::Rgba8 => 4,
        }
    }
}

impl Frame {
    /// Number of bytes a well-formed buffer of this geometry must hold.
    pub fn expected_len(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * self.format.bytes_per_pixel()
    }

    /// Convert the pixel buffer into tightly packed RGB8.
    ///
    /// This is the only normalisation the pipeline performs; resizing and any
    /// model-specific preprocessing belong to the inference engine.
    pub fn to_rgb8(&self) -> Result<Vec<u8>, CaptureError> {
        if self.data.len() != self.expected_len() {
            return Err(CaptureError::Other(anyhow::anyhow!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                self.data.len(),
                self.expected_len()
            )));
        }

        let rgb = match self.format {
            FrameFormat::Rgb8 => self.data.clone(),
            FrameFormat::Bgr8 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            FrameFormat::Rgba8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        };
        Ok(rgb)
    }
}

/// Static properties of a file-backed clip.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipInfo {
    pub duration: Duration,
    /// Nominal frame rate reported by the container.
    pub frame_rate: f64,
    pub width: i32,
    pub height: i32,
}

impl ClipInfo {
    /// Delay between consecutive frames at the nominal rate.
    pub fn frame_interval(&self) -> Duration {
        if self.frame_rate.is_finite() && self.frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.frame_rate)
        } else {
            Duration::from_millis(33)
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("permission denied opening {uri:?}")]
    PermissionDenied { uri: String },
    #[error("{path:?} contains no readable video track")]
    NoVideoTrack { path: String },
    #[error("failed to decode frame at {at:?}: {reason}")]
    Decode { at: Duration, reason: String },
    #[error("capture stream ended: {0}")]
    Stream(String),
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Whether the error concerns a single frame and the stream can continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::Decode { .. })
    }
}

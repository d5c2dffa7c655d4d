//! Frame sources for the live analysis pipeline.
//!
//! Two source variants are supported: push-style cameras that stream frames
//! over a channel, and pull-style decoders that return the frame at a given
//! timestamp of a clip played in a loop.

#[cfg(feature = "with-opencv")]
pub mod camera;
pub mod ffmpeg;
pub mod source;
pub mod types;

#[cfg(feature = "with-opencv")]
pub use camera::{OpenCvCamera, OpenCvFileDecoder};
pub use ffmpeg::{FfmpegCamera, FfmpegFileDecoder, probe_clip};
pub use source::{
    AttachedSource, CameraSource, FrameDecoder, FrameSource, FrameStream, LoopCursor, SourceKind,
};
pub use types::{CaptureError, ClipInfo, Frame, FrameFormat};

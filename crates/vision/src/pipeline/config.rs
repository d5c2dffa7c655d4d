//! Configuration parsing for the live analysis pipeline.
//!
//! This module owns translation of CLI arguments into a `PipelineConfig`
//! which the binary uses to build sources and the pipeline without
//! re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};

use crate::{
    distributor::{AnalysisMode, PumpOptions},
    pipeline::AnalysisSettings,
    scheduler::GenerationOptions,
};

pub const DEFAULT_PROMPT: &str = "Describe the image in English.";
pub const DEFAULT_PROMPT_SUFFIX: &str = "Output should be brief, about 15 words or less.";
pub const DEFAULT_CAMERA: &str = "/dev/video0";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
/// How frames are sourced and when they are analysed.
pub enum RunMode {
    /// Live camera, every frame offered for analysis.
    #[default]
    Continuous,
    /// Live camera, analysis only when requested.
    OnDemand,
    /// Looping video file, analysed continuously.
    FileLoop,
}

impl RunMode {
    pub fn analysis_mode(self) -> AnalysisMode {
        match self {
            RunMode::Continuous | RunMode::FileLoop => AnalysisMode::Continuous,
            RunMode::OnDemand => AnalysisMode::OnDemand,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
/// Capture/decode backend.
pub enum Backend {
    /// `ffmpeg`/`ffprobe` child processes.
    #[default]
    Ffmpeg,
    /// OpenCV `VideoCapture` (requires the `with-opencv` feature).
    Opencv,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Where frames come from.
pub enum SourceSpec {
    Camera { uri: String },
    File { path: PathBuf },
}

#[derive(Clone, Debug, Default)]
/// Logging knobs.
pub struct TelemetryOptions {
    /// Default to `debug` level instead of `info`.
    pub verbose: bool,
    /// Explicit `EnvFilter` directives, overriding `RUST_LOG`.
    pub log_filter: Option<String>,
}

#[derive(Clone, Debug)]
/// Canonical configuration for one `run` invocation.
pub struct PipelineConfig {
    pub run_mode: RunMode,
    pub source: SourceSpec,
    pub backend: Backend,
    /// Capture width for cameras.
    pub width: i32,
    pub height: i32,
    /// Rescale file frames to `width`x`height` (set when a size was given explicitly).
    pub scale_files: bool,
    /// Analysis behaviour handed to the pipeline.
    pub analysis: AnalysisSettings,
    /// Emit viewer output as JSON lines.
    pub json: bool,
    /// Print the Prometheus rendering on exit.
    pub print_metrics: bool,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct PipelineCliArgs {
    /// Source and analysis mode.
    #[arg(long = "mode", value_enum, default_value_t = RunMode::Continuous)]
    pub mode: RunMode,
    /// Camera URI or device index.
    #[arg(long = "camera", value_name = "URI", conflicts_with = "file")]
    pub camera: Option<String>,
    /// Video file played in a loop.
    #[arg(long = "file", value_name = "PATH")]
    pub file: Option<PathBuf>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<i32>,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<i32>,
    /// Instruction sent with every frame.
    #[arg(long = "prompt", value_name = "TEXT")]
    pub prompt: Option<String>,
    /// Text appended to the prompt (pass an empty string to disable).
    #[arg(long = "prompt-suffix", value_name = "TEXT")]
    pub prompt_suffix: Option<String>,
    /// Maximum number of generated tokens per analysis.
    #[arg(long = "max-tokens", value_name = "N")]
    pub max_tokens: Option<usize>,
    /// Emit a partial result every N tokens.
    #[arg(long = "tokens-per-update", value_name = "N")]
    pub tokens_per_update: Option<usize>,
    /// Minimum delay between continuous analysis submissions.
    #[arg(long = "analysis-interval-ms", value_name = "MS")]
    pub analysis_interval_ms: Option<u64>,
    /// Override the clip frame rate used to pace file playback.
    #[arg(long = "file-fps", value_name = "FPS")]
    pub file_fps: Option<f64>,
    /// Capture/decode backend.
    #[arg(long = "backend", value_enum, default_value_t = Backend::Ffmpeg)]
    pub backend: Backend,
    /// Enable debug logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Tracing filter directives (e.g. `vision=debug,info`).
    #[arg(long = "log-filter", value_name = "DIRECTIVES")]
    pub log_filter: Option<String>,
    /// Print viewer output as JSON lines.
    #[arg(long = "json", action = clap::ArgAction::SetTrue)]
    pub json: bool,
    /// Print Prometheus metrics on exit.
    #[arg(long = "print-metrics", action = clap::ArgAction::SetTrue)]
    pub print_metrics: bool,
}

impl TryFrom<PipelineCliArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: PipelineCliArgs) -> Result<Self> {
        let source = match (args.mode, args.file, args.camera) {
            (RunMode::FileLoop, None, _) => {
                bail!("--mode file-loop requires --file <path>")
            }
            (_, Some(path), _) => SourceSpec::File { path },
            (_, None, camera) => SourceSpec::Camera {
                uri: camera.unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
            },
        };

        let scale_files = args.width.is_some() || args.height.is_some();
        let width = args.width.unwrap_or(640);
        let height = args.height.unwrap_or(480);
        if width <= 0 || height <= 0 {
            bail!("Capture width and height must be positive integers");
        }

        let max_tokens = args.max_tokens.unwrap_or(240);
        if max_tokens == 0 {
            bail!("--max-tokens must be at least 1");
        }
        let tokens_per_update = args.tokens_per_update.unwrap_or(4);
        if tokens_per_update == 0 {
            bail!("--tokens-per-update must be at least 1");
        }

        let file_frame_interval = match args.file_fps {
            Some(fps) if fps.is_finite() && fps > 0.0 => Some(Duration::from_secs_f64(1.0 / fps)),
            Some(_) => bail!("--file-fps must be a positive number"),
            None => None,
        };

        let prompt = compose_prompt(
            args.prompt.as_deref().unwrap_or(DEFAULT_PROMPT),
            args.prompt_suffix.as_deref().unwrap_or(DEFAULT_PROMPT_SUFFIX),
        );
        if prompt.is_empty() {
            bail!("--prompt must not be empty");
        }

        let analysis = AnalysisSettings {
            mode: args.mode.analysis_mode(),
            prompt,
            analysis_interval: Duration::from_millis(args.analysis_interval_ms.unwrap_or(250)),
            generation: GenerationOptions {
                max_tokens,
                tokens_per_update,
            },
            pump: PumpOptions {
                file_frame_interval,
            },
        };

        Ok(Self {
            run_mode: args.mode,
            source,
            backend: args.backend,
            width,
            height,
            scale_files,
            analysis,
            json: args.json,
            print_metrics: args.print_metrics,
            telemetry: TelemetryOptions {
                verbose: args.verbose,
                log_filter: args.log_filter,
            },
        })
    }
}

/// Join a prompt and its suffix with a single space.
pub fn compose_prompt(prompt: &str, suffix: &str) -> String {
    match (prompt.trim(), suffix.trim()) {
        (prompt, "") => prompt.to_string(),
        ("", suffix) => suffix.to_string(),
        (prompt, suffix) => format!("{prompt} {suffix}"),
    }
}

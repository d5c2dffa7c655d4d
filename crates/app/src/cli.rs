use std::{
    path::PathBuf,
    sync::{Arc, Once},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{RecvTimeoutError, unbounded};
use tracing::{info, warn};
use video_ingest::{FrameSource, probe_clip};
use vision::{Backend, PipelineCliArgs, PipelineConfig, SourceSpec, TelemetryOptions, telemetry};

use crate::{
    controls::{self, Control},
    engine::SceneSummaryEngine,
    sink::TerminalSink,
};

const ENGINE_WARMUP: Duration = Duration::from_millis(300);
const TOKEN_DELAY: Duration = Duration::from_millis(60);
const CONTROL_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "vlm-live", version, about = "Describe a live camera or looping video")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the live analysis pipeline.
    Run(PipelineCliArgs),
    /// Print the duration, frame rate and size of a video file.
    Probe {
        path: PathBuf,
        /// Print the result as JSON.
        #[arg(long = "json", action = clap::ArgAction::SetTrue)]
        json: bool,
    },
}

impl Cli {
    pub fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Run(args) => run_pipeline(PipelineConfig::try_from(args)?),
            Command::Probe { path, json } => probe(&path, json),
        }
    }
}

fn run_pipeline(config: PipelineConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let run_span = tracing::info_span!(
        "vlm.run",
        mode = ?config.run_mode,
        backend = ?config.backend,
        width = config.width,
        height = config.height,
    );
    let _run_span_guard = run_span.enter();

    let (control_tx, control_rx) = unbounded();
    let handler_tx = control_tx.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            let _ = handler_tx.send(Control::Quit);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    controls::spawn_stdin_reader(control_tx).context("failed to spawn stdin reader")?;

    let sink = Arc::new(TerminalSink::new(config.json).context("failed to start the viewer")?);
    let engine = SceneSummaryEngine::new(ENGINE_WARMUP, TOKEN_DELAY);
    let mut pipeline = vision::Pipeline::new(engine, sink.clone(), config.analysis.clone());
    pipeline
        .scheduler()
        .preload()
        .context("failed to load the inference engine")?;

    let session = pipeline
        .start(build_source(&config)?)
        .context("failed to start the frame source")?;
    info!(%session, mode = %pipeline.mode(), "pipeline running");
    if !config.json {
        eprintln!("{}", controls::HELP);
    }

    let mut warned_idle = false;
    loop {
        let control = match control_rx.recv_timeout(CONTROL_POLL) {
            Ok(control) => control,
            Err(RecvTimeoutError::Timeout) => {
                if !pipeline.is_running() && !warned_idle {
                    warn!("frame source stopped; press r to restart or q to quit");
                    warned_idle = true;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match control {
            Control::Analyse(prompt) => {
                if let Err(err) = pipeline.request_analysis(prompt.as_deref()) {
                    warn!("analysis request ignored: {err}");
                }
            }
            Control::Cancel => match pipeline.cancel_current() {
                Some(task) => info!(%task, "analysis cancelled"),
                None => info!("nothing to cancel"),
            },
            Control::Mode(mode) => {
                pipeline.switch_mode(mode);
                info!(%mode, "analysis mode switched");
            }
            Control::Prompt(prompt) => pipeline.set_prompt(prompt),
            Control::Restart => match build_source(&config).map(|source| pipeline.start(source)) {
                Ok(Ok(session)) => {
                    warned_idle = false;
                    info!(%session, "source restarted");
                }
                Ok(Err(err)) => warn!("restart failed: {err}"),
                Err(err) => warn!("restart failed: {err:#}"),
            },
            Control::Status => {
                let session = pipeline
                    .session_id()
                    .map_or_else(|| "none".to_string(), |id| id.to_string());
                let task = pipeline
                    .scheduler()
                    .active_task()
                    .map_or_else(|| "none".to_string(), |task| task.id().to_string());
                info!(
                    %session,
                    running = pipeline.is_running(),
                    mode = %pipeline.mode(),
                    state = %pipeline.state(),
                    %task,
                    load = ?pipeline.scheduler().load_status(),
                    "status"
                );
            }
            Control::Quit => break,
        }
    }

    info!("shutting down");
    pipeline.shutdown();
    sink.close();
    if sink.dropped_lines() > 0 {
        warn!(dropped = sink.dropped_lines(), "viewer output was dropped");
    }

    if config.print_metrics {
        if let Some(rendered) = telemetry::render_metrics() {
            println!("{rendered}");
        }
    }
    Ok(())
}

fn build_source(config: &PipelineConfig) -> Result<FrameSource> {
    let capture_size = (config.width, config.height);
    let file_size = config.scale_files.then_some(capture_size);

    match (config.backend, &config.source) {
        (Backend::Ffmpeg, SourceSpec::Camera { uri }) => Ok(FrameSource::LiveCamera(Box::new(
            video_ingest::FfmpegCamera::new(uri.clone(), capture_size),
        ))),
        (Backend::Ffmpeg, SourceSpec::File { path }) => Ok(FrameSource::FileLoop(Box::new(
            video_ingest::FfmpegFileDecoder::new(path.clone(), file_size),
        ))),
        #[cfg(feature = "with-opencv")]
        (Backend::Opencv, SourceSpec::Camera { uri }) => Ok(FrameSource::LiveCamera(Box::new(
            video_ingest::OpenCvCamera::new(uri.clone(), capture_size),
        ))),
        #[cfg(feature = "with-opencv")]
        (Backend::Opencv, SourceSpec::File { path }) => Ok(FrameSource::FileLoop(Box::new(
            video_ingest::OpenCvFileDecoder::new(path.to_string_lossy().into_owned(), file_size),
        ))),
        #[cfg(not(feature = "with-opencv"))]
        (Backend::Opencv, _) => {
            anyhow::bail!("--backend opencv requires building with the with-opencv feature")
        }
    }
}

fn probe(path: &std::path::Path, json: bool) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&TelemetryOptions::default());
    let info = probe_clip(path).with_context(|| format!("failed to probe {}", path.display()))?;

    if json {
        let value = serde_json::json!({
            "path": path.display().to_string(),
            "duration_secs": info.duration.as_secs_f64(),
            "frame_rate": info.frame_rate,
            "width": info.width,
            "height": info.height,
        });
        println!("{value}");
    } else {
        println!(
            "{}: {}x{} @ {:.2} fps, {:.2}s",
            path.display(),
            info.width,
            info.height,
            info.frame_rate,
            info.duration.as_secs_f64()
        );
    }
    Ok(())
}

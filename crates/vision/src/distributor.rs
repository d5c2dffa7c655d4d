//! Session lifecycle and frame fan-out.
//!
//! A session pumps frames from one attached [`FrameSource`] into two
//! latest-wins buffers: `display`, which receives every frame, and
//! `analysis`, which only receives frames while continuous analysis is on.
//! Starting a session tears the previous one down completely first.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use video_ingest::{
    AttachedSource, CaptureError, ClipInfo, Frame, FrameDecoder, FrameSource, FrameStream,
    LoopCursor, SourceKind,
};

use crate::{fanout::FanoutBuffer, pipeline::telemetry};

const HEARTBEAT_FRAMES: u64 = 30;
const DECODE_WARN_EVERY: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A frame tagged with the session that produced it and its position in the
/// source order.
#[derive(Clone, Debug)]
pub struct SessionFrame {
    pub session: SessionId,
    pub sequence: u64,
    pub frame: Arc<Frame>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    #[default]
    Continuous,
    OnDemand,
}

impl AnalysisMode {
    pub fn label(self) -> &'static str {
        match self {
            AnalysisMode::Continuous => "continuous",
            AnalysisMode::OnDemand => "on-demand",
        }
    }

    pub fn is_continuous(self) -> bool {
        self == AnalysisMode::Continuous
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared on/off flag for analysis fan-out and continuous submissions.
#[derive(Clone, Debug)]
pub struct AnalysisSwitch(Arc<AtomicBool>);

impl AnalysisSwitch {
    fn new(mode: AnalysisMode) -> Self {
        Self(Arc::new(AtomicBool::new(mode.is_continuous())))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, mode: AnalysisMode) -> AnalysisMode {
        if self.0.swap(mode.is_continuous(), Ordering::SeqCst) {
            AnalysisMode::Continuous
        } else {
            AnalysisMode::OnDemand
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpOptions {
    /// Fixed delay between file frames. Defaults to the clip's frame rate.
    pub file_frame_interval: Option<Duration>,
}

/// Buffers of a running session, handed to its consumers.
#[derive(Clone)]
pub struct SessionHandles {
    pub id: SessionId,
    pub kind: SourceKind,
    pub display: Arc<FanoutBuffer<SessionFrame>>,
    pub analysis: Arc<FanoutBuffer<SessionFrame>>,
}

/// Counters collected by a pump over the lifetime of its session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub frames: u64,
    pub decode_errors: u64,
    pub capture_errors: u64,
    pub loops: u64,
}

struct Session {
    handles: SessionHandles,
    // Dropping the sender stops the pump.
    stop_tx: Option<Sender<()>>,
    pump: Option<JoinHandle<PumpReport>>,
}

impl Session {
    fn shutdown(&mut self) -> Option<PumpReport> {
        drop(self.stop_tx.take());
        self.handles.display.close();
        self.handles.analysis.close();
        let pump = self.pump.take()?;
        match pump.join() {
            Ok(report) => Some(report),
            Err(_) => {
                error!(session = %self.handles.id, "frame pump panicked");
                None
            }
        }
    }
}

/// Owns the current session and the analysis fan-out switch.
pub struct Distributor {
    analysis: AnalysisSwitch,
    options: PumpOptions,
    next_session: u64,
    session: Option<Session>,
}

impl Distributor {
    pub fn new(mode: AnalysisMode, options: PumpOptions) -> Self {
        Self {
            analysis: AnalysisSwitch::new(mode),
            options,
            next_session: 0,
            session: None,
        }
    }

    pub fn mode(&self) -> AnalysisMode {
        if self.analysis.is_enabled() {
            AnalysisMode::Continuous
        } else {
            AnalysisMode::OnDemand
        }
    }

    pub fn analysis_switch(&self) -> AnalysisSwitch {
        self.analysis.clone()
    }

    pub fn session(&self) -> Option<&SessionHandles> {
        self.session.as_ref().map(|session| &session.handles)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session().map(|handles| handles.id)
    }

    /// Whether a session exists and its pump is still producing frames.
    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|session| {
            session
                .pump
                .as_ref()
                .is_some_and(|pump| !pump.is_finished())
        })
    }

    /// Replace the current session with one fed by `source`.
    ///
    /// The previous session is fully stopped before `source` is attached. If
    /// attaching fails the distributor is left without a session.
    pub fn start(&mut self, source: FrameSource) -> Result<SessionHandles, CaptureError> {
        self.stop();

        let kind = source.kind();
        let description = source.describe();
        let attached = match source.attach() {
            Ok(attached) => attached,
            Err(err) => {
                metrics::counter!("vision_capture_errors_total").increment(1);
                error!(source = %description, "failed to attach {} source: {err}", kind.label());
                return Err(err);
            }
        };

        self.next_session += 1;
        let id = SessionId(self.next_session);
        let handles = SessionHandles {
            id,
            kind,
            display: Arc::new(FanoutBuffer::new("display")),
            analysis: Arc::new(FanoutBuffer::new("analysis")),
        };

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let pump = Pump {
            session: id,
            display: handles.display.clone(),
            analysis: handles.analysis.clone(),
            analysis_enabled: self.analysis.clone(),
            report: PumpReport::default(),
            last_frame_at: None,
        };
        let options = self.options;
        let span_source = description.clone();
        let join = telemetry::spawn_thread("vision-pump", move || {
            let span = tracing::info_span!(
                "distributor.pump",
                session = id.get(),
                source = %span_source,
                kind = kind.label()
            );
            let _guard = span.enter();
            pump.run(attached, stop_rx, options)
        })
        .map_err(|err| {
            CaptureError::Other(anyhow::Error::new(err).context("failed to spawn frame pump"))
        })?;

        info!(session = %id, source = %description, mode = %self.mode(), "session started");
        self.session = Some(Session {
            handles: handles.clone(),
            stop_tx: Some(stop_tx),
            pump: Some(join),
        });
        Ok(handles)
    }

    /// Stop the current session, if any. Returns once the source is detached.
    pub fn stop(&mut self) -> Option<PumpReport> {
        let mut session = self.session.take()?;
        let id = session.handles.id;
        let report = session.shutdown();
        if let Some(report) = report {
            info!(
                session = %id,
                frames = report.frames,
                decode_errors = report.decode_errors,
                capture_errors = report.capture_errors,
                loops = report.loops,
                "session stopped"
            );
        }
        report
    }

    /// Enable or disable analysis fan-out without touching the display path.
    pub fn switch_mode(&self, mode: AnalysisMode) {
        let previous = self.analysis.set(mode);
        if !mode.is_continuous() {
            if let Some(handles) = self.session() {
                handles.analysis.clear();
            }
        }
        if previous != mode {
            info!(mode = %mode, "analysis mode switched");
        }
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Pump {
    session: SessionId,
    display: Arc<FanoutBuffer<SessionFrame>>,
    analysis: Arc<FanoutBuffer<SessionFrame>>,
    analysis_enabled: AnalysisSwitch,
    report: PumpReport,
    last_frame_at: Option<Instant>,
}

impl Pump {
    fn run(
        mut self,
        mut source: AttachedSource,
        stop: Receiver<()>,
        options: PumpOptions,
    ) -> PumpReport {
        match &mut source {
            AttachedSource::Live { stream, .. } => self.pump_stream(stream, &stop),
            AttachedSource::File { decoder, info } => {
                let interval = options
                    .file_frame_interval
                    .unwrap_or_else(|| info.frame_interval());
                self.pump_file(decoder.as_mut(), info, interval, &stop)
            }
        }
        source.detach();
        self.display.close();
        self.analysis.close();
        debug!(frames = self.report.frames, "frame pump exited");
        self.report
    }

    fn pump_stream(&mut self, stream: &FrameStream, stop: &Receiver<()>) {
        loop {
            select! {
                recv(stream) -> message => match message {
                    Ok(Ok(frame)) => self.forward(frame),
                    Ok(Err(err)) => {
                        self.report.capture_errors += 1;
                        metrics::counter!("vision_capture_errors_total").increment(1);
                        warn!("capture error (frame skipped): {err}");
                    }
                    Err(_) => {
                        info!("camera stream ended");
                        break;
                    }
                },
                recv(stop) -> _ => break,
            }
        }
    }

    fn pump_file(
        &mut self,
        decoder: &mut dyn FrameDecoder,
        info: &ClipInfo,
        interval: Duration,
        stop: &Receiver<()>,
    ) {
        let mut cursor = LoopCursor::new(info.duration, interval);
        debug!(
            duration_ms = info.duration.as_millis() as u64,
            interval_ms = cursor.interval().as_millis() as u64,
            "looping clip"
        );

        let mut next_due = Instant::now();
        loop {
            let wait = next_due.saturating_duration_since(Instant::now());
            match stop.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            let at = cursor.position();
            match decoder.frame_at(at) {
                Ok(frame) => self.forward(frame),
                Err(err) => {
                    self.report.decode_errors += 1;
                    metrics::counter!("vision_decode_errors_total").increment(1);
                    if self.report.decode_errors % DECODE_WARN_EVERY == 1 {
                        warn!(
                            at_ms = at.as_millis() as u64,
                            total = self.report.decode_errors,
                            "skipping undecodable frame: {err}"
                        );
                    }
                }
            }

            let wraps = cursor.wraps();
            cursor.advance();
            if cursor.wraps() != wraps {
                self.report.loops += 1;
                debug!(loops = self.report.loops, "clip looped to start");
            }

            next_due += cursor.interval();
            let now = Instant::now();
            if next_due < now {
                next_due = now;
            }
        }
    }

    fn forward(&mut self, frame: Frame) {
        self.report.frames += 1;
        let sequence = self.report.frames;

        let now = Instant::now();
        if let Some(previous) = self.last_frame_at.replace(now) {
            metrics::histogram!("vision_source_frame_interval_seconds")
                .record(now.duration_since(previous).as_secs_f64());
        }
        if sequence % HEARTBEAT_FRAMES == 0 {
            debug!(
                "pump heartbeat: frame #{sequence}, {}x{}, ts={}",
                frame.width, frame.height, frame.timestamp_ms
            );
        }

        let item = SessionFrame {
            session: self.session,
            sequence,
            frame: Arc::new(frame),
        };
        if self.analysis_enabled.is_enabled() {
            self.analysis.publish(item.clone());
        }
        self.display.publish(item);
    }
}

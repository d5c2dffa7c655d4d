//! Terminal viewer: display cadence in the log, analysis text on stdout.

use std::{
    io::{self, Write},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Sender, TrySendError, bounded};
use serde::Serialize;
use tracing::{debug, info, warn};
use vision::{
    EvaluationState, SessionFrame, SessionId, TaskId, TaskOutput, ViewerSink, telemetry,
};

const FPS_WINDOW: Duration = Duration::from_secs(2);
/// Lines buffered for the writer thread before new ones are dropped.
const OUTPUT_QUEUE: usize = 256;

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ViewerEvent<'a> {
    Fps {
        session: SessionId,
        frame: u64,
        fps: f64,
    },
    State {
        state: EvaluationState,
    },
    Text {
        task: TaskId,
        output: &'a TaskOutput,
    },
}

struct FpsWindow {
    started: Instant,
    frames: u64,
}

/// Viewer for a terminal.
///
/// Callbacks run on pipeline threads (analysis text under the scheduler
/// lock), so lines are queued to a writer thread and dropped when the queue
/// is full instead of waiting on a slow stdout.
pub struct TerminalSink {
    json: bool,
    lines: Mutex<Option<Sender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
    window: Mutex<FpsWindow>,
}

impl TerminalSink {
    pub fn new(json: bool) -> io::Result<Self> {
        Self::with_writer(json, Box::new(io::stdout()))
    }

    pub fn with_writer(json: bool, mut out: Box<dyn Write + Send>) -> io::Result<Self> {
        let (tx, rx) = bounded::<String>(OUTPUT_QUEUE);
        let writer = telemetry::spawn_thread("vlm-viewer", move || {
            for line in rx {
                if let Err(err) = writeln!(out, "{line}").and_then(|()| out.flush()) {
                    debug!("viewer output failed: {err}");
                }
            }
        })?;
        Ok(Self {
            json,
            lines: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            dropped: AtomicU64::new(0),
            window: Mutex::new(FpsWindow {
                started: Instant::now(),
                frames: 0,
            }),
        })
    }

    /// Lines discarded because the writer fell behind.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush queued lines and stop the writer thread. Later output is discarded.
    pub fn close(&self) {
        drop(
            self.lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(writer) = writer {
            if writer.join().is_err() {
                warn!("viewer writer panicked");
            }
        }
    }

    fn emit(&self, event: &ViewerEvent<'_>, plain: impl FnOnce() -> Option<String>) {
        let line = if self.json {
            match serde_json::to_string(event) {
                Ok(line) => Some(line),
                Err(err) => {
                    warn!("failed to encode viewer event: {err}");
                    None
                }
            }
        } else {
            plain()
        };
        let Some(line) = line else {
            return;
        };

        let lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = lines.as_ref() else {
            return;
        };
        match tx.try_send(line) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 {
                    warn!("terminal is not keeping up; dropping viewer output");
                } else {
                    debug!(dropped, "viewer line dropped");
                }
            }
        }
    }
}

impl Drop for TerminalSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl ViewerSink for TerminalSink {
    fn show_frame(&self, frame: &SessionFrame) {
        let fps = {
            let mut window = self
                .window
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            window.frames += 1;
            let elapsed = window.started.elapsed();
            if elapsed < FPS_WINDOW {
                return;
            }
            let fps = window.frames as f64 / elapsed.as_secs_f64();
            window.started = Instant::now();
            window.frames = 0;
            fps
        };

        info!(
            session = %frame.session,
            frame = frame.sequence,
            "display {:.1} fps ({}x{})",
            fps,
            frame.frame.width,
            frame.frame.height
        );
        if self.json {
            self.emit(
                &ViewerEvent::Fps {
                    session: frame.session,
                    frame: frame.sequence,
                    fps,
                },
                || None,
            );
        }
    }

    fn show_text(&self, task: TaskId, output: &TaskOutput) {
        self.emit(&ViewerEvent::Text { task, output }, || {
            Some(match output {
                TaskOutput::Partial(text) => format!("[{task}] … {text}"),
                TaskOutput::Final(text) => format!("[{task}] {text}"),
                TaskOutput::Failed(message) => format!("[{task}] analysis failed: {message}"),
            })
        });
    }

    fn show_state(&self, state: EvaluationState) {
        debug!(%state, "evaluation state");
        self.emit(&ViewerEvent::State { state }, || None);
    }
}

//! Pipeline owner tying together the distributor, the inference scheduler
//! and the viewer.
//!
//! Each session runs two consumer threads: one drains the display buffer into
//! the viewer and remembers the latest frame for on-demand requests, the
//! other drains the analysis buffer into the scheduler at a bounded rate.

pub mod config;
pub mod telemetry;

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use thiserror::Error;
use tracing::{debug, info, warn};
use video_ingest::{CaptureError, FrameSource};

use crate::{
    distributor::{AnalysisMode, AnalysisSwitch, Distributor, PumpOptions, SessionFrame, SessionId},
    engine::InferenceEngine,
    fanout::FanoutBuffer,
    scheduler::{GenerationOptions, InferenceRequest, InferenceScheduler, TaskHandle, TaskId},
    sink::{SinkObserver, ViewerSink},
    state::EvaluationState,
    throttle::Throttle,
};

const TASK_POLL: Duration = Duration::from_millis(50);

/// Analysis behaviour of a pipeline.
#[derive(Clone, Debug)]
pub struct AnalysisSettings {
    pub mode: AnalysisMode,
    /// Full prompt, suffix included.
    pub prompt: String,
    /// Minimum spacing between continuous submissions.
    pub analysis_interval: Duration,
    pub generation: GenerationOptions,
    pub pump: PumpOptions,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            mode: AnalysisMode::Continuous,
            prompt: config::compose_prompt(config::DEFAULT_PROMPT, config::DEFAULT_PROMPT_SUFFIX),
            analysis_interval: Duration::from_millis(250),
            generation: GenerationOptions::default(),
            pump: PumpOptions::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no session is running")]
    NotRunning,
    #[error("no frame has been displayed yet")]
    NoFrame,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to spawn {worker} worker")]
    Spawn {
        worker: &'static str,
        #[source]
        source: io::Error,
    },
}

type LatestFrame = Arc<Mutex<Option<SessionFrame>>>;

struct SessionWorkers {
    stop_tx: Option<Sender<()>>,
    joins: Vec<JoinHandle<()>>,
}

/// Runs sessions and routes their frames to the viewer and the scheduler.
pub struct Pipeline<E: InferenceEngine> {
    distributor: Distributor,
    scheduler: InferenceScheduler<E>,
    sink: Arc<dyn ViewerSink>,
    prompt: Arc<Mutex<String>>,
    latest: LatestFrame,
    analysis_interval: Duration,
    workers: Option<SessionWorkers>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<E: InferenceEngine> Pipeline<E> {
    pub fn new(engine: E, sink: Arc<dyn ViewerSink>, settings: AnalysisSettings) -> Self {
        let scheduler = InferenceScheduler::new(engine, settings.generation);
        scheduler.observe(Arc::new(SinkObserver(sink.clone())));
        Self {
            distributor: Distributor::new(settings.mode, settings.pump),
            scheduler,
            sink,
            prompt: Arc::new(Mutex::new(settings.prompt)),
            latest: Arc::new(Mutex::new(None)),
            analysis_interval: settings.analysis_interval,
            workers: None,
        }
    }

    pub fn scheduler(&self) -> &InferenceScheduler<E> {
        &self.scheduler
    }

    pub fn state(&self) -> EvaluationState {
        self.scheduler.state()
    }

    pub fn mode(&self) -> AnalysisMode {
        self.distributor.mode()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.distributor.session_id()
    }

    pub fn is_running(&self) -> bool {
        self.distributor.is_running()
    }

    pub fn prompt(&self) -> String {
        lock(&self.prompt).clone()
    }

    /// Replace the prompt used by subsequent submissions.
    pub fn set_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        info!(prompt = %prompt, "prompt updated");
        *lock(&self.prompt) = prompt;
    }

    /// Start a new session on `source`, stopping the current one first.
    pub fn start(&mut self, source: FrameSource) -> Result<SessionId, PipelineError> {
        self.quiesce();

        let handles = self.distributor.start(source)?;
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut joins = Vec::with_capacity(2);

        let display = handles.display.clone();
        let latest = self.latest.clone();
        let sink = self.sink.clone();
        let spawned = telemetry::spawn_thread("vision-display", move || {
            display_loop(&display, &latest, sink.as_ref())
        });
        match spawned {
            Ok(join) => joins.push(join),
            Err(source) => {
                self.distributor.stop();
                return Err(PipelineError::Spawn {
                    worker: "display",
                    source,
                });
            }
        }

        let analysis = handles.analysis.clone();
        let scheduler = self.scheduler.clone();
        let prompt = self.prompt.clone();
        let switch = self.distributor.analysis_switch();
        let interval = self.analysis_interval;
        let spawned = telemetry::spawn_thread("vision-analysis", move || {
            analysis_loop(&analysis, &switch, &scheduler, &prompt, interval, &stop_rx)
        });
        match spawned {
            Ok(join) => joins.push(join),
            Err(source) => {
                self.workers = Some(SessionWorkers {
                    stop_tx: Some(stop_tx),
                    joins,
                });
                self.quiesce();
                return Err(PipelineError::Spawn {
                    worker: "analysis",
                    source,
                });
            }
        }

        self.workers = Some(SessionWorkers {
            stop_tx: Some(stop_tx),
            joins,
        });
        Ok(handles.id)
    }

    /// Stop the current session and cancel any outstanding analysis.
    pub fn stop(&mut self) {
        self.quiesce();
    }

    /// Switch between continuous and on-demand analysis.
    ///
    /// The display keeps running. A mode change cancels the task in flight.
    pub fn switch_mode(&mut self, mode: AnalysisMode) {
        let previous = self.distributor.mode();
        // The switch must be off before cancelling: continuous submissions
        // check it under the scheduler lock that cancel_current takes.
        self.distributor.switch_mode(mode);
        if previous != mode {
            if let Some(task) = self.scheduler.cancel_current() {
                debug!(task = %task, "cancelled task on mode switch");
            }
        }
    }

    /// Analyse the most recently displayed frame.
    ///
    /// Joins the active task instead if one is running.
    pub fn request_analysis(&self, prompt: Option<&str>) -> Result<TaskHandle, PipelineError> {
        if self.distributor.session().is_none() {
            return Err(PipelineError::NotRunning);
        }
        let frame = lock(&self.latest).clone().ok_or(PipelineError::NoFrame)?;
        let prompt = match prompt {
            Some(prompt) => prompt.to_string(),
            None => self.prompt(),
        };
        debug!(frame = frame.sequence, "on-demand analysis requested");
        Ok(self.scheduler.submit(InferenceRequest { prompt, frame }))
    }

    pub fn cancel_current(&self) -> Option<TaskId> {
        self.scheduler.cancel_current()
    }

    /// Stop everything; equivalent to dropping the pipeline.
    pub fn shutdown(mut self) {
        self.quiesce();
    }

    fn quiesce(&mut self) {
        let workers = self.workers.take();
        if let Some(mut workers) = workers {
            drop(workers.stop_tx.take());
            self.distributor.stop();
            for join in workers.joins {
                if join.join().is_err() {
                    warn!("pipeline worker panicked");
                }
            }
        } else {
            self.distributor.stop();
        }
        self.scheduler.cancel_current();
        *lock(&self.latest) = None;
    }
}

impl<E: InferenceEngine> Drop for Pipeline<E> {
    fn drop(&mut self) {
        self.quiesce();
    }
}

fn display_loop(
    display: &FanoutBuffer<SessionFrame>,
    latest: &Mutex<Option<SessionFrame>>,
    sink: &dyn ViewerSink,
) {
    while let Some(frame) = display.consume() {
        *lock(latest) = Some(frame.clone());
        sink.show_frame(&frame);
    }
    debug!("display buffer closed");
}

fn analysis_loop<E: InferenceEngine>(
    analysis: &FanoutBuffer<SessionFrame>,
    switch: &AnalysisSwitch,
    scheduler: &InferenceScheduler<E>,
    prompt: &Mutex<String>,
    interval: Duration,
    stop: &Receiver<()>,
) {
    let mut throttle = Throttle::new(interval);
    loop {
        if !throttle.wait(stop) {
            break;
        }
        let Some(frame) = analysis.consume() else {
            break;
        };
        throttle.mark(Instant::now());

        let prompt = lock(prompt).clone();
        let request = InferenceRequest { prompt, frame };
        let Some(handle) = scheduler.submit_if(request, || switch.is_enabled()) else {
            continue;
        };
        while handle.wait_timeout(TASK_POLL).is_none() {
            if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
                return;
            }
        }
    }
    debug!("analysis loop exited");
}

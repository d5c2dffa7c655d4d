//! Single-flight inference scheduling with cooperative cancellation.
//!
//! At most one task is active at a time; submitting while a task is active
//! joins that task instead of queueing. Task lifecycle, the evaluation state
//! and delivery to observers are serialised through one owner lock, which is
//! also taken by [`InferenceScheduler::cancel_current`]. Once cancellation
//! returns, no further output of the cancelled task reaches any observer.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    distributor::SessionFrame,
    engine::{EngineError, GenerateControl, InferenceEngine, Token},
    pipeline::telemetry,
    state::{EvaluationState, StateMachine, TaskEvent},
};

/// Identity of one inference task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Prompt and frame submitted for analysis.
#[derive(Clone, Debug)]
pub struct InferenceRequest {
    pub prompt: String,
    pub frame: SessionFrame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationOptions {
    /// Generation stops once this many tokens were produced.
    pub max_tokens: usize,
    /// Emit a partial result each time the token count crosses a multiple of
    /// N (the first token is always emitted).
    pub tokens_per_update: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 240,
            tokens_per_update: 4,
        }
    }
}

/// Text delivered to observers for a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum TaskOutput {
    Partial(String),
    Final(String),
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedTask {
    pub text: String,
    pub tokens: usize,
    pub time_to_first_token: Option<Duration>,
}

/// Terminal result of a task, as seen through its [`TaskHandle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(CompletedTask),
    Cancelled,
    Failed(String),
}

impl TaskOutcome {
    fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Completed(_) => "completed",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::Failed(_) => "failed",
        }
    }
}

/// Event published to scheduler observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerEvent {
    State(EvaluationState),
    Output { task: TaskId, output: TaskOutput },
}

/// Receives scheduler events synchronously, in order.
///
/// Observers run while the scheduler's owner lock is held: they must return
/// quickly and must not call back into the scheduler.
pub trait SchedulerObserver: Send + Sync {
    fn on_event(&self, event: &SchedulerEvent);
}

impl SchedulerObserver for Sender<SchedulerEvent> {
    fn on_event(&self, event: &SchedulerEvent) {
        let _ = self.send(event.clone());
    }
}

/// Engine load progress.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LoadStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Failed(String),
}

#[derive(Clone, Debug, Default)]
struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct OutcomeSlot {
    value: Mutex<Option<TaskOutcome>>,
    done: Condvar,
}

/// Handle to a submitted task. Clones refer to the same task.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    cancel: CancelToken,
    outcome: Arc<OutcomeSlot>,
}

impl TaskHandle {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            cancel: CancelToken::default(),
            outcome: Arc::new(OutcomeSlot::default()),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.lock_outcome().is_some()
    }

    fn lock_outcome(&self) -> MutexGuard<'_, Option<TaskOutcome>> {
        self.outcome
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until the task reaches a terminal state.
    pub fn wait(&self) -> TaskOutcome {
        let mut guard = self.lock_outcome();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            guard = self
                .outcome
                .done
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Wait up to `timeout`; `None` if the task is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock_outcome();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = self
                .outcome
                .done
                .wait_timeout(guard, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn complete(&self, outcome: TaskOutcome) {
        let mut guard = self.lock_outcome();
        if guard.is_none() {
            *guard = Some(outcome);
        }
        drop(guard);
        self.outcome.done.notify_all();
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Memoised engine loading: one caller loads, concurrent callers wait for it.
#[derive(Default)]
struct EngineLoader {
    status: Mutex<LoadStatus>,
    changed: Condvar,
}

impl EngineLoader {
    fn lock(&self) -> MutexGuard<'_, LoadStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self) -> LoadStatus {
        self.lock().clone()
    }

    fn ensure(&self, load: impl FnOnce() -> Result<(), EngineError>) -> Result<(), EngineError> {
        let mut status = self.lock();
        let mut waited = false;
        loop {
            match status.clone() {
                LoadStatus::Loaded => return Ok(()),
                LoadStatus::Loading => {
                    waited = true;
                    status = self
                        .changed
                        .wait(status)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                // Callers that waited on a failed load share its error; later callers retry.
                LoadStatus::Failed(message) if waited => {
                    return Err(EngineError::Load(message));
                }
                LoadStatus::Unloaded | LoadStatus::Failed(_) => break,
            }
        }
        *status = LoadStatus::Loading;
        drop(status);

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(load))
            .unwrap_or_else(|_| Err(EngineError::Load("engine panicked while loading".into())));

        let mut status = self.lock();
        match &result {
            Ok(()) => {
                *status = LoadStatus::Loaded;
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "inference engine loaded"
                );
            }
            Err(err) => {
                *status = LoadStatus::Failed(err.to_string());
                error!("inference engine failed to load: {err}");
            }
        }
        drop(status);
        self.changed.notify_all();
        result
    }
}

/// State guarded by the owner lock.
struct Owner {
    machine: StateMachine,
    active: Option<TaskHandle>,
    observers: Vec<Arc<dyn SchedulerObserver>>,
}

impl Owner {
    fn emit(&self, event: SchedulerEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    fn transition(&mut self, task: TaskId, event: TaskEvent) -> bool {
        match self.machine.apply(task, event) {
            Ok(state) => {
                self.emit(SchedulerEvent::State(state));
                true
            }
            Err(err) => {
                debug!("ignoring state transition: {err}");
                false
            }
        }
    }
}

struct Shared<E: InferenceEngine> {
    engine: E,
    options: GenerationOptions,
    loader: EngineLoader,
    // Held while a task drives the engine; a cancelled task releases it on its next step.
    lease: Mutex<()>,
    next_id: AtomicU64,
    owner: Mutex<Owner>,
}

/// Admits inference requests one at a time and streams their output.
pub struct InferenceScheduler<E: InferenceEngine> {
    shared: Arc<Shared<E>>,
}

impl<E: InferenceEngine> Clone for InferenceScheduler<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: InferenceEngine> InferenceScheduler<E> {
    pub fn new(engine: E, options: GenerationOptions) -> Self {
        let options = GenerationOptions {
            max_tokens: options.max_tokens.max(1),
            tokens_per_update: options.tokens_per_update.max(1),
        };
        Self {
            shared: Arc::new(Shared {
                engine,
                options,
                loader: EngineLoader::default(),
                lease: Mutex::new(()),
                next_id: AtomicU64::new(0),
                owner: Mutex::new(Owner {
                    machine: StateMachine::new(),
                    active: None,
                    observers: Vec::new(),
                }),
            }),
        }
    }

    pub fn options(&self) -> GenerationOptions {
        self.shared.options
    }

    pub fn engine(&self) -> &E {
        &self.shared.engine
    }

    /// Register an observer. It immediately receives the current state.
    pub fn observe(&self, observer: Arc<dyn SchedulerObserver>) {
        let mut owner = self.shared.lock_owner();
        observer.on_event(&SchedulerEvent::State(owner.machine.state()));
        owner.observers.push(observer);
    }

    /// Channel-backed observer, mostly useful for tests and tooling.
    pub fn subscribe(&self) -> Receiver<SchedulerEvent> {
        let (tx, rx) = unbounded();
        self.observe(Arc::new(tx));
        rx
    }

    pub fn state(&self) -> EvaluationState {
        self.shared.lock_owner().machine.state()
    }

    pub fn load_status(&self) -> LoadStatus {
        self.shared.loader.status()
    }

    pub fn active_task(&self) -> Option<TaskHandle> {
        self.shared.lock_owner().active.clone()
    }

    /// Load the engine ahead of the first request.
    pub fn preload(&self) -> Result<(), EngineError> {
        let shared = &self.shared;
        shared.loader.ensure(|| shared.engine.ensure_loaded())
    }

    /// Submit a request. Returns the active task's handle if one is running.
    pub fn submit(&self, request: InferenceRequest) -> TaskHandle {
        let owner = self.shared.lock_owner();
        self.start_task(owner, request)
    }

    /// Like [`submit`](Self::submit), but only if `admit` still returns true
    /// once the owner lock is held. `cancel_current` takes the same lock, so a
    /// gate closed before cancelling cannot let a new task slip in after it.
    pub fn submit_if(
        &self,
        request: InferenceRequest,
        admit: impl FnOnce() -> bool,
    ) -> Option<TaskHandle> {
        let owner = self.shared.lock_owner();
        if !admit() {
            debug!(
                frame = request.frame.sequence,
                "submission gate closed; request dropped"
            );
            return None;
        }
        Some(self.start_task(owner, request))
    }

    fn start_task(
        &self,
        mut owner: MutexGuard<'_, Owner>,
        request: InferenceRequest,
    ) -> TaskHandle {
        if let Some(active) = owner.active.as_ref() {
            debug!(task = %active.id, "inference already running; joining active task");
            return active.clone();
        }

        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let handle = TaskHandle::new(id);
        owner.active = Some(handle.clone());
        drop(owner);

        debug!(
            task = %id,
            session = %request.frame.session,
            frame = request.frame.sequence,
            "admitting inference task"
        );

        let shared = self.shared.clone();
        let task = handle.clone();
        let spawned = telemetry::spawn_thread(format!("vision-inference-{}", id.0), move || {
            shared.run_task(task, request)
        });
        if let Err(err) = spawned {
            self.shared.finish(
                &handle,
                TaskOutcome::Failed(format!("failed to spawn inference worker: {err}")),
            );
        }
        handle
    }

    /// Cancel the active task, if any, and return its id.
    ///
    /// The task is detached from the scheduler before this returns: the state
    /// goes back to `Idle`, its remaining output is discarded, and the next
    /// `submit` starts a fresh task.
    pub fn cancel_current(&self) -> Option<TaskId> {
        let mut owner = self.shared.lock_owner();
        let task = owner.active.take()?;
        task.cancel.cancel();
        owner.transition(task.id, TaskEvent::Finished);
        drop(owner);
        info!(task = %task.id, "cancelled inference task");
        Some(task.id)
    }
}

impl<E: InferenceEngine> Shared<E> {
    fn lock_owner(&self) -> MutexGuard<'_, Owner> {
        self.owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_task(&self, task: TaskHandle, request: InferenceRequest) {
        let span = tracing::info_span!(
            "inference.task",
            task = task.id.0,
            session = request.frame.session.get(),
            frame = request.frame.sequence
        );
        let _guard = span.enter();

        let started = Instant::now();
        let result =
            panic::catch_unwind(AssertUnwindSafe(|| self.generate(&task, request, started)));
        let outcome = match result {
            Ok(Ok(Some(done))) => TaskOutcome::Completed(done),
            Ok(Ok(None)) => TaskOutcome::Cancelled,
            Ok(Err(_)) if task.is_cancelled() => TaskOutcome::Cancelled,
            Ok(Err(err)) => TaskOutcome::Failed(err.to_string()),
            Err(_) => TaskOutcome::Failed("inference engine panicked".into()),
        };
        metrics::histogram!("vision_inference_task_seconds", "outcome" => outcome.label())
            .record(started.elapsed().as_secs_f64());
        self.finish(&task, outcome);
    }

    /// Run the generation steps. `Ok(None)` means the task observed cancellation.
    fn generate(
        &self,
        task: &TaskHandle,
        request: InferenceRequest,
        started: Instant,
    ) -> Result<Option<CompletedTask>, EngineError> {
        if task.is_cancelled() {
            return Ok(None);
        }
        self.loader.ensure(|| self.engine.ensure_loaded())?;
        if task.is_cancelled() {
            return Ok(None);
        }

        let _lease = self
            .lease
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !self.admit(task) {
            return Ok(None);
        }

        let input = self
            .engine
            .prepare_input(&request.prompt, &request.frame.frame)?;
        if task.is_cancelled() {
            return Ok(None);
        }

        let max_tokens = self.options.max_tokens;
        let every = self.options.tokens_per_update;
        let mut time_to_first_token = None;
        let mut produced = 0usize;
        let mut last_emitted = 0usize;
        let mut observed_cancel = false;

        let text = self
            .engine
            .generate(input, max_tokens, &mut |tokens: &[Token]| {
                if task.is_cancelled() {
                    observed_cancel = true;
                    return GenerateControl::Stop;
                }
                if tokens.is_empty() {
                    return GenerateControl::Continue;
                }
                produced = tokens.len();

                if time_to_first_token.is_none() {
                    let elapsed = started.elapsed();
                    time_to_first_token = Some(elapsed);
                    metrics::histogram!("vision_inference_ttft_seconds")
                        .record(elapsed.as_secs_f64());
                    debug!(ttft_ms = elapsed.as_millis() as u64, "first token");
                    if !self.first_token(task) {
                        observed_cancel = true;
                        return GenerateControl::Stop;
                    }
                    self.deliver(task, TaskOutput::Partial(self.engine.decode(tokens)));
                    last_emitted = produced;
                } else if produced / every > last_emitted / every {
                    // Engines may hand over several tokens per step.
                    self.deliver(task, TaskOutput::Partial(self.engine.decode(tokens)));
                    last_emitted = produced;
                }

                if produced >= max_tokens {
                    GenerateControl::Stop
                } else {
                    GenerateControl::Continue
                }
            })?;

        metrics::counter!("vision_inference_tokens_total").increment(produced as u64);
        if observed_cancel || task.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(CompletedTask {
            text,
            tokens: produced,
            time_to_first_token,
        }))
    }

    fn admit(&self, task: &TaskHandle) -> bool {
        let mut owner = self.lock_owner();
        if task.is_cancelled() {
            return false;
        }
        if !owner.transition(task.id, TaskEvent::Admitted) {
            warn!(task = %task.id, "evaluation state busy; dropping task");
            return false;
        }
        true
    }

    fn first_token(&self, task: &TaskHandle) -> bool {
        let mut owner = self.lock_owner();
        !task.is_cancelled() && owner.transition(task.id, TaskEvent::FirstToken)
    }

    fn deliver(&self, task: &TaskHandle, output: TaskOutput) {
        let owner = self.lock_owner();
        if task.is_cancelled() {
            return;
        }
        owner.emit(SchedulerEvent::Output {
            task: task.id,
            output,
        });
    }

    fn finish(&self, task: &TaskHandle, outcome: TaskOutcome) {
        let mut owner = self.lock_owner();
        // Re-checked under the lock so a cancellation racing completion wins.
        let outcome = if task.is_cancelled() {
            TaskOutcome::Cancelled
        } else {
            outcome
        };

        match &outcome {
            TaskOutcome::Completed(done) => {
                owner.emit(SchedulerEvent::Output {
                    task: task.id,
                    output: TaskOutput::Final(done.text.clone()),
                });
                info!(
                    task = %task.id,
                    tokens = done.tokens,
                    ttft_ms = done.time_to_first_token.map(|d| d.as_millis() as u64),
                    "inference finished"
                );
            }
            TaskOutcome::Failed(message) => {
                owner.emit(SchedulerEvent::Output {
                    task: task.id,
                    output: TaskOutput::Failed(message.clone()),
                });
                error!(task = %task.id, "inference failed: {message}");
            }
            TaskOutcome::Cancelled => debug!(task = %task.id, "inference cancelled"),
        }
        metrics::counter!("vision_inference_tasks_total", "outcome" => outcome.label())
            .increment(1);

        owner.transition(task.id, TaskEvent::Finished);
        if owner.active.as_ref().is_some_and(|active| active.id == task.id) {
            owner.active = None;
        }
        drop(owner);
        task.complete(outcome);
    }
}

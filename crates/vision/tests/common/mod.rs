#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use video_ingest::{
    CameraSource, CaptureError, ClipInfo, Frame, FrameDecoder, FrameFormat, FrameSource,
    FrameStream,
};
use vision::{
    EngineError, EvaluationState, GenerateControl, InferenceEngine, InferenceRequest,
    SessionFrame, SessionId, TaskId, TaskOutput, Token, ViewerSink,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn frame(timestamp_ms: i64) -> Frame {
    Frame {
        data: vec![0; 4 * 4 * 3],
        width: 4,
        height: 4,
        timestamp_ms,
        format: FrameFormat::Bgr8,
    }
}

pub fn request(prompt: &str, timestamp_ms: i64) -> InferenceRequest {
    InferenceRequest {
        prompt: prompt.to_string(),
        frame: SessionFrame {
            session: SessionId::new(1),
            sequence: timestamp_ms as u64,
            frame: Arc::new(frame(timestamp_ms)),
        },
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Poll `condition` until it holds or `WAIT` elapses.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Engine that emits a fixed list of words, one token per word.
pub struct ScriptedEngine {
    words: Vec<String>,
    batch: usize,
    token_delay: Duration,
    load_delay: Duration,
    gate: Option<Receiver<()>>,
    failing_loads: AtomicUsize,
    fail_after: Option<usize>,
    pub loads: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub frames: Mutex<Vec<i64>>,
    pub prepared_at: Mutex<Vec<Instant>>,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(words: &[&str]) -> Self {
        Self {
            words: words.iter().map(|word| word.to_string()).collect(),
            batch: 1,
            token_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            gate: None,
            failing_loads: AtomicUsize::new(0),
            fail_after: None,
            loads: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            prepared_at: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Every token waits for one message on the returned sender.
    pub fn gated(mut self) -> (Self, Sender<()>) {
        let (tx, rx) = unbounded();
        self.gate = Some(rx);
        (self, tx)
    }

    /// Report tokens to the callback `size` at a time, like a decoder that
    /// samples several tokens per step.
    pub fn with_batch(mut self, size: usize) -> Self {
        self.batch = size.max(1);
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing_loads(self, count: usize) -> Self {
        self.failing_loads.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_after(mut self, tokens: usize) -> Self {
        self.fail_after = Some(tokens);
        self
    }

    pub fn text(&self) -> String {
        self.words.join(" ")
    }
}

impl InferenceEngine for ScriptedEngine {
    type Input = String;

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.load_delay);
        let remaining = self.failing_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_loads.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Load("weights missing".into()));
        }
        Ok(())
    }

    fn prepare_input(&self, prompt: &str, frame: &Frame) -> Result<String, EngineError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.frames.lock().unwrap().push(frame.timestamp_ms);
        self.prepared_at.lock().unwrap().push(Instant::now());
        Ok(prompt.to_string())
    }

    fn generate(
        &self,
        _input: String,
        max_tokens: usize,
        on_token: &mut dyn FnMut(&[Token]) -> GenerateControl,
    ) -> Result<String, EngineError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let mut tokens = Vec::new();
        let mut result = Ok(());
        let limit = self.words.len().min(max_tokens);
        for index in 0..limit {
            if let Some(gate) = &self.gate {
                if gate.recv_timeout(WAIT).is_err() {
                    break;
                }
            }
            thread::sleep(self.token_delay);
            if self.fail_after == Some(index) {
                result = Err(EngineError::Generate("sampler exploded".into()));
                break;
            }
            tokens.push(index as Token);
            let step_done = tokens.len() % self.batch == 0 || index + 1 == limit;
            if step_done && on_token(&tokens) == GenerateControl::Stop {
                break;
            }
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        result.map(|()| self.decode(&tokens))
    }

    fn decode(&self, tokens: &[Token]) -> String {
        tokens
            .iter()
            .filter_map(|token| self.words.get(*token as usize))
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Sink that records everything it is shown.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<(SessionId, u64)>>,
    pub texts: Mutex<Vec<(TaskId, TaskOutput)>>,
    pub states: Mutex<Vec<EvaluationState>>,
}

impl RecordingSink {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn sessions_seen(&self) -> HashSet<SessionId> {
        self.frames.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn outputs_for(&self, task: TaskId) -> Vec<TaskOutput> {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == task)
            .map(|(_, output)| output.clone())
            .collect()
    }

    pub fn last_state(&self) -> Option<EvaluationState> {
        self.states.lock().unwrap().last().copied()
    }
}

impl ViewerSink for RecordingSink {
    fn show_frame(&self, frame: &SessionFrame) {
        self.frames
            .lock()
            .unwrap()
            .push((frame.session, frame.sequence));
    }

    fn show_text(&self, task: TaskId, output: &TaskOutput) {
        self.texts.lock().unwrap().push((task, output.clone()));
    }

    fn show_state(&self, state: EvaluationState) {
        self.states.lock().unwrap().push(state);
    }
}

type FeedSlot = Arc<Mutex<Option<Sender<Result<Frame, CaptureError>>>>>;

/// In-memory push source fed through a [`CameraFeed`].
pub struct MemoryCamera {
    name: String,
    feed: FeedSlot,
    detached: Arc<AtomicBool>,
    deny: bool,
}

/// Test-side handle of a [`MemoryCamera`].
#[derive(Clone)]
pub struct CameraFeed {
    feed: FeedSlot,
    detached: Arc<AtomicBool>,
}

pub fn memory_camera(name: &str) -> (MemoryCamera, CameraFeed) {
    let feed: FeedSlot = Arc::new(Mutex::new(None));
    let detached = Arc::new(AtomicBool::new(false));
    (
        MemoryCamera {
            name: name.to_string(),
            feed: feed.clone(),
            detached: detached.clone(),
            deny: false,
        },
        CameraFeed { feed, detached },
    )
}

/// Camera whose device cannot be opened.
pub fn denied_camera() -> FrameSource {
    let (mut camera, _) = memory_camera("denied");
    camera.deny = true;
    FrameSource::LiveCamera(Box::new(camera))
}

impl MemoryCamera {
    pub fn into_source(self) -> FrameSource {
        FrameSource::LiveCamera(Box::new(self))
    }
}

impl CameraSource for MemoryCamera {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn attach(&mut self) -> Result<FrameStream, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied {
                uri: self.describe(),
            });
        }
        let (tx, rx) = unbounded();
        *self.feed.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn detach(&mut self) {
        self.feed.lock().unwrap().take();
        self.detached.store(true, Ordering::SeqCst);
    }
}

impl CameraFeed {
    /// Push a frame; `false` once the camera was detached.
    pub fn push(&self, frame: Frame) -> bool {
        match self.feed.lock().unwrap().as_ref() {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    pub fn push_error(&self, reason: &str) -> bool {
        match self.feed.lock().unwrap().as_ref() {
            Some(tx) => tx.send(Err(CaptureError::Stream(reason.into()))).is_ok(),
            None => false,
        }
    }

    /// End the stream as if the device disappeared.
    pub fn end(&self) {
        self.feed.lock().unwrap().take();
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Keep pushing frames from a background thread until detached or `stop` fires.
    pub fn stream(&self, period: Duration) -> (Sender<()>, thread::JoinHandle<u64>) {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let feed = self.clone();
        let join = thread::spawn(move || {
            let mut pushed = 0;
            loop {
                if !feed.push(frame(now_ms())) {
                    break;
                }
                pushed += 1;
                if !matches!(
                    stop_rx.recv_timeout(period),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout)
                ) {
                    break;
                }
            }
            pushed
        });
        (stop_tx, join)
    }
}

/// Pull source over a virtual clip. Frame timestamps equal the request time.
pub struct MemoryDecoder {
    info: ClipInfo,
    broken: Vec<Duration>,
    pub requests: Arc<Mutex<Vec<Duration>>>,
    pub closed: Arc<AtomicBool>,
}

impl MemoryDecoder {
    pub fn new(duration: Duration, frame_rate: f64) -> Self {
        Self {
            info: ClipInfo {
                duration,
                frame_rate,
                width: 4,
                height: 4,
            },
            broken: Vec::new(),
            requests: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Timestamps that fail to decode.
    pub fn with_broken(mut self, broken: &[Duration]) -> Self {
        self.broken = broken.to_vec();
        self
    }

    pub fn into_source(self) -> FrameSource {
        FrameSource::FileLoop(Box::new(self))
    }
}

impl FrameDecoder for MemoryDecoder {
    fn describe(&self) -> String {
        "memory clip".into()
    }

    fn open(&mut self) -> Result<ClipInfo, CaptureError> {
        Ok(self.info)
    }

    fn frame_at(&mut self, at: Duration) -> Result<Frame, CaptureError> {
        self.requests.lock().unwrap().push(at);
        if self.broken.contains(&at) {
            return Err(CaptureError::Decode {
                at,
                reason: "corrupt packet".into(),
            });
        }
        Ok(frame(at.as_millis() as i64))
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

//! Live frame analysis: latest-wins frame distribution, single-flight
//! inference scheduling and the evaluation state shown to viewers.

pub mod distributor;
pub mod engine;
pub mod fanout;
pub mod pipeline;
pub mod scheduler;
pub mod sink;
pub mod state;
pub mod throttle;

pub use distributor::{
    AnalysisMode, AnalysisSwitch, Distributor, PumpOptions, PumpReport, SessionFrame,
    SessionHandles, SessionId,
};
pub use engine::{EngineError, GenerateControl, InferenceEngine, Token};
pub use fanout::{FanoutBuffer, FanoutStats, Received};
pub use pipeline::{
    AnalysisSettings, Pipeline, PipelineError,
    config::{Backend, PipelineCliArgs, PipelineConfig, RunMode, SourceSpec, TelemetryOptions},
    telemetry,
};
pub use scheduler::{
    CompletedTask, GenerationOptions, InferenceRequest, InferenceScheduler, LoadStatus,
    SchedulerEvent, SchedulerObserver, TaskHandle, TaskId, TaskOutcome, TaskOutput,
};
pub use sink::{SinkObserver, ViewerSink};
pub use state::{EvaluationState, StateMachine, TaskEvent, TransitionError};
pub use throttle::Throttle;

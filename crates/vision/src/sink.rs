//! Viewer-facing output.

use std::sync::Arc;

use crate::{
    distributor::SessionFrame,
    scheduler::{SchedulerEvent, SchedulerObserver, TaskId, TaskOutput},
    state::EvaluationState,
};

/// Receives frames, analysis text and state changes for presentation.
///
/// Calls arrive from pipeline threads and must not block.
pub trait ViewerSink: Send + Sync {
    fn show_frame(&self, frame: &SessionFrame);

    fn show_text(&self, task: TaskId, output: &TaskOutput);

    fn show_state(&self, state: EvaluationState);
}

impl<S: ViewerSink + ?Sized> ViewerSink for Arc<S> {
    fn show_frame(&self, frame: &SessionFrame) {
        (**self).show_frame(frame)
    }

    fn show_text(&self, task: TaskId, output: &TaskOutput) {
        (**self).show_text(task, output)
    }

    fn show_state(&self, state: EvaluationState) {
        (**self).show_state(state)
    }
}

/// Routes scheduler events to a [`ViewerSink`].
pub struct SinkObserver<S: ?Sized>(pub Arc<S>);

impl<S: ViewerSink + ?Sized> SchedulerObserver for SinkObserver<S> {
    fn on_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::State(state) => self.0.show_state(*state),
            SchedulerEvent::Output { task, output } => self.0.show_text(*task, output),
        }
    }
}

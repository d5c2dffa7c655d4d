mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{RecordingSink, ScriptedEngine, WAIT, eventually, frame, memory_camera, now_ms};
use vision::{
    AnalysisMode, AnalysisSettings, EvaluationState, GenerationOptions, Pipeline, PipelineError,
    PumpOptions, TaskOutcome, TaskOutput,
};

const WORDS: &[&str] = &["a", "cat", "on", "a", "sofa"];

fn settings(mode: AnalysisMode) -> AnalysisSettings {
    AnalysisSettings {
        mode,
        prompt: "describe".into(),
        analysis_interval: Duration::from_millis(10),
        generation: GenerationOptions {
            max_tokens: 64,
            tokens_per_update: 1,
        },
        pump: PumpOptions::default(),
    }
}

#[test]
fn on_demand_request_cancel_and_follow_up() {
    let (engine, gate) = ScriptedEngine::new(WORDS).gated();
    let engine = Arc::new(engine);
    let sink = Arc::new(RecordingSink::default());
    let mut pipeline = Pipeline::new(engine.clone(), sink.clone(), settings(AnalysisMode::OnDemand));

    assert!(matches!(
        pipeline.request_analysis(None),
        Err(PipelineError::NotRunning)
    ));

    let (camera, feed) = memory_camera("desk");
    pipeline.start(camera.into_source()).unwrap();
    assert!(matches!(
        pipeline.request_analysis(None),
        Err(PipelineError::NoFrame)
    ));

    feed.push(frame(100));
    assert!(eventually(|| sink.frame_count() == 1));
    thread::sleep(Duration::from_millis(50));
    assert!(engine.prompts.lock().unwrap().is_empty());
    assert_eq!(pipeline.state(), EvaluationState::Idle);

    let first = pipeline.request_analysis(None).unwrap();
    gate.send(()).unwrap();
    assert!(eventually(|| !sink.outputs_for(first.id()).is_empty()));
    assert_eq!(pipeline.state(), EvaluationState::GeneratingResponse);
    assert_eq!(
        sink.outputs_for(first.id()),
        vec![TaskOutput::Partial("a".into())]
    );

    assert_eq!(pipeline.cancel_current(), Some(first.id()));
    assert_eq!(pipeline.state(), EvaluationState::Idle);
    assert_eq!(sink.last_state(), Some(EvaluationState::Idle));
    let first_outputs = sink.outputs_for(first.id()).len();

    let second = pipeline.request_analysis(Some("what colour is the sofa?")).unwrap();
    assert_ne!(second.id(), first.id());
    for _ in 0..=WORDS.len() {
        gate.send(()).unwrap();
    }

    assert_eq!(first.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
    assert!(matches!(
        second.wait_timeout(WAIT),
        Some(TaskOutcome::Completed(_))
    ));

    assert_eq!(sink.outputs_for(first.id()).len(), first_outputs);
    assert_eq!(
        sink.outputs_for(second.id()).last(),
        Some(&TaskOutput::Final(WORDS.join(" ")))
    );
    assert_eq!(
        *engine.prompts.lock().unwrap(),
        vec!["describe".to_string(), "what colour is the sofa?".to_string()]
    );
    assert_eq!(*engine.frames.lock().unwrap(), vec![100, 100]);
    assert_eq!(pipeline.state(), EvaluationState::Idle);
    pipeline.shutdown();
}

#[test]
fn continuous_mode_analyses_live_frames() {
    let engine = Arc::new(ScriptedEngine::new(WORDS));
    let sink = Arc::new(RecordingSink::default());
    let mut pipeline = Pipeline::new(engine.clone(), sink.clone(), settings(AnalysisMode::Continuous));

    let (camera, feed) = memory_camera("live");
    pipeline.start(camera.into_source()).unwrap();
    let (stop_feed, feeder) = feed.stream(Duration::from_millis(5));

    let finals = || {
        sink.texts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, output)| matches!(output, TaskOutput::Final(_)))
            .count()
    };
    assert!(eventually(|| finals() >= 3));

    pipeline.stop();
    drop(stop_feed);
    feeder.join().unwrap();

    let frames = engine.frames.lock().unwrap().clone();
    assert!(frames.len() >= 3);
    assert!(frames.windows(2).all(|pair| pair[0] <= pair[1]), "{frames:?}");
    assert_eq!(pipeline.state(), EvaluationState::Idle);
}

#[test]
fn restarting_isolates_sessions() {
    let (engine, gate) = ScriptedEngine::new(WORDS).gated();
    let sink = Arc::new(RecordingSink::default());
    let mut pipeline = Pipeline::new(Arc::new(engine), sink.clone(), settings(AnalysisMode::Continuous));

    let (first_camera, first_feed) = memory_camera("first");
    let first_session = pipeline.start(first_camera.into_source()).unwrap();
    first_feed.push(frame(now_ms()));
    assert!(eventually(|| pipeline.scheduler().active_task().is_some()));
    let stale = pipeline.scheduler().active_task().unwrap();

    let (second_camera, second_feed) = memory_camera("second");
    let second_session = pipeline.start(second_camera.into_source()).unwrap();
    assert!(second_session > first_session);
    assert_eq!(pipeline.session_id(), Some(second_session));
    assert!(stale.is_cancelled());
    assert!(first_feed.is_detached());
    assert_eq!(pipeline.state(), EvaluationState::Idle);
    let frames_at_restart = sink.frame_count();

    second_feed.push(frame(now_ms()));
    for _ in 0..16 {
        gate.send(()).unwrap();
    }
    assert_eq!(stale.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));
    assert!(eventually(|| sink.frame_count() > frames_at_restart));

    let frames = sink.frames.lock().unwrap().clone();
    assert!(
        frames[frames_at_restart..]
            .iter()
            .all(|(session, _)| *session == second_session)
    );
    assert!(
        !sink
            .outputs_for(stale.id())
            .iter()
            .any(|output| matches!(output, TaskOutput::Final(_)))
    );
}

#[test]
fn switching_to_on_demand_cancels_and_pauses_analysis() {
    let (engine, gate) = ScriptedEngine::new(WORDS).gated();
    let engine = Arc::new(engine);
    let sink = Arc::new(RecordingSink::default());
    let mut pipeline = Pipeline::new(engine.clone(), sink.clone(), settings(AnalysisMode::Continuous));

    let (camera, feed) = memory_camera("cam");
    pipeline.start(camera.into_source()).unwrap();
    feed.push(frame(1));
    assert!(eventually(|| pipeline.scheduler().active_task().is_some()));
    let running = pipeline.scheduler().active_task().unwrap();

    pipeline.switch_mode(AnalysisMode::OnDemand);
    assert_eq!(pipeline.mode(), AnalysisMode::OnDemand);
    assert!(running.is_cancelled());
    assert_eq!(pipeline.state(), EvaluationState::Idle);
    gate.send(()).unwrap();
    assert_eq!(running.wait_timeout(WAIT), Some(TaskOutcome::Cancelled));

    let shown = sink.frame_count();
    feed.push(frame(2));
    feed.push(frame(3));
    assert!(eventually(|| sink.frame_count() > shown));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.prompts.lock().unwrap().len(), 1);
    assert!(pipeline.scheduler().active_task().is_none());
}

#[test]
fn no_task_survives_a_switch_to_on_demand() {
    let engine = Arc::new(ScriptedEngine::new(WORDS).with_token_delay(Duration::from_millis(2)));
    let sink = Arc::new(RecordingSink::default());
    let mut pipeline = Pipeline::new(engine.clone(), sink, settings(AnalysisMode::Continuous));

    let (camera, feed) = memory_camera("cam");
    pipeline.start(camera.into_source()).unwrap();
    let (stop_feed, feeder) = feed.stream(Duration::from_millis(1));
    assert!(eventually(|| !engine.prompts.lock().unwrap().is_empty()));

    for round in 0..40 {
        pipeline.switch_mode(AnalysisMode::Continuous);
        thread::sleep(Duration::from_millis(round % 7));
        pipeline.switch_mode(AnalysisMode::OnDemand);
        assert!(pipeline.scheduler().active_task().is_none(), "round {round}");
    }

    // Let tasks cancelled mid-step unwind before counting.
    thread::sleep(Duration::from_millis(30));
    let submitted = engine.prompts.lock().unwrap().len();
    thread::sleep(Duration::from_millis(60));
    assert!(pipeline.scheduler().active_task().is_none());
    assert_eq!(engine.prompts.lock().unwrap().len(), submitted);
    assert_eq!(pipeline.state(), EvaluationState::Idle);

    pipeline.stop();
    drop(stop_feed);
    feeder.join().unwrap();
}

#[test]
fn continuous_submissions_respect_the_analysis_interval() {
    let engine = Arc::new(ScriptedEngine::new(WORDS));
    let sink = Arc::new(RecordingSink::default());
    let mut settings = settings(AnalysisMode::Continuous);
    settings.analysis_interval = Duration::from_millis(100);
    let mut pipeline = Pipeline::new(engine.clone(), sink, settings);

    let (camera, feed) = memory_camera("cam");
    pipeline.start(camera.into_source()).unwrap();
    let (stop_feed, feeder) = feed.stream(Duration::from_millis(5));
    assert!(eventually(|| engine.prepared_at.lock().unwrap().len() >= 4));

    pipeline.stop();
    drop(stop_feed);
    feeder.join().unwrap();

    let prepared = engine.prepared_at.lock().unwrap().clone();
    for pair in prepared.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(90), "submissions {gap:?} apart");
    }
}

#[test]
fn prompt_updates_apply_to_later_requests() {
    let engine = Arc::new(ScriptedEngine::new(WORDS));
    let sink = Arc::new(RecordingSink::default());
    let mut pipeline = Pipeline::new(engine.clone(), sink.clone(), settings(AnalysisMode::OnDemand));

    let (camera, feed) = memory_camera("cam");
    pipeline.start(camera.into_source()).unwrap();
    feed.push(frame(7));
    assert!(eventually(|| sink.frame_count() == 1));

    pipeline.set_prompt("count the people");
    assert_eq!(pipeline.prompt(), "count the people");
    let handle = pipeline.request_analysis(None).unwrap();
    assert!(matches!(handle.wait(), TaskOutcome::Completed(_)));
    assert_eq!(
        *engine.prompts.lock().unwrap(),
        vec!["count the people".to_string()]
    );
}

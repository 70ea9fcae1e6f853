use async_trait::async_trait;
use hataori::prelude::*;
use hataori::{Snapshot, SnapshotRegistry, StepOutcome};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct HopStep;

#[async_trait]
impl StepHandler for HopStep {
    async fn execute(
        &self,
        state: WorkflowState,
        _ctx: RunContext,
    ) -> Result<StepOutput, BoxError> {
        let hops = state.get::<i64>("hops").unwrap_or(0);
        Ok(StepOutput::next("b").set("hops", hops + 1))
    }
}

#[derive(Debug)]
struct EndStep;

#[async_trait]
impl StepHandler for EndStep {
    async fn execute(
        &self,
        _state: WorkflowState,
        _ctx: RunContext,
    ) -> Result<StepOutput, BoxError> {
        Ok(StepOutput::done())
    }
}

fn hops_workflow(name: &str) -> Workflow {
    Workflow::builder(name)
        .schema(ObjectSchema::new().with_default("hops", FieldKind::Number, 0))
        .add_step("a", HopStep)
        .add_step("b", EndStep)
        .build()
        .expect("valid workflow")
}

#[tokio::test]
async fn test_hops_workflow() {
    let workflow = hops_workflow("hops");

    let run = workflow.run(WorkflowState::new()).await.expect("run starts");

    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(run.step_names(), vec!["a", "b"]);
    assert_eq!(run.state().get::<i64>("hops"), Some(1));
    assert!(run.finished_at().is_some());
}

#[tokio::test]
async fn test_prev_from_first_step() {
    let workflow = Workflow::builder("backwards")
        .add_step("first", step_fn(|_, _| async { Ok(StepOutput::prev()) }))
        .build()
        .expect("valid workflow");

    let run = workflow.run(WorkflowState::new()).await.expect("run starts");

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(matches!(
        run.error(),
        Some(WorkflowError::NoPreviousStep { step_name }) if step_name.as_str() == "first"
    ));
}

#[tokio::test]
async fn test_prev_returns_to_previous_step() {
    let visits = Arc::new(AtomicU32::new(0));
    let counter = visits.clone();
    let workflow = Workflow::builder("revise")
        .add_step(
            "draft",
            step_fn(move |_, _| {
                let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(StepOutput::next("review").set("drafts", count)) }
            }),
        )
        .add_step(
            "review",
            step_fn(|state, _| async move {
                if state.get::<u32>("drafts") == Some(1) {
                    Ok(StepOutput::prev())
                } else {
                    Ok(StepOutput::done())
                }
            }),
        )
        .build()
        .expect("valid workflow");

    let run = workflow.run(WorkflowState::new()).await.expect("run starts");

    assert!(run.is_success());
    assert_eq!(run.step_names(), vec!["draft", "review", "draft", "review"]);
    assert_eq!(visits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_self_loop_hits_max_steps() {
    let executions = Arc::new(AtomicU32::new(0));
    let counter = executions.clone();
    let workflow = Workflow::builder("spin")
        .max_steps(5)
        .add_step(
            "again",
            step_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(StepOutput::repeat()) }
            }),
        )
        .build()
        .expect("valid workflow");

    let run = workflow.run(WorkflowState::new()).await.expect("run starts");

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(matches!(
        run.error(),
        Some(WorkflowError::MaxStepsExceeded { limit: 5 })
    ));
    assert_eq!(executions.load(Ordering::SeqCst), 5);
    assert_eq!(run.steps_executed(), 5);
}

#[tokio::test]
async fn test_strict_step_rejects_invalid_state() {
    let published = Arc::new(AtomicBool::new(false));
    let flag = published.clone();
    let workflow = Workflow::builder("publishing")
        .add_step(
            "prepare",
            step_fn(|_, _| async {
                Ok(StepOutput::next("publish").set("draft", "hello"))
            }),
        )
        .add_strict_step(
            "publish",
            ObjectSchema::new().field("approved", FieldKind::Bool),
            step_fn(move |_, _| {
                flag.store(true, Ordering::SeqCst);
                async { Ok(StepOutput::done().set("published", true)) }
            }),
        )
        .build()
        .expect("valid workflow");

    let run = workflow.run(WorkflowState::new()).await.expect("run starts");

    assert_eq!(run.status(), RunStatus::Failed);
    assert!(!published.load(Ordering::SeqCst));
    assert!(matches!(
        run.error(),
        Some(WorkflowError::Validation { step_name: Some(step), .. }) if step.as_str() == "publish"
    ));

    let last = run.history().last().expect("rejected step recorded");
    assert_eq!(last.name.as_str(), "publish");
    assert!(matches!(last.outcome, StepOutcome::Failed { .. }));
    assert_eq!(&last.state, &run.history()[0].state);
    assert_eq!(&last.state, run.state());
    assert!(!run.state().contains_key("published"));
}

#[tokio::test]
async fn test_sub_workflow_events_carry_parent_run() {
    let inner = Arc::new(hops_workflow("inner_hops"));
    let parents = Arc::new(Mutex::new(Vec::new()));
    let sink = parents.clone();
    inner
        .emitter()
        .match_event(
            Matcher::AllNested,
            move |event| {
                sink.lock()
                    .push(event.trace().and_then(|t| t.parent_run_id.clone()));
                async { Ok(()) }
            },
            ListenerOptions::new(),
        )
        .expect("listener");

    let outer = Workflow::builder("outer_hops")
        .add_step("delegate", inner.as_step(SubWorkflowOptions::new()))
        .build()
        .expect("valid workflow");

    let run = outer.run(WorkflowState::new()).await.expect("run starts");
    assert!(run.is_success());

    let parents = parents.lock();
    assert!(!parents.is_empty());
    assert!(parents
        .iter()
        .all(|parent| parent.as_deref() == Some(run.run_id())));
}

#[tokio::test]
async fn test_outer_observers_see_sub_workflow_progress() {
    let inner = Workflow::builder("inner_stream")
        .add_step(
            "work",
            step_fn(|_, ctx| async move {
                ctx.emitter().emit("progress", 0.5_f64).await?;
                Ok(StepOutput::done())
            }),
        )
        .build()
        .expect("valid workflow");
    let outer = Workflow::builder("outer_stream")
        .add_step("embed", Arc::new(inner).as_step(SubWorkflowOptions::new()))
        .build()
        .expect("valid workflow");

    let paths = Arc::new(Mutex::new(Vec::new()));
    let sink = paths.clone();
    outer
        .emitter()
        .match_event(
            Matcher::AllNested,
            move |event| {
                sink.lock().push(event.path().to_string());
                async { Ok(()) }
            },
            ListenerOptions::new().blocking(),
        )
        .expect("listener");

    let run = outer.run(WorkflowState::new()).await.expect("run starts");
    assert!(run.is_success());

    let paths = paths.lock();
    let nested: Vec<&str> = paths
        .iter()
        .map(String::as_str)
        .filter(|path| path.starts_with("workflow.inner_stream."))
        .collect();
    assert_eq!(
        nested,
        vec![
            "workflow.inner_stream.run.start",
            "workflow.inner_stream.start",
            "workflow.inner_stream.progress",
            "workflow.inner_stream.success",
            "workflow.inner_stream.run.success",
            "workflow.inner_stream.run.finish",
        ]
    );
    assert_eq!(
        paths.last().map(String::as_str),
        Some("workflow.outer_stream.run.finish")
    );
}

#[tokio::test]
async fn test_abort_before_first_suspension() {
    let workflow = Workflow::builder("cancelled")
        .add_step(
            "stop",
            step_fn(|_, ctx| async move {
                ctx.abort();
                Ok(StepOutput::done().set("finished", true))
            }),
        )
        .build()
        .expect("valid workflow");

    let run = workflow.run(WorkflowState::new()).await.expect("run starts");

    assert_eq!(run.status(), RunStatus::Aborted);
    assert!(run.error().is_some_and(WorkflowError::is_aborted));
    assert!(!run.state().contains_key("finished"));
    assert!(matches!(
        run.history().last().map(|r| &r.outcome),
        Some(StepOutcome::Aborted)
    ));
}

#[tokio::test]
async fn test_caller_signal_aborts_before_first_step() {
    let workflow = hops_workflow("pre_cancelled");
    let token = CancellationToken::new();
    token.cancel();

    let run = workflow
        .run_with(WorkflowState::new(), RunOptions::new().signal(token))
        .await
        .expect("run starts");

    assert_eq!(run.status(), RunStatus::Aborted);
    assert!(run.history().is_empty());
    assert_eq!(run.steps_executed(), 0);
}

#[tokio::test]
async fn test_nested_run_observes_ancestor_abort() {
    let token = CancellationToken::new();
    let observed = Arc::new(AtomicBool::new(false));

    let trigger = token.clone();
    let seen = observed.clone();
    let inner = Workflow::builder("inner_abort")
        .add_step(
            "cancel",
            step_fn(move |_, ctx| {
                trigger.cancel();
                seen.store(ctx.signal().is_aborted(), Ordering::SeqCst);
                async { Ok(StepOutput::done()) }
            }),
        )
        .build()
        .expect("valid workflow");

    let outer = Workflow::builder("outer_abort")
        .add_step("embed", Arc::new(inner).as_step(SubWorkflowOptions::new()))
        .build()
        .expect("valid workflow");

    let run = outer
        .run_with(WorkflowState::new(), RunOptions::new().signal(token))
        .await
        .expect("run starts");

    assert!(observed.load(Ordering::SeqCst));
    assert_eq!(run.status(), RunStatus::Aborted);
}

#[tokio::test]
async fn test_already_running() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let (on_start, on_release) = (started.clone(), release.clone());
    let workflow = Workflow::builder("busy")
        .add_step(
            "wait",
            step_fn(move |_, _| {
                let started = on_start.clone();
                let release = on_release.clone();
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(StepOutput::done())
                }
            }),
        )
        .build()
        .expect("valid workflow");

    let first = workflow.run(WorkflowState::new());
    let second = async {
        started.notified().await;
        let result = workflow.run(WorkflowState::new()).await;
        release.notify_one();
        result
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.expect("first run starts").is_success());
    assert!(matches!(
        second,
        Err(WorkflowError::AlreadyRunning { workflow }) if workflow == "busy"
    ));
    assert!(!workflow.is_running());
}

#[tokio::test]
async fn test_running_flag_released_after_failure() {
    let workflow = Workflow::builder("flaky")
        .add_step(
            "fail",
            step_fn(|_, _| async { Err::<StepOutput, BoxError>("unavailable".into()) }),
        )
        .build()
        .expect("valid workflow");

    for _ in 0..2 {
        let run = workflow.run(WorkflowState::new()).await.expect("run starts");
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(!workflow.is_running());
    }
}

#[tokio::test]
async fn test_deleting_start_step() {
    let mut workflow = hops_workflow("editable");

    workflow.del_step("a").expect("step exists");
    assert!(matches!(
        workflow.run(WorkflowState::new()).await,
        Err(WorkflowError::MissingStartStep)
    ));

    workflow.set_start("b").expect("step exists");
    let run = workflow.run(WorkflowState::new()).await.expect("run starts");
    assert!(run.is_success());
    assert_eq!(run.step_names(), vec!["b"]);
}

#[tokio::test]
async fn test_step_events_and_failing_observer() {
    let workflow = hops_workflow("observed");
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["start", "success"] {
        let sink = log.clone();
        workflow
            .emitter()
            .on(
                name,
                move |event| {
                    if let Some(step) = event.payload::<hataori::StepEvent>() {
                        sink.lock().push(format!("{}:{}", event.name(), step.step));
                    }
                    async { Ok(()) }
                },
                ListenerOptions::new().match_nested(true),
            )
            .expect("listener");
    }
    workflow
        .emitter()
        .on(
            "success",
            |_| async { Err::<(), BoxError>("observer broke".into()) },
            ListenerOptions::new().blocking().match_nested(true),
        )
        .expect("listener");

    let run = workflow.run(WorkflowState::new()).await.expect("run starts");

    assert!(run.is_success());
    assert_eq!(
        *log.lock(),
        vec!["start:a", "success:a", "start:b", "success:b"]
    );
}

#[tokio::test]
async fn test_run_snapshot_through_registry() {
    let workflow = hops_workflow("persisted");
    let run = workflow.run(WorkflowState::new()).await.expect("run starts");

    let mut registry = SnapshotRegistry::new();
    registry.register::<WorkflowRun>("workflow_run");

    let tagged = registry.encode(&run).expect("encodes");
    let json = serde_json::to_string(&tagged).expect("serializes");
    let restored: WorkflowRun = registry
        .decode(serde_json::from_str(&json).expect("deserializes"))
        .expect("decodes");

    assert_eq!(restored.run_id(), run.run_id());
    assert_eq!(restored.status(), RunStatus::Succeeded);
    assert_eq!(restored.step_names(), vec!["a", "b"]);
    assert_eq!(restored.state(), run.state());
    assert_eq!(restored.create_snapshot(), run.create_snapshot());
}

mod support;

use chrono::Duration;
use ers_core::sink::SinkRegistry;
use ers_core::task::{TaskStatus, TaskUpdate, WorkflowKind, WorkflowRequest};
use ers_core::{RegistryError, TaskDispatcher, TaskRegistry, WorkflowError};
use uuid::Uuid;

use support::{half_hourly, register_memory, today, utc, Harness, MemorySink, PortalScript};

#[tokio::test]
async fn queued_task_is_pollable_before_and_after_execution() {
    let sink = MemorySink::default();
    let mut sinks = SinkRegistry::new();
    register_memory(&mut sinks, "x", &sink);
    let harness = Harness::new(
        PortalScript::default(),
        half_hourly(utc(2024, 5, 1, 0, 0), 2),
        sinks,
    );
    let mut request = WorkflowRequest::new(WorkflowKind::Current);
    request.sinks = vec!["x".into()];
    request.keep = true;

    let task_id = harness.controller.enqueue(request).unwrap();
    let record = harness.controller.status(task_id).unwrap();
    assert_eq!(record.status, "queued");
    assert!(!record.result_available);
    assert!(matches!(
        harness.controller.artifact(task_id),
        Err(WorkflowError::Registry(RegistryError::NotReady { .. }))
    ));
    assert_eq!(harness.log().opened, 0);

    let mut dispatcher = TaskDispatcher::new(harness.controller.clone());
    assert_eq!(dispatcher.dispatch_pending().unwrap(), vec![task_id]);
    let results = dispatcher.drain().await;
    assert_eq!(results.len(), 1);
    let (finished, report) = &results[0];
    assert_eq!(*finished, task_id);
    assert!(report.as_ref().unwrap().succeeded());

    let record = harness.controller.status(task_id).unwrap();
    assert_eq!(record.status, "completed");
    assert!(record.result_available);
    assert_eq!(sink.stored.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn submit_returns_id_and_runs_in_background() {
    let harness = Harness::new(PortalScript::default(), Vec::new(), SinkRegistry::new());
    let mut dispatcher = TaskDispatcher::new(harness.controller.clone());

    let task_id = dispatcher
        .submit(WorkflowRequest::new(WorkflowKind::Previous))
        .unwrap();
    assert_eq!(dispatcher.in_flight(), 1);

    let (finished, report) = dispatcher.join_next().await.unwrap();
    assert_eq!(finished, task_id);
    let report = report.unwrap();
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(
        harness.registry.get(task_id).unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn completed_task_cannot_be_executed_again() {
    let harness = Harness::new(PortalScript::default(), Vec::new(), SinkRegistry::new());
    let report = harness
        .controller
        .run(WorkflowRequest::new(WorkflowKind::Current))
        .await
        .unwrap();

    let err = harness.controller.execute(report.task_id).await.unwrap_err();

    assert!(matches!(
        err,
        WorkflowError::Registry(RegistryError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
            ..
        })
    ));
    assert_eq!(harness.log().opened, 1);
}

#[tokio::test]
async fn recovery_fails_interrupted_and_dispatches_queued() {
    let harness = Harness::new(PortalScript::default(), Vec::new(), SinkRegistry::new());
    let interrupted = Uuid::new_v4();
    // left running by a process that died ten minutes ago
    let departed = TaskRegistry::open(harness.registry.path()).unwrap();
    departed
        .create(
            interrupted,
            &WorkflowRequest::new(WorkflowKind::Current),
            TaskStatus::Running,
            today() - Duration::minutes(10),
        )
        .unwrap();
    drop(departed);
    let queued = harness
        .controller
        .enqueue(WorkflowRequest::new(WorkflowKind::Current))
        .unwrap();

    let mut dispatcher = TaskDispatcher::new(harness.controller.clone());
    let recovery = dispatcher.recover().unwrap();
    assert_eq!(recovery.interrupted, vec![interrupted]);
    assert_eq!(recovery.dispatched, vec![queued]);
    dispatcher.drain().await;

    let record = harness.controller.status(interrupted).unwrap();
    assert_eq!(record.status, "failed: interrupted before completion");
    assert_eq!(
        harness.registry.get(queued).unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn queued_request_is_revalidated_at_execution() {
    let harness = Harness::new(PortalScript::default(), Vec::new(), SinkRegistry::new());
    let task_id = Uuid::new_v4();
    let mut request = WorkflowRequest::new(WorkflowKind::Select);
    request.month = Some(7);
    // stored without going through enqueue, as another process might
    harness
        .registry
        .create(task_id, &request, TaskStatus::Queued, today())
        .unwrap();

    let report = harness.controller.execute(task_id).await.unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report
        .error
        .as_deref()
        .unwrap()
        .starts_with("ValidationError: "));
    assert_eq!(harness.log().opened, 0);
}

#[tokio::test]
async fn recovery_leaves_tasks_of_live_processes_alone() {
    let harness = Harness::new(PortalScript::default(), Vec::new(), SinkRegistry::new());
    let other_process = TaskRegistry::open(harness.registry.path()).unwrap();
    let live = Uuid::new_v4();
    other_process
        .create(
            live,
            &WorkflowRequest::new(WorkflowKind::Current),
            TaskStatus::Running,
            today() - Duration::minutes(5),
        )
        .unwrap();
    assert!(other_process.heartbeat(live, today()).unwrap());

    let mut dispatcher = TaskDispatcher::new(harness.controller.clone());
    let recovery = dispatcher.recover().unwrap();
    assert!(recovery.interrupted.is_empty());
    assert_eq!(harness.registry.get(live).unwrap().status, TaskStatus::Running);

    let finished = other_process
        .update(live, &TaskUpdate::status(TaskStatus::Completed), today())
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(harness.controller.status(live).unwrap().status, "completed");
}

//! End-to-end scheduling through a built lab: DAG promotion, dispatch,
//! real task bodies on worker threads, cancellation, and the API surface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{
    device_registry, fast_config, task_registry, wait_until, CountingExecutor, FakeDevice,
};
use lab_arbiter::builders::{build_lab, build_lab_with};
use lab_arbiter::core::{
    DeviceRegistry, Entity, NewTask, RequestStatus, SchedulerError, SlotSpec, TaskStatus,
    WorkerExecutor,
};
use lab_arbiter::runtime::{self, Lab, TaskSubmission};
use lab_arbiter::util::serde::{Priority, TaskId};

const WAIT: Duration = Duration::from_secs(5);

fn furnace(name: &str) -> Arc<FakeDevice> {
    FakeDevice::new(name, "furnace", vec![SlotSpec::new("tray", 4)])
}

fn lab_with(devices: &[Arc<FakeDevice>]) -> Lab {
    build_lab(&fast_config(), task_registry(), device_registry(devices)).unwrap()
}

fn status(lab: &Lab, id: TaskId) -> TaskStatus {
    lab.task(id).unwrap().status
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

#[test]
fn test_chain_runs_in_order() {
    let lab = lab_with(&[]);
    let first = lab.submit_task(NewTask::new("Noop")).unwrap();
    let second = lab.submit_task(NewTask::new("Noop").after([first])).unwrap();
    assert_eq!(status(&lab, second), TaskStatus::Waiting);

    let runner = lab.start().unwrap();
    assert!(wait_until(WAIT, || status(&lab, second) == TaskStatus::Completed));
    runner.stop();

    assert_eq!(lab.task(first).unwrap().result, Some(json!("done")));
    let first_done = lab.task(first).unwrap().updated_at_ms;
    let second_started = lab.task(second).unwrap().dispatch_handle.unwrap().dispatched_at_ms;
    assert!(second_started >= first_done);
}

#[test]
fn test_failed_predecessor_blocks_successor() {
    let lab = lab_with(&[]);
    let broken = lab.submit_task(NewTask::new("Fails")).unwrap();
    let after = lab.submit_task(NewTask::new("Noop").after([broken])).unwrap();

    let runner = lab.start().unwrap();
    assert!(wait_until(WAIT, || status(&lab, broken) == TaskStatus::Error));
    let ticks = runner.ticks();
    assert!(wait_until(WAIT, || runner.ticks() >= ticks + 5));
    runner.stop();

    let failed = lab.task(broken).unwrap();
    assert!(failed.error.unwrap().contains("crucible cracked"));
    assert_eq!(status(&lab, after), TaskStatus::Waiting);
}

#[test]
fn test_unknown_task_type_rejected_at_submission() {
    let lab = lab_with(&[]);
    let err = lab.submit_task(NewTask::new("Sinter")).unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
}

// ============================================================================
// DISPATCH
// ============================================================================

#[test]
fn test_each_ready_task_dispatched_exactly_once() {
    let counting = Arc::new(CountingExecutor::default());
    let lab = build_lab_with(
        &fast_config(),
        task_registry(),
        DeviceRegistry::new(),
        |_| Arc::clone(&counting) as Arc<dyn WorkerExecutor>,
    )
    .unwrap();
    let ids: Vec<TaskId> = (0..5)
        .map(|_| lab.submit_task(NewTask::new("Noop")).unwrap())
        .collect();

    for _ in 0..4 {
        lab.tick().unwrap();
    }

    let mut dispatched = counting.dispatched.lock().clone();
    dispatched.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(dispatched, expected);
    for id in ids {
        assert_eq!(status(&lab, id), TaskStatus::Initiated);
        let handle = lab.task(id).unwrap().dispatch_handle.unwrap();
        assert_eq!(handle.worker_id, format!("counting-{id}"));
    }
}

// ============================================================================
// TASK BODIES WITH RESOURCES
// ============================================================================

#[test]
fn test_heating_tasks_share_furnaces_safely() {
    let furnaces = [furnace("furnace_1"), furnace("furnace_2")];
    let lab = lab_with(&furnaces);
    let ids: Vec<TaskId> = (0..4)
        .map(|_| lab.submit_task(NewTask::new("Heating")).unwrap())
        .collect();

    let runner = lab.start().unwrap();
    assert!(wait_until(WAIT, || {
        ids.iter().all(|id| status(&lab, *id) == TaskStatus::Completed)
    }));
    runner.stop();

    for id in &ids {
        let result = lab.task(*id).unwrap().result.unwrap();
        let name = result["furnace"].as_str().unwrap();
        assert!(name == "furnace_1" || name == "furnace_2");
        let positions = result["positions"].as_array().unwrap();
        assert_eq!(positions.len(), 2);
        assert!(positions
            .iter()
            .all(|p| p.as_str().unwrap().starts_with(&format!("{name}/tray/"))));
    }
    let heats: usize = furnaces.iter().map(|f| f.commands.lock().len()).sum();
    assert_eq!(heats, 4);

    for d in lab.ledger().devices().unwrap() {
        assert_eq!(d.owner, None, "{} still owned", d.name);
    }
    assert!(lab.requests().with_status(RequestStatus::Fulfilled).unwrap().is_empty());

    let actions: Vec<String> = lab.audit_events().into_iter().map(|e| e.action).collect();
    for expected in ["dispatched", "granted", "released"] {
        assert_eq!(
            actions.iter().filter(|a| a.as_str() == expected).count(),
            4,
            "{expected}"
        );
    }
}

#[test]
fn test_priority_decides_who_heats_first() {
    let lab = lab_with(&[furnace("furnace_1")]);
    let blocker = TaskId::new();
    let furnace = Entity::Device("furnace_1".into());
    lab.ledger().occupy(&furnace, blocker).unwrap();

    let low = lab
        .submit_task(NewTask::new("Heating").with_priority(Priority::LOW))
        .unwrap();
    let high = lab
        .submit_task(NewTask::new("Heating").with_priority(Priority::URGENT))
        .unwrap();

    let runner = lab.start().unwrap();
    assert!(wait_until(WAIT, || {
        status(&lab, low) == TaskStatus::RequestingResources
            && status(&lab, high) == TaskStatus::RequestingResources
    }));
    lab.ledger().release(&furnace).unwrap();
    assert!(wait_until(WAIT, || {
        status(&lab, low) == TaskStatus::Completed && status(&lab, high) == TaskStatus::Completed
    }));
    runner.stop();

    let granted: Vec<TaskId> = lab
        .audit_events()
        .into_iter()
        .filter(|e| e.action == "granted")
        .filter_map(|e| e.task_id)
        .collect();
    assert_eq!(granted, vec![high, low]);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_cancelling_blocked_task_withdraws_its_request() {
    let lab = lab_with(&[furnace("furnace_1")]);
    let furnace = Entity::Device("furnace_1".into());
    let blocker = TaskId::new();
    lab.ledger().occupy(&furnace, blocker).unwrap();
    let id = lab.submit_task(NewTask::new("Heating")).unwrap();

    let runner = lab.start().unwrap();
    assert!(wait_until(WAIT, || status(&lab, id) == TaskStatus::RequestingResources));
    lab.cancel_task(id).unwrap();
    assert!(wait_until(WAIT, || status(&lab, id) == TaskStatus::Cancelled));
    assert!(wait_until(WAIT, || lab.scheduler().executor().running() == 0));
    runner.stop();

    assert!(lab.requests().with_status(RequestStatus::Pending).unwrap().is_empty());
    assert_eq!(lab.ledger().owner_of(&furnace).unwrap(), Some(blocker));
    assert!(lab.ledger().owned_by(id).unwrap().is_empty());
    assert!(lab
        .audit_events()
        .iter()
        .any(|e| e.action == "task_cancelled" && e.task_id == Some(id)));
}

#[test]
fn test_cancelling_waiting_task_never_dispatches_it() {
    let lab = lab_with(&[]);
    let gate = lab.submit_task(NewTask::new("Fails")).unwrap();
    let id = lab.submit_task(NewTask::new("Noop").after([gate])).unwrap();
    lab.cancel_task(id).unwrap();

    let report = lab.tick().unwrap();

    assert_eq!(report.cancelled, vec![id]);
    assert_eq!(status(&lab, id), TaskStatus::Cancelled);
    assert!(lab.task(id).unwrap().dispatch_handle.is_none());
    lab.shutdown();
}

// ============================================================================
// API
// ============================================================================

#[test]
fn test_api_surface() {
    let lab = lab_with(&[furnace("furnace_1")]);
    let submission: TaskSubmission = serde_json::from_value(json!({
        "task_type": "Noop",
        "priority": 30,
    }))
    .unwrap();
    let id = runtime::submit_task(&lab, submission).unwrap();
    assert_eq!(lab.task(id).unwrap().priority, Priority::HIGH);

    let bad = TaskSubmission {
        task_type: "Anneal".into(),
        parameters: json!({}),
        priority: Priority::NORMAL,
        prev_tasks: vec![],
        next_tasks: vec![],
    };
    assert!(runtime::submit_task(&lab, bad).unwrap_err().contains("Anneal"));

    let runner = lab.start().unwrap();
    assert!(wait_until(WAIT, || {
        runtime::task_status(&lab, id).unwrap().status == TaskStatus::Completed
    }));
    runner.stop();

    let status = runtime::task_status(&lab, id).unwrap();
    assert_eq!(status.result, Some(json!("done")));
    assert!(status.reason.is_none());
    assert!(runtime::task_status(&lab, TaskId::new()).is_err());

    let snapshot = runtime::ledger_snapshot(&lab).unwrap();
    assert_eq!(snapshot.devices.len(), 1);
    assert_eq!(snapshot.sample_positions.len(), 4);

    let health = runtime::health(&lab);
    assert!(health.ok);
    assert_eq!(health.pending_acknowledgments, 0);
    lab.shutdown();
}

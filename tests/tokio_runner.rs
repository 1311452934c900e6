//! Scheduler loop driven from a tokio runtime.

#![cfg(feature = "tokio-runtime")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{device_registry, fast_config, task_registry, FakeDevice};
use lab_arbiter::builders::build_lab;
use lab_arbiter::core::{NewTask, SlotSpec, TaskStatus};
use lab_arbiter::runtime::TokioSchedulerRunner;

#[tokio::test(flavor = "multi_thread")]
async fn test_tokio_runner_drives_tasks_to_completion() {
    let furnace = FakeDevice::new("furnace_1", "furnace", vec![SlotSpec::new("tray", 4)]);
    let lab = build_lab(
        &fast_config(),
        task_registry(),
        device_registry(&[Arc::clone(&furnace)]),
    )
    .unwrap();
    let first = lab.submit_task(NewTask::new("Heating")).unwrap();
    let second = lab.submit_task(NewTask::new("Heating").after([first])).unwrap();

    let runner = TokioSchedulerRunner::spawn(lab.scheduler(), Duration::from_millis(10));
    let done = tokio::time::timeout(Duration::from_secs(5), async {
        while lab.task(second).unwrap().status != TaskStatus::Completed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    runner.stop().await;

    assert!(done.is_ok(), "tasks did not complete in time");
    assert_eq!(lab.task(first).unwrap().status, TaskStatus::Completed);
    assert_eq!(*furnace.commands.lock(), vec!["heat", "heat"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tokio_runner_stops_promptly() {
    let lab = build_lab(&fast_config(), task_registry(), device_registry(&[])).unwrap();
    let runner = TokioSchedulerRunner::spawn(lab.scheduler(), Duration::from_secs(3600));
    tokio::time::timeout(Duration::from_secs(2), runner.stop())
        .await
        .unwrap();
}

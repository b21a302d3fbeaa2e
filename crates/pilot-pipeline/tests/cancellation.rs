//! S4: `CancelUnit(uid)` kills the targeted running task and finalizes it
//! CANCELED, leaving an unrelated running task untouched.

use std::collections::BTreeMap;

use pilot_launch::{LaunchMethod, LaunchMethodKind};
use pilot_pipeline::exec::ExecWorker;
use pilot_pipeline::queues::{Command, Pipeline};
use pilot_scheduler::{ContinuousScheduler, Scheduler};
use pilot_types::{CuDescription, CuRecord, Node};

fn fork_worker(workdir: std::path::PathBuf) -> ExecWorker {
    let nodes = vec![Node::new("localhost", "localhost", 4)];
    let scheduler = Scheduler::Continuous(ContinuousScheduler::new(nodes));
    let task_launcher = LaunchMethod::configure(LaunchMethodKind::Fork, vec!["localhost".into()], 4, None).unwrap();
    let mpi_launcher = LaunchMethod::configure(LaunchMethodKind::Fork, vec!["localhost".into()], 4, None).unwrap();
    ExecWorker::new(scheduler, task_launcher, mpi_launcher, workdir, BTreeMap::new())
}

#[test]
fn cancel_unit_kills_only_the_targeted_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut worker = fork_worker(dir.path().to_path_buf());
    let pipeline = Pipeline::new();

    let targeted = CuDescription { uid: "cu.target".into(), executable: "/bin/sleep".into(), arguments: vec!["30".into()], ..Default::default() };
    let bystander = CuDescription { uid: "cu.bystander".into(), executable: "/bin/sleep".into(), arguments: vec!["30".into()], ..Default::default() };

    pilot_pipeline::supervisor::route_after_allocating(CuRecord::new(targeted, 0), &pipeline, 0);
    pilot_pipeline::supervisor::route_after_allocating(CuRecord::new(bystander, 0), &pipeline, 0);
    assert!(worker.try_pop_and_start(&pipeline.execution_rx, &pipeline.execution_tx, &pipeline.update_tx, 10));
    assert!(worker.try_pop_and_start(&pipeline.execution_rx, &pipeline.execution_tx, &pipeline.update_tx, 10));
    assert_eq!(worker.running_count(), 2);

    pipeline.command_tx.send(Command::CancelUnit("cu.target".into())).unwrap();
    worker.drain_commands(&pipeline.command_rx);

    assert!(worker.poll_running(&pipeline.stageout_tx, &pipeline.update_tx, 20));
    assert_eq!(worker.running_count(), 1);

    let mut saw_canceled = false;
    while let Ok(req) = pipeline.update_rx.try_recv() {
        if req.cu_uid == "cu.target" && req.update.0.get("state").map(|v| v == "Canceled").unwrap_or(false) {
            saw_canceled = true;
        }
        assert_ne!(req.cu_uid, "cu.bystander", "bystander must not be touched by a targeted cancel");
    }
    assert!(saw_canceled);
}

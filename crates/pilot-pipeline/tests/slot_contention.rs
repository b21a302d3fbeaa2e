//! S2: two compute units that both need the whole (two-core) node. The
//! second must be re-queued by `SchedulerExhausted` until the first
//! finishes and releases its slot.

use std::collections::BTreeMap;
use std::time::Duration;

use pilot_launch::{LaunchMethod, LaunchMethodKind};
use pilot_pipeline::exec::ExecWorker;
use pilot_pipeline::queues::Pipeline;
use pilot_scheduler::{ContinuousScheduler, Scheduler};
use pilot_types::{CuDescription, CuRecord, Node};

fn fork_worker(workdir: std::path::PathBuf) -> ExecWorker {
    // Exactly 2 cores total: only one 2-process CU can run at a time.
    let nodes = vec![Node::new("localhost", "localhost", 2)];
    let scheduler = Scheduler::Continuous(ContinuousScheduler::new(nodes));
    let task_launcher = LaunchMethod::configure(LaunchMethodKind::Fork, vec!["localhost".into()], 2, None).unwrap();
    let mpi_launcher = LaunchMethod::configure(LaunchMethodKind::Fork, vec!["localhost".into()], 2, None).unwrap();
    ExecWorker::new(scheduler, task_launcher, mpi_launcher, workdir, BTreeMap::new())
}

fn sleeper(uid: &str) -> CuDescription {
    CuDescription { uid: uid.into(), executable: "/bin/sleep".into(), arguments: vec!["0.3".into()], cpu_processes: 2, ..Default::default() }
}

#[test]
fn second_cu_waits_for_the_first_to_release_its_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut worker = fork_worker(dir.path().to_path_buf());
    let pipeline = Pipeline::new();

    pilot_pipeline::supervisor::route_after_allocating(CuRecord::new(sleeper("cu.a"), 0), &pipeline, 0);
    pilot_pipeline::supervisor::route_after_allocating(CuRecord::new(sleeper("cu.b"), 0), &pipeline, 0);

    assert!(worker.try_pop_and_start(&pipeline.execution_rx, &pipeline.execution_tx, &pipeline.update_tx, 10));
    assert_eq!(worker.running_count(), 1);

    // Second CU finds the node fully occupied: requeued, not started.
    let did_work = worker.try_pop_and_start(&pipeline.execution_rx, &pipeline.execution_tx, &pipeline.update_tx, 10);
    assert!(!did_work);
    assert_eq!(worker.running_count(), 1);

    // Drive the first CU to completion, releasing its slot.
    let mut first_done = false;
    for _ in 0..200 {
        if worker.poll_running(&pipeline.stageout_tx, &pipeline.update_tx, 20) && worker.running_count() == 0 {
            first_done = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(first_done);

    // The requeued second CU can now allocate and start.
    assert!(worker.try_pop_and_start(&pipeline.execution_rx, &pipeline.execution_tx, &pipeline.update_tx, 30));
    assert_eq!(worker.running_count(), 1);

    let mut second_done = false;
    for _ in 0..200 {
        if worker.poll_running(&pipeline.stageout_tx, &pipeline.update_tx, 40) && worker.running_count() == 0 {
            second_done = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(second_done);
}

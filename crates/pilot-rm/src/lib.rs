//! LRMS adapter (spec §4.1): discovers the allocated node list and
//! cores-per-node from batch-system environment variables. Pure w.r.t. its
//! inputs (an [`EnvSource`]) and invoked once at agent startup.

pub mod bgq;
mod env;
mod hostlist;

use std::collections::BTreeMap;
use std::fs;

use pilot_types::{CoreState, Node, TorusCoord, TorusNode, TorusShape, SUPPORTED_TORUS_SUB_BLOCK_SIZES};

pub use env::{EnvSource, MapEnv, ProcessEnv};
pub use pilot_types::AgentError;

use bgq::BoardLister;

/// BG/Q compute nodes expose 16 usable cores per node.
pub const BGQ_CORES_PER_NODE: usize = 16;
/// Nodes per board on a standard BG/Q midplane, used to lay out the torus
/// coordinate of successive boards along the A dimension.
pub const BGQ_NODES_PER_BOARD: i32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lrms {
    Fork,
    Torque,
    PbsPro,
    Slurm,
    Sge,
    Lsf,
    LoadLeveler,
    LoadLevelerBgq,
}

impl Lrms {
    /// Registry lookup by configuration name (spec §9: "a registry mapping a
    /// name string to a constructor").
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "FORK" => Some(Lrms::Fork),
            "TORQUE" => Some(Lrms::Torque),
            "PBSPRO" => Some(Lrms::PbsPro),
            "SLURM" => Some(Lrms::Slurm),
            "SGE" => Some(Lrms::Sge),
            "LSF" => Some(Lrms::Lsf),
            "LOADLEVELER" | "LOADL" => Some(Lrms::LoadLeveler),
            "LOADLEVELERBGQ" | "LOADL_BGQ" => Some(Lrms::LoadLevelerBgq),
            _ => None,
        }
    }
}

/// BG/Q torus block discovered alongside the flat node list.
#[derive(Debug)]
pub struct TorusInfo {
    pub block_name: String,
    pub nodes: Vec<TorusNode>,
    /// Supported sub-block sizes that evenly divide the block, mapped to the
    /// shape a scheduler allocation of that size should report.
    pub sub_block_shapes: BTreeMap<u32, TorusShape>,
}

#[derive(Debug)]
pub struct Discovery {
    pub nodes: Vec<Node>,
    pub cores_per_node: usize,
    pub torus: Option<TorusInfo>,
}

fn require(env: &dyn EnvSource, key: &str) -> Result<String, AgentError> {
    env.var(key).ok_or_else(|| {
        AgentError::MisconfiguredEnvironment(format!("required environment variable {key} not set"))
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, AgentError> {
    value
        .trim()
        .parse()
        .map_err(|_| AgentError::MisconfiguredEnvironment(format!("{key}={value:?} is not a valid integer")))
}

fn unique_preserving_order(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for n in names {
        if seen.insert(n.clone()) {
            out.push(n);
        }
    }
    out
}

fn nodes_from_names(names: &[String], cores_per_node: usize) -> Vec<Node> {
    names
        .iter()
        .map(|n| Node::new(n.clone(), n.clone(), cores_per_node))
        .collect()
}

fn read_lines(path: &str) -> Result<Vec<String>, AgentError> {
    let content = fs::read_to_string(path)
        .map_err(|e| AgentError::MisconfiguredEnvironment(format!("cannot read {path}: {e}")))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Validate that the discovered allocation can satisfy `requested_cores`
/// (spec §4.1: "Fails with AllocationTooSmall when |nodes| * cores_per_node < requested_cores").
fn check_allocation_size(nodes: &[Node], cores_per_node: usize, requested_cores: usize) -> Result<(), AgentError> {
    let available = nodes.len() * cores_per_node;
    if available < requested_cores {
        return Err(AgentError::AllocationTooSmall { requested: requested_cores, available });
    }
    Ok(())
}

/// Discover resources for non-BG/Q variants. For `Lrms::LoadLevelerBgq` use
/// [`discover_bgq`] instead, since it additionally requires a [`BoardLister`].
pub fn discover(lrms: Lrms, requested_cores: usize, env: &dyn EnvSource) -> Result<Discovery, AgentError> {
    let (names, cores_per_node) = match lrms {
        Lrms::Fork => discover_fork(env)?,
        Lrms::Torque => discover_torque(env)?,
        Lrms::PbsPro => discover_pbspro(env)?,
        Lrms::Slurm => discover_slurm(env)?,
        Lrms::Sge => discover_sge(env)?,
        Lrms::Lsf => discover_lsf(env)?,
        Lrms::LoadLeveler => discover_loadleveler(env)?,
        Lrms::LoadLevelerBgq => {
            return Err(AgentError::MisconfiguredEnvironment(
                "LoadLevelerBgq requires discover_bgq (needs a BoardLister)".into(),
            ));
        }
    };
    let nodes = nodes_from_names(&names, cores_per_node);
    check_allocation_size(&nodes, cores_per_node, requested_cores)?;
    tracing::info!(
        target: "rm",
        lrms = ?lrms,
        node_count = nodes.len(),
        cores_per_node,
        "lrms_discovery_complete"
    );
    Ok(Discovery { nodes, cores_per_node, torus: None })
}

fn discover_fork(_env: &dyn EnvSource) -> Result<(Vec<String>, usize), AgentError> {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    Ok((vec!["localhost".to_string()], cores))
}

fn discover_torque(env: &dyn EnvSource) -> Result<(Vec<String>, usize), AgentError> {
    let nodefile = require(env, "PBS_NODEFILE")?;
    let lines = read_lines(&nodefile)?;
    let names = unique_preserving_order(lines.clone());

    let cores_per_node = if let Some(ppn) = env.var("PBS_NUM_PPN") {
        parse_usize("PBS_NUM_PPN", &ppn)?
    } else if let Some(ppn) = env.var("SAGA_PPN") {
        parse_usize("SAGA_PPN", &ppn)?
    } else if !names.is_empty() {
        lines.iter().filter(|l| *l == &names[0]).count().max(1)
    } else if let (Some(ncpus), Some(nnodes)) = (env.var("PBS_NCPUS"), env.var("PBS_NUM_NODES")) {
        let ncpus = parse_usize("PBS_NCPUS", &ncpus)?;
        let nnodes = parse_usize("PBS_NUM_NODES", &nnodes)?.max(1);
        ncpus / nnodes
    } else {
        return Err(AgentError::MisconfiguredEnvironment(
            "cannot determine cores-per-node for Torque allocation".into(),
        ));
    };
    Ok((names, cores_per_node))
}

fn discover_pbspro(env: &dyn EnvSource) -> Result<(Vec<String>, usize), AgentError> {
    let nodefile = require(env, "PBS_NODEFILE")?;
    let num_ppn = require(env, "NUM_PPN")?;
    let _node_count = require(env, "NODE_COUNT")?;
    let _num_pes = require(env, "NUM_PES")?;
    let _job_id = require(env, "PBS_JOBID")?;

    let lines = read_lines(&nodefile)?;
    let names = unique_preserving_order(lines);
    let cores_per_node = parse_usize("NUM_PPN", &num_ppn)?;
    Ok((names, cores_per_node))
}

fn discover_slurm(env: &dyn EnvSource) -> Result<(Vec<String>, usize), AgentError> {
    let nodelist = require(env, "SLURM_NODELIST")?;
    let _nprocs = require(env, "SLURM_NPROCS")?;
    let nnodes = require(env, "SLURM_NNODES")?;
    let cpus_on_node = require(env, "SLURM_CPUS_ON_NODE")?;

    let names = hostlist::expand(&nodelist);
    let expected = parse_usize("SLURM_NNODES", &nnodes)?;
    if names.len() != expected {
        tracing::warn!(
            target: "rm",
            expanded = names.len(),
            declared = expected,
            "slurm_nodelist_count_mismatch"
        );
    }
    let cores_per_node = parse_usize("SLURM_CPUS_ON_NODE", &cpus_on_node)?;
    Ok((names, cores_per_node))
}

fn discover_sge(env: &dyn EnvSource) -> Result<(Vec<String>, usize), AgentError> {
    let hostfile = require(env, "PE_HOSTFILE")?;
    let lines = read_lines(&hostfile)?;
    let mut names = Vec::new();
    let mut cores_per_node = None;
    for line in &lines {
        let mut parts = line.split_whitespace();
        let Some(host) = parts.next() else { continue };
        let Some(ncores) = parts.next() else { continue };
        names.push(host.to_string());
        if cores_per_node.is_none() {
            cores_per_node = Some(parse_usize("PE_HOSTFILE", ncores)?);
        }
    }
    let cores_per_node = cores_per_node.ok_or_else(|| {
        AgentError::MisconfiguredEnvironment("PE_HOSTFILE contained no usable entries".into())
    })?;
    Ok((unique_preserving_order(names), cores_per_node))
}

fn discover_lsf(env: &dyn EnvSource) -> Result<(Vec<String>, usize), AgentError> {
    let _hostfile = require(env, "LSB_DJOB_HOSTFILE")?;
    let mcpu_hosts = require(env, "LSB_MCPU_HOSTS")?;

    let tokens: Vec<&str> = mcpu_hosts.split_whitespace().collect();
    let mut names = Vec::new();
    let mut cores_per_node = None;
    for pair in tokens.chunks(2) {
        let [host, ncores] = pair else { continue };
        names.push(host.to_string());
        if cores_per_node.is_none() {
            cores_per_node = Some(parse_usize("LSB_MCPU_HOSTS", ncores)?);
        }
    }
    let cores_per_node = cores_per_node.ok_or_else(|| {
        AgentError::MisconfiguredEnvironment("LSB_MCPU_HOSTS contained no host/count pairs".into())
    })?;
    Ok((names, cores_per_node))
}

fn discover_loadleveler(env: &dyn EnvSource) -> Result<(Vec<String>, usize), AgentError> {
    let hostfile = require(env, "LOADL_HOSTFILE")?;
    let total_tasks = require(env, "LOADL_TOTAL_TASKS")?;

    let lines = read_lines(&hostfile)?;
    let names = unique_preserving_order(lines);
    let total_tasks = parse_usize("LOADL_TOTAL_TASKS", &total_tasks)?;
    if names.is_empty() {
        return Err(AgentError::MisconfiguredEnvironment("LOADL_HOSTFILE is empty".into()));
    }
    let cores_per_node = total_tasks / names.len();
    if total_tasks % names.len() != 0 {
        tracing::warn!(
            target: "rm",
            total_tasks,
            node_count = names.len(),
            "loadleveler_tasks_not_evenly_divisible"
        );
    }
    Ok((names, cores_per_node.max(1)))
}

/// Discover a BG/Q torus block (spec §4.1: "for LoadLevelerBGQ — additionally
/// parses the block shape and board list from the batch scheduler's
/// job-listing command").
pub fn discover_bgq(
    requested_cores: usize,
    env: &dyn EnvSource,
    lister: &dyn BoardLister,
) -> Result<Discovery, AgentError> {
    let block = require(env, "LOADL_BG_BLOCK")?;
    let size = require(env, "LOADL_BG_SIZE")?;
    let _job_name = require(env, "LOADL_JOB_NAME")?;

    let total_nodes = parse_usize("LOADL_BG_SIZE", &size)?;
    let boards = lister.list_boards(&block)?;

    let mut torus_nodes = Vec::with_capacity(total_nodes);
    let mut index = 0usize;
    for board in &boards {
        let corner = bgq::board_corner(&board.id, BGQ_NODES_PER_BOARD);
        for offset in 0..board.node_count {
            torus_nodes.push(TorusNode {
                index,
                coord: TorusCoord { a: corner.a + offset as i32, ..corner },
                name: format!("{}-n{offset:03}", board.id),
                status: CoreState::Free,
            });
            index += 1;
        }
    }

    let mut sub_block_shapes = BTreeMap::new();
    for &size in SUPPORTED_TORUS_SUB_BLOCK_SIZES {
        if (size as usize) <= total_nodes.max(1) {
            sub_block_shapes.insert(size, TorusShape { a: size, b: 1, c: 1, d: 1, e: 1 });
        }
    }

    let flat_names: Vec<String> = torus_nodes.iter().map(|n| n.name.clone()).collect();
    let nodes = nodes_from_names(&flat_names, BGQ_CORES_PER_NODE);
    check_allocation_size(&nodes, BGQ_CORES_PER_NODE, requested_cores)?;

    tracing::info!(
        target: "rm",
        block = block.as_str(),
        node_count = nodes.len(),
        "bgq_discovery_complete"
    );

    Ok(Discovery {
        nodes,
        cores_per_node: BGQ_CORES_PER_NODE,
        torus: Some(TorusInfo { block_name: block, nodes: torus_nodes, sub_block_shapes }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgq::BoardEntry;
    use std::io::Write;

    #[test]
    fn fork_needs_no_env() {
        let env = MapEnv::new();
        let d = discover(Lrms::Fork, 1, &env).unwrap();
        assert_eq!(d.nodes.len(), 1);
        assert!(d.nodes[0].cores_per_node >= 1);
    }

    #[test]
    fn torque_reads_nodefile_and_derives_ppn() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "n0\nn0\nn1\nn1").unwrap();
        let env = MapEnv::new().set("PBS_NODEFILE", file.path().to_str().unwrap());
        let d = discover(Lrms::Torque, 4, &env).unwrap();
        assert_eq!(d.nodes.len(), 2);
        assert_eq!(d.cores_per_node, 2);
    }

    #[test]
    fn torque_missing_nodefile_is_misconfigured() {
        let env = MapEnv::new();
        let err = discover(Lrms::Torque, 1, &env).unwrap_err();
        assert!(matches!(err, AgentError::MisconfiguredEnvironment(_)));
    }

    #[test]
    fn allocation_too_small_detected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "n0").unwrap();
        let env = MapEnv::new()
            .set("PBS_NODEFILE", file.path().to_str().unwrap())
            .set("PBS_NUM_PPN", "4");
        let err = discover(Lrms::Torque, 100, &env).unwrap_err();
        assert!(matches!(err, AgentError::AllocationTooSmall { .. }));
    }

    #[test]
    fn slurm_expands_nodelist() {
        let env = MapEnv::new()
            .set("SLURM_NODELIST", "node[001-002]")
            .set("SLURM_NPROCS", "32")
            .set("SLURM_NNODES", "2")
            .set("SLURM_CPUS_ON_NODE", "16");
        let d = discover(Lrms::Slurm, 32, &env).unwrap();
        assert_eq!(d.nodes.len(), 2);
        assert_eq!(d.cores_per_node, 16);
        assert_eq!(d.nodes[0].name, "node001");
    }

    #[test]
    fn sge_parses_hostfile_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "n0 8 all.q@n0 UNDEFINED").unwrap();
        writeln!(file, "n1 8 all.q@n1 UNDEFINED").unwrap();
        let env = MapEnv::new().set("PE_HOSTFILE", file.path().to_str().unwrap());
        let d = discover(Lrms::Sge, 16, &env).unwrap();
        assert_eq!(d.nodes.len(), 2);
        assert_eq!(d.cores_per_node, 8);
    }

    #[test]
    fn lsf_parses_mcpu_hosts_pairs() {
        let env = MapEnv::new()
            .set("LSB_DJOB_HOSTFILE", "/dev/null")
            .set("LSB_MCPU_HOSTS", "n0 8 n1 8");
        let d = discover(Lrms::Lsf, 16, &env).unwrap();
        assert_eq!(d.nodes.len(), 2);
        assert_eq!(d.cores_per_node, 8);
    }

    #[test]
    fn loadleveler_derives_cores_per_node_from_total_tasks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "n0\nn0\nn1\nn1").unwrap();
        let env = MapEnv::new()
            .set("LOADL_HOSTFILE", file.path().to_str().unwrap())
            .set("LOADL_TOTAL_TASKS", "4");
        let d = discover(Lrms::LoadLeveler, 4, &env).unwrap();
        assert_eq!(d.nodes.len(), 2);
        assert_eq!(d.cores_per_node, 2);
    }

    struct MockLister(Vec<BoardEntry>);
    impl BoardLister for MockLister {
        fn list_boards(&self, _block: &str) -> Result<Vec<BoardEntry>, AgentError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn bgq_discovery_lays_out_torus_nodes() {
        let env = MapEnv::new()
            .set("LOADL_BG_BLOCK", "BLOCK0")
            .set("LOADL_BG_SIZE", "64")
            .set("LOADL_JOB_NAME", "job0");
        let lister = MockLister(vec![
            BoardEntry { id: "R00-M0-N00".into(), node_count: 32 },
            BoardEntry { id: "R00-M0-N01".into(), node_count: 32 },
        ]);
        let d = discover_bgq(64, &env, &lister).unwrap();
        assert_eq!(d.nodes.len(), 64);
        assert_eq!(d.cores_per_node, BGQ_CORES_PER_NODE);
        let torus = d.torus.unwrap();
        assert_eq!(torus.nodes.len(), 64);
        assert!(torus.sub_block_shapes.contains_key(&32));
        // second board's corner is offset from the first by one board width
        assert_eq!(torus.nodes[32].coord.a, BGQ_NODES_PER_BOARD);
    }

    #[test]
    fn lrms_from_name_registry() {
        assert_eq!(Lrms::from_name("slurm"), Some(Lrms::Slurm));
        assert_eq!(Lrms::from_name("LOADLEVELERBGQ"), Some(Lrms::LoadLevelerBgq));
        assert_eq!(Lrms::from_name("bogus"), None);
    }
}

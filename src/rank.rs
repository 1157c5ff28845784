use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::env::{self, EnvMap, LaunchEnv};
use crate::error::Result;

/// Who started this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinationMode {
    /// A cluster scheduler launched one task per worker.
    ClusterManaged,
    /// An elastic launcher (or our own spawner) exported `LOCAL_RANK`.
    ElasticManaged,
    /// Started by hand; this process is rank 0 and spawns the rest.
    SelfSpawned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendVariant {
    /// One worker per device.
    PerDevice,
    /// One worker per node, fanning out over every visible device.
    WholeNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub local_rank: usize,
    pub global_rank: usize,
    pub world_size: usize,
    pub node_rank: usize,
    pub is_master: bool,
}

impl WorkerIdentity {
    pub fn per_device(
        node_rank: usize,
        local_rank: usize,
        processes_per_node: usize,
        num_nodes: usize,
        is_master: bool,
    ) -> Self {
        Self {
            local_rank,
            global_rank: node_rank * processes_per_node + local_rank,
            world_size: num_nodes * processes_per_node,
            node_rank,
            is_master,
        }
    }

    /// Node-granular identity: the node is the worker.
    pub fn whole_node(node_rank: usize, num_nodes: usize) -> Self {
        Self {
            local_rank: node_rank,
            global_rank: node_rank,
            world_size: num_nodes,
            node_rank,
            is_master: false,
        }
    }

    pub fn is_global_zero(&self) -> bool {
        self.global_rank == 0
    }
}

/// The single process allowed to draw progress output.
pub fn is_progress_rank(node_rank: usize, process_idx: usize) -> bool {
    node_rank == 0 && process_idx == 0
}

#[derive(Debug, Clone, Copy)]
pub struct RankResolver {
    pub mode: CoordinationMode,
    pub variant: BackendVariant,
}

impl RankResolver {
    pub fn new(mode: CoordinationMode, variant: BackendVariant) -> Self {
        Self { mode, variant }
    }

    /// Index of this process among the workers on its node.
    pub fn resolve_task_index(&self, env: &EnvMap) -> Result<usize> {
        let task_idx = match (self.variant, self.mode) {
            (_, CoordinationMode::ClusterManaged) => env.require(
                env::SLURM_LOCALID,
                "the cluster scheduler should export it for every task; \
                 run inside an allocation or pick a non-cluster backend",
            )?,
            (BackendVariant::WholeNode, _) => Self::elastic_local_rank(
                env,
                "ddp2 only works under a cluster scheduler or an elastic launcher \
                 exporting WORLD_SIZE, LOCAL_RANK and GROUP_RANK",
            )?,
            (BackendVariant::PerDevice, CoordinationMode::ElasticManaged) => Self::elastic_local_rank(
                env,
                "elastic launches require WORLD_SIZE, LOCAL_RANK and GROUP_RANK (or NODE_RANK)",
            )?,
            (BackendVariant::PerDevice, CoordinationMode::SelfSpawned) => 0,
        };
        debug!("resolved task index {} ({:?}, {:?})", task_idx, self.mode, self.variant);
        Ok(task_idx)
    }

    fn elastic_local_rank(env: &EnvMap, hint: &str) -> Result<usize> {
        if let Some(launch) = LaunchEnv::from_env(env)? {
            return Ok(launch.local_rank);
        }
        env.require(env::LOCAL_RANK, hint)
    }

    pub fn identity(
        &self,
        node_rank: usize,
        process_idx: usize,
        processes_per_node: usize,
        num_nodes: usize,
        is_master: bool,
    ) -> WorkerIdentity {
        match self.variant {
            BackendVariant::PerDevice => WorkerIdentity::per_device(
                node_rank,
                process_idx,
                processes_per_node,
                num_nodes,
                is_master,
            ),
            BackendVariant::WholeNode => WorkerIdentity::whole_node(node_rank, num_nodes),
        }
    }
}

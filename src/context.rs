use std::fmt;

use candle_core::Device;

use crate::checkpoint::{CheckpointTracker, ModelCheckpoint};
use crate::config::{DistributedBackend, TrainerConfig};
use crate::env::EnvMap;
use crate::module::OptimizerSetup;
use crate::precision::AmpBackend;
use crate::progress::{ProgressBarCallback, ProgressReporter, SilentProgress};
use crate::rank::WorkerIdentity;
use crate::spawn::ChildRegistry;

/// Mutable state of one worker's run.
///
/// The connector fills the mode, rank and device fields when the run is
/// created; the orchestrator writes identity, device and optimizer fields
/// while it sets the worker up; the training loop owns `should_stop`.
pub struct RunContext {
    pub config: TrainerConfig,
    pub env: EnvMap,

    pub distributed_backend: Option<DistributedBackend>,
    pub use_ddp: bool,
    pub use_ddp2: bool,
    pub on_gpu: bool,
    pub is_slurm_managing_tasks: bool,
    pub num_processes: usize,
    pub num_nodes: usize,
    pub node_rank: usize,
    pub local_rank: usize,
    pub global_rank: usize,
    pub world_size: usize,
    pub data_parallel_device_ids: Option<Vec<usize>>,
    pub root_gpu: Option<usize>,
    pub root_device: Device,
    pub amp_type: Option<AmpBackend>,
    pub identity: Option<WorkerIdentity>,

    pub optimizers: OptimizerSetup,
    pub should_stop: bool,
    pub testing: bool,

    pub progress: Box<dyn ProgressReporter>,
    pub checkpoint: Box<dyn CheckpointTracker>,
    /// Processes this worker launched, if it is a script-mode master.
    pub children: ChildRegistry,
}

impl RunContext {
    pub fn new(config: TrainerConfig, env: EnvMap) -> Self {
        let progress: Box<dyn ProgressReporter> = if config.progress_bar {
            Box::new(ProgressBarCallback::default())
        } else {
            Box::new(SilentProgress)
        };
        let checkpoint = Box::new(ModelCheckpoint::new(config.checkpoint_dir.clone()));
        Self {
            distributed_backend: config.distributed_backend,
            num_processes: config.num_processes,
            num_nodes: config.num_nodes,
            config,
            env,
            use_ddp: false,
            use_ddp2: false,
            on_gpu: false,
            is_slurm_managing_tasks: false,
            node_rank: 0,
            local_rank: 0,
            global_rank: 0,
            world_size: 1,
            data_parallel_device_ids: None,
            root_gpu: None,
            root_device: Device::Cpu,
            amp_type: None,
            identity: None,
            optimizers: OptimizerSetup::default(),
            should_stop: false,
            testing: false,
            progress,
            checkpoint,
            children: ChildRegistry::default(),
        }
    }

    /// A fresh context for a sibling worker of an in-process run: the same
    /// run-level decisions, none of this worker's per-process state.
    pub fn fork_worker(&self) -> Self {
        let mut worker = Self::new(self.config.clone(), self.env.clone());
        worker.distributed_backend = self.distributed_backend;
        worker.use_ddp = self.use_ddp;
        worker.use_ddp2 = self.use_ddp2;
        worker.on_gpu = self.on_gpu;
        worker.is_slurm_managing_tasks = self.is_slurm_managing_tasks;
        worker.num_processes = self.num_processes;
        worker.num_nodes = self.num_nodes;
        worker.node_rank = self.node_rank;
        worker.data_parallel_device_ids = self.data_parallel_device_ids.clone();
        worker.root_gpu = self.root_gpu;
        worker.amp_type = self.amp_type;
        worker.testing = self.testing;
        worker
    }

    pub fn is_global_zero(&self) -> bool {
        self.global_rank == 0
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("distributed_backend", &self.distributed_backend)
            .field("use_ddp", &self.use_ddp)
            .field("use_ddp2", &self.use_ddp2)
            .field("on_gpu", &self.on_gpu)
            .field("node_rank", &self.node_rank)
            .field("local_rank", &self.local_rank)
            .field("global_rank", &self.global_rank)
            .field("world_size", &self.world_size)
            .field("data_parallel_device_ids", &self.data_parallel_device_ids)
            .field("should_stop", &self.should_stop)
            .field("testing", &self.testing)
            .finish_non_exhaustive()
    }
}

//! Turns a `TrainerConfig` and the process environment into run state and
//! picks the backend that will drive the run.

use std::fmt;

use tracing::{info, warn};

use crate::config::{DistributedBackend, GpuSpec};
use crate::context::RunContext;
use crate::env::{self, LaunchEnv};
use crate::error::{OrchestratorError, Result};
use crate::logging::{self, rank_zero_info, rank_zero_warn};
use crate::rank::{BackendVariant, CoordinationMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedBackend {
    /// One process per node; `CoordinationMode` says who launched it.
    Ddp2(CoordinationMode),
    /// One OS process per device.
    Ddp(CoordinationMode),
    /// Workers replicated as threads of this process.
    DdpSpawn { nprocs: usize },
    SingleProcess,
}

impl SelectedBackend {
    pub fn variant(&self) -> BackendVariant {
        match self {
            SelectedBackend::Ddp2(_) => BackendVariant::WholeNode,
            _ => BackendVariant::PerDevice,
        }
    }

    pub fn mode(&self) -> CoordinationMode {
        match self {
            SelectedBackend::Ddp2(mode) | SelectedBackend::Ddp(mode) => *mode,
            SelectedBackend::DdpSpawn { .. } | SelectedBackend::SingleProcess => CoordinationMode::SelfSpawned,
        }
    }
}

impl fmt::Display for SelectedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectedBackend::Ddp2(mode) => write!(f, "ddp2 ({mode:?})"),
            SelectedBackend::Ddp(mode) => write!(f, "ddp ({mode:?})"),
            SelectedBackend::DdpSpawn { nprocs } => write!(f, "ddp_spawn ({nprocs} workers)"),
            SelectedBackend::SingleProcess => f.write_str("single process"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcceleratorConnector {
    cuda_available: bool,
}

impl Default for AcceleratorConnector {
    fn default() -> Self {
        Self::new(candle_core::utils::cuda_is_available())
    }
}

impl AcceleratorConnector {
    pub fn new(cuda_available: bool) -> Self {
        Self { cuda_available }
    }

    pub fn on_trainer_init(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.config.validate()?;

        // messages emitted before ranks are known should still only show once
        if let Some(local_rank) = ctx.env.parse::<usize>(env::LOCAL_RANK, "expected an integer")? {
            logging::set_rank(local_rank);
        }

        if ctx.config.num_processes != 1
            && ctx.config.num_gpus() > 0
            && ctx.config.distributed_backend != Some(DistributedBackend::DdpCpu)
        {
            rank_zero_warn("num_processes is only used for distributed_backend=ddp_cpu when GPUs are requested. Ignoring it.");
        }
        ctx.num_nodes = ctx.config.num_nodes;
        ctx.num_processes = ctx.config.num_processes;

        // children inherit the exact selection their master was started with
        if let Some(raw) = ctx.env.get(env::TRAINER_GPUS) {
            ctx.config.gpus = Some(raw.parse::<GpuSpec>()?);
        }
        ctx.data_parallel_device_ids = ctx.config.gpus.as_ref().and_then(GpuSpec::device_ids);
        ctx.root_gpu = ctx.data_parallel_device_ids.as_ref().and_then(|ids| ids.first().copied());
        ctx.on_gpu = ctx.data_parallel_device_ids.is_some() && self.cuda_available;

        self.set_distributed_mode(ctx)?;

        ctx.world_size = 1;
        self.configure_slurm_ddp(ctx);
        ctx.node_rank = Self::determine_ddp_node_rank(ctx)?;
        ctx.local_rank = Self::determine_local_rank(ctx)?;
        ctx.global_rank = 0;

        Self::set_nvidia_flags(ctx);
        Ok(())
    }

    fn num_gpus(ctx: &RunContext) -> usize {
        ctx.data_parallel_device_ids.as_ref().map_or(0, Vec::len)
    }

    fn set_distributed_mode(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.use_ddp = false;
        ctx.use_ddp2 = false;
        let num_gpus = Self::num_gpus(ctx);
        let multi_worker = ctx.num_nodes > 1 || ctx.num_processes > 1;

        let mut backend = ctx.config.distributed_backend;
        if backend.is_none() {
            if num_gpus > 1 {
                rank_zero_warn(
                    "You requested multiple GPUs but did not specify a backend (ddp, ddp_spawn or ddp2). \
                     Setting distributed_backend=ddp_spawn for you.",
                );
                backend = Some(DistributedBackend::DdpSpawn);
            } else if num_gpus == 0 && multi_worker {
                backend = Some(DistributedBackend::DdpCpu);
            }
        }

        match backend {
            None => {}
            Some(DistributedBackend::Ddp | DistributedBackend::DdpSpawn) => match num_gpus {
                0 => ctx.use_ddp = multi_worker,
                n => {
                    ctx.use_ddp = true;
                    ctx.num_processes = n;
                }
            },
            Some(DistributedBackend::Ddp2) => ctx.use_ddp2 = num_gpus >= 1,
            Some(DistributedBackend::DdpCpu) => {
                if num_gpus > 0 {
                    rank_zero_warn(
                        "You requested one or more GPUs, but set the backend to `ddp_cpu`. Training will not use GPUs.",
                    );
                }
                ctx.use_ddp = true;
                ctx.data_parallel_device_ids = None;
                ctx.root_gpu = None;
                ctx.on_gpu = false;
            }
            Some(DistributedBackend::Tpu) => {
                return Err(OrchestratorError::configuration(
                    "distributed_backend=tpu is not supported by this trainer; use ddp, ddp_spawn, ddp_cpu or ddp2",
                ))
            }
        }
        ctx.distributed_backend = backend;

        if ctx.num_nodes > 1 && !(ctx.use_ddp || ctx.use_ddp2) {
            return Err(OrchestratorError::configuration(
                "num_nodes > 1 needs a distributed backend. Set distributed_backend=ddp or distributed_backend=ddp2",
            ));
        }

        rank_zero_info(format!(
            "GPU available: {}, used: {}",
            self.cuda_available, ctx.on_gpu
        ));
        if self.cuda_available && !ctx.on_gpu {
            rank_zero_warn("GPU available but not used. Pass --gpus to train on it.");
        }
        Ok(())
    }

    /// Decides whether the scheduler already launched one task per worker.
    fn configure_slurm_ddp(&self, ctx: &mut RunContext) {
        ctx.is_slurm_managing_tasks = false;

        if ctx.use_ddp || ctx.use_ddp2 {
            let requested = if ctx.use_ddp2 {
                ctx.num_nodes
            } else {
                Self::num_gpus(ctx) * ctx.num_nodes
            };
            let tasks = ctx.env.get(env::SLURM_NTASKS).and_then(|n| n.trim().parse::<usize>().ok());
            let job_name = ctx.env.get(env::SLURM_JOB_NAME);
            // interactive allocations run a shell, not our tasks
            ctx.is_slurm_managing_tasks = match (tasks, job_name) {
                (Some(tasks), Some(name)) => tasks == requested && name != "bash",
                _ => false,
            };
        }

        let fake = ctx
            .env
            .get(env::FAKE_SLURM_MANAGING_TASKS)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .is_some_and(|v| v != 0);
        if fake {
            ctx.is_slurm_managing_tasks = true;
        }

        if ctx.is_slurm_managing_tasks {
            rank_zero_info("Multi-processing is handled by Slurm.");
        }
    }

    fn determine_ddp_node_rank(ctx: &RunContext) -> Result<usize> {
        if ctx.is_slurm_managing_tasks {
            return ctx.env.require(
                env::SLURM_NODEID,
                "the cluster scheduler should export it for every task",
            );
        }
        let group_rank = ctx.env.get(env::GROUP_RANK);
        let node_rank = ctx.env.get(env::NODE_RANK);
        let (key, raw) = match (group_rank, node_rank) {
            (None, None) => return Ok(0),
            (Some(group), Some(node)) => {
                warn!(
                    "Multiple environment variables (NODE_RANK={}, GROUP_RANK={}) defined for node rank. Using GROUP_RANK.",
                    node, group
                );
                (env::GROUP_RANK, group)
            }
            (Some(group), None) => (env::GROUP_RANK, group),
            (None, Some(node)) => (env::NODE_RANK, node),
        };
        let rank: usize = raw.trim().parse().map_err(|_| {
            OrchestratorError::configuration(format!("{key}={raw:?} is not a node index"))
        })?;
        rank_zero_info(format!("Using environment variable {key} for node rank ({rank})."));
        Ok(rank)
    }

    fn determine_local_rank(ctx: &RunContext) -> Result<usize> {
        if ctx.is_slurm_managing_tasks {
            return ctx.env.require(
                env::SLURM_LOCALID,
                "the cluster scheduler should export it for every task",
            );
        }
        if let Some(launch) = LaunchEnv::from_env(&ctx.env)? {
            return Ok(launch.local_rank);
        }
        Ok(ctx
            .env
            .parse::<usize>(env::LOCAL_RANK, "expected an integer")?
            .unwrap_or(0))
    }

    fn set_nvidia_flags(ctx: &mut RunContext) {
        let Some(ids) = &ctx.data_parallel_device_ids else {
            return;
        };
        ctx.env.set(env::CUDA_DEVICE_ORDER, "PCI_BUS_ID");

        // the scheduler scopes visible devices itself
        if !ctx.is_slurm_managing_tasks && !ctx.env.contains(env::CUDA_VISIBLE_DEVICES) {
            let visible = ids.iter().map(usize::to_string).collect::<Vec<_>>().join(",");
            ctx.env.set(env::CUDA_VISIBLE_DEVICES, visible);
        }
        rank_zero_info(format!(
            "CUDA_VISIBLE_DEVICES: [{}]",
            ctx.env.get_or(env::CUDA_VISIBLE_DEVICES, "")
        ));
    }

    pub fn select_accelerator(&self, ctx: &RunContext) -> SelectedBackend {
        let elastic_flags =
            ctx.env.contains(env::WORLD_SIZE) && (ctx.env.contains(env::GROUP_RANK) || ctx.env.contains(env::NODE_RANK));
        let spawn_family = matches!(
            ctx.distributed_backend,
            Some(DistributedBackend::DdpCpu | DistributedBackend::DdpSpawn)
        );

        let selected = if ctx.use_ddp2 {
            if ctx.is_slurm_managing_tasks {
                SelectedBackend::Ddp2(CoordinationMode::ClusterManaged)
            } else {
                SelectedBackend::Ddp2(CoordinationMode::ElasticManaged)
            }
        } else if ctx.use_ddp && ctx.is_slurm_managing_tasks {
            SelectedBackend::Ddp(CoordinationMode::ClusterManaged)
        } else if ctx.use_ddp && elastic_flags {
            SelectedBackend::Ddp(CoordinationMode::ElasticManaged)
        } else if ctx.use_ddp && spawn_family {
            SelectedBackend::DdpSpawn {
                nprocs: ctx.num_processes,
            }
        } else if ctx.distributed_backend == Some(DistributedBackend::Ddp) {
            SelectedBackend::Ddp(CoordinationMode::SelfSpawned)
        } else {
            SelectedBackend::SingleProcess
        };
        info!("⚙️  selected backend: {}", selected);
        selected
    }
}

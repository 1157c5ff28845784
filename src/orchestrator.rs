//! Per-worker setup sequence and the step-level contract the training loop
//! drives the wrapped model through.

use std::mem;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bootstrap::ConnectionBootstrapper;
use crate::collective::{Collective, LocalGroup};
use crate::connector::SelectedBackend;
use crate::context::RunContext;
use crate::device::{visible_devices, DeviceBinder};
use crate::env::{self, LaunchEnv};
use crate::error::{OrchestratorError, Result};
use crate::logging;
use crate::module::{
    reinit_scheduler_properties, ConnectionRequest, DistributedModel, ModuleOptimizers, OptimizerFactory,
    RunProperties, Stage, StepOutput, TrainModule,
};
use crate::precision::{self, AmpBackend};
use crate::rank::{self, BackendVariant, CoordinationMode, RankResolver};
use crate::spawn::{CommandLine, ProcessSpawner};
use crate::termination::{early_stop_vote, transfer_distrib_spawn_state_on_fit_end, StateChannel};

/// The generic train/evaluate loop the orchestrator hands control to.
pub trait TrainLoop: Send {
    fn setup_training(&mut self, _ctx: &mut RunContext, _model: &mut DistributedModel) -> Result<()> {
        Ok(())
    }

    fn fit(&mut self, ctx: &mut RunContext, steps: &mut StepRunner<'_>) -> Result<Value>;

    fn test(&mut self, ctx: &mut RunContext, steps: &mut StepRunner<'_>) -> Result<Value>;
}

/// Forward calls and step-end reductions on the wrapped model.
pub struct StepRunner<'a> {
    model: &'a mut DistributedModel,
    amp: Option<AmpBackend>,
}

impl<'a> StepRunner<'a> {
    pub fn new(model: &'a mut DistributedModel, amp: Option<AmpBackend>) -> Self {
        Self { model, amp }
    }

    fn forward(&self, batch: &[Tensor]) -> Result<StepOutput> {
        match self.amp {
            Some(AmpBackend::Native) => precision::autocast(|| self.model.forward(batch)),
            _ => self.model.forward(batch),
        }
    }

    pub fn training_step(&self, batch: &[Tensor]) -> Result<StepOutput> {
        self.forward(batch)
    }

    pub fn validation_step(&self, batch: &[Tensor]) -> Result<StepOutput> {
        self.forward(batch)
    }

    pub fn test_step(&self, batch: &[Tensor]) -> Result<StepOutput> {
        self.forward(batch)
    }

    fn step_end(output: StepOutput) -> Result<StepOutput> {
        match output {
            StepOutput::Result(mut result) => {
                result.dp_reduce()?;
                Ok(StepOutput::Result(result))
            }
            other => Ok(other),
        }
    }

    pub fn training_step_end(&self, output: StepOutput) -> Result<StepOutput> {
        Self::step_end(output)
    }

    pub fn validation_step_end(&self, output: StepOutput) -> Result<StepOutput> {
        Self::step_end(output)
    }

    pub fn test_step_end(&self, output: StepOutput) -> Result<StepOutput> {
        Self::step_end(output)
    }

    pub fn barrier(&self, name: &str) -> Result<()> {
        debug!("barrier {}", name);
        self.model.collective().barrier()
    }

    /// Collective vote; every worker must call it at the same point.
    pub fn early_stopping_should_stop(&self, should_stop: bool) -> Result<bool> {
        early_stop_vote(self.model.collective(), should_stop)
    }

    pub fn model(&self) -> &DistributedModel {
        &*self.model
    }

    pub fn model_mut(&mut self) -> &mut DistributedModel {
        &mut *self.model
    }
}

pub struct DdpOutcome {
    pub results: Value,
    pub module: Box<dyn TrainModule>,
}

pub struct RunOutcome {
    /// Only global rank 0 reports results.
    pub results: Option<Value>,
    pub module: Option<Box<dyn TrainModule>>,
}

pub struct TrainingOrchestrator {
    selected: SelectedBackend,
    resolver: RankResolver,
    spawner: ProcessSpawner,
    bootstrapper: ConnectionBootstrapper,
    binder: DeviceBinder,
    optimizer_factory: Arc<dyn OptimizerFactory>,
    command: Option<CommandLine>,
    task_idx: Option<usize>,
}

impl TrainingOrchestrator {
    pub fn new(selected: SelectedBackend) -> Self {
        Self {
            selected,
            resolver: RankResolver::new(selected.mode(), selected.variant()),
            spawner: ProcessSpawner::default(),
            bootstrapper: ConnectionBootstrapper::default(),
            binder: DeviceBinder::default(),
            optimizer_factory: Arc::new(ModuleOptimizers),
            command: None,
            task_idx: None,
        }
    }

    pub fn with_spawner(mut self, spawner: ProcessSpawner) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_binder(mut self, binder: DeviceBinder) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_optimizer_factory(mut self, factory: Arc<dyn OptimizerFactory>) -> Self {
        self.optimizer_factory = factory;
        self
    }

    /// Command line children re-run; defaults to the current process.
    pub fn with_command(mut self, command: CommandLine) -> Self {
        self.command = Some(command);
        self
    }

    pub fn selected(&self) -> SelectedBackend {
        self.selected
    }

    /// Orchestrator for another worker of the same in-process run.
    pub fn worker(&self) -> Self {
        Self {
            selected: self.selected,
            resolver: self.resolver,
            spawner: ProcessSpawner::default(),
            bootstrapper: ConnectionBootstrapper::default(),
            binder: self.binder,
            optimizer_factory: Arc::clone(&self.optimizer_factory),
            command: None,
            task_idx: None,
        }
    }

    fn is_master(&self) -> bool {
        self.selected.mode() == CoordinationMode::SelfSpawned
    }

    /// Resolves this process's task index, launching the sibling processes
    /// first when this is a script-mode master. A script-mode master can do
    /// that once per process; later calls fail with `ReentrantSpawn`.
    pub fn setup(&mut self, ctx: &mut RunContext) -> Result<usize> {
        let task_idx = match self.selected {
            SelectedBackend::Ddp(CoordinationMode::SelfSpawned) => {
                let command = match &self.command {
                    Some(command) => command.clone(),
                    None => CommandLine::current(ctx.config.original_cwd.as_deref()),
                };
                let outcome = self.spawner.spawn_children(
                    ctx.global_rank,
                    &mut ctx.env,
                    &command,
                    ctx.num_processes,
                    ctx.num_nodes,
                )?;
                ctx.node_rank = outcome.node_rank;
                ctx.children = self.spawner.children().clone();
                outcome.task_idx
            }
            _ => self.resolver.resolve_task_index(&ctx.env)?,
        };
        self.task_idx = Some(task_idx);
        Ok(task_idx)
    }

    /// Runs one worker of an OS-process backend (script, cluster, elastic,
    /// whole-node or single process).
    pub fn train(
        &mut self,
        ctx: &mut RunContext,
        module: Box<dyn TrainModule>,
        train_loop: &mut dyn TrainLoop,
    ) -> Result<RunOutcome> {
        let task_idx = match self.task_idx {
            Some(task_idx) => task_idx,
            None => self.setup(ctx)?,
        };
        let in_process: Option<Arc<dyn Collective>> = match self.selected {
            SelectedBackend::SingleProcess => Some(Arc::new(LocalGroup::solo())),
            _ => None,
        };
        let outcome = self.ddp_train(ctx, task_idx, module, train_loop, None, in_process)?;

        if self.selected == SelectedBackend::Ddp(CoordinationMode::SelfSpawned) {
            // a later fit in this process must not see this run's world
            ctx.env.remove(env::WORLD_SIZE);
            for (local_rank, status) in ctx.children.wait_all() {
                match status {
                    Ok(status) if status.success() => debug!("worker {} exited cleanly", local_rank),
                    Ok(status) => warn!("worker {} exited with {}", local_rank, status),
                    Err(e) => warn!("could not reap worker {}: {}", local_rank, e),
                }
            }
        }

        let spawn_family = ctx
            .distributed_backend
            .is_some_and(|backend| backend.transfers_state_on_fit_end());
        let results = (ctx.is_global_zero() && !spawn_family).then_some(outcome.results);
        Ok(RunOutcome {
            results,
            module: Some(outcome.module),
        })
    }

    pub fn ddp_train(
        &mut self,
        ctx: &mut RunContext,
        process_idx: usize,
        mut module: Box<dyn TrainModule>,
        train_loop: &mut dyn TrainLoop,
        channel: Option<Box<dyn StateChannel>>,
        in_process: Option<Arc<dyn Collective>>,
    ) -> Result<DdpOutcome> {
        let variant = self.selected.variant();
        let is_master = self.is_master();

        let identity = self
            .resolver
            .identity(ctx.node_rank, process_idx, ctx.num_processes, ctx.num_nodes, is_master);
        if let Some(launch) = LaunchEnv::from_env(&ctx.env)? {
            if variant == BackendVariant::PerDevice && launch.world_size != identity.world_size {
                return Err(OrchestratorError::configuration(format!(
                    "launcher announced a world of {} workers but this worker computed {} \
                     ({} nodes x {} processes); check num_nodes and gpus match on every node",
                    launch.world_size, identity.world_size, ctx.num_nodes, ctx.num_processes
                )));
            }
        }
        ctx.local_rank = identity.local_rank;
        ctx.global_rank = identity.global_rank;
        ctx.world_size = identity.world_size;
        ctx.identity = Some(identity);
        logging::set_rank(identity.global_rank);

        // 1. one progress bar per job
        if !rank::is_progress_rank(ctx.node_rank, process_idx) {
            ctx.progress.disable();
        }

        let request = ConnectionRequest {
            global_rank: identity.global_rank,
            world_size: identity.world_size,
            is_cluster_managed: ctx.is_slurm_managing_tasks,
            env: &ctx.env,
            in_process,
        };
        let collective = self.bootstrapper.connect(module.as_mut(), &request)?;
        module.setup(if ctx.testing { Stage::Test } else { Stage::Fit })?;
        if identity.is_global_zero() {
            info!(
                "🌟 All DDP processes registered. Starting ddp with {} processes",
                identity.world_size
            );
        }

        // 2. per-device workers only; goes in before the weights move
        if ctx.config.sync_batchnorm && variant == BackendVariant::PerDevice {
            module.configure_sync_batchnorm()?;
        }

        // 3.
        if ctx.on_gpu {
            let visible = visible_devices(&ctx.env);
            let assignment = match variant {
                BackendVariant::PerDevice => self.binder.assign(is_master, process_idx, &visible)?,
                BackendVariant::WholeNode => self.binder.assign(false, process_idx, &visible)?,
            };
            let device = self.binder.bind(&assignment)?;
            ctx.root_gpu = Some(assignment.physical_device_id);
            ctx.root_device = device;
        } else {
            ctx.root_device = Device::Cpu;
        }
        module.to_device(&ctx.root_device)?;

        // 4.
        ctx.optimizers = self.optimizer_factory.init_optimizers(module.as_mut())?;

        // 5.
        ctx.amp_type = precision::amp_type(ctx.config.precision, ctx.config.amp_backend);
        module.apply_run_properties(&RunProperties {
            device: ctx.root_device.clone(),
            precision: ctx.config.precision,
            amp_backend: ctx.amp_type,
            global_rank: ctx.global_rank,
            world_size: ctx.world_size,
            use_ddp: ctx.use_ddp,
            use_ddp2: ctx.use_ddp2,
            testing: ctx.testing,
        });

        // 6.
        if ctx.amp_type == Some(AmpBackend::Apex) {
            let optimizers = mem::take(&mut ctx.optimizers.optimizers);
            ctx.optimizers.optimizers = module.configure_apex(optimizers, &ctx.config.amp_level)?;
            reinit_scheduler_properties(&ctx.optimizers.optimizers, &mut ctx.optimizers.lr_schedulers)?;
        }

        // 7.
        let device_ids = match (ctx.on_gpu, variant) {
            (false, _) => None,
            (true, BackendVariant::PerDevice) => ctx.root_gpu.map(|id| vec![id]),
            (true, BackendVariant::WholeNode) => ctx.data_parallel_device_ids.clone(),
        };

        // 8.
        let mut model = DistributedModel::wrap(module, device_ids, collective)?;

        // 9.
        train_loop.setup_training(ctx, &mut model)?;
        let results = {
            let mut steps = StepRunner::new(&mut model, ctx.amp_type);
            if ctx.testing {
                train_loop.test(ctx, &mut steps)?
            } else {
                train_loop.fit(ctx, &mut steps)?
            }
        };

        // 10.
        let module = model.into_inner();
        transfer_distrib_spawn_state_on_fit_end(ctx, module.as_ref(), results.clone(), channel)?;

        // 11.
        if ctx.on_gpu {
            DeviceBinder::release_cache(&ctx.root_device)?;
        }

        Ok(DdpOutcome { results, module })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::config::{DistributedBackend, TrainerConfig};
    use crate::env::EnvMap;
    use crate::module::{OptimizerSetup, StepResult, TrainOptimizer};
    use crate::precision::{is_autocast_enabled, Precision};
    use crate::spawn::tests::RecordingLauncher;
    use crate::device::Accelerator;
    use crate::spawn::{SpawnGuard, Stagger};

    struct NoopOptimizer;

    impl TrainOptimizer for NoopOptimizer {
        fn learning_rate(&self) -> f64 {
            0.1
        }
        fn set_learning_rate(&mut self, _lr: f64) {}
        fn backward_step(&mut self, _loss: &Tensor) -> Result<()> {
            Ok(())
        }
    }

    /// Records the order its hooks are called in.
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    impl TrainModule for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn init_ddp_connection(&mut self, request: &ConnectionRequest<'_>) -> Result<Arc<dyn Collective>> {
            self.record(format!("connect {}/{}", request.global_rank, request.world_size));
            crate::bootstrap::default_connection(request)
        }
        fn setup(&mut self, _stage: Stage) -> Result<()> {
            self.record("setup");
            Ok(())
        }
        fn configure_sync_batchnorm(&mut self) -> Result<()> {
            self.record("sync_batchnorm");
            Ok(())
        }
        fn to_device(&mut self, _device: &Device) -> Result<()> {
            self.record("to_device");
            Ok(())
        }
        fn configure_optimizers(&mut self) -> Result<OptimizerSetup> {
            self.record("configure_optimizers");
            Ok(OptimizerSetup {
                optimizers: vec![Box::new(NoopOptimizer)],
                ..OptimizerSetup::default()
            })
        }
        fn apply_run_properties(&mut self, _props: &RunProperties) {
            self.record("run_properties");
        }
        fn configure_apex(
            &mut self,
            optimizers: Vec<Box<dyn TrainOptimizer>>,
            _amp_level: &str,
        ) -> Result<Vec<Box<dyn TrainOptimizer>>> {
            self.record("apex");
            Ok(optimizers)
        }
        fn configure_ddp(&mut self, device_ids: Option<&[usize]>) -> Result<()> {
            self.record(format!("configure_ddp {device_ids:?}"));
            Ok(())
        }
        fn forward(&self, batch: &[Tensor]) -> Result<StepOutput> {
            self.record(format!("forward autocast={}", is_autocast_enabled()));
            let loss = batch[0].clone();
            Ok(StepOutput::Result(StepResult::with_loss(loss)))
        }
        fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
            Ok(HashMap::new())
        }
        fn load_state_dict(&mut self, _weights: HashMap<String, Tensor>) -> Result<()> {
            Ok(())
        }
    }

    struct OneStep;

    impl TrainLoop for OneStep {
        fn fit(&mut self, _ctx: &mut RunContext, steps: &mut StepRunner<'_>) -> Result<Value> {
            let batch = vec![Tensor::new(&[1f32, 3.0], &Device::Cpu)?];
            let output = steps.training_step_end(steps.training_step(&batch)?)?;
            let loss = output.loss().map(|l| l.to_scalar::<f32>()).transpose()?;
            steps.barrier("fit_end")?;
            Ok(json!({ "loss": loss }))
        }

        fn test(&mut self, _ctx: &mut RunContext, _steps: &mut StepRunner<'_>) -> Result<Value> {
            Ok(json!({ "test": true }))
        }
    }

    fn context(config: TrainerConfig) -> RunContext {
        RunContext::new(
            TrainerConfig {
                progress_bar: false,
                ..config
            },
            EnvMap::new(),
        )
    }

    #[test]
    fn hooks_run_in_setup_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = context(TrainerConfig {
            sync_batchnorm: true,
            precision: Precision::Half,
            amp_backend: AmpBackend::Apex,
            ..TrainerConfig::default()
        });
        let mut orchestrator = TrainingOrchestrator::new(SelectedBackend::SingleProcess);
        let outcome = orchestrator
            .train(&mut ctx, Box::new(Recorder { calls: Arc::clone(&calls) }), &mut OneStep)
            .unwrap();

        assert_eq!(outcome.results, Some(json!({ "loss": 2.0 })));
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "connect 0/1",
                "setup",
                "sync_batchnorm",
                "to_device",
                "configure_optimizers",
                "run_properties",
                "apex",
                "configure_ddp None",
                "forward autocast=false",
            ]
        );
        assert_eq!(ctx.optimizers.optimizers.len(), 1);
    }

    #[test]
    fn native_amp_scopes_the_forward_call() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = context(TrainerConfig {
            precision: Precision::Half,
            amp_backend: AmpBackend::Native,
            ..TrainerConfig::default()
        });
        TrainingOrchestrator::new(SelectedBackend::SingleProcess)
            .train(&mut ctx, Box::new(Recorder { calls: Arc::clone(&calls) }), &mut OneStep)
            .unwrap();
        let calls = calls.lock().unwrap();
        assert!(calls.contains(&"forward autocast=true".to_string()));
        assert!(!calls.contains(&"apex".to_string()));
        assert!(!is_autocast_enabled());
    }

    #[test]
    fn testing_runs_the_test_loop() {
        let mut ctx = context(TrainerConfig::default());
        ctx.testing = true;
        let outcome = TrainingOrchestrator::new(SelectedBackend::SingleProcess)
            .train(&mut ctx, Box::new(Recorder { calls: Arc::default() }), &mut OneStep)
            .unwrap();
        assert_eq!(outcome.results, Some(json!({ "test": true })));
    }

    #[test]
    fn spawn_family_hides_results_from_train() {
        let mut ctx = context(TrainerConfig::default());
        ctx.distributed_backend = Some(DistributedBackend::DdpSpawn);
        let outcome = TrainingOrchestrator::new(SelectedBackend::SingleProcess)
            .train(&mut ctx, Box::new(Recorder { calls: Arc::default() }), &mut OneStep)
            .unwrap();
        assert!(outcome.results.is_none());
    }

    fn script_master(guard: SpawnGuard) -> (TrainingOrchestrator, Arc<Mutex<Vec<(CommandLine, EnvMap, Option<PathBuf>)>>>) {
        let launcher = RecordingLauncher::default();
        let launched = Arc::clone(&launcher.launched);
        let spawner = ProcessSpawner::new(Box::new(launcher))
            .with_guard(guard)
            .with_stagger(Stagger::Disabled);
        let orchestrator = TrainingOrchestrator::new(SelectedBackend::Ddp(CoordinationMode::SelfSpawned))
            .with_spawner(spawner)
            .with_command(CommandLine::new("/opt/train", ["fit"]));
        (orchestrator, launched)
    }

    fn script_context() -> RunContext {
        let mut ctx = context(TrainerConfig {
            distributed_backend: Some(DistributedBackend::Ddp),
            num_processes: 3,
            ..TrainerConfig::default()
        });
        ctx.env.set(env::MASTER_PORT, "29555");
        ctx
    }

    #[test]
    fn script_master_spawns_once_and_reports_task_zero() {
        let (mut orchestrator, launched) = script_master(SpawnGuard::detached());
        let mut ctx = script_context();

        assert_eq!(orchestrator.setup(&mut ctx).unwrap(), 0);
        assert!(matches!(
            orchestrator.setup(&mut ctx),
            Err(OrchestratorError::ReentrantSpawn(_))
        ));
        assert_eq!(launched.lock().unwrap().len(), 2);
        assert_eq!(ctx.children.len(), 2);
        assert_eq!(ctx.env.get(env::WORLD_SIZE), Some("3"));
    }

    #[test]
    fn second_orchestrator_in_the_same_process_cannot_spawn() {
        let guard = SpawnGuard::detached();
        let (mut first, first_launched) = script_master(guard.clone());
        let (mut second, second_launched) = script_master(guard);

        let mut ctx = script_context();
        assert_eq!(first.setup(&mut ctx).unwrap(), 0);
        let mut later = script_context();
        assert!(matches!(
            second.setup(&mut later),
            Err(OrchestratorError::ReentrantSpawn(_))
        ));

        assert_eq!(first_launched.lock().unwrap().len(), 2);
        assert!(second_launched.lock().unwrap().is_empty());
        assert_eq!(ctx.children.len() + later.children.len(), 2);
    }

    #[test]
    fn whole_node_worker_binds_its_task_index_and_skips_sync_batchnorm() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = context(TrainerConfig {
            distributed_backend: Some(DistributedBackend::Ddp2),
            sync_batchnorm: true,
            ..TrainerConfig::default()
        });
        ctx.on_gpu = true;
        ctx.use_ddp2 = true;
        ctx.data_parallel_device_ids = Some(vec![0, 1]);
        ctx.env.set(env::CUDA_VISIBLE_DEVICES, "0,1");

        let mut orchestrator = TrainingOrchestrator::new(SelectedBackend::Ddp2(CoordinationMode::ElasticManaged))
            .with_binder(DeviceBinder::new(Accelerator::Cpu));
        orchestrator
            .ddp_train(
                &mut ctx,
                1,
                Box::new(Recorder { calls: Arc::clone(&calls) }),
                &mut OneStep,
                None,
                Some(Arc::new(LocalGroup::solo())),
            )
            .unwrap();

        assert_eq!(ctx.root_gpu, Some(1));
        let calls = calls.lock().unwrap();
        assert!(!calls.contains(&"sync_batchnorm".to_string()));
        assert!(calls.contains(&"configure_ddp Some([0, 1])".to_string()));
    }
}

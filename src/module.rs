//! Hooks the orchestrator expects from the model layer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::bootstrap;
use crate::collective::Collective;
use crate::env::EnvMap;
use crate::error::{OrchestratorError, Result};
use crate::precision::{AmpBackend, Precision};

/// Metrics a step reports per device, reduced to one value by `dp_reduce`.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub loss: Option<Tensor>,
    pub metrics: BTreeMap<String, Tensor>,
}

impl StepResult {
    pub fn with_loss(loss: Tensor) -> Self {
        Self {
            loss: Some(loss),
            metrics: BTreeMap::new(),
        }
    }

    pub fn log(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Averages every entry over its device dimension, in place.
    pub fn dp_reduce(&mut self) -> Result<()> {
        if let Some(loss) = self.loss.as_mut() {
            *loss = loss.mean_all()?;
        }
        for value in self.metrics.values_mut() {
            *value = value.mean_all()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum StepOutput {
    Tensor(Tensor),
    /// Reduction-aware output; step-end hooks reduce it across devices.
    Result(StepResult),
}

impl StepOutput {
    pub fn loss(&self) -> Option<&Tensor> {
        match self {
            StepOutput::Tensor(t) => Some(t),
            StepOutput::Result(r) => r.loss.as_ref(),
        }
    }
}

pub trait TrainOptimizer: Send {
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
    fn backward_step(&mut self, loss: &Tensor) -> Result<()>;
}

/// Adapts any candle optimizer.
pub struct CandleOptimizer<O>(pub O);

impl<O: candle_nn::Optimizer + Send> TrainOptimizer for CandleOptimizer<O> {
    fn learning_rate(&self) -> f64 {
        self.0.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.0.set_learning_rate(lr)
    }

    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        Ok(self.0.backward_step(loss)?)
    }
}

pub trait LrScheduler: Send {
    /// Re-reads whatever state the scheduler keeps about its optimizer.
    fn rebind(&mut self, optimizer: &dyn TrainOptimizer);
    fn step(&mut self, optimizer: &mut dyn TrainOptimizer);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    Epoch,
    Step,
}

pub struct SchedulerBinding {
    pub scheduler: Box<dyn LrScheduler>,
    pub optimizer_index: usize,
    pub interval: Interval,
    pub frequency: usize,
}

impl fmt::Debug for SchedulerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBinding")
            .field("optimizer_index", &self.optimizer_index)
            .field("interval", &self.interval)
            .field("frequency", &self.frequency)
            .finish()
    }
}

#[derive(Default)]
pub struct OptimizerSetup {
    pub optimizers: Vec<Box<dyn TrainOptimizer>>,
    pub lr_schedulers: Vec<SchedulerBinding>,
    /// Steps each optimizer runs before handing over to the next. Empty
    /// means every optimizer steps every batch.
    pub optimizer_frequencies: Vec<usize>,
}

impl fmt::Debug for OptimizerSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizerSetup")
            .field("optimizers", &self.optimizers.len())
            .field("lr_schedulers", &self.lr_schedulers)
            .field("optimizer_frequencies", &self.optimizer_frequencies)
            .finish()
    }
}

/// Points each scheduler at the optimizer it drives after the optimizers
/// were rewrapped.
pub fn reinit_scheduler_properties(
    optimizers: &[Box<dyn TrainOptimizer>],
    schedulers: &mut [SchedulerBinding],
) -> Result<()> {
    for binding in schedulers.iter_mut() {
        let optimizer = optimizers.get(binding.optimizer_index).ok_or_else(|| {
            OrchestratorError::configuration(format!(
                "lr scheduler is bound to optimizer {} but only {} optimizers exist",
                binding.optimizer_index,
                optimizers.len()
            ))
        })?;
        binding.scheduler.rebind(optimizer.as_ref());
    }
    Ok(())
}

pub trait OptimizerFactory: Send + Sync {
    fn init_optimizers(&self, module: &mut dyn TrainModule) -> Result<OptimizerSetup>;
}

/// Asks the module for its optimizers and checks the result is coherent.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuleOptimizers;

impl OptimizerFactory for ModuleOptimizers {
    fn init_optimizers(&self, module: &mut dyn TrainModule) -> Result<OptimizerSetup> {
        let setup = module.configure_optimizers()?;
        if setup.optimizers.is_empty() {
            return Err(OrchestratorError::configuration(format!(
                "`configure_optimizers` of {} returned no optimizer",
                module.name()
            )));
        }
        if !setup.optimizer_frequencies.is_empty()
            && setup.optimizer_frequencies.len() != setup.optimizers.len()
        {
            return Err(OrchestratorError::configuration(
                "optimizer frequencies must be given for every optimizer or for none",
            ));
        }
        Ok(setup)
    }
}

/// Run-level settings copied onto the module before it is wrapped.
#[derive(Debug, Clone)]
pub struct RunProperties {
    pub device: Device,
    pub precision: Precision,
    pub amp_backend: Option<AmpBackend>,
    pub global_rank: usize,
    pub world_size: usize,
    pub use_ddp: bool,
    pub use_ddp2: bool,
    pub testing: bool,
}

pub struct ConnectionRequest<'a> {
    pub global_rank: usize,
    pub world_size: usize,
    pub is_cluster_managed: bool,
    pub env: &'a EnvMap,
    /// Group prepared by an in-process launcher, if any.
    pub in_process: Option<Arc<dyn Collective>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fit,
    Test,
}

pub trait TrainModule: Send {
    fn name(&self) -> &str;

    /// Joins the process group. Called once per process.
    fn init_ddp_connection(&mut self, request: &ConnectionRequest<'_>) -> Result<Arc<dyn Collective>> {
        bootstrap::default_connection(request)
    }

    fn setup(&mut self, _stage: Stage) -> Result<()> {
        Ok(())
    }

    /// Swaps batch-norm layers for synchronized ones. Runs before the
    /// weights move to the device.
    fn configure_sync_batchnorm(&mut self) -> Result<()> {
        Ok(())
    }

    fn to_device(&mut self, device: &Device) -> Result<()>;

    fn configure_optimizers(&mut self) -> Result<OptimizerSetup>;

    fn apply_run_properties(&mut self, _props: &RunProperties) {}

    fn configure_apex(
        &mut self,
        optimizers: Vec<Box<dyn TrainOptimizer>>,
        _amp_level: &str,
    ) -> Result<Vec<Box<dyn TrainOptimizer>>> {
        Ok(optimizers)
    }

    /// Prepares the module for data-parallel execution on `device_ids`.
    fn configure_ddp(&mut self, _device_ids: Option<&[usize]>) -> Result<()> {
        Ok(())
    }

    fn forward(&self, batch: &[Tensor]) -> Result<StepOutput>;

    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    fn load_state_dict(&mut self, weights: HashMap<String, Tensor>) -> Result<()>;
}

/// The module after parallel wrapping; everything after step 8 of a run
/// goes through this.
pub struct DistributedModel {
    module: Box<dyn TrainModule>,
    device_ids: Option<Vec<usize>>,
    collective: Arc<dyn Collective>,
}

impl DistributedModel {
    pub fn wrap(
        mut module: Box<dyn TrainModule>,
        device_ids: Option<Vec<usize>>,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        module.configure_ddp(device_ids.as_deref())?;
        Ok(Self {
            module,
            device_ids,
            collective,
        })
    }

    pub fn forward(&self, batch: &[Tensor]) -> Result<StepOutput> {
        self.module.forward(batch)
    }

    pub fn device_ids(&self) -> Option<&[usize]> {
        self.device_ids.as_deref()
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    pub fn module(&self) -> &dyn TrainModule {
        self.module.as_ref()
    }

    pub fn module_mut(&mut self) -> &mut dyn TrainModule {
        self.module.as_mut()
    }

    pub fn into_inner(self) -> Box<dyn TrainModule> {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantLr {
        base_lr: f64,
    }

    impl LrScheduler for ConstantLr {
        fn rebind(&mut self, optimizer: &dyn TrainOptimizer) {
            self.base_lr = optimizer.learning_rate();
        }
        fn step(&mut self, optimizer: &mut dyn TrainOptimizer) {
            optimizer.set_learning_rate(self.base_lr);
        }
    }

    struct FixedLr(f64);

    impl TrainOptimizer for FixedLr {
        fn learning_rate(&self) -> f64 {
            self.0
        }
        fn set_learning_rate(&mut self, lr: f64) {
            self.0 = lr;
        }
        fn backward_step(&mut self, _loss: &Tensor) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn dp_reduce_averages_in_place() {
        let loss = Tensor::new(&[1f32, 3.0], &Device::Cpu).unwrap();
        let acc = Tensor::new(&[0.5f32, 0.7, 0.9], &Device::Cpu).unwrap();
        let mut result = StepResult::with_loss(loss).log("acc", acc);
        result.dp_reduce().unwrap();

        assert_eq!(result.loss.unwrap().to_scalar::<f32>().unwrap(), 2.0);
        let acc = result.metrics["acc"].to_scalar::<f32>().unwrap();
        assert!((acc - 0.7).abs() < 1e-6);
    }

    #[test]
    fn schedulers_rebind_to_their_optimizer() {
        let optimizers: Vec<Box<dyn TrainOptimizer>> = vec![Box::new(FixedLr(0.1)), Box::new(FixedLr(0.01))];
        let mut schedulers = vec![SchedulerBinding {
            scheduler: Box::new(ConstantLr { base_lr: 0.0 }),
            optimizer_index: 1,
            interval: Interval::Epoch,
            frequency: 1,
        }];
        reinit_scheduler_properties(&optimizers, &mut schedulers).unwrap();

        let mut target = FixedLr(5.0);
        schedulers[0].scheduler.step(&mut target);
        assert_eq!(target.0, 0.01);

        schedulers[0].optimizer_index = 4;
        assert!(reinit_scheduler_properties(&optimizers, &mut schedulers).is_err());
    }
}

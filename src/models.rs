use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module, Optimizer, VarBuilder, VarMap, SGD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::module::{CandleOptimizer, OptimizerSetup, RunProperties, StepOutput, StepResult, TrainModule};
use crate::precision::autocast_dtype;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionConfig {
    pub in_features: usize,
    pub learning_rate: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            in_features: 8,
            learning_rate: 0.05,
        }
    }
}

/// Single linear layer fit with mean squared error.
pub struct RegressionModule {
    config: RegressionConfig,
    var_map: VarMap,
    linear: Linear,
    device: Device,
    name: String,
}

fn lock(var_map: &VarMap) -> MutexGuard<'_, HashMap<String, candle_core::Var>> {
    let data: &Mutex<_> = var_map.data();
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RegressionModule {
    pub fn new(config: RegressionConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let linear = Self::build(&config, &var_map, device)?;
        Ok(Self {
            name: format!("linear-regression-{}", config.in_features),
            config,
            var_map,
            linear,
            device: device.clone(),
        })
    }

    fn build(config: &RegressionConfig, var_map: &VarMap, device: &Device) -> Result<Linear> {
        let vb = VarBuilder::from_varmap(var_map, DType::F32, device);
        Ok(candle_nn::linear(config.in_features, 1, vb.pp("linear"))?)
    }

    pub fn config(&self) -> &RegressionConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn parameter_count(&self) -> usize {
        lock(&self.var_map).values().map(|var| var.elem_count()).sum()
    }
}

impl TrainModule for RegressionModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn to_device(&mut self, device: &Device) -> Result<()> {
        if self.device.same_device(device) {
            return Ok(());
        }
        let weights = self.state_dict()?;
        let var_map = VarMap::new();
        let linear = Self::build(&self.config, &var_map, device)?;
        self.var_map = var_map;
        self.linear = linear;
        self.device = device.clone();
        self.load_state_dict(weights)
    }

    fn configure_optimizers(&mut self) -> Result<OptimizerSetup> {
        let sgd = SGD::new(self.var_map.all_vars(), self.config.learning_rate)?;
        Ok(OptimizerSetup {
            optimizers: vec![Box::new(CandleOptimizer(sgd))],
            ..OptimizerSetup::default()
        })
    }

    fn apply_run_properties(&mut self, props: &RunProperties) {
        debug!(
            "{} running as rank {}/{} with {:?} precision",
            self.name, props.global_rank, props.world_size, props.precision
        );
    }

    fn forward(&self, batch: &[Tensor]) -> Result<StepOutput> {
        let [x, y] = batch else {
            return Err(OrchestratorError::configuration(format!(
                "{} expects (inputs, targets) batches, got {} tensors",
                self.name,
                batch.len()
            )));
        };
        let dtype = autocast_dtype();
        let prediction = if dtype == DType::F32 {
            self.linear.forward(x)?
        } else {
            // reduced-precision matmul, loss stays in f32
            let weight = self.linear.weight().to_dtype(dtype)?;
            let mut out = x.to_dtype(dtype)?.matmul(&weight.t()?)?;
            if let Some(bias) = self.linear.bias() {
                out = out.broadcast_add(&bias.to_dtype(dtype)?)?;
            }
            out.to_dtype(DType::F32)?
        };
        let loss = candle_nn::loss::mse(&prediction, y)?;
        Ok(StepOutput::Result(StepResult::with_loss(loss)))
    }

    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(lock(&self.var_map)
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect())
    }

    fn load_state_dict(&mut self, weights: HashMap<String, Tensor>) -> Result<()> {
        for (name, tensor) in weights {
            self.var_map.set_one(&name, tensor.to_device(&self.device)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_round_trip_through_state_dict() {
        let source = RegressionModule::new(RegressionConfig::default(), &Device::Cpu).unwrap();
        let mut target = RegressionModule::new(RegressionConfig::default(), &Device::Cpu).unwrap();
        target.load_state_dict(source.state_dict().unwrap()).unwrap();

        let expected = source.state_dict().unwrap()["linear.weight"].to_vec2::<f32>().unwrap();
        let loaded = target.state_dict().unwrap()["linear.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(expected, loaded);
        assert_eq!(source.parameter_count(), 9);
    }

    #[test]
    fn autocast_forward_tracks_the_full_precision_loss() {
        let model = RegressionModule::new(RegressionConfig::default(), &Device::Cpu).unwrap();
        let x = Tensor::new(&[[0.5f32, -0.25, 0.75, 0.1, -0.6, 0.3, 0.9, -0.4]], &Device::Cpu).unwrap();
        let y = Tensor::new(&[[0.2f32]], &Device::Cpu).unwrap();
        let batch = [x, y];

        let scalar = |output: StepOutput| output.loss().unwrap().to_scalar::<f32>().unwrap();
        let full = scalar(model.forward(&batch).unwrap());
        let half = scalar(crate::precision::autocast(|| model.forward(&batch)).unwrap());
        assert!((full - half).abs() < 1e-2 * full.max(1.0));
    }

    #[test]
    fn forward_rejects_malformed_batches() {
        let model = RegressionModule::new(RegressionConfig::default(), &Device::Cpu).unwrap();
        let x = Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(model.forward(&[x.clone()]).is_err());

        let y = Tensor::zeros((4, 1), DType::F32, &Device::Cpu).unwrap();
        let output = model.forward(&[x, y]).unwrap();
        assert!(output.loss().is_some());
    }
}

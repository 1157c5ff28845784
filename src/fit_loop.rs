use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tracing::info;

use crate::context::RunContext;
use crate::error::{OrchestratorError, Result};
use crate::module::{DistributedModel, Interval};
use crate::orchestrator::{StepRunner, TrainLoop};

/// Epoch loop over synthetic linear-regression data.
pub struct EpochLoop {
    pub max_epochs: usize,
    pub steps_per_epoch: usize,
    pub batch_size: usize,
    pub in_features: usize,
    /// Validation loss under which every worker votes to stop.
    pub target_loss: Option<f64>,
    seed: u64,
    true_weights: Vec<f32>,
    rng: Option<StdRng>,
    device: Device,
}

impl EpochLoop {
    pub fn new(max_epochs: usize, steps_per_epoch: usize, in_features: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let true_weights = (0..in_features).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        Self {
            max_epochs,
            steps_per_epoch,
            batch_size: 32,
            in_features,
            target_loss: None,
            seed,
            true_weights,
            rng: None,
            device: Device::Cpu,
        }
    }

    pub fn with_target_loss(mut self, target_loss: f64) -> Self {
        self.target_loss = Some(target_loss);
        self
    }

    fn batch(&mut self) -> Result<Vec<Tensor>> {
        let rng = self
            .rng
            .as_mut()
            .ok_or_else(|| OrchestratorError::configuration("batches requested before setup_training"))?;
        let mut inputs = Vec::with_capacity(self.batch_size * self.in_features);
        let mut targets = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let row: Vec<f32> = (0..self.in_features).map(|_| rng.random_range(-1.0f32..1.0)).collect();
            let target = row.iter().zip(&self.true_weights).map(|(x, w)| x * w).sum::<f32>() + 0.5;
            inputs.extend(row);
            targets.push(target);
        }
        let x = Tensor::from_vec(inputs, (self.batch_size, self.in_features), &self.device)?;
        let y = Tensor::from_vec(targets, (self.batch_size, 1), &self.device)?;
        Ok(vec![x, y])
    }

    fn scalar_loss(output: &crate::module::StepOutput) -> Result<f64> {
        let loss = output
            .loss()
            .ok_or_else(|| OrchestratorError::configuration("step produced no loss"))?;
        Ok(loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
    }

    fn evaluate(&mut self, steps: &StepRunner<'_>, batches: usize, test: bool) -> Result<f64> {
        let mut total = 0.0;
        for _ in 0..batches {
            let batch = self.batch()?;
            let output = if test {
                steps.test_step_end(steps.test_step(&batch)?)?
            } else {
                steps.validation_step_end(steps.validation_step(&batch)?)?
            };
            total += Self::scalar_loss(&output)?;
        }
        Ok(total / batches.max(1) as f64)
    }
}

/// Index of the optimizer that owns `step` when optimizers take turns.
pub fn active_optimizer(step: usize, frequencies: &[usize]) -> Option<usize> {
    let cycle: usize = frequencies.iter().sum();
    if cycle == 0 {
        return None;
    }
    let mut position = step % cycle;
    for (idx, &frequency) in frequencies.iter().enumerate() {
        if position < frequency {
            return Some(idx);
        }
        position -= frequency;
    }
    None
}

impl TrainLoop for EpochLoop {
    fn setup_training(&mut self, ctx: &mut RunContext, _model: &mut DistributedModel) -> Result<()> {
        // every rank sees a different shard of the stream
        self.rng = Some(StdRng::seed_from_u64(self.seed + 1 + ctx.global_rank as u64));
        self.device = ctx.root_device.clone();
        Ok(())
    }

    fn fit(&mut self, ctx: &mut RunContext, steps: &mut StepRunner<'_>) -> Result<Value> {
        let mut global_step = 0;
        let mut epochs_run = 0;
        let mut train_loss = f64::NAN;
        let mut val_loss = f64::NAN;

        for epoch in 0..self.max_epochs {
            ctx.progress.start_epoch(epoch, self.steps_per_epoch);
            let mut total = 0.0;
            for _ in 0..self.steps_per_epoch {
                let batch = self.batch()?;
                let output = steps.training_step_end(steps.training_step(&batch)?)?;
                let loss = output
                    .loss()
                    .ok_or_else(|| OrchestratorError::configuration("training step produced no loss"))?;

                let frequencies = ctx.optimizers.optimizer_frequencies.clone();
                match active_optimizer(global_step, &frequencies) {
                    Some(idx) => ctx.optimizers.optimizers[idx].backward_step(loss)?,
                    None => {
                        for optimizer in ctx.optimizers.optimizers.iter_mut() {
                            optimizer.backward_step(loss)?;
                        }
                    }
                }
                let value = Self::scalar_loss(&output)?;
                total += value;
                global_step += 1;
                ctx.progress.advance(&format!("loss {value:.4}"));
            }
            train_loss = total / self.steps_per_epoch.max(1) as f64;

            val_loss = self.evaluate(steps, 4, false)?;
            let weights = steps.model().module().state_dict()?;
            let is_global_zero = ctx.is_global_zero();
            ctx.checkpoint.on_epoch_end(epoch, val_loss, &weights, is_global_zero)?;

            let setup = &mut ctx.optimizers;
            for binding in setup.lr_schedulers.iter_mut() {
                if binding.interval == Interval::Epoch && (epoch + 1) % binding.frequency.max(1) == 0 {
                    if let Some(optimizer) = setup.optimizers.get_mut(binding.optimizer_index) {
                        binding.scheduler.step(optimizer.as_mut());
                    }
                }
            }

            epochs_run = epoch + 1;
            if is_global_zero {
                info!("epoch {}: train loss {:.5}, val loss {:.5}", epoch, train_loss, val_loss);
            }
            ctx.should_stop = self.target_loss.is_some_and(|target| val_loss < target);
            if steps.early_stopping_should_stop(ctx.should_stop)? {
                if is_global_zero {
                    info!("every worker reached the target loss, stopping after epoch {}", epoch);
                }
                break;
            }
        }
        ctx.progress.finish();
        steps.barrier("fit_end")?;

        Ok(json!({
            "epochs": epochs_run,
            "global_step": global_step,
            "train_loss": train_loss,
            "val_loss": val_loss,
        }))
    }

    fn test(&mut self, _ctx: &mut RunContext, steps: &mut StepRunner<'_>) -> Result<Value> {
        let test_loss = self.evaluate(steps, 4, true)?;
        steps.barrier("test_end")?;
        Ok(json!({ "test_loss": test_loss }))
    }
}

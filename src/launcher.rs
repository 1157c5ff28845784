//! Entry points that pick how workers are started and run them to the end.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::checkpoint::load_weights;
use crate::collective::{Collective, LocalGroup};
use crate::connector::SelectedBackend;
use crate::context::RunContext;
use crate::error::{OrchestratorError, Result};
use crate::module::TrainModule;
use crate::orchestrator::{DdpOutcome, RunOutcome, TrainLoop, TrainingOrchestrator};
use crate::rendezvous::RendezvousAddr;
use crate::termination::{StateChannel, TerminationEnvelope};

/// Runs `nprocs` workers as threads of this process.
#[derive(Debug, Clone, Copy)]
pub struct InProcessLauncher {
    nprocs: usize,
}

impl InProcessLauncher {
    pub fn new(nprocs: usize) -> Self {
        Self { nprocs }
    }

    pub fn run<F, L>(
        &self,
        ctx: &mut RunContext,
        orchestrator: &TrainingOrchestrator,
        make_worker: F,
    ) -> Result<RunOutcome>
    where
        F: Fn(usize) -> Result<(Box<dyn TrainModule>, L)> + Sync,
        L: TrainLoop,
    {
        // workers on other nodes find this one through the published address
        RendezvousAddr::for_spawn(&ctx.env)?.export(&mut ctx.env);

        let groups: Vec<Option<Arc<dyn Collective>>> = if ctx.num_nodes == 1 {
            LocalGroup::new(self.nprocs)
                .into_iter()
                .map(|group| Some(Arc::new(group) as Arc<dyn Collective>))
                .collect()
        } else {
            (0..self.nprocs).map(|_| None).collect()
        };

        let (tx, rx) = mpsc::channel::<TerminationEnvelope>();
        let mut channel = Some(tx);
        info!("🚀 starting {} in-process workers", self.nprocs);

        let outcomes: Vec<Result<DdpOutcome>> = thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .enumerate()
                .map(|(process_idx, group)| {
                    let mut worker_ctx = ctx.fork_worker();
                    let mut worker = orchestrator.worker();
                    let channel: Option<Box<dyn StateChannel>> = match process_idx {
                        0 => channel.take().map(|tx| Box::new(tx) as Box<dyn StateChannel>),
                        _ => None,
                    };
                    let make_worker = &make_worker;
                    let handle = thread::Builder::new()
                        .name(format!("ddp-worker-{process_idx}"))
                        .spawn_scoped(s, move || {
                            let (module, mut train_loop) = make_worker(process_idx)?;
                            worker.ddp_train(&mut worker_ctx, process_idx, module, &mut train_loop, channel, group)
                        });
                    (process_idx, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(process_idx, handle)| match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or(Err(OrchestratorError::WorkerPanicked(process_idx))),
                    Err(e) => Err(OrchestratorError::Io(e)),
                })
                .collect()
        });
        drop(channel);

        let mut module = None;
        for (process_idx, outcome) in outcomes.into_iter().enumerate() {
            let outcome = outcome?;
            if process_idx == 0 {
                module = Some(outcome.module);
            }
        }

        let envelope = rx.recv().map_err(|_| OrchestratorError::ChannelClosed)?;
        self.restore(ctx, module.as_mut(), &envelope)?;
        Ok(RunOutcome {
            results: Some(envelope.results),
            module,
        })
    }

    fn restore(
        &self,
        ctx: &mut RunContext,
        module: Option<&mut Box<dyn TrainModule>>,
        envelope: &TerminationEnvelope,
    ) -> Result<()> {
        ctx.checkpoint.set_best_model_path(envelope.best_model_path.clone());
        match (&envelope.last_path, module) {
            (Some(last_path), Some(module)) if !ctx.testing => {
                let weights = load_weights(last_path, &ctx.root_device)?;
                module.load_state_dict(weights)?;
                info!("restored last weights from {}", last_path);
            }
            (Some(_), None) => warn!("last weights were saved but no module is left to load them into"),
            _ => {}
        }
        Ok(())
    }
}

impl TrainingOrchestrator {
    /// Runs the whole job this process takes part in.
    pub fn run<F, L>(mut self, ctx: &mut RunContext, make_worker: F) -> Result<RunOutcome>
    where
        F: Fn(usize) -> Result<(Box<dyn TrainModule>, L)> + Sync,
        L: TrainLoop,
    {
        match self.selected() {
            SelectedBackend::DdpSpawn { nprocs } => InProcessLauncher::new(nprocs).run(ctx, &self, make_worker),
            _ => {
                let task_idx = self.setup(ctx)?;
                let (module, mut train_loop) = make_worker(task_idx)?;
                self.train(ctx, module, &mut train_loop)
            }
        }
    }
}

//! End-of-run coordination: the early-stop vote and the hand-back of final
//! state from an in-process worker to its parent.

use std::sync::mpsc::Sender;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::checkpoint::atomic_save;
use crate::collective::Collective;
use crate::context::RunContext;
use crate::error::{OrchestratorError, Result};
use crate::module::TrainModule;

/// Passes only if every member votes to stop. Every member must call this
/// at the same point of every epoch.
pub fn early_stop_vote(collective: &dyn Collective, should_stop: bool) -> Result<bool> {
    let votes = collective.all_reduce_sum(i64::from(should_stop))?;
    collective.barrier()?;
    Ok(votes == collective.world_size() as i64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationEnvelope {
    pub best_model_path: Option<String>,
    pub results: Value,
    /// Weights as they were when the worker finished.
    pub last_path: Option<String>,
}

/// Single-use sink for a worker's final state.
pub trait StateChannel: Send {
    fn send(self: Box<Self>, envelope: TerminationEnvelope) -> Result<()>;
}

impl StateChannel for Sender<TerminationEnvelope> {
    fn send(self: Box<Self>, envelope: TerminationEnvelope) -> Result<()> {
        Sender::send(&self, envelope).map_err(|_| OrchestratorError::ChannelClosed)
    }
}

/// `epoch=2.ckpt` -> `epoch=2.tmp_end.ckpt`. Paths without the extension
/// get the suffix appended.
pub fn last_weights_path(best_model_path: &str) -> String {
    match best_model_path.strip_suffix(".ckpt") {
        Some(stem) => format!("{stem}.tmp_end.ckpt"),
        None => format!("{best_model_path}.tmp_end.ckpt"),
    }
}

/// Sends the final state of an in-process run to the parent. Does nothing
/// unless the backend replicates workers in-process, this is global rank 0
/// and a channel was supplied. Returns what was sent.
pub fn transfer_distrib_spawn_state_on_fit_end(
    ctx: &RunContext,
    module: &dyn TrainModule,
    results: Value,
    channel: Option<Box<dyn StateChannel>>,
) -> Result<Option<TerminationEnvelope>> {
    let spawned = ctx
        .distributed_backend
        .is_some_and(|backend| backend.transfers_state_on_fit_end());
    if !spawned || !ctx.is_global_zero() {
        return Ok(None);
    }
    let Some(channel) = channel else {
        return Ok(None);
    };

    warn!("cleaning up ddp environment...");
    let best_model_path = ctx
        .checkpoint
        .best_model_path()
        .filter(|path| !path.is_empty())
        .map(str::to_string);

    let last_path = match (&best_model_path, ctx.testing) {
        (Some(best), false) => {
            let path = last_weights_path(best);
            atomic_save(&module.state_dict()?, &path)?;
            debug!("saved last weights to {}", path);
            Some(path)
        }
        _ => None,
    };

    let envelope = TerminationEnvelope {
        best_model_path,
        results,
        last_path,
    };
    channel.send(envelope.clone())?;
    Ok(Some(envelope))
}

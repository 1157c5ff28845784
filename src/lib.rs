//! Worker bootstrap for multi-process Candle training: rank resolution,
//! sibling process spawning, process-group setup, device binding and the
//! end-of-run handshake between workers.

pub mod bootstrap;
pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod connector;
pub mod context;
pub mod device;
pub mod env;
pub mod error;
pub mod fit_loop;
pub mod launcher;
pub mod logging;
pub mod models;
pub mod module;
pub mod orchestrator;
pub mod precision;
pub mod progress;
pub mod rank;
pub mod rendezvous;
pub mod spawn;
pub mod termination;

pub use crate::collective::{Collective, LocalGroup, TcpGroup};
pub use crate::config::{DistributedBackend, GpuSpec, TrainerConfig};
pub use crate::connector::{AcceleratorConnector, SelectedBackend};
pub use crate::context::RunContext;
pub use crate::error::{OrchestratorError, ReentrantSpawnError, Result};
pub use crate::module::{DistributedModel, TrainModule};
pub use crate::orchestrator::{RunOutcome, StepRunner, TrainLoop, TrainingOrchestrator};
pub use crate::termination::{early_stop_vote, TerminationEnvelope};

use thiserror::Error;

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Raised when a process that already launched its sibling workers tries to
/// launch them again. Two coordination masters in one job corrupt the
/// rendezvous, so callers must treat this as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "You tried to run `fit` or `test` multiple times in the same process. \
     This is not supported with the `ddp` backend, switch to `ddp_spawn` instead."
)]
pub struct ReentrantSpawnError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A required environment variable or config field is missing or malformed.
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    ReentrantSpawn(#[from] ReentrantSpawnError),

    #[error("sibling processes can only be spawned from global rank 0, this process is rank {0}")]
    NotCoordinationMaster(usize),

    #[error("the process group for this worker has already been initialised")]
    AlreadyConnected,

    #[error("collective mismatch: rank {rank} issued `{found}` while rank 0 issued `{expected}`")]
    CollectiveMismatch {
        rank: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("result channel closed before the fit-end state was delivered")]
    ChannelClosed,

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

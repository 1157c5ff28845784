use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::precision::{AmpBackend, Precision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedBackend {
    /// One OS process per device; extra processes re-run the current command.
    Ddp,
    /// One worker per device, replicated inside this process.
    DdpSpawn,
    /// Like `DdpSpawn` but CPU only.
    DdpCpu,
    /// One process per node driving every visible device.
    Ddp2,
    /// Accelerator pods. Only recognised as a mode name.
    Tpu,
}

impl DistributedBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ddp => "ddp",
            Self::DdpSpawn => "ddp_spawn",
            Self::DdpCpu => "ddp_cpu",
            Self::Ddp2 => "ddp2",
            Self::Tpu => "tpu",
        }
    }

    /// Backends whose workers hand their final state back to a parent
    /// through an in-process channel.
    pub fn transfers_state_on_fit_end(&self) -> bool {
        matches!(self, Self::DdpSpawn | Self::DdpCpu | Self::Tpu)
    }
}

impl fmt::Display for DistributedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributedBackend {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ddp" => Ok(Self::Ddp),
            "ddp_spawn" | "ddp-spawn" => Ok(Self::DdpSpawn),
            "ddp_cpu" | "ddp-cpu" => Ok(Self::DdpCpu),
            "ddp2" => Ok(Self::Ddp2),
            "tpu" => Ok(Self::Tpu),
            other => Err(OrchestratorError::configuration(format!(
                "unknown distributed backend {other:?}; expected one of ddp, ddp_spawn, ddp_cpu, ddp2"
            ))),
        }
    }
}

/// Which GPUs to train on: a count (`"2"`) or an explicit id list (`"0,3"`).
/// A trailing comma forces list form, so `"3,"` means GPU 3, not three GPUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GpuSpec {
    Count(usize),
    Ids(Vec<usize>),
}

impl GpuSpec {
    pub fn device_ids(&self) -> Option<Vec<usize>> {
        let ids: Vec<usize> = match self {
            GpuSpec::Count(n) => (0..*n).collect(),
            GpuSpec::Ids(ids) => ids.clone(),
        };
        if ids.is_empty() {
            None
        } else {
            Some(ids)
        }
    }
}

impl FromStr for GpuSpec {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || {
            OrchestratorError::configuration(format!(
                "invalid GPU selection {s:?}; use a count such as \"2\" or an id list such as \"0,3\""
            ))
        };
        if s.is_empty() {
            return Ok(GpuSpec::Count(0));
        }
        if !s.contains(',') {
            return s.parse().map(GpuSpec::Count).map_err(|_| invalid());
        }
        s.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| id.parse::<usize>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()
            .map(GpuSpec::Ids)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub distributed_backend: Option<DistributedBackend>,
    pub gpus: Option<GpuSpec>,
    pub num_nodes: usize,
    pub num_processes: usize,
    pub sync_batchnorm: bool,
    pub precision: Precision,
    pub amp_backend: AmpBackend,
    pub amp_level: String,
    pub progress_bar: bool,
    pub max_epochs: usize,
    pub steps_per_epoch: usize,
    pub checkpoint_dir: PathBuf,
    /// Directory child processes start in, when a config layer has changed
    /// the working directory since launch.
    pub original_cwd: Option<PathBuf>,
    pub stagger_spawn: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            distributed_backend: None,
            gpus: None,
            num_nodes: 1,
            num_processes: 1,
            sync_batchnorm: false,
            precision: Precision::Full,
            amp_backend: AmpBackend::Native,
            amp_level: "O2".to_string(),
            progress_bar: true,
            max_epochs: 3,
            steps_per_epoch: 20,
            checkpoint_dir: PathBuf::from("checkpoints"),
            original_cwd: None,
            stagger_spawn: true,
        }
    }
}

impl TrainerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: TrainerConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Several CPU workers replicated inside one process.
    pub fn cpu_workers(num_processes: usize) -> Self {
        Self {
            distributed_backend: Some(DistributedBackend::DdpCpu),
            num_processes,
            ..Self::default()
        }
    }

    /// One OS process per GPU on a single node.
    pub fn multi_gpu(num_gpus: usize) -> Self {
        Self {
            distributed_backend: Some(DistributedBackend::Ddp),
            gpus: Some(GpuSpec::Count(num_gpus)),
            precision: Precision::Half,
            ..Self::default()
        }
    }

    pub fn num_gpus(&self) -> usize {
        self.gpus
            .as_ref()
            .and_then(GpuSpec::device_ids)
            .map_or(0, |ids| ids.len())
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(OrchestratorError::configuration("num_nodes must be at least 1"));
        }
        if self.num_processes == 0 {
            return Err(OrchestratorError::configuration(
                "num_processes must be at least 1",
            ));
        }
        if self.steps_per_epoch == 0 {
            return Err(OrchestratorError::configuration(
                "steps_per_epoch must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_spec_parses_counts_and_lists() {
        assert_eq!("2".parse::<GpuSpec>().unwrap(), GpuSpec::Count(2));
        assert_eq!("3,".parse::<GpuSpec>().unwrap(), GpuSpec::Ids(vec![3]));
        assert_eq!("0, 5".parse::<GpuSpec>().unwrap(), GpuSpec::Ids(vec![0, 5]));
        assert!("x".parse::<GpuSpec>().is_err());
        assert_eq!(GpuSpec::Count(0).device_ids(), None);
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        let config = TrainerConfig::multi_gpu(4);
        config.save(&path).unwrap();

        let loaded = TrainerConfig::load(&path).unwrap();
        assert_eq!(loaded.distributed_backend, Some(DistributedBackend::Ddp));
        assert_eq!(loaded.num_gpus(), 4);
    }

    #[test]
    fn only_spawn_family_transfers_state() {
        assert!(DistributedBackend::DdpSpawn.transfers_state_on_fit_end());
        assert!(DistributedBackend::DdpCpu.transfers_state_on_fit_end());
        assert!(DistributedBackend::Tpu.transfers_state_on_fit_end());
        assert!(!DistributedBackend::Ddp.transfers_state_on_fit_end());
        assert!(!DistributedBackend::Ddp2.transfers_state_on_fit_end());
    }
}

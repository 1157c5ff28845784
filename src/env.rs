//! Environment snapshot and the typed launch record handed to spawned workers.
//!
//! Components never touch the process environment directly: the binary takes
//! one [`EnvMap`] snapshot at startup, every component reads and writes that
//! snapshot through the run context, and spawned children receive an explicit
//! copy of it.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

pub const SLURM_LOCALID: &str = "SLURM_LOCALID";
pub const SLURM_NODEID: &str = "SLURM_NODEID";
pub const SLURM_NTASKS: &str = "SLURM_NTASKS";
pub const SLURM_JOB_NAME: &str = "SLURM_JOB_NAME";
pub const SLURM_JOB_ID: &str = "SLURM_JOB_ID";
pub const SLURM_NODELIST: &str = "SLURM_NODELIST";
pub const FAKE_SLURM_MANAGING_TASKS: &str = "FAKE_SLURM_MANAGING_TASKS";
pub const LOCAL_RANK: &str = "LOCAL_RANK";
pub const WORLD_SIZE: &str = "WORLD_SIZE";
pub const GROUP_RANK: &str = "GROUP_RANK";
pub const NODE_RANK: &str = "NODE_RANK";
pub const MASTER_ADDR: &str = "MASTER_ADDR";
pub const MASTER_PORT: &str = "MASTER_PORT";
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
pub const CUDA_DEVICE_ORDER: &str = "CUDA_DEVICE_ORDER";
/// GPU selection forwarded from the coordination master to its children.
pub const TRAINER_GPUS: &str = "DDP_TRAINER_GPUS";
/// JSON-encoded [`LaunchEnv`].
pub const LAUNCH_ENV: &str = "DDP_LAUNCH_ENV";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvMap {
    vars: BTreeMap<String, String>,
}

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment. Non UTF-8 entries are skipped.
    pub fn from_process() -> Self {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Parses `key`, returning `None` when it is unset and a configuration
    /// error carrying `hint` when it is set but malformed.
    pub fn parse<T: FromStr>(&self, key: &str, hint: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                OrchestratorError::configuration(format!(
                    "environment variable {key}={raw:?} is not valid. {hint}"
                ))
            }),
        }
    }

    /// Like [`EnvMap::parse`] but a missing variable is also an error.
    pub fn require<T: FromStr>(&self, key: &str, hint: &str) -> Result<T> {
        self.parse(key, hint)?.ok_or_else(|| {
            OrchestratorError::configuration(format!(
                "environment variable {key} is not set. {hint}"
            ))
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Everything a spawned worker needs to find its place in the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchEnv {
    pub master_addr: String,
    pub master_port: u16,
    pub node_rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub trainer_gpus: Option<String>,
}

impl LaunchEnv {
    /// Writes the record as JSON plus the conventional variables, so workers
    /// can also be started by launchers that only know the plain names.
    pub fn export(&self, env: &mut EnvMap) -> Result<()> {
        env.set(LAUNCH_ENV, serde_json::to_string(self)?);
        env.set(MASTER_ADDR, self.master_addr.clone());
        env.set(MASTER_PORT, self.master_port.to_string());
        env.set(NODE_RANK, self.node_rank.to_string());
        env.set(LOCAL_RANK, self.local_rank.to_string());
        env.set(WORLD_SIZE, self.world_size.to_string());
        match &self.trainer_gpus {
            Some(gpus) => env.set(TRAINER_GPUS, gpus.clone()),
            None => {
                env.remove(TRAINER_GPUS);
            }
        }
        Ok(())
    }

    pub fn from_env(env: &EnvMap) -> Result<Option<Self>> {
        match env.get(LAUNCH_ENV) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
                OrchestratorError::configuration(format!(
                    "{LAUNCH_ENV} is set but could not be decoded ({e}); unset it or relaunch from the coordination master"
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reports_the_offending_variable() {
        let env: EnvMap = [(LOCAL_RANK, "one")].into_iter().collect();
        let err = env.parse::<usize>(LOCAL_RANK, "expected an integer").unwrap_err();
        assert!(err.to_string().contains("LOCAL_RANK"));
        assert!(env.parse::<usize>(WORLD_SIZE, "").unwrap().is_none());
    }

    #[test]
    fn launch_env_exports_plain_variables_too() {
        let launch = LaunchEnv {
            master_addr: "10.0.0.1".into(),
            master_port: 29500,
            node_rank: 1,
            local_rank: 3,
            world_size: 8,
            trainer_gpus: Some("0,1,2,3".into()),
        };
        let mut env = EnvMap::new();
        launch.export(&mut env).unwrap();

        assert_eq!(env.get(LOCAL_RANK), Some("3"));
        assert_eq!(env.get(MASTER_PORT), Some("29500"));
        assert_eq!(LaunchEnv::from_env(&env).unwrap(), Some(launch));
    }
}

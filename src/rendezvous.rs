use std::net::{Ipv4Addr, TcpListener};

use tracing::warn;

use crate::env::{self, EnvMap};
use crate::error::{OrchestratorError, Result};

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 12910;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousAddr {
    pub addr: String,
    pub port: u16,
}

impl RendezvousAddr {
    /// Address the coordination master publishes before spawning: an
    /// operator-supplied address and port win, otherwise loopback on a port
    /// nobody is listening on.
    pub fn for_spawn(env: &EnvMap) -> Result<Self> {
        let addr = env.get_or(env::MASTER_ADDR, DEFAULT_MASTER_ADDR).to_string();
        let port = match env.parse::<u16>(env::MASTER_PORT, "expected a TCP port")? {
            Some(port) => port,
            None => find_free_network_port()?,
        };
        Ok(Self { addr, port })
    }

    /// Address used when joining the process group outside a cluster.
    pub fn generic(env: &EnvMap) -> Result<Self> {
        let addr = match env.get(env::MASTER_ADDR) {
            Some(addr) => addr.to_string(),
            None => {
                warn!("MASTER_ADDR environment variable is not defined. Set as localhost");
                DEFAULT_MASTER_ADDR.to_string()
            }
        };
        let port = env
            .parse::<u16>(env::MASTER_PORT, "expected a TCP port")?
            .unwrap_or(DEFAULT_MASTER_PORT);
        Ok(Self { addr, port })
    }

    /// Address derived from the scheduler allocation: the first node of the
    /// job's node list, on a port keyed by the job id so concurrent jobs on
    /// a shared node do not collide.
    pub fn cluster(env: &EnvMap) -> Result<Self> {
        let port = match env.get(env::SLURM_JOB_ID) {
            Some(job_id) => {
                let digits: String = job_id.chars().filter(char::is_ascii_digit).collect();
                let tail = &digits[digits.len().saturating_sub(4)..];
                let tail: u16 = tail.parse().map_err(|_| {
                    OrchestratorError::configuration(format!(
                        "SLURM_JOB_ID={job_id:?} does not end in digits"
                    ))
                })?;
                tail + 15000
            }
            None => DEFAULT_MASTER_PORT,
        };
        let addr = match env.get(env::SLURM_NODELIST) {
            Some(nodes) => resolve_root_node_address(nodes),
            None => DEFAULT_MASTER_ADDR.to_string(),
        };
        Ok(Self { addr, port })
    }

    pub fn export(&self, env: &mut EnvMap) {
        env.set(env::MASTER_ADDR, self.addr.clone());
        env.set(env::MASTER_PORT, self.port.to_string());
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Asks the OS for a port that is free right now.
pub fn find_free_network_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// First host of a scheduler node list such as `node[07-09,12]`.
pub fn resolve_root_node_address(root_node: &str) -> String {
    match root_node.split_once('[') {
        None => root_node.to_string(),
        Some((name, numbers)) => {
            let first = numbers.split(',').next().unwrap_or_default();
            let first = first.split('-').next().unwrap_or_default();
            let digits: String = first.chars().filter(char::is_ascii_digit).collect();
            format!("{name}{digits}")
        }
    }
}

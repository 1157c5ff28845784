//! Process-group initialisation.

use std::sync::Arc;

use tracing::info;

use crate::collective::{Collective, TcpGroup};
use crate::error::{OrchestratorError, Result};
use crate::module::{ConnectionRequest, TrainModule};
use crate::rendezvous::RendezvousAddr;

/// What `TrainModule::init_ddp_connection` does unless a module overrides it.
pub fn default_connection(request: &ConnectionRequest<'_>) -> Result<Arc<dyn Collective>> {
    if let Some(group) = &request.in_process {
        return Ok(Arc::clone(group));
    }
    let rendezvous = if request.is_cluster_managed {
        RendezvousAddr::cluster(request.env)?
    } else {
        RendezvousAddr::generic(request.env)?
    };
    info!(
        "initializing ddp: GLOBAL_RANK: {}, MEMBER: {}/{}, rendezvous {}",
        request.global_rank,
        request.global_rank + 1,
        request.world_size,
        rendezvous.socket_addr()
    );
    let group = TcpGroup::join(&rendezvous.socket_addr(), request.global_rank, request.world_size)?;
    Ok(Arc::new(group))
}

/// Makes sure the module hook runs once per process.
#[derive(Debug, Default)]
pub struct ConnectionBootstrapper {
    connected: bool,
}

impl ConnectionBootstrapper {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect(
        &mut self,
        module: &mut dyn TrainModule,
        request: &ConnectionRequest<'_>,
    ) -> Result<Arc<dyn Collective>> {
        if self.connected {
            return Err(OrchestratorError::AlreadyConnected);
        }
        let group = module.init_ddp_connection(request)?;
        if group.world_size() != request.world_size || group.rank() != request.global_rank {
            return Err(OrchestratorError::configuration(format!(
                "process group reports rank {}/{} but this worker is rank {}/{}",
                group.rank(),
                group.world_size(),
                request.global_rank,
                request.world_size
            )));
        }
        self.connected = true;
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::thread;

    use candle_core::{Device, Tensor};

    use super::*;
    use crate::collective::LocalGroup;
    use crate::env::{self, EnvMap};
    use crate::module::{OptimizerSetup, StepOutput};

    struct Inert;

    impl TrainModule for Inert {
        fn name(&self) -> &str {
            "inert"
        }
        fn to_device(&mut self, _device: &Device) -> Result<()> {
            Ok(())
        }
        fn configure_optimizers(&mut self) -> Result<OptimizerSetup> {
            Ok(OptimizerSetup::default())
        }
        fn forward(&self, batch: &[Tensor]) -> Result<StepOutput> {
            Ok(StepOutput::Tensor(batch[0].clone()))
        }
        fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
            Ok(HashMap::new())
        }
        fn load_state_dict(&mut self, _weights: HashMap<String, Tensor>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn second_connection_is_rejected() {
        let env = EnvMap::new();
        let request = ConnectionRequest {
            global_rank: 0,
            world_size: 1,
            is_cluster_managed: false,
            env: &env,
            in_process: Some(Arc::new(LocalGroup::solo())),
        };
        let mut bootstrapper = ConnectionBootstrapper::default();
        let mut module = Inert;
        bootstrapper.connect(&mut module, &request).unwrap();
        assert!(bootstrapper.is_connected());
        assert!(matches!(
            bootstrapper.connect(&mut module, &request),
            Err(OrchestratorError::AlreadyConnected)
        ));
    }

    #[test]
    fn generic_rendezvous_joins_over_tcp() {
        let port = crate::rendezvous::find_free_network_port().unwrap();
        let env: EnvMap = [(env::MASTER_ADDR, "127.0.0.1".to_string()), (env::MASTER_PORT, port.to_string())]
            .into_iter()
            .collect();

        let sums: Vec<i64> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    let env = &env;
                    s.spawn(move || {
                        let request = ConnectionRequest {
                            global_rank: rank,
                            world_size: 2,
                            is_cluster_managed: false,
                            env,
                            in_process: None,
                        };
                        let group = ConnectionBootstrapper::default()
                            .connect(&mut Inert, &request)
                            .unwrap();
                        group.all_reduce_sum(rank as i64 + 1).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(sums, vec![3, 3]);
    }

    #[test]
    fn mismatched_group_is_a_configuration_error() {
        let env = EnvMap::new();
        let request = ConnectionRequest {
            global_rank: 1,
            world_size: 2,
            is_cluster_managed: false,
            env: &env,
            in_process: Some(Arc::new(LocalGroup::solo())),
        };
        let result = ConnectionBootstrapper::default().connect(&mut Inert, &request);
        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
    }
}

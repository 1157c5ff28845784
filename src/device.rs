use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::env::{self, EnvMap};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accelerator {
    Cuda,
    Metal,
    Cpu,
}

impl Accelerator {
    /// The accelerator this build was compiled for.
    pub fn compiled() -> Self {
        if cfg!(feature = "cuda") {
            Accelerator::Cuda
        } else if cfg!(feature = "metal") {
            Accelerator::Metal
        } else {
            Accelerator::Cpu
        }
    }
}

/// Entries of `CUDA_VISIBLE_DEVICES`, in order, empty ones dropped.
pub fn visible_devices(env: &EnvMap) -> Vec<String> {
    env.get(env::CUDA_VISIBLE_DEVICES)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub logical_index: usize,
    pub physical_device_id: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceBinder {
    accelerator: Accelerator,
}

impl Default for DeviceBinder {
    fn default() -> Self {
        Self::new(Accelerator::compiled())
    }
}

impl DeviceBinder {
    pub fn new(accelerator: Accelerator) -> Self {
        Self { accelerator }
    }

    pub fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    /// The coordination master looks its device up in the visible list;
    /// every other worker uses its process index directly, since its
    /// visible list was already narrowed by whoever launched it.
    pub fn assign(&self, is_master: bool, process_idx: usize, visible: &[String]) -> Result<DeviceAssignment> {
        if !is_master {
            return Ok(DeviceAssignment {
                logical_index: process_idx,
                physical_device_id: process_idx,
            });
        }
        let raw = visible.get(process_idx).ok_or_else(|| {
            OrchestratorError::configuration(format!(
                "local rank {} has no entry in CUDA_VISIBLE_DEVICES ({} visible); \
                 request fewer processes or expose more devices",
                process_idx,
                visible.len()
            ))
        })?;
        let physical_device_id = raw.parse().map_err(|_| {
            OrchestratorError::configuration(format!(
                "CUDA_VISIBLE_DEVICES entry {raw:?} is not a device index"
            ))
        })?;
        debug!("local rank {} -> physical device {}", process_idx, physical_device_id);
        Ok(DeviceAssignment {
            logical_index: process_idx,
            physical_device_id,
        })
    }

    pub fn bind(&self, assignment: &DeviceAssignment) -> Result<Device> {
        let device = match self.accelerator {
            Accelerator::Cuda => Device::new_cuda(assignment.physical_device_id)?,
            Accelerator::Metal => Device::new_metal(assignment.physical_device_id)?,
            Accelerator::Cpu => Device::Cpu,
        };
        info!(
            "🖥️  bound worker {} to {:?} device {}",
            assignment.logical_index, self.accelerator, assignment.physical_device_id
        );
        Ok(device)
    }

    /// Flushes pending work on `device` so its memory can be reclaimed.
    pub fn release_cache(device: &Device) -> Result<()> {
        device.synchronize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn master_indexes_into_visible_devices() {
        let binder = DeviceBinder::new(Accelerator::Cpu);
        let visible = ids(&["2", "5"]);
        assert_eq!(binder.assign(true, 1, &visible).unwrap().physical_device_id, 5);
        assert_eq!(binder.assign(false, 1, &visible).unwrap().physical_device_id, 1);
    }

    #[test]
    fn master_rejects_short_or_garbled_lists() {
        let binder = DeviceBinder::new(Accelerator::Cpu);
        assert!(binder.assign(true, 2, &ids(&["0", "1"])).is_err());
        assert!(binder.assign(true, 0, &ids(&["GPU-abc"])).is_err());
    }

    #[test]
    fn visible_list_ignores_trailing_comma() {
        let env: EnvMap = [(env::CUDA_VISIBLE_DEVICES, "3,")].into_iter().collect();
        assert_eq!(visible_devices(&env), ids(&["3"]));
        assert!(visible_devices(&EnvMap::new()).is_empty());
    }

    #[test]
    fn cpu_binding_is_always_available() {
        let binder = DeviceBinder::new(Accelerator::Cpu);
        let device = binder
            .bind(&DeviceAssignment {
                logical_index: 0,
                physical_device_id: 0,
            })
            .unwrap();
        assert!(device.is_cpu());
        DeviceBinder::release_cache(&device).unwrap();
    }
}

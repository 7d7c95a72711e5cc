use burn::tensor::backend::Backend;
use clap::ValueEnum;
use thiserror::Error;
use tracing::info;

use crate::TrainBackend;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("replication needs at least one accelerator; only gpu mode is supported")]
    NoAccelerators,
    #[error("invalid number of accelerators: requested {requested}, available {available}")]
    NotEnough { requested: usize, available: usize },
}

/// Devices available to the wrapper: a host device plus zero or more accelerators.
#[derive(Debug, Clone)]
pub struct DevicePool<D> {
    primary: D,
    accelerators: Vec<D>,
}

impl<D: Clone> DevicePool<D> {
    pub fn new(primary: D, accelerators: Vec<D>) -> Self {
        Self {
            primary,
            accelerators,
        }
    }

    pub fn cpu_only(primary: D) -> Self {
        Self::new(primary, Vec::new())
    }

    pub fn primary(&self) -> &D {
        &self.primary
    }

    pub fn accelerator_count(&self) -> usize {
        self.accelerators.len()
    }

    /// Default accelerator, or the host device when the pool has none.
    pub fn accelerator(&self) -> D {
        self.accelerators
            .first()
            .cloned()
            .unwrap_or_else(|| self.primary.clone())
    }

    pub fn select(&self, cpu: bool) -> D {
        if cpu {
            self.primary.clone()
        } else {
            self.accelerator()
        }
    }

    /// The first `requested` accelerators, for replication.
    pub fn replicas(&self, requested: usize) -> Result<Vec<D>, DeviceError> {
        if requested == 0 {
            return Err(DeviceError::NoAccelerators);
        }
        if self.accelerators.len() < requested {
            return Err(DeviceError::NotEnough {
                requested,
                available: self.accelerators.len(),
            });
        }
        Ok(self.accelerators[..requested].to_vec())
    }
}

impl<D: Clone + Default> Default for DevicePool<D> {
    fn default() -> Self {
        Self::cpu_only(D::default())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            info!("built with backend-wgpu; the WGPU backend is used despite --backend nd-array");
        }
        _ => {}
    }
    Ok(())
}

pub type TrainDevice = <TrainBackend as Backend>::Device;

/// Device pool for [`TrainBackend`]: discrete GPUs `0..n_gpus` under WGPU, host only otherwise.
#[cfg(feature = "backend-wgpu")]
pub fn default_device_pool(n_gpus: usize) -> DevicePool<TrainDevice> {
    use burn_wgpu::WgpuDevice;
    DevicePool::new(
        WgpuDevice::Cpu,
        (0..n_gpus).map(WgpuDevice::DiscreteGpu).collect(),
    )
}

#[cfg(not(feature = "backend-wgpu"))]
pub fn default_device_pool(_n_gpus: usize) -> DevicePool<TrainDevice> {
    DevicePool::cpu_only(burn_ndarray::NdArrayDevice::Cpu)
}

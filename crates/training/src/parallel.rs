//! Batch-splitting replication across devices.
//!
//! [`DataParallel`] keeps one master copy of a module. Each forward scatters the batch along
//! dimension 0, moves a replica of the master onto every device with `Module::to_device`
//! (differentiable, so gradients flow back to the master parameters), runs the chunks and
//! gathers the outputs back on the first device.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::device::DeviceError;

/// Access to the model behind a placement wrapper.
pub trait Unwrappable<M> {
    fn inner(&self) -> &M;
    fn inner_mut(&mut self) -> &mut M;
    fn into_inner(self) -> M;
}

/// Outputs that can be concatenated back from per-device chunks.
pub trait Gather<B: Backend>: Sized {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self;
}

impl<B: Backend, const D: usize> Gather<B> for Tensor<B, D> {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self {
        let parts = parts
            .into_iter()
            .map(|part| part.to_device(device))
            .collect();
        Tensor::cat(parts, 0)
    }
}

impl<B: Backend, T: Gather<B>> Gather<B> for Vec<T> {
    fn gather(parts: Vec<Self>, device: &B::Device) -> Self {
        let width = parts.first().map(Vec::len).unwrap_or(0);
        let mut columns: Vec<Vec<T>> = (0..width).map(|_| Vec::with_capacity(parts.len())).collect();
        for part in parts {
            for (column, item) in columns.iter_mut().zip(part) {
                column.push(item);
            }
        }
        columns
            .into_iter()
            .map(|column| T::gather(column, device))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DataParallel<B: Backend, M> {
    module: M,
    devices: Vec<B::Device>,
}

impl<B: Backend, M: Module<B>> DataParallel<B, M> {
    /// Replicate `module` over `devices`; the first device holds the master copy.
    pub fn new(module: M, devices: Vec<B::Device>) -> Result<Self, DeviceError> {
        let Some(first) = devices.first() else {
            return Err(DeviceError::NoAccelerators);
        };
        let module = module.to_device(first);
        Ok(Self { module, devices })
    }

    pub fn devices(&self) -> &[B::Device] {
        &self.devices
    }

    pub fn output_device(&self) -> &B::Device {
        &self.devices[0]
    }

    /// Run `forward` over the batch split across devices.
    pub fn run<O, F>(&self, input: Tensor<B, 4>, forward: F) -> O
    where
        O: Gather<B>,
        F: Fn(&M, Tensor<B, 4>) -> O,
    {
        let batch = input.dims()[0];
        let shards = self.devices.len().min(batch).max(1);
        if shards == 1 {
            return forward(&self.module, input.to_device(self.output_device()));
        }
        let outputs = input
            .chunk(shards, 0)
            .into_iter()
            .zip(&self.devices)
            .map(|(chunk, device)| {
                let replica = self.module.clone().to_device(device);
                forward(&replica, chunk.to_device(device))
            })
            .collect();
        O::gather(outputs, self.output_device())
    }

    pub fn map<F: FnOnce(M) -> M>(self, f: F) -> Self {
        Self {
            module: f(self.module),
            devices: self.devices,
        }
    }
}

impl<B: Backend, M> Unwrappable<M> for DataParallel<B, M> {
    fn inner(&self) -> &M {
        &self.module
    }

    fn inner_mut(&mut self) -> &mut M {
        &mut self.module
    }

    fn into_inner(self) -> M {
        self.module
    }
}

/// A model as placed by the wrapper: directly on one device, or behind a replication proxy.
#[derive(Debug, Clone)]
pub enum ModelHandle<B: Backend, M> {
    Single(M),
    Replicated(DataParallel<B, M>),
}

impl<B: Backend, M: Module<B>> ModelHandle<B, M> {
    pub fn replicate(self, devices: Vec<B::Device>) -> Result<Self, DeviceError> {
        let module = self.into_inner();
        Ok(Self::Replicated(DataParallel::new(module, devices)?))
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, Self::Replicated(_))
    }

    pub fn run<O, F>(&self, input: Tensor<B, 4>, forward: F) -> O
    where
        O: Gather<B>,
        F: Fn(&M, Tensor<B, 4>) -> O,
    {
        match self {
            Self::Single(module) => forward(module, input),
            Self::Replicated(proxy) => proxy.run(input, forward),
        }
    }

    pub fn map<F: FnOnce(M) -> M>(self, f: F) -> Self {
        match self {
            Self::Single(module) => Self::Single(f(module)),
            Self::Replicated(proxy) => Self::Replicated(proxy.map(f)),
        }
    }
}

impl<B: Backend, M> Unwrappable<M> for ModelHandle<B, M> {
    fn inner(&self) -> &M {
        match self {
            Self::Single(module) => module,
            Self::Replicated(proxy) => proxy.inner(),
        }
    }

    fn inner_mut(&mut self) -> &mut M {
        match self {
            Self::Single(module) => module,
            Self::Replicated(proxy) => proxy.inner_mut(),
        }
    }

    fn into_inner(self) -> M {
        match self {
            Self::Single(module) => module,
            Self::Replicated(proxy) => proxy.into_inner(),
        }
    }
}

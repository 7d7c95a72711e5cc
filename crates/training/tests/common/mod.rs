#![allow(dead_code)]

use burn::backend::Autodiff;
use burn::tensor::Tensor;
use burn_ndarray::{NdArray, NdArrayDevice};
use models::{NetworkOptions, ParamTensor, StateDict};
use training::{DevicePool, ExperimentLog, ModelOptions};

pub type TestBackend = Autodiff<NdArray<f32>>;

pub fn small_options() -> ModelOptions {
    ModelOptions {
        network: NetworkOptions {
            scale: vec![2, 4],
            n_colors: 3,
            n_feats: 4,
            n_blocks: 2,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn cpu_pool() -> DevicePool<NdArrayDevice> {
    DevicePool::cpu_only(NdArrayDevice::Cpu)
}

/// Host device plus two accelerator slots, both backed by the CPU.
pub fn two_device_pool() -> DevicePool<NdArrayDevice> {
    DevicePool::new(NdArrayDevice::Cpu, vec![NdArrayDevice::Cpu, NdArrayDevice::Cpu])
}

pub fn open_log(dir: &std::path::Path) -> ExperimentLog {
    ExperimentLog::open(dir).unwrap()
}

pub fn ramp(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
    let n: usize = shape.iter().product();
    Tensor::<TestBackend, 1, burn::tensor::Int>::arange(0..n as i64, &NdArrayDevice::Cpu)
        .float()
        .reshape(shape)
        .div_scalar(n as f32)
}

pub fn filled_like(dict: &StateDict, value: f32) -> StateDict {
    dict.iter()
        .map(|(key, tensor)| (key.clone(), ParamTensor::filled(tensor.shape.clone(), value)))
        .collect()
}

pub fn all_equal(tensor: &ParamTensor, value: f32) -> bool {
    tensor.values.iter().all(|v| *v == value)
}

pub fn max_abs_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
    let a = a.into_data().to_vec::<f32>().unwrap();
    let b = b.into_data().to_vec::<f32>().unwrap();
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(&b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

//! Named parameter export/import for Burn modules.
//!
//! Checkpoints are keyed the way the reference training code keys them: dot-separated paths
//! such as `up_blocks.0.3.body.0.weight`. Burn records are typed and positional, so the
//! modules in this crate describe their own parameter paths through [`NamedParams`], and the
//! resulting [`StateDict`] is what checkpoint IO, migration and non-strict loading work on.

use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

use burn::module::{Module, ModuleVisitor, Param, ParamId};
use burn::nn::conv::Conv2d;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use thiserror::Error;
use tracing::debug;

pub type StateDictResult<T> = Result<T, StateDictError>;

#[derive(Debug, Error)]
pub enum StateDictError {
    #[error("parameter {key}: checkpoint shape {found:?} does not match model shape {expected:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("parameter {key}: {len} values cannot fill shape {shape:?}")]
    ValueCount {
        key: String,
        shape: Vec<usize>,
        len: usize,
    },
    #[error("parameter {key}: tensor data is not readable as f32 ({msg})")]
    Data { key: String, msg: String },
    #[error("strict load failed: missing keys {missing:?}, unexpected keys {unexpected:?}")]
    Strict {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
}

/// Host copy of a single parameter tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    /// Constant-filled tensor; handy for fixtures and migration checks.
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            values: vec![value; len],
        }
    }

    pub fn numel(&self) -> usize {
        self.values.len()
    }

    pub fn from_tensor<B: Backend, const D: usize>(
        key: &str,
        tensor: &Tensor<B, D>,
    ) -> StateDictResult<Self> {
        let data = tensor.to_data().convert::<f32>();
        let shape = data.shape.clone();
        let values = data.to_vec::<f32>().map_err(|err| StateDictError::Data {
            key: key.to_string(),
            msg: format!("{err:?}"),
        })?;
        Ok(Self { shape, values })
    }

    pub fn to_tensor<B: Backend, const D: usize>(
        &self,
        key: &str,
        device: &B::Device,
    ) -> StateDictResult<Tensor<B, D>> {
        let expected: usize = self.shape.iter().product();
        if self.shape.len() != D || expected != self.values.len() {
            return Err(StateDictError::ValueCount {
                key: key.to_string(),
                shape: self.shape.clone(),
                len: self.values.len(),
            });
        }
        let data = TensorData::new(self.values.clone(), self.shape.clone());
        Ok(Tensor::from_data(data, device))
    }
}

/// Ordered mapping from parameter path to tensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    entries: BTreeMap<String, ParamTensor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ParamTensor> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: ParamTensor) -> Option<ParamTensor> {
        self.entries.insert(key.into(), tensor)
    }

    /// Overwrites every key present in `patch`, keeping all other entries.
    pub fn update(&mut self, patch: StateDict) {
        self.entries.extend(patch.entries);
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ParamTensor> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Keys in module order: segments compare numerically when both are integers, so
    /// `up_blocks.0.2` sorts before `up_blocks.0.10`.
    pub fn keys_in_module_order(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_by(|a, b| module_order(a, b));
        keys
    }
}

impl FromIterator<(String, ParamTensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, ParamTensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for StateDict {
    type Item = (String, ParamTensor);
    type IntoIter = btree_map::IntoIter<String, ParamTensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a StateDict {
    type Item = (&'a String, &'a ParamTensor);
    type IntoIter = btree_map::Iter<'a, String, ParamTensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Compare two parameter paths segment by segment, numerically where possible.
pub fn module_order(a: &str, b: &str) -> Ordering {
    let mut lhs = a.split('.');
    let mut rhs = b.split('.');
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Join a module prefix and a child name into a parameter path.
pub fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Keys that did not line up during a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Model parameters with no entry in the checkpoint (left untouched).
    pub missing_keys: Vec<String>,
    /// Checkpoint entries the model has no parameter for (ignored).
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

/// Source of parameter values during an import; tracks what was consumed.
pub struct ParamSource<'a> {
    dict: &'a StateDict,
    consumed: BTreeSet<String>,
    missing: Vec<String>,
}

impl<'a> ParamSource<'a> {
    pub fn new(dict: &'a StateDict) -> Self {
        Self {
            dict,
            consumed: BTreeSet::new(),
            missing: Vec::new(),
        }
    }

    /// Replace `param` with the checkpoint value at `key`, or return it unchanged when the
    /// checkpoint has no such key.
    pub fn take<B: Backend, const D: usize>(
        &mut self,
        key: String,
        param: Param<Tensor<B, D>>,
    ) -> StateDictResult<Param<Tensor<B, D>>> {
        let Some(stored) = self.dict.get(&key) else {
            self.missing.push(key);
            return Ok(param);
        };
        let current = param.val();
        let expected = current.dims().to_vec();
        if stored.shape != expected {
            return Err(StateDictError::ShapeMismatch {
                key,
                expected,
                found: stored.shape.clone(),
            });
        }
        let trainable = current.is_require_grad();
        let tensor = stored.to_tensor::<B, D>(&key, &current.device())?;
        self.consumed.insert(key);
        Ok(Param::initialized(param.id, tensor.set_require_grad(trainable)))
    }

    pub fn finish(self) -> LoadReport {
        let unexpected_keys = self
            .dict
            .keys()
            .filter(|key| !self.consumed.contains(*key))
            .map(str::to_string)
            .collect();
        LoadReport {
            missing_keys: self.missing,
            unexpected_keys,
        }
    }
}

struct TrainableCount(usize);

impl<B: Backend> ModuleVisitor<B> for TrainableCount {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        if tensor.is_require_grad() {
            self.0 += tensor.shape().num_elements();
        }
    }
}

/// Number of float parameters that take part in gradient computation. Frozen parameters and
/// every parameter on a backend without autodiff count as zero.
pub fn trainable_params<B: Backend, M: Module<B>>(module: &M) -> usize {
    let mut count = TrainableCount(0);
    module.visit(&mut count);
    count.0
}

/// Modules that can describe their parameters by hierarchical path.
pub trait NamedParams<B: Backend>: Sized {
    /// Write every parameter under `prefix` into `dict`.
    fn export_params(&self, prefix: &str, dict: &mut StateDict) -> StateDictResult<()>;

    /// Replace every parameter under `prefix` that `source` holds.
    fn import_params(self, prefix: &str, source: &mut ParamSource<'_>) -> StateDictResult<Self>;

    fn state_dict(&self) -> StateDictResult<StateDict> {
        let mut dict = StateDict::new();
        self.export_params("", &mut dict)?;
        Ok(dict)
    }

    /// Load `dict` into the module.
    ///
    /// Non-strict loads ignore checkpoint keys the module does not have and leave module
    /// parameters the checkpoint does not mention at their current values. A shape mismatch on
    /// a shared key is an error either way.
    fn load_state_dict(self, dict: &StateDict, strict: bool) -> StateDictResult<(Self, LoadReport)> {
        let mut source = ParamSource::new(dict);
        let module = self.import_params("", &mut source)?;
        let report = source.finish();
        if strict && !report.is_exact() {
            return Err(StateDictError::Strict {
                missing: report.missing_keys,
                unexpected: report.unexpected_keys,
            });
        }
        if !report.is_exact() {
            debug!(
                missing = report.missing_keys.len(),
                unexpected = report.unexpected_keys.len(),
                "non-strict load skipped keys"
            );
        }
        Ok((module, report))
    }

    /// Type name followed by one `key [shape]` line per parameter.
    fn describe(&self) -> StateDictResult<String> {
        let dict = self.state_dict()?;
        let mut out = format!("{}(\n", std::any::type_name::<Self>());
        for key in dict.keys_in_module_order() {
            if let Some(tensor) = dict.get(key) {
                out.push_str(&format!("  {key} {:?}\n", tensor.shape));
            }
        }
        out.push(')');
        Ok(out)
    }
}

impl<B: Backend> NamedParams<B> for Conv2d<B> {
    fn export_params(&self, prefix: &str, dict: &mut StateDict) -> StateDictResult<()> {
        let key = join_key(prefix, "weight");
        dict.insert(key.clone(), ParamTensor::from_tensor(&key, &self.weight.val())?);
        if let Some(bias) = &self.bias {
            let key = join_key(prefix, "bias");
            dict.insert(key.clone(), ParamTensor::from_tensor(&key, &bias.val())?);
        }
        Ok(())
    }

    fn import_params(mut self, prefix: &str, source: &mut ParamSource<'_>) -> StateDictResult<Self> {
        self.weight = source.take(join_key(prefix, "weight"), self.weight)?;
        self.bias = match self.bias {
            Some(bias) => Some(source.take(join_key(prefix, "bias"), bias)?),
            None => None,
        };
        Ok(self)
    }
}

/// Export each element of a sequence under `prefix.{index}`.
pub fn export_seq<B: Backend, M: NamedParams<B>>(
    items: &[M],
    prefix: &str,
    dict: &mut StateDict,
) -> StateDictResult<()> {
    for (idx, item) in items.iter().enumerate() {
        item.export_params(&join_key(prefix, &idx.to_string()), dict)?;
    }
    Ok(())
}

pub fn import_seq<B: Backend, M: NamedParams<B>>(
    items: Vec<M>,
    prefix: &str,
    source: &mut ParamSource<'_>,
) -> StateDictResult<Vec<M>> {
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| item.import_params(&join_key(prefix, &idx.to_string()), source))
        .collect()
}

//! The model wrapper: one primary network plus one dual network per scale, placed on a device
//! (or replicated across several), with checkpoint load/migrate/save.

use std::io::Write;
use std::path::Path;

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use models::{
    trainable_params, DownBlock, Drn, DualNetwork, LoadReport, SrNetwork, StateDict, StateDictError,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checkpoint::{
    self, CheckpointError, CheckpointKind, CheckpointNaming, CheckpointPaths,
};
use crate::device::{DeviceError, DevicePool};
use crate::experiment::{ExperimentError, ExperimentLog};
use crate::migrate::migrate;
use crate::options::ModelOptions;
use crate::parallel::{ModelHandle, Unwrappable};

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("no scales configured; at least one scale is required")]
    NoScales,
    #[error("dual model index {index} out of range ({len} dual models)")]
    DualIndex { index: usize, len: usize },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    StateDict(#[from] StateDictError),
    #[error(transparent)]
    Log(#[from] ExperimentError),
}

pub type WrapperResult<T> = Result<T, WrapperError>;

/// Dual downsampling factor for a scale ladder starting at `first_scale`.
pub fn downsample_factor(first_scale: usize) -> usize {
    if first_scale % 2 == 0 {
        2
    } else {
        3
    }
}

/// Flip/transpose variant used by the self-ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    flip_w: bool,
    flip_h: bool,
    transpose: bool,
}

impl Geometry {
    fn all() -> Vec<Geometry> {
        let mut out = Vec::with_capacity(8);
        for transpose in [false, true] {
            for flip_h in [false, true] {
                for flip_w in [false, true] {
                    out.push(Geometry {
                        flip_w,
                        flip_h,
                        transpose,
                    });
                }
            }
        }
        out
    }

    fn apply<B: Backend>(self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.flip_w { x.flip([3]) } else { x };
        let x = if self.flip_h { x.flip([2]) } else { x };
        if self.transpose {
            x.swap_dims(2, 3)
        } else {
            x
        }
    }

    fn invert<B: Backend>(self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.transpose { x.swap_dims(2, 3) } else { x };
        let x = if self.flip_h { x.flip([2]) } else { x };
        if self.flip_w {
            x.flip([3])
        } else {
            x
        }
    }
}

#[derive(Debug)]
pub struct ModelWrapper<B: Backend, P = Drn<B>, D = DownBlock<B>> {
    options: ModelOptions,
    idx_scale: usize,
    device: B::Device,
    model: ModelHandle<B, P>,
    dual_models: Vec<ModelHandle<B, D>>,
}

impl<B, P, D> ModelWrapper<B, P, D>
where
    B: Backend,
    P: SrNetwork<B>,
    D: DualNetwork<B>,
{
    /// Build the primary and dual networks, replicate them when configured, load the configured
    /// checkpoints and log the model summary.
    pub fn new(
        options: ModelOptions,
        pool: &DevicePool<B::Device>,
        log: &mut ExperimentLog,
    ) -> WrapperResult<Self> {
        info!("Making model...");
        let first_scale = *options.scale().first().ok_or(WrapperError::NoScales)?;
        let factor = downsample_factor(first_scale);
        let device = pool.select(options.cpu);

        let mut model = ModelHandle::Single(P::build(&options.network, &device));
        let mut dual_models: Vec<ModelHandle<B, D>> = options
            .scale()
            .iter()
            .map(|_| ModelHandle::Single(D::build(&options.network, factor, &device)))
            .collect();

        if options.wants_replication() {
            let devices = pool.replicas(options.n_gpus)?;
            info!(devices = devices.len(), "replicating models");
            model = model.replicate(devices.clone())?;
            dual_models = dual_models
                .into_iter()
                .map(|dual| dual.replicate(devices.clone()))
                .collect::<Result<_, _>>()?;
        }

        let paths = options.checkpoint_paths();
        let mut wrapper = Self {
            options,
            idx_scale: 0,
            device,
            model,
            dual_models,
        };
        wrapper.load(&paths)?;

        if !wrapper.options.test_only {
            wrapper.write_summary(log)?;
        }

        let num_parameter = wrapper.count_parameters(wrapper.get_model());
        log.write_log(&format!(
            "The number of parameters is {:.2}M",
            num_parameter as f64 / 1000f64.powi(2)
        ))?;
        Ok(wrapper)
    }

    fn write_summary(&self, log: &mut ExperimentLog) -> WrapperResult<()> {
        let mut text = self.get_model().describe()?;
        text.push('\n');
        for dual in &self.dual_models {
            text.push_str(&dual.inner().describe()?);
            text.push('\n');
        }
        let path = log.log_path();
        log.log_file()
            .write_all(text.as_bytes())
            .map_err(|source| ExperimentError::Io { path, source })?;
        Ok(())
    }

    /// Run the primary network at `idx_scale`.
    pub fn forward(&mut self, input: Tensor<B, 4>, idx_scale: usize) -> Vec<Tensor<B, 4>> {
        self.idx_scale = idx_scale;
        if let Some(selector) = self.model.inner_mut().scale_selector() {
            selector.set_scale(idx_scale);
        }
        self.model
            .run(input, |model, x| SrNetwork::forward(model, x))
    }

    /// Average of the eight flip/transpose variants of `input`, mapped back to the input
    /// orientation.
    pub fn forward_ensemble(&mut self, input: Tensor<B, 4>, idx_scale: usize) -> Vec<Tensor<B, 4>> {
        let variants = Geometry::all();
        let count = variants.len() as f32;
        let mut sums: Option<Vec<Tensor<B, 4>>> = None;
        for geometry in variants {
            let outputs = self.forward(geometry.apply(input.clone()), idx_scale);
            let restored: Vec<Tensor<B, 4>> =
                outputs.into_iter().map(|out| geometry.invert(out)).collect();
            sums = Some(match sums {
                None => restored,
                Some(acc) => acc.into_iter().zip(restored).map(|(a, b)| a + b).collect(),
            });
        }
        sums.unwrap_or_default()
            .into_iter()
            .map(|sum| sum.div_scalar(count))
            .collect()
    }

    /// Self-ensemble in test mode when enabled, plain forward otherwise.
    pub fn forward_auto(&mut self, input: Tensor<B, 4>, idx_scale: usize) -> Vec<Tensor<B, 4>> {
        if self.options.self_ensemble && self.options.test_only {
            self.forward_ensemble(input, idx_scale)
        } else {
            self.forward(input, idx_scale)
        }
    }

    pub fn dual_forward(&self, idx: usize, input: Tensor<B, 4>) -> WrapperResult<Tensor<B, 4>> {
        let handle = self.dual_models.get(idx).ok_or(WrapperError::DualIndex {
            index: idx,
            len: self.dual_models.len(),
        })?;
        Ok(handle.run(input, |model, x| DualNetwork::forward(model, x)))
    }

    pub fn get_model(&self) -> &P {
        self.model.inner()
    }

    pub fn get_model_mut(&mut self) -> &mut P {
        self.model.inner_mut()
    }

    pub fn get_dual_model(&self, idx: usize) -> Option<&D> {
        self.dual_models.get(idx).map(Unwrappable::inner)
    }

    pub fn model_handle(&self) -> &ModelHandle<B, P> {
        &self.model
    }

    pub fn dual_handle(&self, idx: usize) -> Option<&ModelHandle<B, D>> {
        self.dual_models.get(idx)
    }

    pub fn dual_models_len(&self) -> usize {
        self.dual_models.len()
    }

    pub fn is_replicated(&self) -> bool {
        self.model.is_replicated()
    }

    pub fn idx_scale(&self) -> usize {
        self.idx_scale
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn state_dict(&self) -> WrapperResult<StateDict> {
        Ok(self.get_model().state_dict()?)
    }

    /// Number of parameters that require gradients. Zero on a backend without autodiff.
    pub fn count_parameters<M: Module<B>>(&self, model: &M) -> usize {
        trainable_params(model)
    }

    /// Replace the primary network, e.g. with the result of an optimizer step.
    pub fn map_model<F: FnOnce(P) -> P>(mut self, f: F) -> Self {
        self.model = self.model.map(f);
        self
    }

    pub fn map_dual_model<F: FnOnce(D) -> D>(mut self, idx: usize, f: F) -> WrapperResult<Self> {
        let len = self.dual_models.len();
        if idx >= len {
            return Err(WrapperError::DualIndex { index: idx, len });
        }
        let handle = self.dual_models.remove(idx);
        self.dual_models.insert(idx, handle.map(f));
        Ok(self)
    }

    pub fn checkpoint_naming(&self) -> WrapperResult<CheckpointNaming> {
        self.options.checkpoint_naming().ok_or(WrapperError::NoScales)
    }

    /// Load checkpoints. Unset paths are skipped.
    ///
    /// The primary checkpoint is migrated with the new-format checkpoint first (see
    /// [`crate::migrate`]); dual checkpoints are loaded entry by entry. Both loads are
    /// non-strict.
    pub fn load(&mut self, paths: &CheckpointPaths) -> WrapperResult<()> {
        if paths.is_empty() {
            debug!("no checkpoints configured; keeping initial parameters");
            return Ok(());
        }
        if let Some(pre_train) = &paths.pre_train {
            info!("Loading model from {}", pre_train.display());
            let legacy = checkpoint::load_state_dict(pre_train)?;
            let merged = match &paths.new_pre_train {
                Some(new_path) => {
                    let new = checkpoint::load_state_dict(new_path)?;
                    migrate(legacy, &new).map_err(CheckpointError::from)?
                }
                None => {
                    warn!("no new-format checkpoint given; loading {} without migration", pre_train.display());
                    legacy
                }
            };
            let (loaded, report) = self.get_model().clone().load_state_dict(&merged, false)?;
            log_report("model", &report);
            *self.model.inner_mut() = loaded;
        }

        if let Some(pre_train_dual) = &paths.pre_train_dual {
            info!("Loading dual model from {}", pre_train_dual.display());
            if let Some(new_dual) = &paths.new_pre_train_dual {
                let unused = checkpoint::load_dual_state_dicts(new_dual)?;
                debug!(count = unused.len(), "new-format dual checkpoint read; not applied");
            }
            let dicts = checkpoint::load_dual_state_dicts(pre_train_dual)?;
            if dicts.len() < self.dual_models.len() {
                return Err(CheckpointError::DualCount {
                    path: pre_train_dual.clone(),
                    expected: self.dual_models.len(),
                    found: dicts.len(),
                }
                .into());
            }
            for (idx, (handle, dict)) in self.dual_models.iter_mut().zip(&dicts).enumerate() {
                let (loaded, report) = handle.inner().clone().load_state_dict(dict, false)?;
                log_report(&format!("dual model {idx}"), &report);
                *handle.inner_mut() = loaded;
            }
        }
        Ok(())
    }

    /// Save the unwrapped models as the latest checkpoints, and as the best ones too when
    /// `is_best`.
    pub fn save(&self, dir: &Path, naming: &CheckpointNaming, is_best: bool) -> WrapperResult<()> {
        let state = self.state_dict()?;
        checkpoint::save_state_dict(&naming.primary_path(dir, CheckpointKind::Latest), &state)?;
        if is_best {
            checkpoint::save_state_dict(&naming.primary_path(dir, CheckpointKind::Best), &state)?;
        }

        let dual_states = self
            .dual_models
            .iter()
            .map(|dual| dual.inner().state_dict())
            .collect::<Result<Vec<_>, _>>()?;
        checkpoint::save_dual_state_dicts(
            &naming.dual_path(dir, CheckpointKind::Latest),
            &dual_states,
        )?;
        if is_best {
            checkpoint::save_dual_state_dicts(
                &naming.dual_path(dir, CheckpointKind::Best),
                &dual_states,
            )?;
        }
        Ok(())
    }
}

fn log_report(target: &str, report: &LoadReport) {
    if !report.missing_keys.is_empty() {
        warn!(
            count = report.missing_keys.len(),
            "{target}: parameters not in checkpoint kept their values"
        );
    }
    if !report.unexpected_keys.is_empty() {
        debug!(
            keys = ?report.unexpected_keys,
            "{target}: checkpoint entries ignored"
        );
    }
}

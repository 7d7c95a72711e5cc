use std::path::PathBuf;

use cli_support::ModelArgs;
use models::NetworkOptions;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{parse_checkpoint_arg, CheckpointNaming, CheckpointPaths};
use crate::config::expand_path;

/// Everything the wrapper is configured with. Fixed for the wrapper's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    #[serde(flatten)]
    pub network: NetworkOptions,
    pub self_ensemble: bool,
    pub cpu: bool,
    pub n_gpus: usize,
    pub pre_train: Option<PathBuf>,
    pub pre_train_dual: Option<PathBuf>,
    pub new_pre_train: Option<PathBuf>,
    pub new_pre_train_dual: Option<PathBuf>,
    pub test_only: bool,
    /// Training dataset name; prefixes saved checkpoint files.
    pub data_train: String,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            network: NetworkOptions::default(),
            self_ensemble: false,
            cpu: false,
            n_gpus: 1,
            pre_train: None,
            pre_train_dual: None,
            new_pre_train: None,
            new_pre_train_dual: None,
            test_only: false,
            data_train: "DF2K".to_string(),
        }
    }
}

impl ModelOptions {
    pub fn scale(&self) -> &[usize] {
        &self.network.scale
    }

    pub fn checkpoint_paths(&self) -> CheckpointPaths {
        CheckpointPaths {
            pre_train: self.pre_train.clone(),
            pre_train_dual: self.pre_train_dual.clone(),
            new_pre_train: self.new_pre_train.clone(),
            new_pre_train_dual: self.new_pre_train_dual.clone(),
        }
    }

    pub fn checkpoint_naming(&self) -> Option<CheckpointNaming> {
        self.network
            .final_scale()
            .map(|scale| CheckpointNaming::new(self.data_train.clone(), scale))
    }

    /// Apply command-line overrides. Checkpoint flags replace the configured path; "." clears it.
    pub fn apply_args(&mut self, args: &ModelArgs) {
        if let Some(target) = args.scale {
            self.network.scale = scale_ladder(target);
        }
        self.cpu |= args.cpu;
        if let Some(n_gpus) = args.n_gpus {
            self.n_gpus = n_gpus;
        }
        self.test_only |= args.test_only;
        self.self_ensemble |= args.self_ensemble;
        if let Some(dataset) = &args.dataset {
            self.data_train = dataset.clone();
        }
        let ckpt = &args.checkpoints;
        let resolve = |raw: &str| parse_checkpoint_arg(raw).map(|p| expand_path(&p.to_string_lossy()));
        if let Some(raw) = &ckpt.pre_train {
            self.pre_train = resolve(raw);
        }
        if let Some(raw) = &ckpt.pre_train_dual {
            self.pre_train_dual = resolve(raw);
        }
        if let Some(raw) = &ckpt.new_pre_train {
            self.new_pre_train = resolve(raw);
        }
        if let Some(raw) = &ckpt.new_pre_train_dual {
            self.new_pre_train_dual = resolve(raw);
        }
    }

    /// Replication is used only off-CPU with more than one device requested.
    pub fn wants_replication(&self) -> bool {
        !self.cpu && self.n_gpus > 1
    }
}

/// Expand a target scale into the x2 ladder the network is built from (4 -> [2, 4]).
/// Targets that are not powers of two are kept as a single step.
pub fn scale_ladder(target: usize) -> Vec<usize> {
    if target >= 2 && target.is_power_of_two() {
        (1..=target.ilog2()).map(|s| 1usize << s).collect()
    } else {
        vec![target]
    }
}

//! TOML run configuration.
//!
//! ```toml
//! save_dir = "~/experiments/drn_x4"
//!
//! [model]
//! scale = [2, 4]
//! n_feats = 16
//! n_gpus = 1
//! data_train = "DF2K"
//!
//! [checkpoints]
//! pre_train = "${CKPT}/drn4x.safetensors"
//! new_pre_train = "${CKPT}/drn2x.safetensors"
//! pre_train_dual = "."
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::checkpoint::parse_checkpoint_arg;
use crate::options::ModelOptions;

pub const CONFIG_ENV: &str = "DUALSR_CONFIG";
const DEFAULT_CONFIG_NAME: &str = "dualsr.toml";
const DEFAULT_SAVE_DIR: &str = "experiment/default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub options: ModelOptions,
    pub save_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            options: ModelOptions::default(),
            save_dir: PathBuf::from(DEFAULT_SAVE_DIR),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunConfigFile {
    save_dir: Option<String>,
    model: Option<ModelOptions>,
    checkpoints: Option<CheckpointSection>,
}

#[derive(Debug, Deserialize, Default)]
struct CheckpointSection {
    pre_train: Option<String>,
    pre_train_dual: Option<String>,
    new_pre_train: Option<String>,
    new_pre_train_dual: Option<String>,
}

impl RunConfig {
    /// Load from `path`, else from `$DUALSR_CONFIG`, else from `./dualsr.toml`; defaults when
    /// none of these exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidate = match path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var(CONFIG_ENV)
                .ok()
                .map(PathBuf::from)
                .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_NAME)).filter(|p| p.exists())),
        };
        let cfg = match candidate {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        cfg.warn_if_invalid();
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let file: RunConfigFile = toml::from_str(raw)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: RunConfigFile) -> Self {
        let mut options = file.model.unwrap_or_default();
        if let Some(section) = file.checkpoints {
            let resolve = |raw: Option<String>| {
                raw.as_deref()
                    .and_then(parse_checkpoint_arg)
                    .map(|p| expand_path(&p.to_string_lossy()))
            };
            options.pre_train = resolve(section.pre_train);
            options.pre_train_dual = resolve(section.pre_train_dual);
            options.new_pre_train = resolve(section.new_pre_train);
            options.new_pre_train_dual = resolve(section.new_pre_train_dual);
        }
        RunConfig {
            options,
            save_dir: file
                .save_dir
                .map(|v| expand_path(&v))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SAVE_DIR)),
        }
    }

    fn warn_if_invalid(&self) {
        let opts = &self.options;
        if opts.network.scale.is_empty() {
            warn!("run config: scale is empty; model construction will fail");
        }
        if opts.pre_train.is_some() && opts.new_pre_train.is_none() {
            warn!("run config: pre_train set without new_pre_train; legacy weights load unmigrated");
        }
        if opts.n_gpus == 0 && !opts.cpu {
            warn!("run config: n_gpus is 0 without cpu mode");
        }
        if opts.data_train.trim().is_empty() {
            warn!("run config: data_train is empty; checkpoint names will start with '_'");
        }
    }
}

/// Expand a leading `~` and `${VAR}` references; unknown variables are left verbatim.
pub fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

fn expand_env(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&format!("${{{key}}}")),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

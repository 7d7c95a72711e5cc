//! Checkpoint files.
//!
//! A primary checkpoint is one safetensors file holding a single [`StateDict`]. A dual
//! checkpoint holds every dual model's mapping in one file, keys prefixed with the dual index
//! (`"{i}.{key}"`), plus `format`/`count` metadata so an empty mapping still counts.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use models::{ParamTensor, StateDict, StateDictError};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensorError, SafeTensors};
use thiserror::Error;
use tracing::debug;

use crate::migrate::MigrationError;

pub const CHECKPOINT_EXT: &str = "safetensors";
const FORMAT_KEY: &str = "format";
const COUNT_KEY: &str = "count";
const DUAL_FORMAT: &str = "dual";

pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("safetensors error at {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: SafeTensorError,
    },
    #[error("tensor {key} in {path} has dtype {dtype:?}; only F32 checkpoints are supported")]
    Dtype {
        path: PathBuf,
        key: String,
        dtype: Dtype,
    },
    #[error("dual checkpoint {path}: {msg}")]
    DualLayout { path: PathBuf, msg: String },
    #[error("dual checkpoint {path} holds {found} models but {expected} dual models are configured")]
    DualCount {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("state dict error: {0}")]
    StateDict(#[from] StateDictError),
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// The four checkpoint inputs of a load. `None` skips the corresponding file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointPaths {
    /// Legacy-format primary checkpoint.
    pub pre_train: Option<PathBuf>,
    pub pre_train_dual: Option<PathBuf>,
    /// New-format primary checkpoint migrated into `pre_train`.
    pub new_pre_train: Option<PathBuf>,
    pub new_pre_train_dual: Option<PathBuf>,
}

impl CheckpointPaths {
    /// Neither a primary nor a dual checkpoint is set, so a load has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.pre_train.is_none() && self.pre_train_dual.is_none()
    }
}

/// Parse a checkpoint path argument; `"."` (or empty) means "skip".
pub fn parse_checkpoint_arg(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "." {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Latest,
    Best,
}

impl CheckpointKind {
    fn tag(self) -> &'static str {
        match self {
            CheckpointKind::Latest => "latest",
            CheckpointKind::Best => "best",
        }
    }
}

/// File naming for saved checkpoints: dataset name plus the final scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointNaming {
    pub dataset: String,
    pub final_scale: usize,
}

impl CheckpointNaming {
    pub fn new(dataset: impl Into<String>, final_scale: usize) -> Self {
        Self {
            dataset: dataset.into(),
            final_scale,
        }
    }

    /// `{dir}/model/{dataset}_{latest|best}_x{scale}.safetensors`
    pub fn primary_path(&self, dir: &Path, kind: CheckpointKind) -> PathBuf {
        dir.join("model").join(format!(
            "{}_{}_x{}.{CHECKPOINT_EXT}",
            self.dataset,
            kind.tag(),
            self.final_scale
        ))
    }

    /// `{dir}/model/{dataset}_dual_{latest|best}_x{scale}.safetensors`
    pub fn dual_path(&self, dir: &Path, kind: CheckpointKind) -> PathBuf {
        dir.join("model").join(format!(
            "{}_dual_{}_x{}.{CHECKPOINT_EXT}",
            self.dataset,
            kind.tag(),
            self.final_scale
        ))
    }
}

fn to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn ensure_parent(path: &Path) -> CheckpointResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

fn write_entries(
    path: &Path,
    entries: Vec<(String, &ParamTensor)>,
    metadata: Option<HashMap<String, String>>,
) -> CheckpointResult<()> {
    ensure_parent(path)?;
    let format_err = |source| CheckpointError::Format {
        path: path.to_path_buf(),
        source,
    };
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = entries
        .into_iter()
        .map(|(key, tensor)| (key, tensor.shape.clone(), to_bytes(&tensor.values)))
        .collect();
    let views = buffers
        .iter()
        .map(|(key, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (key.as_str(), view))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(format_err)?;
    let views = views.iter().map(|(key, view)| (*key, view));
    safetensors::serialize_to_file(views, &metadata, path).map_err(format_err)?;
    debug!(path = %path.display(), "checkpoint written");
    Ok(())
}

fn read_file(path: &Path) -> CheckpointResult<Vec<u8>> {
    fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_entries(path: &Path, buffer: &[u8]) -> CheckpointResult<Vec<(String, ParamTensor)>> {
    let tensors = SafeTensors::deserialize(buffer).map_err(|source| CheckpointError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    tensors
        .tensors()
        .into_iter()
        .map(|(key, view)| {
            if view.dtype() != Dtype::F32 {
                return Err(CheckpointError::Dtype {
                    path: path.to_path_buf(),
                    key,
                    dtype: view.dtype(),
                });
            }
            let tensor = ParamTensor::new(view.shape().to_vec(), from_bytes(view.data()));
            Ok((key, tensor))
        })
        .collect()
}

fn read_metadata(path: &Path, buffer: &[u8]) -> CheckpointResult<HashMap<String, String>> {
    let (_, metadata) =
        SafeTensors::read_metadata(buffer).map_err(|source| CheckpointError::Format {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(metadata.metadata().clone().unwrap_or_default())
}

pub fn save_state_dict(path: &Path, dict: &StateDict) -> CheckpointResult<()> {
    let entries = dict.iter().map(|(key, tensor)| (key.clone(), tensor)).collect();
    write_entries(path, entries, None)
}

pub fn load_state_dict(path: &Path) -> CheckpointResult<StateDict> {
    let buffer = read_file(path)?;
    Ok(decode_entries(path, &buffer)?.into_iter().collect())
}

pub fn save_dual_state_dicts(path: &Path, dicts: &[StateDict]) -> CheckpointResult<()> {
    let entries = dicts
        .iter()
        .enumerate()
        .flat_map(|(idx, dict)| {
            dict.iter()
                .map(move |(key, tensor)| (format!("{idx}.{key}"), tensor))
        })
        .collect();
    let metadata = HashMap::from([
        (FORMAT_KEY.to_string(), DUAL_FORMAT.to_string()),
        (COUNT_KEY.to_string(), dicts.len().to_string()),
    ]);
    write_entries(path, entries, Some(metadata))
}

pub fn load_dual_state_dicts(path: &Path) -> CheckpointResult<Vec<StateDict>> {
    let buffer = read_file(path)?;
    let metadata = read_metadata(path, &buffer)?;
    let layout_err = |msg: String| CheckpointError::DualLayout {
        path: path.to_path_buf(),
        msg,
    };

    let entries = decode_entries(path, &buffer)?;
    let stored = entries.len();
    let mut grouped: BTreeMap<usize, StateDict> = BTreeMap::new();
    for (key, tensor) in entries {
        let (idx, rest) = key
            .split_once('.')
            .ok_or_else(|| layout_err(format!("key {key} has no dual index prefix")))?;
        let idx: usize = idx
            .parse()
            .map_err(|_| layout_err(format!("key {key} has a non-numeric dual index")))?;
        grouped.entry(idx).or_default().insert(rest, tensor);
    }

    let count = match metadata.get(COUNT_KEY) {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| layout_err(format!("invalid count metadata {raw:?}")))?,
        None => grouped.keys().next_back().map(|idx| idx + 1).unwrap_or(0),
    };
    if count > stored {
        return Err(layout_err(format!(
            "declared count {count} exceeds the {stored} tensors stored"
        )));
    }
    if let Some(idx) = grouped.keys().find(|idx| **idx >= count) {
        return Err(layout_err(format!(
            "dual index {idx} exceeds declared count {count}"
        )));
    }
    Ok((0..count)
        .map(|idx| grouped.remove(&idx).unwrap_or_default())
        .collect())
}

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

const LOG_FILE: &str = "log.txt";
const CONFIG_FILE: &str = "config.txt";

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("experiment io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialise run config: {0}")]
    Config(#[from] toml::ser::Error),
}

pub type ExperimentResult<T> = Result<T, ExperimentError>;

/// Experiment directory: `log.txt`, `config.txt` and the `model/` checkpoint folder.
#[derive(Debug)]
pub struct ExperimentLog {
    dir: PathBuf,
    log_file: File,
}

impl ExperimentLog {
    pub fn open(dir: impl AsRef<Path>) -> ExperimentResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let model_dir = dir.join("model");
        fs::create_dir_all(&model_dir).map_err(|source| ExperimentError::Io {
            path: model_dir,
            source,
        })?;
        let log_path = dir.join(LOG_FILE);
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| ExperimentError::Io {
                path: log_path,
                source,
            })?;
        Ok(Self { dir, log_file })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Raw log destination, for multi-line dumps.
    pub fn log_file(&mut self) -> &mut File {
        &mut self.log_file
    }

    /// Append one line to `log.txt` and echo it as an `info` event.
    pub fn write_log(&mut self, line: &str) -> ExperimentResult<()> {
        info!("{line}");
        writeln!(self.log_file, "{line}").map_err(|source| ExperimentError::Io {
            path: self.log_path(),
            source,
        })
    }

    /// Write `config` as TOML to `config.txt`, replacing any previous copy.
    pub fn write_config<T: Serialize>(&self, config: &T) -> ExperimentResult<()> {
        let path = self.dir.join(CONFIG_FILE);
        let text = toml::to_string_pretty(config)?;
        fs::write(&path, text).map_err(|source| ExperimentError::Io { path, source })
    }
}

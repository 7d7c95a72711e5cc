use clap::Args;
use std::path::PathBuf;

/// Model/device overrides shared by the model binaries. Unset flags keep the config value.
#[derive(Debug, Clone, Default, Args)]
pub struct ModelArgs {
    /// Target upscaling factor; powers of two expand to the x2 ladder (4 -> 2,4).
    #[arg(long)]
    pub scale: Option<usize>,
    /// Keep everything on the host device.
    #[arg(long, default_value_t = false)]
    pub cpu: bool,
    /// Number of accelerators to replicate across.
    #[arg(long)]
    pub n_gpus: Option<usize>,
    /// Test mode: skips the architecture dump in the log.
    #[arg(long, default_value_t = false)]
    pub test_only: bool,
    /// Average the eight flip/transpose variants in test mode.
    #[arg(long, default_value_t = false)]
    pub self_ensemble: bool,
    /// Training dataset name used in checkpoint file names.
    #[arg(long)]
    pub dataset: Option<String>,
    #[command(flatten)]
    pub checkpoints: CheckpointArgs,
}

/// Checkpoint inputs. Pass "." to skip a path set in the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct CheckpointArgs {
    /// Legacy-format primary checkpoint.
    #[arg(long)]
    pub pre_train: Option<String>,
    #[arg(long)]
    pub pre_train_dual: Option<String>,
    /// New-format primary checkpoint the legacy one is migrated with.
    #[arg(long)]
    pub new_pre_train: Option<String>,
    #[arg(long)]
    pub new_pre_train_dual: Option<String>,
}

/// Config file and experiment directory selection.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// TOML run config (falls back to $DUALSR_CONFIG, then ./dualsr.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Experiment directory for log.txt, config.txt and model/.
    #[arg(long)]
    pub save_dir: Option<PathBuf>,
    /// Verbose logging (debug level) unless RUST_LOG is set.
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

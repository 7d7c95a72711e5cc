pub mod common;
pub mod logging;

pub use common::{CheckpointArgs, ModelArgs, RunArgs};
pub use logging::init_tracing;

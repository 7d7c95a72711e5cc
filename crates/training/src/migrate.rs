//! Legacy checkpoint migration.
//!
//! Checkpoints of the four-branch layout (`up_blocks.{0,1,..}`) are patched with up-block
//! weights from a two-branch checkpoint before being loaded:
//!
//! - every `up_blocks.0.*` key takes the value stored under the same key in the new checkpoint;
//! - the `i`-th `up_blocks.1.*` key (third segment other than `41`) takes the new checkpoint's
//!   value for the `i`-th `up_blocks.0.*` key.
//!
//! The second rule is positional and sources branch-0 values for branch-1 slots; existing
//! migrated checkpoints were produced with exactly this pairing.

use models::StateDict;
use thiserror::Error;
use tracing::debug;

const UP_BLOCKS: &str = "up_blocks";
const EXCLUDED_INDEX: &str = "41";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("new-format checkpoint has no entry for {key}")]
    MissingSource { key: String },
    #[error("legacy key {key} (position {index}) has no up_blocks.0 counterpart")]
    NoCounterpart { key: String, index: usize },
}

/// Legacy keys grouped by the branch they belong to, each in module order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UpBlockBuckets {
    /// `up_blocks.0.*`
    pub branch0: Vec<String>,
    /// `up_blocks.1.*` minus `up_blocks.1.41.*`
    pub branch1: Vec<String>,
}

pub fn partition_up_blocks(legacy: &StateDict) -> UpBlockBuckets {
    let mut buckets = UpBlockBuckets::default();
    for key in legacy.keys_in_module_order() {
        let mut segments = key.split('.');
        if segments.next() != Some(UP_BLOCKS) {
            continue;
        }
        match segments.next() {
            Some("0") => buckets.branch0.push(key.to_string()),
            Some("1") if segments.next() != Some(EXCLUDED_INDEX) => {
                buckets.branch1.push(key.to_string())
            }
            _ => {}
        }
    }
    buckets
}

/// Apply the up-block migration to `legacy`, returning the merged mapping.
pub fn migrate(mut legacy: StateDict, new: &StateDict) -> Result<StateDict, MigrationError> {
    let buckets = partition_up_blocks(&legacy);

    let mut patch0 = StateDict::new();
    for key in &buckets.branch0 {
        let value = new
            .get(key)
            .ok_or_else(|| MigrationError::MissingSource { key: key.clone() })?;
        patch0.insert(key.clone(), value.clone());
    }

    let mut patch1 = StateDict::new();
    for (index, key) in buckets.branch1.iter().enumerate() {
        let source = buckets
            .branch0
            .get(index)
            .ok_or_else(|| MigrationError::NoCounterpart {
                key: key.clone(),
                index,
            })?;
        let value = new.get(source).ok_or_else(|| MigrationError::MissingSource {
            key: source.clone(),
        })?;
        patch1.insert(key.clone(), value.clone());
    }

    debug!(
        branch0 = patch0.len(),
        branch1 = patch1.len(),
        "patched legacy up-block weights"
    );
    legacy.update(patch0);
    legacy.update(patch1);
    Ok(legacy)
}

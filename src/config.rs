use serde::{Deserialize, Serialize};

use crate::common::WORKSPACE_SIZE;

/// Tunable thresholds of the tiling search.
///
/// [Default] yields the reference constants; callers usually only override
/// `enable_gather` or the utilization target.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Tensors smaller than this many bytes take the small-shape path.
    pub small_shape_bytes_threshold: u64,
    /// Minimum innermost extent (in elements) for the aligned-move path.
    pub movealign_last_min_ele: u64,
    /// Fraction of cores a utilization search tries to keep busy.
    pub core_used_threshold: f64,
    /// Per-core byte alignment of small-shape work.
    pub small_shape_split_align_bytes: u64,
    /// Smallest buffer tile, in bytes, a gather plan may move.
    pub min_gather_tile_bytes: u64,
    pub enable_gather: bool,
    pub workspace_size: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Core utilization threshold must be in (0, 1], got {0}")]
    InvalidUtilization(f64),
    #[error("Small-shape split alignment must be positive")]
    ZeroSplitAlignment,
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.core_used_threshold > 0.0 && self.core_used_threshold <= 1.0) {
            return Err(ConfigError::InvalidUtilization(self.core_used_threshold));
        }
        if self.small_shape_split_align_bytes == 0 {
            return Err(ConfigError::ZeroSplitAlignment);
        }
        Ok(())
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            small_shape_bytes_threshold: 4_000_000,
            movealign_last_min_ele: 32,
            core_used_threshold: 0.9,
            small_shape_split_align_bytes: 128,
            min_gather_tile_bytes: 1024,
            enable_gather: true,
            workspace_size: WORKSPACE_SIZE,
        }
    }
}

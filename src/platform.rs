use serde::{Deserialize, Serialize};

/// Hardware resource limits the planner tiles against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PlatformInfo {
    /// Number of vector cores that can run tiles in parallel.
    pub core_num: u64,
    /// Capacity of each core's on-chip buffer, in bytes.
    pub ub_size: u64,
    pub cache_line_size: u64,
    /// Minimum addressable unit of the on-chip buffer, in bytes.
    pub ub_block_size: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Core count must be positive, got {0}")]
    InvalidCoreNum(i64),
    #[error("Buffer size must be positive, got {0}")]
    InvalidUbSize(i64),
    #[error("Cache line size must be positive, got {0}")]
    InvalidCacheLineSize(i64),
    #[error("Buffer block size must be positive, got {0}")]
    InvalidBlockSize(i64),
}

impl PlatformInfo {
    pub fn new(
        core_num: i64,
        ub_size: i64,
        cache_line_size: i64,
        ub_block_size: i64,
    ) -> Result<Self, PlatformError> {
        if core_num <= 0 {
            return Err(PlatformError::InvalidCoreNum(core_num));
        }
        if ub_size <= 0 {
            return Err(PlatformError::InvalidUbSize(ub_size));
        }
        if cache_line_size <= 0 {
            return Err(PlatformError::InvalidCacheLineSize(cache_line_size));
        }
        if ub_block_size <= 0 {
            return Err(PlatformError::InvalidBlockSize(ub_block_size));
        }
        Ok(PlatformInfo {
            core_num: core_num.unsigned_abs(),
            ub_size: ub_size.unsigned_abs(),
            cache_line_size: cache_line_size.unsigned_abs(),
            ub_block_size: ub_block_size.unsigned_abs(),
        })
    }

    /// Checks a descriptor built field-by-field (e.g., deserialized).
    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.core_num == 0 {
            return Err(PlatformError::InvalidCoreNum(0));
        }
        if self.ub_size == 0 {
            return Err(PlatformError::InvalidUbSize(0));
        }
        if self.cache_line_size == 0 {
            return Err(PlatformError::InvalidCacheLineSize(0));
        }
        if self.ub_block_size == 0 {
            return Err(PlatformError::InvalidBlockSize(0));
        }
        Ok(())
    }

    /// Buffer capacity in elements of `ele_len` bytes.
    pub fn ub_elements(&self, ele_len: u64) -> u64 {
        self.ub_size / ele_len
    }
}

impl Default for PlatformInfo {
    fn default() -> Self {
        PlatformInfo {
            core_num: 64,
            ub_size: 248 * 1024,
            cache_line_size: 128,
            ub_block_size: 32,
        }
    }
}

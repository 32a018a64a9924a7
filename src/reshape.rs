use serde::{Deserialize, Serialize};

use crate::common::{Dtype, MAX_SUPPORT_DIMS};
use crate::planner::TransposeRequest;
use crate::shapeinfo::{normalize_perm, ShapeError};

/// A reshape fused with a transpose of row-major data.
///
/// With `transpose_first` unset, `x_shape` is first viewed as `shape` and the
/// result is transposed by `perm`. With it set, `x_shape` is transposed and the
/// result is viewed as `shape`. Either way the data movement is a single plain
/// transpose, which [ReshapeTranspose::to_transpose] returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ReshapeTranspose {
    pub x_shape: Vec<i64>,
    pub shape: Vec<i64>,
    pub perm: Vec<i64>,
    pub transpose_first: bool,
    pub dtype: Dtype,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReshapeError {
    #[error("Rank {rank} of {operand} is outside 1..=8")]
    RankOutOfRange { operand: &'static str, rank: usize },
    #[error("Perm has {perm_dims} axes but the transposed operand has {expected}")]
    PermRankMismatch { perm_dims: usize, expected: usize },
    #[error("Axis {axis} of {operand} has non-positive extent {value}")]
    NonPositiveDim {
        operand: &'static str,
        axis: usize,
        value: i64,
    },
    #[error("Element count of {operand} overflows 64 bits")]
    VolumeOverflow { operand: &'static str },
    #[error("Cannot reshape {from} elements into {to}")]
    VolumeMismatch { from: u64, to: u64 },
    #[error(transparent)]
    Perm(#[from] ShapeError),
}

impl ReshapeTranspose {
    /// Returns the transpose this reshape+transpose performs.
    pub fn to_transpose(&self) -> Result<TransposeRequest, ReshapeError> {
        let from = checked_volume("x", &self.x_shape)?;
        let to = checked_volume("shape", &self.shape)?;
        if from != to {
            return Err(ReshapeError::VolumeMismatch { from, to });
        }

        let base = if self.transpose_first {
            &self.x_shape
        } else {
            &self.shape
        };
        if self.perm.len() != base.len() {
            return Err(ReshapeError::PermRankMismatch {
                perm_dims: self.perm.len(),
                expected: base.len(),
            });
        }
        let perm = normalize_perm(&self.perm, base.len())?;
        Ok(TransposeRequest {
            in_shape: base.clone(),
            out_shape: perm.iter().map(|&p| base[p]).collect(),
            perm: perm.iter().map(|&p| p as i64).collect(),
            element_size: i64::from(self.dtype.size()),
        })
    }
}

fn checked_volume(operand: &'static str, shape: &[i64]) -> Result<u64, ReshapeError> {
    if shape.is_empty() || shape.len() > MAX_SUPPORT_DIMS {
        return Err(ReshapeError::RankOutOfRange {
            operand,
            rank: shape.len(),
        });
    }
    let mut vol = 1u64;
    for (axis, &value) in shape.iter().enumerate() {
        if value <= 0 {
            return Err(ReshapeError::NonPositiveDim {
                operand,
                axis,
                value,
            });
        }
        vol = vol
            .checked_mul(value.unsigned_abs())
            .ok_or(ReshapeError::VolumeOverflow { operand })?;
    }
    Ok(vol)
}

use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt::Display;

use crate::common::{DimSize, Perm, Shape, MAX_SUPPORT_DIMS};
use crate::shape;
use crate::utils::{join_into_string, volume};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Tensor rank {0} is outside 1..=8")]
    RankOutOfRange(usize),
    #[error("Ranks disagree: input has {in_dims}, output has {out_dims}, perm has {perm_dims}")]
    RankMismatch {
        in_dims: usize,
        out_dims: usize,
        perm_dims: usize,
    },
    #[error("Perm value {value} is out of range for rank {dims}")]
    PermOutOfRange { value: i64, dims: usize },
    #[error("Axis {0} appears more than once in perm")]
    DuplicatePermAxis(usize),
    #[error("Axis {axis} has a non-positive extent (input {in_dim}, output {out_dim})")]
    NonPositiveDim {
        axis: usize,
        in_dim: i64,
        out_dim: i64,
    },
    #[error("Output axis {axis} has extent {out_dim} but input axis {in_axis} has {in_dim}")]
    PermConflict {
        axis: usize,
        in_axis: usize,
        in_dim: i64,
        out_dim: i64,
    },
    #[error("Element size must be positive, got {0}")]
    InvalidElementSize(i64),
    #[error("Tensor of {ele_len}-byte elements is too large to address")]
    VolumeOverflow { ele_len: i64 },
}

/// A validated transpose problem together with its reduced form.
///
/// The reduced shapes drop unit axes and merge runs of input axes which stay
/// adjacent and in order in the output. All planning happens on the reduced
/// form; the original shapes are kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ShapeInfo {
    pub in_shape: Shape,
    pub out_shape: Shape,
    pub perm: Perm,
    pub orig_dim: usize,
    pub ele_len: u64,
    pub reduced_in_shape: Shape,
    pub reduced_out_shape: Shape,
    pub reduced_perm: Perm,
    /// Output position of each reduced input axis; the inverse of `reduced_perm`.
    pub reduced_out_index: Perm,
    pub is_last_axis_transpose: bool,
}

impl ShapeInfo {
    pub fn new(
        in_shape: &[i64],
        out_shape: &[i64],
        perm: &[i64],
        ele_len: i64,
    ) -> Result<Self, ShapeError> {
        let in_dims = in_shape.len();
        if in_dims != out_shape.len() || in_dims != perm.len() {
            return Err(ShapeError::RankMismatch {
                in_dims,
                out_dims: out_shape.len(),
                perm_dims: perm.len(),
            });
        }
        if in_dims < 1 || in_dims > MAX_SUPPORT_DIMS {
            return Err(ShapeError::RankOutOfRange(in_dims));
        }
        if ele_len <= 0 {
            return Err(ShapeError::InvalidElementSize(ele_len));
        }
        let perm = normalize_perm(perm, in_dims)?;
        for (axis, (&in_dim, &out_dim)) in in_shape.iter().zip(out_shape).enumerate() {
            if in_dim <= 0 || out_dim <= 0 {
                return Err(ShapeError::NonPositiveDim {
                    axis,
                    in_dim,
                    out_dim,
                });
            }
        }
        // Byte counts are emitted as i64, so the whole tensor must fit one.
        if in_shape
            .iter()
            .try_fold(ele_len, |bytes, &d| bytes.checked_mul(d))
            .is_none()
        {
            return Err(ShapeError::VolumeOverflow { ele_len });
        }
        for (axis, &in_axis) in perm.iter().enumerate() {
            if in_shape[in_axis] != out_shape[axis] {
                return Err(ShapeError::PermConflict {
                    axis,
                    in_axis,
                    in_dim: in_shape[in_axis],
                    out_dim: out_shape[axis],
                });
            }
        }

        let in_shape: Shape = in_shape.iter().map(|&d| d.unsigned_abs()).collect();
        let out_shape: Shape = out_shape.iter().map(|&d| d.unsigned_abs()).collect();
        Ok(Self::from_validated(
            in_shape,
            out_shape,
            perm,
            ele_len.unsigned_abs(),
        ))
    }

    fn from_validated(in_shape: Shape, out_shape: Shape, perm: Perm, ele_len: u64) -> Self {
        let (reduced_in_shape, reduced_perm) = reduce_axes(&in_shape, &perm);
        let reduced_out_shape = permute_shape(&reduced_in_shape, &reduced_perm);
        let dim = reduced_perm.len();
        let mut reduced_out_index: Perm = smallvec![0; dim];
        for (position, &axis) in reduced_perm.iter().enumerate() {
            reduced_out_index[axis] = position;
        }
        let is_last_axis_transpose = reduced_perm[dim - 1] != dim - 1;
        debug!(
            "Reduced [{}] perm [{}] to [{}] perm [{}]",
            join_into_string(&in_shape, ", "),
            join_into_string(&perm, ", "),
            join_into_string(&reduced_in_shape, ", "),
            join_into_string(&reduced_perm, ", ")
        );
        ShapeInfo {
            orig_dim: in_shape.len(),
            in_shape,
            out_shape,
            perm,
            ele_len,
            reduced_in_shape,
            reduced_out_shape,
            reduced_perm,
            reduced_out_index,
            is_last_axis_transpose,
        }
    }

    /// Rank of the reduced problem.
    pub fn dim(&self) -> usize {
        self.reduced_perm.len()
    }

    pub fn volume(&self) -> u64 {
        volume(&self.reduced_in_shape)
    }

    pub fn volume_bytes(&self) -> u64 {
        self.volume() * self.ele_len
    }

    /// Returns the output position of the reduced input axis `in_axis`.
    ///
    /// Panics if `in_axis` is not below [ShapeInfo::dim].
    pub fn out_position(&self, in_axis: usize) -> usize {
        self.reduced_out_index[in_axis]
    }
}

impl Display for ShapeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] -> [{}] (perm [{}], {}B elements)",
            join_into_string(&self.reduced_in_shape, ", "),
            join_into_string(&self.reduced_out_shape, ", "),
            join_into_string(&self.reduced_perm, ", "),
            self.ele_len
        )
    }
}

/// Wraps negative entries and checks `perm` is a permutation of `0..dims`.
pub fn normalize_perm(perm: &[i64], dims: usize) -> Result<Perm, ShapeError> {
    let signed_dims = i64::try_from(dims).map_err(|_| ShapeError::RankOutOfRange(dims))?;
    let mut seen: SmallVec<[bool; MAX_SUPPORT_DIMS]> = smallvec![false; dims];
    let mut result = Perm::new();
    for &value in perm {
        let wrapped = if value < 0 { value + signed_dims } else { value };
        if wrapped < 0 || wrapped >= signed_dims {
            return Err(ShapeError::PermOutOfRange { value, dims });
        }
        let axis = wrapped.unsigned_abs() as usize;
        if seen[axis] {
            return Err(ShapeError::DuplicatePermAxis(axis));
        }
        seen[axis] = true;
        result.push(axis);
    }
    Ok(result)
}

/// Returns `shape` as seen through `perm`, i.e. `out[i] = shape[perm[i]]`.
pub fn permute_shape(shape: &[DimSize], perm: &[usize]) -> Shape {
    perm.iter().map(|&p| shape[p]).collect()
}

/// Drops unit axes and merges input-contiguous runs that stay adjacent in the output.
///
/// Returns the reduced input shape and permutation. A tensor made only of unit
/// axes reduces to a single unit axis.
pub fn reduce_axes(in_shape: &[DimSize], perm: &[usize]) -> (Shape, Perm) {
    let mut new_index: SmallVec<[Option<usize>; MAX_SUPPORT_DIMS]> = SmallVec::new();
    let mut kept = Shape::new();
    for &d in in_shape {
        if d == 1 {
            new_index.push(None);
        } else {
            new_index.push(Some(kept.len()));
            kept.push(d);
        }
    }
    if kept.is_empty() {
        return (shape![1], smallvec![0]);
    }
    let kept_perm: Perm = perm.iter().filter_map(|&p| new_index[p]).collect();

    // (first input axis, merged extent) per output-order group.
    let mut groups: SmallVec<[(usize, DimSize); MAX_SUPPORT_DIMS]> = SmallVec::new();
    let mut prev: Option<usize> = None;
    for &p in &kept_perm {
        let extends = prev.is_some_and(|q| p == q + 1);
        prev = Some(p);
        if extends {
            if let Some(group) = groups.last_mut() {
                group.1 *= kept[p];
            }
        } else {
            groups.push((p, kept[p]));
        }
    }

    let mut by_start: SmallVec<[usize; MAX_SUPPORT_DIMS]> = (0..groups.len()).collect();
    by_start.sort_unstable_by_key(|&g| groups[g].0);
    let mut reduced_in = shape![0; groups.len()];
    let mut reduced_perm: Perm = smallvec![0; groups.len()];
    for (new_axis, &g) in by_start.iter().enumerate() {
        reduced_in[new_axis] = groups[g].1;
        reduced_perm[g] = new_axis;
    }
    (reduced_in, reduced_perm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_problem() -> impl Strategy<Value = (Vec<u64>, Vec<usize>)> {
        prop::collection::vec(1u64..5, 1..=MAX_SUPPORT_DIMS).prop_flat_map(|shape| {
            let n = shape.len();
            (Just(shape), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        })
    }

    fn info(in_shape: &[i64], perm: &[i64]) -> Result<ShapeInfo, ShapeError> {
        let out_shape = perm
            .iter()
            .map(|&p| in_shape[p.rem_euclid(in_shape.len() as i64) as usize])
            .collect::<Vec<_>>();
        ShapeInfo::new(in_shape, &out_shape, perm, 4)
    }

    #[test]
    fn test_unit_axes_are_dropped() {
        let s = info(&[1, 4, 1, 5], &[3, 2, 1, 0]).unwrap();
        assert_eq!(s.reduced_in_shape, shape![4, 5]);
        assert_eq!(s.reduced_out_shape, shape![5, 4]);
        assert_eq!(s.reduced_perm.as_slice(), &[1, 0]);
        assert!(s.is_last_axis_transpose);
    }

    #[test]
    fn test_out_position_of_rotation() {
        let s = info(&[2, 3, 4], &[2, 0, 1]).unwrap();
        assert_eq!(s.reduced_perm.as_slice(), &[1, 0]);
        assert_eq!(s.reduced_out_index.as_slice(), &[1, 0]);
        let s = info(&[2, 3, 4, 5], &[3, 1, 0, 2]).unwrap();
        assert_eq!(s.reduced_perm.as_slice(), &[3, 1, 0, 2]);
        assert_eq!(s.reduced_out_index.as_slice(), &[2, 1, 3, 0]);
        assert_eq!(s.out_position(3), 0);
    }

    #[test]
    fn test_identity_merges_to_one_axis() {
        let s = info(&[2, 3, 4], &[0, 1, 2]).unwrap();
        assert_eq!(s.reduced_in_shape, shape![24]);
        assert_eq!(s.reduced_perm.as_slice(), &[0]);
        assert!(!s.is_last_axis_transpose);
    }

    #[test]
    fn test_adjacent_runs_merge() {
        let s = info(&[2, 3, 4, 5], &[2, 3, 0, 1]).unwrap();
        assert_eq!(s.reduced_in_shape, shape![6, 20]);
        assert_eq!(s.reduced_out_shape, shape![20, 6]);
        assert_eq!(s.reduced_perm.as_slice(), &[1, 0]);
    }

    #[test]
    fn test_merge_keeps_untouched_last_axis() {
        let s = info(&[2, 3, 4, 5], &[1, 0, 2, 3]).unwrap();
        assert_eq!(s.reduced_in_shape, shape![2, 3, 20]);
        assert_eq!(s.reduced_perm.as_slice(), &[1, 0, 2]);
        assert!(!s.is_last_axis_transpose);
    }

    #[test]
    fn test_all_unit_axes_reduce_to_one() {
        let s = info(&[1, 1, 1], &[2, 0, 1]).unwrap();
        assert_eq!(s.reduced_in_shape, shape![1]);
        assert_eq!(s.reduced_perm.as_slice(), &[0]);
        assert_eq!(s.orig_dim, 3);
    }

    #[test]
    fn test_negative_perm_wraps() {
        let s = info(&[3, 7], &[-1, 0]).unwrap();
        assert_eq!(s.perm.as_slice(), &[1, 0]);
        assert_eq!(s.reduced_out_shape, shape![7, 3]);
    }

    #[test]
    fn test_duplicate_perm_is_rejected() {
        assert_eq!(
            ShapeInfo::new(&[4, 4], &[4, 4], &[1, 1], 4),
            Err(ShapeError::DuplicatePermAxis(1))
        );
    }

    #[test]
    fn test_out_of_range_perm_is_rejected() {
        assert_eq!(
            ShapeInfo::new(&[4, 5], &[5, 4], &[2, 0], 4),
            Err(ShapeError::PermOutOfRange { value: 2, dims: 2 })
        );
        assert_eq!(
            ShapeInfo::new(&[4, 5], &[5, 4], &[-3, 0], 4),
            Err(ShapeError::PermOutOfRange { value: -3, dims: 2 })
        );
    }

    #[test]
    fn test_zero_dimension_is_rejected() {
        assert_eq!(
            ShapeInfo::new(&[4, 0], &[0, 4], &[1, 0], 4),
            Err(ShapeError::NonPositiveDim {
                axis: 0,
                in_dim: 4,
                out_dim: 0
            })
        );
    }

    #[test]
    fn test_rank_errors() {
        assert_eq!(
            ShapeInfo::new(&[], &[], &[], 4),
            Err(ShapeError::RankOutOfRange(0))
        );
        assert_eq!(
            ShapeInfo::new(&[2; 9], &[2; 9], &[0, 1, 2, 3, 4, 5, 6, 7, 8], 4),
            Err(ShapeError::RankOutOfRange(9))
        );
        assert!(matches!(
            ShapeInfo::new(&[2, 3], &[3, 2, 1], &[1, 0], 4),
            Err(ShapeError::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_conflicting_output_is_rejected() {
        assert!(matches!(
            ShapeInfo::new(&[2, 3], &[2, 3], &[1, 0], 4),
            Err(ShapeError::PermConflict { axis: 0, .. })
        ));
    }

    #[test]
    fn test_overflowing_volume_is_rejected() {
        assert_eq!(
            info(&[1 << 40, 1 << 40], &[1, 0]),
            Err(ShapeError::VolumeOverflow { ele_len: 4 })
        );
        // The element count fits but the byte count does not.
        assert_eq!(
            info(&[1 << 31, 1 << 31], &[1, 0]),
            Err(ShapeError::VolumeOverflow { ele_len: 4 })
        );
        assert!(info(&[1 << 30, 1 << 30], &[1, 0]).is_ok());
    }

    #[test]
    fn test_element_size_must_be_positive() {
        assert_eq!(
            ShapeInfo::new(&[2, 3], &[3, 2], &[1, 0], 0),
            Err(ShapeError::InvalidElementSize(0))
        );
    }

    proptest! {
        #[test]
        fn test_reduction_preserves_volume((shape, perm) in arb_problem()) {
            let (reduced, reduced_perm) = reduce_axes(&shape, &perm);
            prop_assert_eq!(volume(&reduced), volume(&shape));
            prop_assert_eq!(reduced.len(), reduced_perm.len());
        }

        #[test]
        fn test_reduction_is_idempotent((shape, perm) in arb_problem()) {
            let (reduced, reduced_perm) = reduce_axes(&shape, &perm);
            let (again, again_perm) = reduce_axes(&reduced, &reduced_perm);
            prop_assert_eq!(again, reduced);
            prop_assert_eq!(again_perm, reduced_perm);
        }

        #[test]
        fn test_reduced_perm_is_a_permutation((shape, perm) in arb_problem()) {
            let (reduced, reduced_perm) = reduce_axes(&shape, &perm);
            let mut sorted = reduced_perm.to_vec();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..reduced.len()).collect::<Vec<_>>());
            if reduced.len() > 1 {
                prop_assert!(reduced.iter().all(|&d| d > 1));
                prop_assert!(reduced_perm.windows(2).all(|w| w[1] != w[0] + 1));
            }
        }

        #[test]
        fn test_out_position_inverts_perm((shape, perm) in arb_problem()) {
            let in_shape = shape.iter().map(|&d| d as i64).collect::<Vec<_>>();
            let signed_perm = perm.iter().map(|&p| p as i64).collect::<Vec<_>>();
            let s = info(&in_shape, &signed_perm).unwrap();
            for axis in 0..s.dim() {
                prop_assert_eq!(s.reduced_perm[s.out_position(axis)], axis);
            }
            for (position, &axis) in s.reduced_perm.iter().enumerate() {
                prop_assert_eq!(s.out_position(axis), position);
            }
        }

        #[test]
        fn test_reduced_output_matches_perm((shape, perm) in arb_problem()) {
            let in_shape = shape.iter().map(|&d| d as i64).collect::<Vec<_>>();
            let signed_perm = perm.iter().map(|&p| p as i64).collect::<Vec<_>>();
            let s = info(&in_shape, &signed_perm).unwrap();
            for (i, &p) in s.reduced_perm.iter().enumerate() {
                prop_assert_eq!(s.reduced_out_shape[i], s.reduced_in_shape[p]);
            }
            prop_assert_eq!(volume(&s.reduced_out_shape), volume(&s.out_shape));
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::common::NDDMA_MAX_DIM_NUM;
use crate::config::PlannerConfig;
use crate::shapeinfo::ShapeInfo;

/// Integer tag selecting the execution path of a plan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, enum_iterator::Sequence,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum TilingKey {
    TensorMove,
    SmallShape,
    CutOnce,
    CutTwice,
    NLastTranspose,
    BigDim,
    GatherTranspose,
}

impl TilingKey {
    pub fn value(self) -> i64 {
        match self {
            TilingKey::TensorMove => 0,
            TilingKey::SmallShape => 1,
            TilingKey::CutOnce => 2,
            TilingKey::CutTwice => 3,
            TilingKey::NLastTranspose => 4,
            TilingKey::BigDim => 5,
            TilingKey::GatherTranspose => 6,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        enum_iterator::all::<TilingKey>().find(|k| k.value() == value)
    }
}

impl Display for TilingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TilingKey::TensorMove => "TENSOR_MOVE",
            TilingKey::SmallShape => "SMALL_SHAPE",
            TilingKey::CutOnce => "CUT_ONCE",
            TilingKey::CutTwice => "CUT_TWICE",
            TilingKey::NLastTranspose => "N_LAST_TRANSPOSE",
            TilingKey::BigDim => "BIG_DIM",
            TilingKey::GatherTranspose => "GATHER_TRANSPOSE",
        };
        write!(f, "{name}")
    }
}

/// The tiling keys a buffer split can produce.
///
/// Gather plans carry their own block split and never pass through the
/// buffer and core split planners, so there is no gather variant here.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, enum_iterator::Sequence,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum SplitKey {
    TensorMove,
    SmallShape,
    CutOnce,
    CutTwice,
    NLastTranspose,
    BigDim,
}

impl From<SplitKey> for TilingKey {
    fn from(key: SplitKey) -> Self {
        match key {
            SplitKey::TensorMove => TilingKey::TensorMove,
            SplitKey::SmallShape => TilingKey::SmallShape,
            SplitKey::CutOnce => TilingKey::CutOnce,
            SplitKey::CutTwice => TilingKey::CutTwice,
            SplitKey::NLastTranspose => TilingKey::NLastTranspose,
            SplitKey::BigDim => TilingKey::BigDim,
        }
    }
}

impl Display for SplitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        TilingKey::from(*self).fmt(f)
    }
}

/// The execution mode chosen before buffer splitting.
///
/// [Mode::NddmaBase] is refined into [SplitKey::CutOnce] or
/// [SplitKey::CutTwice] once the buffer cut points are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Mode {
    TensorMove,
    SmallShape,
    NLastTranspose,
    NddmaBase,
    BigDim,
}

impl Mode {
    /// Whether a gather plan may stand in for this mode.
    pub fn is_nddma_eligible(self) -> bool {
        matches!(self, Mode::NddmaBase | Mode::BigDim)
    }
}

pub fn select_mode(shape: &ShapeInfo, config: &PlannerConfig) -> Mode {
    let dim = shape.dim();
    if dim == 1 {
        return Mode::TensorMove;
    }
    if shape.volume_bytes() < config.small_shape_bytes_threshold {
        return Mode::SmallShape;
    }
    if !shape.is_last_axis_transpose
        && shape.reduced_in_shape[dim - 1] >= config.movealign_last_min_ele
    {
        return Mode::NLastTranspose;
    }
    if dim <= NDDMA_MAX_DIM_NUM {
        Mode::NddmaBase
    } else {
        Mode::BigDim
    }
}

/// Whether the gather strategy should be tried before `mode`.
pub fn should_try_gather(mode: Mode, shape: &ShapeInfo, config: &PlannerConfig) -> bool {
    config.enable_gather && mode.is_nddma_eligible() && shape.is_last_axis_transpose
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info(in_shape: &[i64], perm: &[i64], ele: i64) -> ShapeInfo {
        let out = perm.iter().map(|&p| in_shape[p as usize]).collect::<Vec<_>>();
        ShapeInfo::new(in_shape, &out, perm, ele).unwrap()
    }

    #[test]
    fn test_single_axis_is_tensor_move() {
        let config = PlannerConfig::default();
        assert_eq!(select_mode(&info(&[1 << 24], &[0], 4), &config), Mode::TensorMove);
        assert_eq!(select_mode(&info(&[7, 9], &[0, 1], 4), &config), Mode::TensorMove);
    }

    #[test]
    fn test_small_volume_is_small_shape() {
        let config = PlannerConfig::default();
        assert_eq!(select_mode(&info(&[100, 200], &[1, 0], 4), &config), Mode::SmallShape);
    }

    #[test]
    fn test_untransposed_wide_last_axis_is_n_last() {
        let config = PlannerConfig::default();
        let s = info(&[64, 128, 256], &[1, 0, 2], 4);
        assert_eq!(select_mode(&s, &config), Mode::NLastTranspose);
        assert!(!should_try_gather(Mode::NLastTranspose, &s, &config));
    }

    #[test]
    fn test_untransposed_narrow_last_axis_is_nddma() {
        let config = PlannerConfig::default();
        let s = info(&[1024, 2048, 8], &[1, 0, 2], 4);
        assert_eq!(select_mode(&s, &config), Mode::NddmaBase);
        assert!(!should_try_gather(Mode::NddmaBase, &s, &config));
    }

    #[test]
    fn test_transposed_last_axis_tries_gather() {
        let config = PlannerConfig::default();
        let s = info(&[1024, 2048], &[1, 0], 4);
        assert_eq!(select_mode(&s, &config), Mode::NddmaBase);
        assert!(should_try_gather(Mode::NddmaBase, &s, &config));
        let disabled = PlannerConfig {
            enable_gather: false,
            ..PlannerConfig::default()
        };
        assert!(!should_try_gather(Mode::NddmaBase, &s, &disabled));
    }

    #[test]
    fn test_many_axes_is_big_dim() {
        let config = PlannerConfig::default();
        let s = info(&[4, 5, 6, 7, 8, 9, 10], &[6, 4, 2, 0, 5, 3, 1], 8);
        assert_eq!(s.dim(), 7);
        assert_eq!(select_mode(&s, &config), Mode::BigDim);
    }

    #[test]
    fn test_tiling_key_values_are_distinct() {
        let values = enum_iterator::all::<TilingKey>()
            .map(TilingKey::value)
            .collect::<Vec<_>>();
        assert_eq!(values, (0..7).collect::<Vec<_>>());
        assert_eq!(TilingKey::from_value(7), None);
    }

    #[test]
    fn test_split_keys_cover_all_but_gather() {
        let keys = enum_iterator::all::<SplitKey>()
            .map(TilingKey::from)
            .collect::<Vec<_>>();
        let expected = enum_iterator::all::<TilingKey>()
            .filter(|&k| k != TilingKey::GatherTranspose)
            .collect::<Vec<_>>();
        assert_eq!(keys, expected);
        assert_eq!(SplitKey::CutTwice.to_string(), "CUT_TWICE");
    }

    proptest! {
        #[test]
        fn test_tiling_key_value_is_invertible(key in any::<TilingKey>()) {
            prop_assert_eq!(TilingKey::from_value(key.value()), Some(key));
        }

        #[test]
        fn test_split_key_keeps_its_value(key in any::<SplitKey>()) {
            let tiling = TilingKey::from(key);
            prop_assert_ne!(tiling, TilingKey::GatherTranspose);
            prop_assert_eq!(TilingKey::from_value(tiling.value()), Some(tiling));
        }

        #[test]
        fn test_selection_is_total(
            dims in prop::collection::vec(1i64..40, 1..=8),
            ele in prop::sample::select(vec![1i64, 2, 4, 8]),
        ) {
            let n = dims.len() as i64;
            let perm = (0..n).rev().collect::<Vec<_>>();
            let s = info(&dims, &perm, ele);
            let mode = select_mode(&s, &PlannerConfig::default());
            if s.dim() == 1 {
                prop_assert_eq!(mode, Mode::TensorMove);
            }
            if mode == Mode::NddmaBase {
                prop_assert!(s.dim() <= NDDMA_MAX_DIM_NUM);
            }
        }
    }
}

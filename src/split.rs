use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::{BUFFER_NUM, NDDMA_MAX_DIM_NUM};
use crate::platform::PlatformInfo;
use crate::shapeinfo::ShapeInfo;
use crate::strategy::{Mode, SplitKey};
use crate::utils::{ceil_align, ceil_div, isqrt, volume};

/// Where the input and output sides of the transpose are cut to fit the buffer.
///
/// Indices refer to the reduced shapes. Factors are counted in elements of the
/// cut axis, except that an output cut on the input-cut axis counts blocks of
/// `in_ub_factor` until the core split folds the two together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SplitInfo {
    pub in_cut_index: usize,
    pub out_cut_index: usize,
    pub in_ub_factor: u64,
    pub out_ub_factor: u64,
    pub in_tail_factor: u64,
    pub out_tail_factor: u64,
    /// Buffer capacity, in elements, the cut points were chosen against.
    pub ub_element: u64,
}

impl SplitInfo {
    pub fn new(ub_element: u64) -> Self {
        SplitInfo {
            in_cut_index: 0,
            out_cut_index: 0,
            in_ub_factor: 1,
            out_ub_factor: 1,
            in_tail_factor: 0,
            out_tail_factor: 0,
            ub_element,
        }
    }

    pub(crate) fn set_in_cut(&mut self, index: usize, factor: u64, extent: u64) {
        self.in_cut_index = index;
        self.in_ub_factor = factor;
        self.in_tail_factor = extent % factor;
    }

    pub(crate) fn set_out_cut(&mut self, index: usize, factor: u64, extent: u64) {
        self.out_cut_index = index;
        self.out_ub_factor = factor;
        self.out_tail_factor = extent % factor;
    }
}

/// Whether an output tile cut at `cut` with `value` elements overflows the buffer.
///
/// The innermost run is padded to the buffer block size. With `calc_in`, a cut
/// on the input-cut axis is scaled by the input factor.
pub(crate) fn ub_out_of_bound(
    shape: &ShapeInfo,
    split: &SplitInfo,
    block_size: u64,
    cut: usize,
    value: u64,
    calc_in: bool,
) -> bool {
    let ele = shape.ele_len;
    let perm = &shape.reduced_perm;
    let out = &shape.reduced_out_shape;

    let mut burst = volume(&out[cut + 1..]) * value;
    if calc_in && perm[cut] == split.in_cut_index {
        burst *= split.in_ub_factor;
    }
    let mut elements = ceil_align(burst * ele, block_size) / ele;
    for i in 0..cut {
        if perm[i] > split.in_cut_index {
            elements *= out[i];
        } else if perm[i] == split.in_cut_index {
            elements *= split.in_ub_factor;
        }
    }
    elements > split.ub_element
}

/// Like [ub_out_of_bound], for tiles that keep the innermost input axis in place.
pub(crate) fn ub_out_of_bound_n_last(
    shape: &ShapeInfo,
    split: &SplitInfo,
    block_size: u64,
    cut: usize,
    value: u64,
) -> bool {
    let ele = shape.ele_len;
    let last = shape.dim() - 1;
    let input = &shape.reduced_in_shape;

    let burst = if cut == last { value } else { input[last] };
    let mut elements = ceil_align(burst * ele, block_size) / ele;
    for i in cut..last {
        elements *= if i == cut { value } else { input[i] };
    }
    elements > split.ub_element
}

/// Chooses buffer cut points for a [Mode].
pub struct BufferSplitPlanner<'a> {
    shape: &'a ShapeInfo,
    platform: &'a PlatformInfo,
}

impl<'a> BufferSplitPlanner<'a> {
    pub fn new(shape: &'a ShapeInfo, platform: &'a PlatformInfo) -> Self {
        BufferSplitPlanner { shape, platform }
    }

    /// Returns the cut points and the refined split key for `mode`.
    pub fn plan(&self, mode: Mode) -> (SplitInfo, SplitKey) {
        let ub_element = self.platform.ub_elements(self.shape.ele_len);
        match mode {
            Mode::TensorMove => (self.double_buffered(), SplitKey::TensorMove),
            Mode::NLastTranspose => (self.double_buffered(), SplitKey::NLastTranspose),
            Mode::SmallShape => {
                let mut split = SplitInfo::new(ub_element);
                let (input, output) = (&self.shape.reduced_in_shape, &self.shape.reduced_out_shape);
                split.set_in_cut(0, input[0], input[0]);
                split.set_out_cut(0, output[0], output[0]);
                (split, SplitKey::SmallShape)
            }
            Mode::NddmaBase => self.split_nddma(ub_element),
            Mode::BigDim => (self.split_big_dim(ub_element), SplitKey::BigDim),
        }
    }

    fn double_buffered(&self) -> SplitInfo {
        SplitInfo::new(self.platform.ub_size / BUFFER_NUM / self.shape.ele_len)
    }

    fn split_nddma(&self, ub_element: u64) -> (SplitInfo, SplitKey) {
        let shape = self.shape;
        let dim = shape.dim();
        let input = &shape.reduced_in_shape;
        let output = &shape.reduced_out_shape;
        let perm = &shape.reduced_perm;
        let core_num = self.platform.core_num;
        let mut split = SplitInfo::new(ub_element);

        // Input side: absorb whole axes into a sqrt-sized budget.
        let mut in_ub_element = isqrt(ub_element).max(1);
        let mut in_ub_actual = 1;
        let mut remaining = shape.volume();
        for idx in (0..dim).rev() {
            let extent = input[idx];
            if in_ub_element < extent {
                split.set_in_cut(idx, in_ub_element, extent);
                in_ub_actual *= in_ub_element;
                remaining = remaining / extent * ceil_div(extent, in_ub_element);
                break;
            }
            in_ub_element /= extent;
            in_ub_actual *= extent;
            remaining /= extent;
            split.in_ub_factor = extent;
        }

        // Output side, with whatever the input tile left over.
        let mut out_ub_element = (ub_element / in_ub_actual).max(1);
        for idx in (0..dim).rev() {
            if perm[idx] > split.in_cut_index {
                continue;
            }
            let extent = if perm[idx] == split.in_cut_index {
                ceil_div(input[split.in_cut_index], split.in_ub_factor)
            } else {
                output[idx]
            };
            remaining /= extent;
            if out_ub_element < extent {
                let tiles = remaining * ceil_div(extent, out_ub_element);
                if tiles > core_num {
                    self.find_factor_by_multiples(
                        &mut split,
                        idx,
                        extent,
                        remaining,
                        tiles / core_num,
                        out_ub_element,
                    );
                } else {
                    split.set_out_cut(idx, out_ub_element, extent);
                }
                break;
            }
            out_ub_element /= extent;
            split.set_out_cut(idx, extent, extent);
        }

        let key = if split.out_cut_index > shape.out_position(split.in_cut_index) {
            SplitKey::CutTwice
        } else {
            SplitKey::CutOnce
        };
        debug!(
            "Buffer split {key}: in cut {} by {}, out cut {} by {}",
            split.in_cut_index, split.in_ub_factor, split.out_cut_index, split.out_ub_factor
        );
        (split, key)
    }

    /// Picks the smallest output factor keeping the same number of full core rounds.
    fn find_factor_by_multiples(
        &self,
        split: &mut SplitInfo,
        cut: usize,
        extent: u64,
        remaining: u64,
        core_multiples: u64,
        out_ub_element: u64,
    ) {
        let block_size = self.platform.ub_block_size;
        let core_num = self.platform.core_num;
        let mut best = 1;
        for factor in 1..=out_ub_element {
            let fits = !ub_out_of_bound(self.shape, split, block_size, cut, factor, true);
            let tiles = remaining * ceil_div(extent, factor);
            if fits && tiles / core_num == core_multiples {
                split.set_out_cut(cut, factor, extent);
                return;
            }
            if fits {
                best = factor;
            }
        }
        split.set_out_cut(cut, best, extent);
    }

    fn split_big_dim(&self, ub_element: u64) -> SplitInfo {
        let shape = self.shape;
        let output = &shape.reduced_out_shape;
        let core_num = self.platform.core_num;
        let mut split = SplitInfo::new(ub_element);
        split.set_out_cut(0, output[0], output[0]);

        let mut budget = isqrt(ub_element).max(1);
        let mut absorbable = NDDMA_MAX_DIM_NUM - 1;
        let mut remaining = shape.volume();
        for idx in (0..shape.dim()).rev() {
            let extent = output[idx];
            if budget < extent {
                split.set_out_cut(idx, budget, extent);
                break;
            }
            if absorbable == 0 {
                split.set_out_cut(idx, extent, extent);
                break;
            }
            remaining /= extent;
            if remaining <= core_num {
                split.set_out_cut(idx, extent, extent);
                break;
            }
            budget /= extent;
            absorbable -= 1;
        }
        debug!(
            "Buffer split BIG_DIM: out cut {} by {}",
            split.out_cut_index, split.out_ub_factor
        );
        split
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info(in_shape: &[i64], perm: &[i64], ele: i64) -> ShapeInfo {
        let out = perm.iter().map(|&p| in_shape[p as usize]).collect::<Vec<_>>();
        ShapeInfo::new(in_shape, &out, perm, ele).unwrap()
    }

    fn platform() -> PlatformInfo {
        PlatformInfo::new(48, 192 * 1024, 128, 32).unwrap()
    }

    #[test]
    fn test_double_buffered_modes_halve_the_buffer() {
        let s = info(&[64, 128, 256], &[1, 0, 2], 4);
        let p = platform();
        let (split, key) = BufferSplitPlanner::new(&s, &p).plan(Mode::NLastTranspose);
        assert_eq!(key, SplitKey::NLastTranspose);
        assert_eq!(split.ub_element, 192 * 1024 / 2 / 4);
    }

    #[test]
    fn test_nddma_two_axis_swap() {
        let s = info(&[1024, 2048], &[1, 0], 4);
        let p = platform();
        let (split, key) = BufferSplitPlanner::new(&s, &p).plan(Mode::NddmaBase);
        // sqrt(49152) = 221, so the inner input axis is cut at 221.
        assert_eq!(split.in_cut_index, 1);
        assert_eq!(split.in_ub_factor, 221);
        assert_eq!(split.in_tail_factor, 2048 % 221);
        // Output axis 1 (input axis 0) is cut next, giving two cuts.
        assert_eq!(split.out_cut_index, 1);
        assert_eq!(key, SplitKey::CutTwice);
        assert!(split.out_ub_factor > 0);
        assert!(split.out_tail_factor < split.out_ub_factor);
    }

    #[test]
    fn test_nddma_cut_on_same_axis_is_cut_once() {
        let s = info(&[4096, 3, 8], &[1, 0, 2], 4);
        let p = platform();
        let (split, key) = BufferSplitPlanner::new(&s, &p).plan(Mode::NddmaBase);
        assert_eq!(split.in_cut_index, 0);
        assert_eq!(key, SplitKey::CutOnce);
    }

    #[test]
    fn test_out_of_bound_accounts_for_padding() {
        let s = info(&[1024, 2048], &[1, 0], 4);
        let split = SplitInfo {
            in_cut_index: 1,
            in_ub_factor: 100,
            ..SplitInfo::new(1000)
        };
        // One element pads to a full 8-element block.
        assert!(!ub_out_of_bound(&s, &split, 32, 1, 1, false));
        assert!(ub_out_of_bound(&s, &split, 32, 1, 1001, false));
        assert!(ub_out_of_bound_n_last(&s, &split, 32, 1, 1001));
        assert!(!ub_out_of_bound_n_last(&s, &split, 32, 1, 1000));
    }

    #[test]
    fn test_big_dim_absorbs_at_most_four_axes() {
        let s = info(&[4, 5, 6, 7, 8, 9, 10], &[6, 4, 2, 0, 5, 3, 1], 8);
        let p = PlatformInfo::new(2, 1 << 30, 128, 32).unwrap();
        let (split, key) = BufferSplitPlanner::new(&s, &p).plan(Mode::BigDim);
        assert_eq!(key, SplitKey::BigDim);
        assert!(split.out_cut_index >= s.dim() - NDDMA_MAX_DIM_NUM);
    }

    fn arb_nddma_problem() -> impl Strategy<Value = (Vec<i64>, Vec<i64>)> {
        prop::collection::vec(2i64..300, 2..=NDDMA_MAX_DIM_NUM).prop_flat_map(|shape| {
            let n = shape.len() as i64;
            (Just(shape), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn test_nddma_factors_are_valid((dims, perm) in arb_nddma_problem()) {
            let s = info(&dims, &perm, 4);
            prop_assume!(s.dim() > 1);
            let p = platform();
            let (split, key) = BufferSplitPlanner::new(&s, &p).plan(Mode::NddmaBase);
            prop_assert!(matches!(key, SplitKey::CutOnce | SplitKey::CutTwice));
            prop_assert!(split.in_cut_index < s.dim());
            prop_assert!(split.out_cut_index < s.dim());
            prop_assert!(split.in_ub_factor > 0 && split.out_ub_factor > 0);
            prop_assert!(split.in_tail_factor < split.in_ub_factor);
            prop_assert!(split.out_tail_factor < split.out_ub_factor);
            prop_assert!(split.in_ub_factor <= s.reduced_in_shape[split.in_cut_index]);
        }
    }
}

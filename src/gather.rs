use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeSet;

use crate::common::{MAX_SUPPORT_DIMS, UB_MAX_BORROW_NUM, UB_MAX_DIM_NUM};
use crate::config::PlannerConfig;
use crate::platform::PlatformInfo;
use crate::shapeinfo::ShapeInfo;
use crate::utils::{ceil_align, ceil_div, isqrt, volume};

const BYTES_PER_SUB_BANK: u64 = 8;
const BYTES_PER_BANK: u64 = 128;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatherError {
    #[error("Buffer tile of {0} bytes is below the gather minimum")]
    TileTooSmall(u64),
    #[error("Buffer tile of {tile_bytes} bytes exceeds the {budget}-byte data tensor")]
    TileTooLarge { tile_bytes: u64, budget: u64 },
    #[error("Index stride of {0} elements hits a bank conflict")]
    BankConflict(u64),
    #[error("A buffer cut factor is zero")]
    ZeroFactor,
    #[error("Only {used} of {cores} cores would be used")]
    UnderUtilized { used: u64, cores: u64 },
}

/// How the borrowed axes are laid out in the buffer.
///
/// Positions index the buffer axes in input order. Strides are in elements of
/// the full input and output tensors.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UbSplit {
    pub axes_cnt: usize,
    /// Reduced input axes cut by the input and output tiles.
    pub in_cut_axis: usize,
    pub out_cut_axis: usize,
    pub in_ub_in_cut_pos: usize,
    pub in_ub_out_cut_pos: usize,
    pub out_ub_in_cut_pos: usize,
    pub out_ub_out_cut_pos: usize,
    pub in_cut_axis_size: u64,
    pub out_cut_axis_size: u64,
    pub in_cut_axis_factor: u64,
    pub out_cut_axis_factor: u64,
    pub in_src_strides: [u64; 3],
    pub out_dst_strides: [u64; 3],
    /// Buffer tile extents in input order.
    pub in_ub_axes: [u64; UB_MAX_DIM_NUM],
    /// Buffer tile extents in output order.
    pub out_ub_axes: [u64; UB_MAX_DIM_NUM],
    /// Buffer-local permutation from `in_ub_axes` to `out_ub_axes`.
    pub ub_perm: [usize; UB_MAX_DIM_NUM],
}

/// One loop axis of the block split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlockAxis {
    pub loop_size: u64,
    pub in_offset: u64,
    pub out_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlockSplit {
    pub axes: SmallVec<[BlockAxis; MAX_SUPPORT_DIMS]>,
    /// Block axis holding the input cut, when that cut leaves a tail.
    pub in_ub_cut_pos: Option<usize>,
    /// Block axis holding the output cut, when that cut leaves a tail.
    pub out_ub_cut_pos: Option<usize>,
    pub used_core_cnt: u64,
    pub blk_factor: u64,
    /// Iterations of the last used core.
    pub blk_tail_factor: u64,
    pub total_iterations: u64,
}

/// A complete gather-based plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct GatherPlan {
    pub data_tensor_size: u64,
    pub index_tensor_size: u64,
    pub ub: UbSplit,
    pub blk: BlockSplit,
}

/// Which of the two outermost borrowed axes is cut, and what is already fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CutSide {
    /// Input and output cut the same axis.
    Shared,
    /// Only the output side is cut; the input cut axis is whole.
    Output,
    /// Only the input side is cut; the output cut axis is whole.
    Input,
    /// Both are cut and the input factor is already chosen.
    OutputAfterInput,
}

/// Axes borrowed into the buffer from one side, innermost first.
#[derive(Debug, Default)]
struct Borrowed {
    axes: SmallVec<[usize; UB_MAX_BORROW_NUM]>,
}

impl Borrowed {
    fn last(&self) -> usize {
        self.axes[self.axes.len() - 1]
    }

    fn whole(&self) -> &[usize] {
        &self.axes[..self.axes.len() - 1]
    }

    fn cnt(&self) -> usize {
        self.axes.len()
    }
}

pub struct GatherStrategyPlanner<'a> {
    shape: &'a ShapeInfo,
    platform: &'a PlatformInfo,
    config: &'a PlannerConfig,
}

struct State {
    data_tensor_size: u64,
    index_tensor_size: u64,
    elem_in_tensor: u64,
    in_perm: Borrowed,
    out_perm: Borrowed,
    in_perm_set: BTreeSet<usize>,
    all: BTreeSet<usize>,
    ub: UbSplit,
}

impl<'a> GatherStrategyPlanner<'a> {
    pub fn new(shape: &'a ShapeInfo, platform: &'a PlatformInfo, config: &'a PlannerConfig) -> Self {
        GatherStrategyPlanner {
            shape,
            platform,
            config,
        }
    }

    pub fn plan(&self) -> Result<GatherPlan, GatherError> {
        let (data_tensor_size, index_tensor_size) = self.tensor_sizes();
        let elem_in_tensor = data_tensor_size / self.shape.ele_len;
        let sqrted = self.sqrted_tensor(elem_in_tensor);
        if sqrted == 0 {
            return Err(GatherError::ZeroFactor);
        }

        let mut state = State {
            data_tensor_size,
            index_tensor_size,
            elem_in_tensor,
            in_perm: Borrowed::default(),
            out_perm: Borrowed::default(),
            in_perm_set: BTreeSet::new(),
            all: BTreeSet::new(),
            ub: UbSplit::default(),
        };
        self.borrow_axes(&mut state, sqrted);
        self.split_for_gather(&mut state, sqrted)?;
        self.mte_strides(&mut state);
        self.adjust_in_ub_axes(&mut state);
        debug!("Gather buffer split: {:?}", state.ub);

        let blk = self.block_split(&state)?;
        Ok(GatherPlan {
            data_tensor_size: state.data_tensor_size,
            index_tensor_size: state.index_tensor_size,
            ub: state.ub,
            blk,
        })
    }

    fn ele(&self) -> u64 {
        self.shape.ele_len
    }

    fn elem_per_block(&self) -> u64 {
        (self.platform.ub_block_size / self.ele()).max(1)
    }

    /// Byte sizes of the data and index tensors, double-buffered.
    fn tensor_sizes(&self) -> (u64, u64) {
        let ub = self.platform.ub_size;
        let block = self.platform.ub_block_size;
        match self.ele() {
            1 => {
                let data = ub / 6 / block * block;
                (data, data * 2)
            }
            8 => {
                let data = ub / 36 * 8 / block * block;
                (data, data / 2)
            }
            _ => {
                let data = ub / 5 / block * block;
                (data, data)
            }
        }
    }

    /// Whether a gather step of `steps` elements lands on the same bank parity.
    fn has_bank_conflict(&self, steps: u64) -> bool {
        let aligned = ceil_align(steps * self.ele(), BYTES_PER_SUB_BANK);
        aligned % BYTES_PER_BANK / BYTES_PER_SUB_BANK % 2 == 0
    }

    fn sqrted_tensor(&self, elem_in_tensor: u64) -> u64 {
        let ele = self.ele();
        let per_block = self.elem_per_block();
        let line = self.platform.cache_line_size;
        let mut sqrted = isqrt(elem_in_tensor) / per_block * per_block;
        if sqrted * ele > line {
            sqrted = sqrted * ele / line * line / ele;
        }
        let last_in = self.shape.reduced_in_shape[self.shape.dim() - 1];
        if last_in > sqrted && self.has_bank_conflict(sqrted) {
            sqrted = sqrted.saturating_sub((BYTES_PER_SUB_BANK / ele).max(1));
        }
        sqrted
    }

    fn borrow_axes(&self, state: &mut State, sqrted: u64) {
        let shape = self.shape;
        let dim = shape.dim();
        for i in (0..dim).rev() {
            state.in_perm.axes.push(i);
            state.in_perm_set.insert(i);
            state.all.insert(i);
            if state.in_perm.cnt() >= UB_MAX_BORROW_NUM
                || volume(&shape.reduced_in_shape[i..]) > sqrted
            {
                break;
            }
        }
        for i in (0..dim).rev() {
            state.out_perm.axes.push(shape.reduced_perm[i]);
            state.all.insert(shape.reduced_perm[i]);
            if state.out_perm.cnt() >= UB_MAX_BORROW_NUM
                || volume(&shape.reduced_out_shape[i..]) > sqrted
            {
                break;
            }
        }
        debug!(
            "Gather borrows input axes {:?} and output axes {:?}",
            state.in_perm.axes, state.out_perm.axes
        );
    }

    fn rank(state: &State, axis: usize) -> usize {
        state.all.range(..axis).count()
    }

    fn split_for_gather(&self, state: &mut State, sqrted: u64) -> Result<(), GatherError> {
        let shape = self.shape;
        let input = &shape.reduced_in_shape;
        let mut tmp_out_perm = [0usize; MAX_SUPPORT_DIMS];
        let mut tmp_in_axes = [0u64; MAX_SUPPORT_DIMS];
        let mut tmp_out_axes = [0u64; MAX_SUPPORT_DIMS];
        let mut place = |axis: usize, extent: u64| {
            let idx = shape.out_position(axis);
            tmp_out_perm[idx] = axis;
            tmp_out_axes[idx] = extent;
            tmp_in_axes[axis] = extent;
        };

        let mut left = state.all.clone();
        state.ub.axes_cnt = state.all.len();
        let in_last = state.in_perm.last();
        state.ub.in_cut_axis = in_last;
        state.ub.in_cut_axis_size = input[in_last];
        state.ub.in_ub_in_cut_pos = Self::rank(state, in_last);
        for &axis in state.in_perm.whole() {
            place(axis, input[axis]);
            left.remove(&axis);
        }
        let out_last = state.out_perm.last();
        state.ub.out_cut_axis = out_last;
        state.ub.out_cut_axis_size = input[out_last];
        state.ub.in_ub_out_cut_pos = Self::rank(state, out_last);
        for &axis in state.out_perm.whole() {
            if left.remove(&axis) {
                place(axis, input[axis]);
            }
        }

        let in_left = left.contains(&in_last);
        let out_left = left.contains(&out_last);
        self.cut_factors(state, sqrted, in_left, out_left, &left);
        if state.ub.in_cut_axis_factor == 0 || state.ub.out_cut_axis_factor == 0 {
            return Err(GatherError::ZeroFactor);
        }
        if in_left {
            place(in_last, state.ub.in_cut_axis_factor);
        }
        if out_left {
            place(out_last, state.ub.out_cut_axis_factor);
        }

        self.ub_axes(state, &tmp_in_axes, &tmp_out_axes, &tmp_out_perm)
    }

    fn cut_factors(
        &self,
        state: &mut State,
        sqrted: u64,
        in_left: bool,
        out_left: bool,
        left: &BTreeSet<usize>,
    ) {
        let shape = self.shape;
        let dim = shape.dim();
        let input = &shape.reduced_in_shape;
        let elem = state.elem_in_tensor;
        let per_block = self.elem_per_block();
        let in_size = state.ub.in_cut_axis_size;
        let out_size = state.ub.out_cut_axis_size;

        let all_saved: u64 = state
            .all
            .iter()
            .filter(|axis| !left.contains(*axis))
            .map(|&axis| input[axis])
            .product();
        let out_saved = volume(&shape.reduced_out_shape[dim + 1 - state.out_perm.cnt()..]);
        let in_saved = volume(&input[dim + 1 - state.in_perm.cnt()..]);
        // A quarter of the tensor is kept for the gather indices.
        let max_out_cut = elem / 4 / per_block * per_block / ceil_align(out_saved, per_block);
        let max_cut = elem / all_saved;

        let (in_factor, out_factor) = match (in_left, out_left) {
            (true, true) if state.in_perm.last() != state.out_perm.last() => {
                if state.out_perm.cnt() + state.in_perm.cnt() == state.ub.axes_cnt {
                    (in_size.min(sqrted / in_saved), out_size.min(sqrted / out_saved))
                } else {
                    // Axes borrowed by both sides take their share of the tensor first.
                    let common: u64 = state
                        .out_perm
                        .whole()
                        .iter()
                        .filter(|axis| state.in_perm_set.contains(*axis))
                        .map(|&axis| input[axis])
                        .product();
                    let new_sqrted = isqrt(elem / common / per_block * per_block);
                    let in_factor = in_size.min(new_sqrted / (in_saved / common));
                    let out_factor = out_size.min(new_sqrted / (out_saved / common));
                    let out_factor =
                        self.adjust_factor(state, out_factor, in_factor, CutSide::OutputAfterInput);
                    (in_factor, out_factor)
                }
            }
            (true, true) => {
                let factor = in_size.min(max_cut).min(max_out_cut);
                let factor = self.adjust_factor(state, factor, factor, CutSide::Shared);
                (factor, factor)
            }
            (false, false) => (in_size, out_size),
            (false, true) => {
                let factor = out_size.min(max_cut).min(max_out_cut);
                (in_size, self.adjust_factor(state, factor, in_size, CutSide::Output))
            }
            (true, false) => {
                let factor = in_size.min(max_cut);
                (self.adjust_factor(state, factor, out_size, CutSide::Input), out_size)
            }
        };
        state.ub.in_cut_axis_factor = in_factor;
        state.ub.out_cut_axis_factor = out_factor;
        debug!(
            "Gather cut factors: input {in_factor} of {in_size}, output {out_factor} of {out_size}"
        );
    }

    /// Shrinks `factor` until both the source and destination tiles fit the tensor.
    ///
    /// `fixed` is the factor already chosen for the other cut axis.
    fn adjust_factor(&self, state: &State, factor: u64, fixed: u64, side: CutSide) -> u64 {
        let input = &self.shape.reduced_in_shape;
        let elem = state.elem_in_tensor;
        let per_block = self.elem_per_block();
        if factor == 0 || fixed == 0 {
            return 0;
        }

        // Whole axes of each side, and those of the other side not already counted.
        let (dst_out, dst_in) = Self::side_volumes(state, &state.out_perm, &state.in_perm, input);
        let (src_in, src_out) = Self::side_volumes(state, &state.in_perm, &state.out_perm, input);

        match side {
            CutSide::Shared => {
                let dst_over = dst_in * ceil_align(dst_out * factor, per_block) > elem;
                let src_over = src_out * ceil_align(src_in * factor, per_block) > elem;
                if dst_over || src_over {
                    let dst = elem / dst_in / per_block * per_block / dst_out;
                    let src = elem / src_out / per_block * per_block / src_in;
                    return dst.min(src).min(factor);
                }
            }
            CutSide::Output | CutSide::OutputAfterInput => {
                let (dst_in, src_out) = if side == CutSide::OutputAfterInput {
                    (dst_in * fixed, src_out)
                } else {
                    (dst_in, (src_out / fixed).max(1))
                };
                let src_row = ceil_align(src_in * fixed, per_block);
                let dst_over = dst_in * ceil_align(dst_out * factor, per_block) > elem;
                let src_over = factor * src_out * src_row > elem;
                if dst_over || src_over {
                    let dst = elem / dst_in / per_block * per_block / dst_out;
                    let src = elem / src_out / src_row;
                    return dst.min(src).min(factor);
                }
            }
            CutSide::Input => {
                let dst_in = (dst_in / fixed).max(1);
                let dst_row = ceil_align(dst_out * fixed, per_block);
                let dst_over = factor * dst_in * dst_row > elem;
                let src_over = src_out * ceil_align(src_in * factor, per_block) > elem;
                if dst_over || src_over {
                    let dst = elem / dst_in / dst_row;
                    let src = elem / src_out / per_block * per_block / src_in;
                    return dst.min(src).min(factor);
                }
            }
        }
        factor
    }

    /// Volume of `primary`'s whole axes, and of `secondary`'s whole axes outside them.
    fn side_volumes(
        state: &State,
        primary: &Borrowed,
        secondary: &Borrowed,
        input: &[u64],
    ) -> (u64, u64) {
        let mut left = state.all.clone();
        let mut primary_volume = 1;
        for &axis in primary.whole() {
            primary_volume *= input[axis];
            left.remove(&axis);
        }
        let secondary_volume = secondary
            .whole()
            .iter()
            .filter(|axis| left.contains(*axis))
            .map(|&axis| input[axis])
            .product();
        (primary_volume, secondary_volume)
    }

    fn ub_axes(
        &self,
        state: &mut State,
        tmp_in_axes: &[u64; MAX_SUPPORT_DIMS],
        tmp_out_axes: &[u64; MAX_SUPPORT_DIMS],
        tmp_out_perm: &[usize; MAX_SUPPORT_DIMS],
    ) -> Result<(), GatherError> {
        let (mut in_idx, mut out_idx) = (0, 0);
        for j in 0..MAX_SUPPORT_DIMS {
            if tmp_out_axes[j] != 0 {
                let rank = Self::rank(state, tmp_out_perm[j]);
                state.ub.out_ub_axes[out_idx] = tmp_out_axes[j];
                state.ub.ub_perm[out_idx] = rank;
                out_idx += 1;
            }
            if tmp_in_axes[j] != 0 {
                state.ub.in_ub_axes[in_idx] = tmp_in_axes[j];
                in_idx += 1;
            }
        }

        let ub = &mut state.ub;
        let cnt = ub.axes_cnt;
        let tile_bytes = self.ele() * volume(&ub.in_ub_axes[..cnt]);
        let index_step = volume(&ub.in_ub_axes[ub.ub_perm[cnt - 1] + 1..cnt]);
        if tile_bytes < self.config.min_gather_tile_bytes {
            return Err(GatherError::TileTooSmall(tile_bytes));
        }
        if tile_bytes > state.data_tensor_size {
            return Err(GatherError::TileTooLarge {
                tile_bytes,
                budget: state.data_tensor_size,
            });
        }
        if self.has_bank_conflict(index_step) {
            return Err(GatherError::BankConflict(index_step));
        }

        for k in 0..cnt {
            if ub.ub_perm[k] == ub.in_ub_in_cut_pos {
                ub.out_ub_in_cut_pos = k;
            }
            if ub.ub_perm[k] == ub.in_ub_out_cut_pos {
                ub.out_ub_out_cut_pos = k;
            }
        }
        Ok(())
    }

    fn mte_strides(&self, state: &mut State) {
        let shape = self.shape;
        let dim = shape.dim();
        let input = &shape.reduced_in_shape;
        let output = &shape.reduced_out_shape;
        let in_last = state.in_perm.last();
        let out_first = state.out_perm.axes[0];
        let in_stride = |axis: usize| volume(&input[axis + 1..]);

        let strides = &mut state.ub.in_src_strides;
        let mut slot = 0;
        if out_first < in_last {
            // The output's innermost axis leads so that moved-in rows stay contiguous.
            strides[0] = in_stride(out_first);
            slot = 1;
        }
        let first_slot = slot;
        for i in (0..in_last).rev() {
            if !state.all.contains(&i) || i == out_first {
                continue;
            }
            strides[slot] = in_stride(i);
            if slot == first_slot {
                slot += 1;
            }
        }

        let strides = &mut state.ub.out_dst_strides;
        let mut slot = 0;
        for j in (0..dim.saturating_sub(state.out_perm.cnt())).rev() {
            if state.all.contains(&shape.reduced_perm[j]) {
                strides[slot] = volume(&output[j + 1..]);
                slot = (slot + 1).min(2);
            }
        }
    }

    /// Moves the output's innermost axis next to the input cut when borrowing reordered them.
    fn adjust_in_ub_axes(&self, state: &mut State) {
        let out_cnt = state.out_perm.cnt();
        let in_cnt = state.in_perm.cnt();
        let ub = &mut state.ub;
        let cnt = ub.axes_cnt;
        let out_last_pos = ub.ub_perm[cnt - 1];
        if ub.in_ub_in_cut_pos <= out_last_pos + 1 {
            return;
        }
        let gap = ub.in_ub_in_cut_pos - 1 - out_last_pos;
        ub.in_ub_axes
            .copy_within(out_last_pos + 1..out_last_pos + gap + 1, out_last_pos);
        ub.in_ub_axes[out_last_pos + gap] = ub.out_ub_axes[cnt - 1];
        if out_last_pos < ub.in_ub_out_cut_pos && ub.in_ub_out_cut_pos < ub.in_ub_in_cut_pos {
            ub.in_ub_out_cut_pos -= 1;
        }

        let perm = &mut ub.ub_perm[..cnt];
        let n = perm.len();
        match out_cnt {
            2 => {
                perm[n - 2] = 0;
                perm[n - 1] = 1;
            }
            3 if in_cnt + out_cnt == cnt => {
                if perm[n - 3] == 2 {
                    perm[n - 3..].copy_from_slice(&[1, 0, 2]);
                } else if perm[n - 2] == 2 {
                    perm[n - 3..].copy_from_slice(&[0, 1, 2]);
                }
            }
            3 => {
                if perm[n - 3] >= 2 {
                    perm[n - 2] = 0;
                    perm[n - 1] = 1;
                } else if perm[n - 2] >= 2 {
                    perm[n - 3] = 0;
                    perm[n - 1] = 1;
                }
            }
            _ => {}
        }
    }

    fn block_split(&self, state: &State) -> Result<BlockSplit, GatherError> {
        let shape = self.shape;
        let input = &shape.reduced_in_shape;
        let output = &shape.reduced_out_shape;
        let ub = &state.ub;
        let in_last = state.in_perm.last();
        let out_last = state.out_perm.last();

        let mut axes = SmallVec::<[BlockAxis; MAX_SUPPORT_DIMS]>::new();
        let mut in_ub_cut_pos = None;
        let mut out_ub_cut_pos = None;
        for i in 0..shape.dim() {
            let factor = if !state.all.contains(&i) {
                1
            } else if i == in_last && ub.in_cut_axis_size != ub.in_cut_axis_factor {
                if ub.in_cut_axis_size % ub.in_cut_axis_factor != 0 {
                    in_ub_cut_pos = Some(axes.len());
                }
                ub.in_cut_axis_factor
            } else if i == out_last && ub.out_cut_axis_size != ub.out_cut_axis_factor {
                if ub.out_cut_axis_size % ub.out_cut_axis_factor != 0 {
                    out_ub_cut_pos = Some(axes.len());
                }
                ub.out_cut_axis_factor
            } else {
                continue;
            };
            axes.push(BlockAxis {
                loop_size: ceil_div(input[i], factor),
                in_offset: volume(&input[i + 1..]) * factor,
                out_offset: volume(&output[shape.out_position(i) + 1..]) * factor,
            });
        }

        let total: u64 = axes.iter().map(|a| a.loop_size).product();
        let cores = self.platform.core_num;
        let used = ceil_div(total, ceil_div(total, cores));
        if used < cores / 2 {
            return Err(GatherError::UnderUtilized { used, cores });
        }
        let blk_factor = ceil_div(total, used);
        debug!("Gather block split: {total} iterations over {used} cores");
        Ok(BlockSplit {
            axes,
            in_ub_cut_pos,
            out_ub_cut_pos,
            used_core_cnt: used,
            blk_factor,
            blk_tail_factor: total - (used - 1) * blk_factor,
            total_iterations: total,
        })
    }
}

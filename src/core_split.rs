use log::debug;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::common::MAX_SUPPORT_DIMS;
use crate::config::PlannerConfig;
use crate::platform::PlatformInfo;
use crate::shapeinfo::ShapeInfo;
use crate::split::{ub_out_of_bound, ub_out_of_bound_n_last, SplitInfo};
use crate::strategy::SplitKey;
use crate::utils::{ceil_div, floor_align, volume};

/// How tile iterations are spread over cores.
///
/// Core `k` owns iterations `[k * blk_factor, (k + 1) * blk_factor)`, clipped to
/// `total_iterations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct CoreSplitInfo {
    pub real_core_num: u64,
    pub blk_factor: u64,
    pub blk_tail_factor: u64,
    pub total_iterations: u64,
}

impl CoreSplitInfo {
    /// Spreads `total` iterations as evenly as possible over at most `core_num` cores.
    pub fn distribute(total: u64, core_num: u64) -> Self {
        let real_core_num = core_num.min(total).max(1);
        let blk_factor = ceil_div(total, real_core_num).max(1);
        CoreSplitInfo {
            real_core_num,
            blk_factor,
            blk_tail_factor: total % blk_factor,
            total_iterations: total,
        }
    }

    /// Assigns `blk_factor` iterations per core, using as many cores as needed.
    pub(crate) fn with_block(total: u64, blk_factor: u64) -> Self {
        CoreSplitInfo {
            real_core_num: ceil_div(total, blk_factor),
            blk_factor,
            blk_tail_factor: total % blk_factor,
            total_iterations: total,
        }
    }

    /// The iterations owned by `core`. Empty for cores past the end.
    pub fn core_range(&self, core: u64) -> Range<u64> {
        let start = (core * self.blk_factor).min(self.total_iterations);
        let end = ((core + 1) * self.blk_factor).min(self.total_iterations);
        start..end
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        (0..self.real_core_num).map(|core| self.core_range(core))
    }
}

/// Chooses block factors that keep cores busy without overflowing the buffer.
pub struct CoreSplitPlanner<'a> {
    shape: &'a ShapeInfo,
    platform: &'a PlatformInfo,
    config: &'a PlannerConfig,
}

impl<'a> CoreSplitPlanner<'a> {
    pub fn new(shape: &'a ShapeInfo, platform: &'a PlatformInfo, config: &'a PlannerConfig) -> Self {
        CoreSplitPlanner {
            shape,
            platform,
            config,
        }
    }

    /// Distributes tiles for `key`, refining the buffer factors in `split`.
    pub fn plan(&self, key: SplitKey, split: &mut SplitInfo) -> CoreSplitInfo {
        debug!("Core split for {key}");
        let core = match key {
            SplitKey::TensorMove => self.tensor_move(split),
            SplitKey::SmallShape => self.small_shape(),
            SplitKey::CutOnce => self.cut_once(split),
            SplitKey::CutTwice => self.cut_twice(split),
            SplitKey::NLastTranspose => self.n_last(split),
            SplitKey::BigDim => self.big_dim(split),
        };
        debug!(
            "{} iterations over {} cores, {} per core",
            core.total_iterations, core.real_core_num, core.blk_factor
        );
        core
    }

    fn core_num(&self) -> u64 {
        self.platform.core_num
    }

    fn rate(&self, tiles: u64) -> f64 {
        tiles as f64 / self.core_num() as f64
    }

    fn tensor_move(&self, split: &mut SplitInfo) -> CoreSplitInfo {
        split.in_cut_index = 0;
        split.in_ub_factor = split.ub_element;
        split.in_tail_factor = 0;
        CoreSplitInfo::distribute(self.shape.volume(), self.core_num())
    }

    fn small_shape(&self) -> CoreSplitInfo {
        let total = self.shape.volume();
        let core_num = self.core_num();
        if total < core_num {
            return CoreSplitInfo::distribute(total, core_num);
        }

        let ele = self.shape.ele_len;
        let align = self.config.small_shape_split_align_bytes;
        let per_core = total / core_num;
        let ceil_factor = ceil_div(per_core * ele, align) * align / ele;
        let floor_factor = floor_align(per_core * ele, align) / ele;
        if floor_factor > 0 && total - floor_factor * (core_num - 1) <= floor_factor {
            return CoreSplitInfo {
                real_core_num: core_num,
                blk_factor: floor_factor,
                blk_tail_factor: total % floor_factor,
                total_iterations: total,
            };
        }
        if ceil_factor > 0 && ceil_div(total, ceil_factor) <= core_num {
            return CoreSplitInfo::with_block(total, ceil_factor);
        }
        CoreSplitInfo::distribute(total, core_num)
    }

    /// Scans factors downward from `start` for one that keeps enough cores busy.
    ///
    /// Falls back to the fitting factor with the best utilization seen.
    fn search_by_rate(
        &self,
        extent: u64,
        start: u64,
        other_tiles: u64,
        fits: impl Fn(u64) -> bool,
    ) -> u64 {
        let mut best = 1;
        let mut best_rate = 0.0;
        for factor in (1..=start).rev() {
            let rate = self.rate(ceil_div(extent, factor) * other_tiles);
            let fit = fits(factor);
            if fit && rate >= self.config.core_used_threshold {
                return factor;
            }
            if fit && rate > best_rate {
                best_rate = rate;
                best = factor;
            }
        }
        best
    }

    /// Product of the output axes left of `out_cut` that lie outside the buffer tile.
    fn outer_output_tiles(&self, split: &SplitInfo) -> u64 {
        let shape = self.shape;
        (0..split.out_cut_index)
            .filter(|&i| shape.reduced_perm[i] < split.in_cut_index)
            .map(|i| shape.reduced_out_shape[i])
            .product()
    }

    fn cut_once(&self, split: &mut SplitInfo) -> CoreSplitInfo {
        let shape = self.shape;
        let output = &shape.reduced_out_shape;

        if split.in_cut_index == shape.reduced_perm[split.out_cut_index] {
            let extent = output[split.out_cut_index];
            let factor = (split.out_ub_factor * split.in_ub_factor).min(extent);
            split.set_out_cut(split.out_cut_index, factor, extent);
        }
        if split.out_ub_factor == output[split.out_cut_index] {
            let index = shape.out_position(split.in_cut_index);
            split.set_out_cut(index, split.in_ub_factor, output[index]);
        }

        let extent = output[split.out_cut_index];
        let others = self.outer_output_tiles(split);
        if ceil_div(extent, split.out_ub_factor) < self.core_num() {
            let block_size = self.platform.ub_block_size;
            let frozen = *split;
            let factor = self.search_by_rate(extent, split.out_ub_factor, others, |f| {
                !ub_out_of_bound(shape, &frozen, block_size, frozen.out_cut_index, f, false)
            });
            split.set_out_cut(split.out_cut_index, factor, extent);
        }

        let total = ceil_div(extent, split.out_ub_factor) * others;
        CoreSplitInfo::distribute(total, self.core_num())
    }

    fn cut_twice(&self, split: &mut SplitInfo) -> CoreSplitInfo {
        let shape = self.shape;
        let in_extent = shape.reduced_in_shape[split.in_cut_index];
        let out_extent = shape.reduced_out_shape[split.out_cut_index];
        let others = self.outer_output_tiles(split) * ceil_div(out_extent, split.out_ub_factor);

        if others * ceil_div(in_extent, split.in_ub_factor) < self.core_num() {
            let block_size = self.platform.ub_block_size;
            let frozen = *split;
            let factor = self.search_by_rate(in_extent, split.in_ub_factor, others, |f| {
                let candidate = SplitInfo {
                    in_ub_factor: f,
                    ..frozen
                };
                !ub_out_of_bound(
                    shape,
                    &candidate,
                    block_size,
                    frozen.out_cut_index,
                    frozen.out_ub_factor,
                    false,
                )
            });
            split.set_in_cut(split.in_cut_index, factor, in_extent);
        }

        let total = ceil_div(in_extent, split.in_ub_factor) * others;
        CoreSplitInfo::distribute(total, self.core_num())
    }

    fn big_dim(&self, split: &mut SplitInfo) -> CoreSplitInfo {
        let output = &self.shape.reduced_out_shape;
        let core_num = self.core_num();
        let cut = split.out_cut_index;
        let extent = output[cut];
        let others = volume(&output[..cut]);

        let tiles = ceil_div(extent, split.out_ub_factor) * others;
        let factor = if tiles < core_num {
            self.search_by_rate(extent, split.out_ub_factor, others, |_| true)
        } else {
            let multiples = tiles / core_num;
            (1..=split.out_ub_factor)
                .find(|&f| ceil_div(extent, f) * others / core_num == multiples)
                .unwrap_or(split.out_ub_factor)
        };
        split.set_out_cut(cut, factor, extent);

        let total = ceil_div(extent, split.out_ub_factor) * others;
        CoreSplitInfo::distribute(total, core_num)
    }

    fn n_last(&self, split: &mut SplitInfo) -> CoreSplitInfo {
        let shape = self.shape;
        let input = &shape.reduced_in_shape;
        let dim = shape.dim();
        let core_num = self.core_num();

        let mut budget = split.ub_element;
        let mut remaining = shape.volume();
        // Volume of input axes absorbed whole, from each axis inward.
        let mut solved = [1u64; MAX_SUPPORT_DIMS];
        let mut cut = false;
        for idx in (0..dim).rev() {
            let extent = input[idx];
            remaining /= extent;
            let tiles = remaining * ceil_div(extent, budget);
            if budget < extent && tiles >= core_num {
                self.multiples_n_last(split, idx, budget, remaining);
                if split.in_ub_factor == 0 {
                    remaining = self.retry_inner_axes(split, idx, remaining, &solved);
                }
                cut = true;
                break;
            }
            if tiles < core_num {
                self.rate_n_last(split, idx, budget.min(extent), remaining);
                cut = true;
                break;
            }
            budget /= extent;
            solved[idx] = extent * if idx == dim - 1 { 1 } else { solved[idx + 1] };
        }

        if !cut {
            split.set_in_cut(0, input[0], input[0]);
            remaining = 1;
        }
        if split.in_ub_factor == 0 {
            split.set_in_cut(split.in_cut_index, 1, input[split.in_cut_index]);
        }
        let total = ceil_div(input[split.in_cut_index], split.in_ub_factor) * remaining;
        CoreSplitInfo::distribute(total, core_num)
    }

    fn rate_n_last(&self, split: &mut SplitInfo, idx: usize, start: u64, remaining: u64) {
        let extent = self.shape.reduced_in_shape[idx];
        let block_size = self.platform.ub_block_size;
        split.set_in_cut(idx, 1, extent);
        for factor in (2..=start).rev() {
            let rate = self.rate(remaining * ceil_div(extent, factor));
            if rate >= self.config.core_used_threshold
                && !ub_out_of_bound_n_last(self.shape, split, block_size, idx, factor)
            {
                split.set_in_cut(idx, factor, extent);
                return;
            }
        }
    }

    /// Largest fitting factor, then the smallest one with the same number of full rounds.
    ///
    /// Leaves a zero factor when nothing fits.
    fn multiples_n_last(&self, split: &mut SplitInfo, idx: usize, start: u64, remaining: u64) {
        let extent = self.shape.reduced_in_shape[idx];
        let block_size = self.platform.ub_block_size;
        let core_num = self.core_num();
        split.in_cut_index = idx;
        split.in_ub_factor = 0;
        split.in_tail_factor = 0;

        let Some(largest) = (1..=start)
            .rev()
            .find(|&f| !ub_out_of_bound_n_last(self.shape, split, block_size, idx, f))
        else {
            return;
        };
        split.set_in_cut(idx, largest, extent);

        let multiples = remaining * ceil_div(extent, largest) / core_num;
        if let Some(factor) = (1..largest).find(|&f| {
            remaining * ceil_div(extent, f) / core_num == multiples
                && !ub_out_of_bound_n_last(self.shape, split, block_size, idx, f)
        }) {
            split.set_in_cut(idx, factor, extent);
        }
    }

    /// Moves the cut inward until some factor fits. Returns the new outer volume.
    fn retry_inner_axes(
        &self,
        split: &mut SplitInfo,
        mut idx: usize,
        mut remaining: u64,
        solved: &[u64],
    ) -> u64 {
        let input = &self.shape.reduced_in_shape;
        let total = self.shape.volume();
        while idx + 1 < self.shape.dim() {
            idx += 1;
            remaining = total / solved[idx];
            self.multiples_n_last(split, idx, input[idx], remaining);
            if split.in_ub_factor > 0 {
                break;
            }
        }
        remaining
    }
}

use serde::{Deserialize, Serialize};

use crate::common::{MAX_SUPPORT_DIMS, NDDMA_MAX_DIM_NUM, UB_MAX_DIM_NUM};
use crate::core_split::CoreSplitInfo;
use crate::gather::GatherPlan;
use crate::nddma::{BigDimTables, IntervalRanges, NddmaLayout, NddmaShape, OffsetRange};
use crate::shapeinfo::ShapeInfo;
use crate::split::SplitInfo;
use crate::strategy::TilingKey;

/// The chosen execution path and the tables only that path needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Strategy {
    TensorMove,
    /// `layout` is absent when the reduced rank exceeds the NDDMA rank.
    SmallShape {
        layout: Option<NddmaLayout>,
    },
    CutOnce {
        layout: NddmaLayout,
    },
    CutTwice {
        layout: NddmaLayout,
        intervals: IntervalRanges,
    },
    NLastTranspose,
    BigDim {
        tables: BigDimTables,
    },
    GatherTranspose(Box<GatherPlan>),
}

impl Strategy {
    pub fn tiling_key(&self) -> TilingKey {
        match self {
            Strategy::TensorMove => TilingKey::TensorMove,
            Strategy::SmallShape { .. } => TilingKey::SmallShape,
            Strategy::CutOnce { .. } => TilingKey::CutOnce,
            Strategy::CutTwice { .. } => TilingKey::CutTwice,
            Strategy::NLastTranspose => TilingKey::NLastTranspose,
            Strategy::BigDim { .. } => TilingKey::BigDim,
            Strategy::GatherTranspose(_) => TilingKey::GatherTranspose,
        }
    }

    pub fn layout(&self) -> Option<&NddmaLayout> {
        match self {
            Strategy::SmallShape { layout } => layout.as_ref(),
            Strategy::CutOnce { layout } | Strategy::CutTwice { layout, .. } => Some(layout),
            _ => None,
        }
    }
}

/// A complete, immutable transpose plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TilingPlan {
    pub shape: ShapeInfo,
    pub split: SplitInfo,
    pub core: CoreSplitInfo,
    pub strategy: Strategy,
    /// Buffer capacity of one core, in bytes.
    pub ub_size: u64,
    pub workspace_size: u64,
}

impl TilingPlan {
    pub fn tiling_key(&self) -> TilingKey {
        self.strategy.tiling_key()
    }

    /// Number of cores the plan launches.
    pub fn block_dim(&self) -> u64 {
        self.core.real_core_num
    }

    /// Packs the plan into the fixed-layout record read by the kernels.
    pub fn record(&self) -> TilingRecord {
        match &self.strategy {
            Strategy::GatherTranspose(gather) => {
                TilingRecord::Gather(Box::new(GatherTilingData::new(self.tiling_key(), gather)))
            }
            _ => TilingRecord::Nddma(Box::new(NddmaTilingData::new(self))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum TilingRecord {
    Nddma(Box<NddmaTilingData>),
    Gather(Box<GatherTilingData>),
}

impl TilingRecord {
    /// Encodes the record as consecutive little-endian `i64`s in field order.
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        match self {
            TilingRecord::Nddma(data) => bincode::serialize(data.as_ref()),
            TilingRecord::Gather(data) => bincode::serialize(data.as_ref()),
        }
    }
}

/// Record consumed by every NDDMA-based strategy.
///
/// Tables a strategy does not use are zero.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NddmaTilingData {
    pub perm_size: i64,
    pub in_cut_index: i64,
    pub out_cut_index: i64,
    pub in_ub_factor: i64,
    pub out_ub_factor: i64,
    pub in_tail_factor: i64,
    pub out_tail_factor: i64,
    pub real_core_num: i64,
    pub blk_factor: i64,
    pub blk_tail_factor: i64,
    pub ub_size: i64,
    pub total_nddma_num: i64,
    pub input_shape: [i64; MAX_SUPPORT_DIMS],
    pub output_shape: [i64; MAX_SUPPORT_DIMS],
    pub perm: [i64; MAX_SUPPORT_DIMS],
    pub base_in_shape: [i64; MAX_SUPPORT_DIMS],
    pub base_nddma_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub nddma_idx: [i64; NDDMA_MAX_DIM_NUM],
    pub range_main_end: i64,
    pub range_input_tail_start: i64,
    pub range_input_tail_end: i64,
    pub range_output_tail_start: i64,
    pub range_output_tail_end: i64,
    pub range_tail_start: i64,
    pub range_tail_end: i64,
    pub expanded_perm: [i64; NDDMA_MAX_DIM_NUM],
    pub expanded_input_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub expanded_output_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub in_ub_main_src_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub in_ub_main_dst_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub in_ub_input_tail_src_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub in_ub_input_tail_dst_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub in_ub_output_tail_src_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub in_ub_output_tail_dst_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub in_ub_tail_src_shape: [i64; NDDMA_MAX_DIM_NUM],
    pub in_ub_tail_dst_shape: [i64; NDDMA_MAX_DIM_NUM],
}

impl NddmaTilingData {
    fn new(plan: &TilingPlan) -> Self {
        let shape = &plan.shape;
        let split = &plan.split;
        let core = &plan.core;
        let mut data = NddmaTilingData {
            perm_size: shape.dim() as i64,
            in_cut_index: split.in_cut_index as i64,
            out_cut_index: split.out_cut_index as i64,
            in_ub_factor: split.in_ub_factor as i64,
            out_ub_factor: split.out_ub_factor as i64,
            in_tail_factor: split.in_tail_factor as i64,
            out_tail_factor: split.out_tail_factor as i64,
            real_core_num: core.real_core_num as i64,
            blk_factor: core.blk_factor as i64,
            blk_tail_factor: core.blk_tail_factor as i64,
            ub_size: plan.ub_size as i64,
            input_shape: fixed(shape.reduced_in_shape.iter().map(|&d| d as i64)),
            output_shape: fixed(shape.reduced_out_shape.iter().map(|&d| d as i64)),
            perm: fixed(shape.reduced_perm.iter().map(|&p| p as i64)),
            ..NddmaTilingData::default()
        };

        if let Some(layout) = plan.strategy.layout() {
            data.fill_layout(layout);
        }
        match &plan.strategy {
            Strategy::CutTwice { intervals, .. } => data.fill_intervals(intervals),
            Strategy::BigDim { tables } => {
                data.total_nddma_num = tables.total_nddma_num as i64;
                data.base_in_shape = fixed(tables.base_in_shape.iter().map(|&s| s as i64));
                data.base_nddma_shape = fixed(tables.base_nddma_shape().map(|s| s as i64));
                data.nddma_idx = fixed(tables.nddma_idx().map(|a| a as i64));
            }
            _ => {}
        }
        data
    }

    fn fill_layout(&mut self, layout: &NddmaLayout) {
        let expanded = &layout.expanded;
        self.expanded_perm = fixed(expanded.perm.iter().map(|&p| p as i64));
        self.expanded_input_shape = nddma_shape(&expanded.in_shape);
        self.expanded_output_shape = nddma_shape(&expanded.out_shape);
        self.in_ub_main_src_shape = nddma_shape(&layout.main.src);
        self.in_ub_main_dst_shape = nddma_shape(&layout.main.dst);
        self.in_ub_input_tail_src_shape = nddma_shape(&layout.input_tail.src);
        self.in_ub_input_tail_dst_shape = nddma_shape(&layout.input_tail.dst);
        self.in_ub_output_tail_src_shape = nddma_shape(&layout.output_tail.src);
        self.in_ub_output_tail_dst_shape = nddma_shape(&layout.output_tail.dst);
        self.in_ub_tail_src_shape = nddma_shape(&layout.tail.src);
        self.in_ub_tail_dst_shape = nddma_shape(&layout.tail.dst);
    }

    fn fill_intervals(&mut self, intervals: &IntervalRanges) {
        let bounds = |range: Option<OffsetRange>| {
            range.map_or((0, 0), |r| (r.start as i64, r.end as i64))
        };
        self.range_main_end = intervals.main.end as i64;
        (self.range_input_tail_start, self.range_input_tail_end) = bounds(intervals.input_tail);
        (self.range_output_tail_start, self.range_output_tail_end) = bounds(intervals.output_tail);
        (self.range_tail_start, self.range_tail_end) = bounds(intervals.tail);
    }
}

/// Record consumed by the gather strategy. Absent cut positions are `-1`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GatherTilingData {
    pub tiling_key: i64,
    pub data_tensor_size: i64,
    pub index_tensor_size: i64,
    pub used_core_cnt: i64,
    pub blk_axes_cnt: i64,
    pub blk_in_ub_cut_pos: i64,
    pub blk_out_ub_cut_pos: i64,
    pub ub_axes_cnt: i64,
    pub in_ub_in_cut_pos: i64,
    pub in_ub_out_cut_pos: i64,
    pub out_ub_in_cut_pos: i64,
    pub out_ub_out_cut_pos: i64,
    pub blk_factor: i64,
    pub blk_tail_factor: i64,
    pub in_ub_cut_axis_size: i64,
    pub out_ub_cut_axis_size: i64,
    pub in_ub_cut_axis_factor: i64,
    pub out_ub_cut_axis_factor: i64,
    pub axis0_in_src_stride: i64,
    pub axis1_in_src_stride: i64,
    pub axis2_in_src_stride: i64,
    pub axis0_out_dst_stride: i64,
    pub axis1_out_dst_stride: i64,
    pub axis2_out_dst_stride: i64,
    pub blk_axes: [i64; MAX_SUPPORT_DIMS],
    pub blk_axes_in_a_offset: [i64; MAX_SUPPORT_DIMS],
    pub blk_axes_out_a_offset: [i64; MAX_SUPPORT_DIMS],
    pub in_ub_axes: [i64; UB_MAX_DIM_NUM],
    pub out_ub_axes: [i64; UB_MAX_DIM_NUM],
    pub ub_perm: [i64; UB_MAX_DIM_NUM],
}

impl GatherTilingData {
    fn new(key: TilingKey, gather: &GatherPlan) -> Self {
        let ub = &gather.ub;
        let blk = &gather.blk;
        let cut_pos = |pos: Option<usize>| pos.map_or(-1, |p| p as i64);
        GatherTilingData {
            tiling_key: key.value(),
            data_tensor_size: gather.data_tensor_size as i64,
            index_tensor_size: gather.index_tensor_size as i64,
            used_core_cnt: blk.used_core_cnt as i64,
            blk_axes_cnt: blk.axes.len() as i64,
            blk_in_ub_cut_pos: cut_pos(blk.in_ub_cut_pos),
            blk_out_ub_cut_pos: cut_pos(blk.out_ub_cut_pos),
            ub_axes_cnt: ub.axes_cnt as i64,
            in_ub_in_cut_pos: ub.in_ub_in_cut_pos as i64,
            in_ub_out_cut_pos: ub.in_ub_out_cut_pos as i64,
            out_ub_in_cut_pos: ub.out_ub_in_cut_pos as i64,
            out_ub_out_cut_pos: ub.out_ub_out_cut_pos as i64,
            blk_factor: blk.blk_factor as i64,
            blk_tail_factor: blk.blk_tail_factor as i64,
            in_ub_cut_axis_size: ub.in_cut_axis_size as i64,
            out_ub_cut_axis_size: ub.out_cut_axis_size as i64,
            in_ub_cut_axis_factor: ub.in_cut_axis_factor as i64,
            out_ub_cut_axis_factor: ub.out_cut_axis_factor as i64,
            axis0_in_src_stride: ub.in_src_strides[0] as i64,
            axis1_in_src_stride: ub.in_src_strides[1] as i64,
            axis2_in_src_stride: ub.in_src_strides[2] as i64,
            axis0_out_dst_stride: ub.out_dst_strides[0] as i64,
            axis1_out_dst_stride: ub.out_dst_strides[1] as i64,
            axis2_out_dst_stride: ub.out_dst_strides[2] as i64,
            blk_axes: fixed(blk.axes.iter().map(|a| a.loop_size as i64)),
            blk_axes_in_a_offset: fixed(blk.axes.iter().map(|a| a.in_offset as i64)),
            blk_axes_out_a_offset: fixed(blk.axes.iter().map(|a| a.out_offset as i64)),
            in_ub_axes: fixed(ub.in_ub_axes.iter().map(|&a| a as i64)),
            out_ub_axes: fixed(ub.out_ub_axes.iter().map(|&a| a as i64)),
            ub_perm: fixed(ub.ub_perm.iter().map(|&p| p as i64)),
        }
    }
}

/// Copies `values` into a zero-padded array, dropping any overflow.
fn fixed<const N: usize>(values: impl IntoIterator<Item = i64>) -> [i64; N] {
    let mut out = [0; N];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = value;
    }
    out
}

fn nddma_shape(shape: &NddmaShape) -> [i64; NDDMA_MAX_DIM_NUM] {
    fixed(shape.iter().map(|&d| d as i64))
}

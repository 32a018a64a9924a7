use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::common::BUFFER_NUM;
use crate::config::{ConfigError, PlannerConfig};
use crate::core_split::{CoreSplitInfo, CoreSplitPlanner};
use crate::gather::{GatherPlan, GatherStrategyPlanner};
use crate::nddma::{BigDimTables, IntervalRanges, NddmaLayout};
use crate::plan::{Strategy, TilingPlan};
use crate::platform::{PlatformError, PlatformInfo};
use crate::reshape::{ReshapeError, ReshapeTranspose};
use crate::shapeinfo::{ShapeError, ShapeInfo};
use crate::split::{BufferSplitPlanner, SplitInfo};
use crate::strategy::{select_mode, should_try_gather, SplitKey, TilingKey};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Reshape(#[from] ReshapeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("A {ub_size}-byte buffer cannot double-buffer {ele_len}-byte elements")]
    BufferTooSmall { ub_size: u64, ele_len: u64 },
    #[error("No {key} layout exists for rank {dim}")]
    LayoutRank { key: TilingKey, dim: usize },
}

/// A raw transpose problem as supplied by a caller.
///
/// `out_shape[i]` must equal `in_shape[perm[i]]`. Negative perm entries count
/// from the end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TransposeRequest {
    pub in_shape: Vec<i64>,
    pub out_shape: Vec<i64>,
    pub perm: Vec<i64>,
    pub element_size: i64,
}

/// Plans transposes against one platform and configuration.
#[derive(Debug, Clone)]
pub struct Planner {
    platform: PlatformInfo,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(platform: PlatformInfo, config: PlannerConfig) -> Result<Self, PlanError> {
        platform.validate()?;
        config.validate()?;
        Ok(Planner { platform, config })
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn plan_transpose(&self, request: &TransposeRequest) -> Result<TilingPlan, PlanError> {
        let shape = ShapeInfo::new(
            &request.in_shape,
            &request.out_shape,
            &request.perm,
            request.element_size,
        )?;
        self.plan_shape(shape, true)
    }

    /// Plans the transpose underlying a fused reshape+transpose.
    ///
    /// The gather strategy is never used on this path.
    pub fn plan_reshape_transpose(
        &self,
        request: &ReshapeTranspose,
    ) -> Result<TilingPlan, PlanError> {
        let transpose = request.to_transpose()?;
        let shape = ShapeInfo::new(
            &transpose.in_shape,
            &transpose.out_shape,
            &transpose.perm,
            transpose.element_size,
        )?;
        self.plan_shape(shape, false)
    }

    fn plan_shape(&self, shape: ShapeInfo, allow_gather: bool) -> Result<TilingPlan, PlanError> {
        let ub_size = self.platform.ub_size;
        if ub_size / BUFFER_NUM / shape.ele_len == 0 {
            return Err(PlanError::BufferTooSmall {
                ub_size,
                ele_len: shape.ele_len,
            });
        }

        let mode = select_mode(&shape, &self.config);
        debug!("Planning {shape} in mode {mode:?}");
        if allow_gather && should_try_gather(mode, &shape, &self.config) {
            match GatherStrategyPlanner::new(&shape, &self.platform, &self.config).plan() {
                Ok(gather) => return Ok(self.finish(self.gather_plan(shape, gather))),
                Err(e) => debug!("Gather strategy rejected ({e}); falling back to {mode:?}"),
            }
        }

        let (mut split, key) = BufferSplitPlanner::new(&shape, &self.platform).plan(mode);
        let core = CoreSplitPlanner::new(&shape, &self.platform, &self.config).plan(key, &mut split);
        let strategy = nddma_strategy(key, &shape, &split)?;
        Ok(self.finish(TilingPlan {
            shape,
            split,
            core,
            strategy,
            ub_size,
            workspace_size: self.config.workspace_size,
        }))
    }

    fn gather_plan(&self, shape: ShapeInfo, gather: GatherPlan) -> TilingPlan {
        let ub = &gather.ub;
        let blk = &gather.blk;
        let mut split = SplitInfo::new(gather.data_tensor_size / shape.ele_len);
        split.set_in_cut(ub.in_cut_axis, ub.in_cut_axis_factor, ub.in_cut_axis_size);
        split.set_out_cut(
            shape.out_position(ub.out_cut_axis),
            ub.out_cut_axis_factor,
            ub.out_cut_axis_size,
        );
        let core = CoreSplitInfo {
            real_core_num: blk.used_core_cnt,
            blk_factor: blk.blk_factor,
            blk_tail_factor: blk.total_iterations % blk.blk_factor,
            total_iterations: blk.total_iterations,
        };
        TilingPlan {
            shape,
            split,
            core,
            strategy: Strategy::GatherTranspose(Box::new(gather)),
            ub_size: self.platform.ub_size,
            workspace_size: self.config.workspace_size,
        }
    }

    fn finish(&self, plan: TilingPlan) -> TilingPlan {
        info!(
            "Planned {} as {} on {} cores ({} iterations, {} per core)",
            plan.shape,
            plan.tiling_key(),
            plan.block_dim(),
            plan.core.total_iterations,
            plan.core.blk_factor
        );
        plan
    }
}

impl Default for Planner {
    fn default() -> Self {
        Planner {
            platform: PlatformInfo::default(),
            config: PlannerConfig::default(),
        }
    }
}

/// Plans `request` on the default platform and configuration.
pub fn plan_transpose(request: &TransposeRequest) -> Result<TilingPlan, PlanError> {
    Planner::default().plan_transpose(request)
}

fn nddma_strategy(
    key: SplitKey,
    shape: &ShapeInfo,
    split: &SplitInfo,
) -> Result<Strategy, PlanError> {
    let rank_error = || PlanError::LayoutRank {
        key: key.into(),
        dim: shape.dim(),
    };
    Ok(match key {
        SplitKey::TensorMove => Strategy::TensorMove,
        SplitKey::SmallShape => Strategy::SmallShape {
            layout: NddmaLayout::no_cut(shape, split),
        },
        SplitKey::CutOnce => Strategy::CutOnce {
            layout: NddmaLayout::cut_once(shape, split).ok_or_else(rank_error)?,
        },
        SplitKey::CutTwice => {
            let layout = NddmaLayout::cut_twice(shape, split).ok_or_else(rank_error)?;
            let intervals = IntervalRanges::cut_twice(&layout, split);
            Strategy::CutTwice { layout, intervals }
        }
        SplitKey::NLastTranspose => Strategy::NLastTranspose,
        SplitKey::BigDim => Strategy::BigDim {
            tables: BigDimTables::new(shape, split),
        },
    })
}

pub mod common;
pub mod config;
pub mod core_split;
pub mod gather;
pub mod nddma;
pub mod plan;
pub mod planner;
pub mod platform;
pub mod pprint;
pub mod reshape;
pub mod shapeinfo;
pub mod split;
pub mod strategy;
pub mod utils;

pub use planner::{plan_transpose, PlanError, Planner, TransposeRequest};

// Exported for the `shape!` macro.
pub use smallvec;

use iai_callgrind::{black_box, main};

use transplan::config::PlannerConfig;
use transplan::platform::PlatformInfo;
use transplan::planner::{Planner, TransposeRequest};

fn request(in_shape: &[i64], perm: &[i64]) -> TransposeRequest {
    TransposeRequest {
        in_shape: in_shape.to_vec(),
        out_shape: perm.iter().map(|&p| in_shape[p as usize]).collect(),
        perm: perm.to_vec(),
        element_size: 4,
    }
}

#[inline(never)]
fn plan_gather_swap() {
    let planner = Planner::default();
    black_box(planner.plan_transpose(&request(&[1024, 2048], &[1, 0])).unwrap());
}

#[inline(never)]
fn plan_nddma_swap() {
    let config = PlannerConfig {
        enable_gather: false,
        ..PlannerConfig::default()
    };
    let planner = Planner::new(PlatformInfo::default(), config).unwrap();
    black_box(planner.plan_transpose(&request(&[1024, 2048], &[1, 0])).unwrap());
}

#[inline(never)]
fn plan_n_last() {
    let planner = Planner::default();
    black_box(planner.plan_transpose(&request(&[64, 128, 256], &[1, 0, 2])).unwrap());
}

#[inline(never)]
fn plan_big_dim() {
    let planner = Planner::default();
    let r = TransposeRequest {
        element_size: 8,
        ..request(&[4, 5, 6, 7, 8, 9, 10], &[6, 4, 2, 0, 5, 3, 1])
    };
    black_box(planner.plan_transpose(&r).unwrap());
}

main!(
    callgrind_args = "--simulate-wb=no", "--simulate-hwpref=yes",
        "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64";
    functions = plan_gather_swap, plan_nddma_swap, plan_n_last, plan_big_dim
);

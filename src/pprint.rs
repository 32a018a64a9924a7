use crate::nddma::{NddmaLayout, OffsetRange};
use crate::plan::{Strategy, TilingPlan};

use itertools::Itertools;
use prettytable::{self, format, row, Cell, Row};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PlanPrintStyle {
    Full,
    Compact,
}

/// Pretty-print a [TilingPlan] to stdout.
pub fn pprint(plan: &TilingPlan, style: PlanPrintStyle) {
    pprint_table(plan, style).printstd();
}

/// Pretty-print a [TilingPlan] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(out: &mut W, plan: &TilingPlan, style: PlanPrintStyle) -> fmt::Result {
    write!(out, "{}", pprint_table(plan, style))
}

pub fn pprint_string(plan: &TilingPlan, style: PlanPrintStyle) -> String {
    format!("{}", pprint_table(plan, style))
}

fn pprint_table(plan: &TilingPlan, style: PlanPrintStyle) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    match style {
        PlanPrintStyle::Full => {
            table.set_titles(row!["Field", "Value"]);
            for (name, value) in full_rows(plan) {
                table.add_row(row![name, value]);
            }
        }
        PlanPrintStyle::Compact => {
            table.set_titles(row!["Key", "Shape", "Cores", "Per core", "Tail"]);
            let mut r = Row::empty();
            for v in [
                plan.tiling_key().to_string(),
                plan.shape.to_string(),
                plan.block_dim().to_string(),
                plan.core.blk_factor.to_string(),
                plan.core.blk_tail_factor.to_string(),
            ] {
                r.add_cell(Cell::new(&v));
            }
            table.add_row(r);
        }
    }

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

fn full_rows(plan: &TilingPlan) -> Vec<(&'static str, String)> {
    let shape = &plan.shape;
    let split = &plan.split;
    let core = &plan.core;
    let mut rows = vec![
        ("Tiling key", format!("{} ({})", plan.tiling_key(), plan.tiling_key().value())),
        ("Input", bracketed(&shape.reduced_in_shape)),
        ("Output", bracketed(&shape.reduced_out_shape)),
        ("Perm", bracketed(&shape.reduced_perm)),
        ("Element bytes", shape.ele_len.to_string()),
        (
            "Input cut",
            format!(
                "axis {} by {} (tail {})",
                split.in_cut_index, split.in_ub_factor, split.in_tail_factor
            ),
        ),
        (
            "Output cut",
            format!(
                "axis {} by {} (tail {})",
                split.out_cut_index, split.out_ub_factor, split.out_tail_factor
            ),
        ),
        ("Cores", core.real_core_num.to_string()),
        (
            "Iterations",
            format!(
                "{} ({} per core, tail {})",
                core.total_iterations, core.blk_factor, core.blk_tail_factor
            ),
        ),
        ("Buffer bytes", plan.ub_size.to_string()),
    ];

    if let Some(layout) = plan.strategy.layout() {
        layout_rows(layout, &mut rows);
    }
    match &plan.strategy {
        Strategy::CutTwice { intervals, .. } => {
            rows.push(("Main tiles", range(Some(intervals.main))));
            rows.push(("Input tail tiles", range(intervals.input_tail)));
            rows.push(("Output tail tiles", range(intervals.output_tail)));
            rows.push(("Tail tiles", range(intervals.tail)));
        }
        Strategy::BigDim { tables } => {
            rows.push(("Input strides", bracketed(&tables.base_in_shape)));
            rows.push((
                "NDDMA axes",
                tables
                    .axes
                    .iter()
                    .map(|d| format!("{}x{}@{}", d.axis, d.repeat, d.stride))
                    .join(" "),
            ));
            rows.push(("Elements per call", tables.total_nddma_num.to_string()));
        }
        Strategy::GatherTranspose(gather) => {
            let ub = &gather.ub;
            let cnt = ub.axes_cnt;
            rows.push(("Buffer input axes", bracketed(&ub.in_ub_axes[..cnt])));
            rows.push(("Buffer output axes", bracketed(&ub.out_ub_axes[..cnt])));
            rows.push(("Buffer perm", bracketed(&ub.ub_perm[..cnt])));
            rows.push(("Source strides", bracketed(&ub.in_src_strides)));
            rows.push(("Destination strides", bracketed(&ub.out_dst_strides)));
            rows.push((
                "Block loops",
                gather.blk.axes.iter().map(|a| a.loop_size).join(" x "),
            ));
        }
        _ => {}
    }
    rows
}

fn layout_rows(layout: &NddmaLayout, rows: &mut Vec<(&'static str, String)>) {
    rows.push(("Expanded perm", bracketed(&layout.expanded.perm)));
    rows.push(("Main tile", tile(&layout.main.src, &layout.main.dst)));
    if layout.input_tail.src.iter().any(|&d| d != 0) {
        rows.push((
            "Input tail tile",
            tile(&layout.input_tail.src, &layout.input_tail.dst),
        ));
        rows.push((
            "Output tail tile",
            tile(&layout.output_tail.src, &layout.output_tail.dst),
        ));
    }
    rows.push(("Tail tile", tile(&layout.tail.src, &layout.tail.dst)));
}

fn bracketed<T: fmt::Display>(values: &[T]) -> String {
    format!("[{}]", values.iter().join(", "))
}

fn tile(src: &[u64], dst: &[u64]) -> String {
    format!("{} -> {}", bracketed(src), bracketed(dst))
}

fn range(r: Option<OffsetRange>) -> String {
    match r {
        Some(r) => format!("{}..={}", r.start, r.end),
        None => "-".to_owned(),
    }
}

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::common::{Shape, NDDMA_MAX_DIM_NUM};
use crate::shapeinfo::ShapeInfo;
use crate::split::SplitInfo;

pub type NddmaShape = [u64; NDDMA_MAX_DIM_NUM];

/// The reduced problem left-padded to the fixed NDDMA rank.
///
/// Padding axes have extent 1 and map to themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ExpandedShape {
    pub perm: [usize; NDDMA_MAX_DIM_NUM],
    pub in_shape: NddmaShape,
    pub out_shape: NddmaShape,
    /// Number of padding axes.
    pub offset: usize,
}

impl ExpandedShape {
    /// Returns `None` when the reduced rank exceeds the NDDMA rank.
    pub fn new(shape: &ShapeInfo) -> Option<Self> {
        let dim = shape.dim();
        if dim > NDDMA_MAX_DIM_NUM {
            return None;
        }
        let offset = NDDMA_MAX_DIM_NUM - dim;
        let mut expanded = ExpandedShape {
            perm: [0, 1, 2, 3, 4],
            in_shape: [1; NDDMA_MAX_DIM_NUM],
            out_shape: [1; NDDMA_MAX_DIM_NUM],
            offset,
        };
        for i in 0..dim {
            expanded.perm[i + offset] = shape.reduced_perm[i] + offset;
            expanded.in_shape[i + offset] = shape.reduced_in_shape[i];
            expanded.out_shape[i + offset] = shape.reduced_out_shape[i];
        }
        Some(expanded)
    }
}

/// Source (input order) and destination (output order) extents of one tile.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TileShapes {
    pub src: NddmaShape,
    pub dst: NddmaShape,
}

impl TileShapes {
    fn from_dst(dst: NddmaShape, perm: &[usize; NDDMA_MAX_DIM_NUM]) -> Self {
        let mut src = [0; NDDMA_MAX_DIM_NUM];
        for i in 0..NDDMA_MAX_DIM_NUM {
            src[perm[i]] = dst[i];
        }
        TileShapes { src, dst }
    }

    fn from_src(src: NddmaShape, perm: &[usize; NDDMA_MAX_DIM_NUM]) -> Self {
        let mut dst = [0; NDDMA_MAX_DIM_NUM];
        for i in 0..NDDMA_MAX_DIM_NUM {
            dst[i] = src[perm[i]];
        }
        TileShapes { src, dst }
    }
}

/// Per-tile NDDMA extents for the main block and each tail.
///
/// Single-cut strategies only fill `main` and `tail`; the input and output
/// tails are zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct NddmaLayout {
    pub expanded: ExpandedShape,
    pub main: TileShapes,
    pub input_tail: TileShapes,
    pub output_tail: TileShapes,
    pub tail: TileShapes,
}

impl NddmaLayout {
    /// Layout for a plan whose only cut is on the output side.
    pub fn no_cut(shape: &ShapeInfo, split: &SplitInfo) -> Option<Self> {
        let expanded = ExpandedShape::new(shape)?;
        let out_cut = split.out_cut_index + expanded.offset;
        let mut main = [1; NDDMA_MAX_DIM_NUM];
        let mut tail = [1; NDDMA_MAX_DIM_NUM];
        for i in out_cut..NDDMA_MAX_DIM_NUM {
            if i == out_cut {
                main[i] = split.out_ub_factor;
                tail[i] = split.out_tail_factor;
            } else {
                main[i] = expanded.out_shape[i];
                tail[i] = expanded.out_shape[i];
            }
        }
        Some(Self::single(expanded, main, tail))
    }

    pub fn cut_once(shape: &ShapeInfo, split: &SplitInfo) -> Option<Self> {
        let expanded = ExpandedShape::new(shape)?;
        let out_cut = split.out_cut_index + expanded.offset;
        let in_cut = split.in_cut_index + expanded.offset;
        let mut main = expanded.out_shape;
        let mut tail = expanded.out_shape;
        for i in 0..NDDMA_MAX_DIM_NUM {
            if i == out_cut {
                main[i] = split.out_ub_factor;
                tail[i] = split.out_tail_factor;
            } else if i < out_cut && expanded.perm[i] < in_cut {
                main[i] = 1;
                tail[i] = 1;
            }
        }
        Some(Self::single(expanded, main, tail))
    }

    fn single(expanded: ExpandedShape, main: NddmaShape, tail: NddmaShape) -> Self {
        NddmaLayout {
            expanded,
            main: TileShapes::from_dst(main, &expanded.perm),
            input_tail: TileShapes::default(),
            output_tail: TileShapes::default(),
            tail: TileShapes::from_dst(tail, &expanded.perm),
        }
    }

    /// Layout for a plan cut on both sides.
    ///
    /// Axes left of the input cut are outside the tile. Of the output axes right
    /// of the output cut, those not already inside the input tile are whole.
    pub fn cut_twice(shape: &ShapeInfo, split: &SplitInfo) -> Option<Self> {
        let expanded = ExpandedShape::new(shape)?;
        let in_cut = split.in_cut_index + expanded.offset;
        let out_cut = split.out_cut_index + expanded.offset;
        let out_cut_src = expanded.perm[out_cut];

        let mut main = expanded.in_shape;
        let mut input_tail = expanded.in_shape;
        let mut tail = expanded.in_shape;
        for idx in 0..NDDMA_MAX_DIM_NUM {
            if idx < in_cut {
                main[idx] = 1;
                input_tail[idx] = 1;
                tail[idx] = 1;
            } else if idx == in_cut {
                main[idx] = split.in_ub_factor;
                input_tail[idx] = split.in_tail_factor;
                tail[idx] = split.in_tail_factor;
            }
        }
        let mut output_tail = input_tail;
        output_tail[in_cut] = split.in_ub_factor;

        main[out_cut_src] = split.out_ub_factor;
        input_tail[out_cut_src] = split.out_ub_factor;
        output_tail[out_cut_src] = split.out_tail_factor;
        tail[out_cut_src] = split.out_tail_factor;

        for idx in out_cut + 1..NDDMA_MAX_DIM_NUM {
            let axis = expanded.perm[idx];
            if axis == in_cut {
                continue;
            }
            for shapes in [&mut main, &mut input_tail, &mut output_tail, &mut tail] {
                shapes[axis] = expanded.in_shape[axis];
            }
        }

        Some(NddmaLayout {
            expanded,
            main: TileShapes::from_src(main, &expanded.perm),
            input_tail: TileShapes::from_src(input_tail, &expanded.perm),
            output_tail: TileShapes::from_src(output_tail, &expanded.perm),
            tail: TileShapes::from_src(tail, &expanded.perm),
        })
    }
}

/// An inclusive range of tile indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct OffsetRange {
    pub start: u64,
    pub end: u64,
}

impl OffsetRange {
    fn following(prev_end: u64, len: u64) -> Self {
        OffsetRange {
            start: prev_end + 1,
            end: prev_end + len,
        }
    }
}

/// Which tile indices of a twice-cut plan use which tile shape.
///
/// Main tiles come first, then the input tails, the output tails, and the
/// single corner tail. Absent tails are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct IntervalRanges {
    pub main: OffsetRange,
    pub input_tail: Option<OffsetRange>,
    pub output_tail: Option<OffsetRange>,
    pub tail: Option<OffsetRange>,
}

impl IntervalRanges {
    pub fn cut_twice(layout: &NddmaLayout, split: &SplitInfo) -> Self {
        let expanded = &layout.expanded;
        let main_src = &layout.main.src;
        let in_cut = split.in_cut_index + expanded.offset;
        let out_cut_src = expanded.perm[split.out_cut_index + expanded.offset];

        let outer_loop: u64 = (0..NDDMA_MAX_DIM_NUM)
            .filter(|&i| i != in_cut && i != out_cut_src)
            .map(|i| expanded.in_shape[i] / main_src[i])
            .product();
        let in_blocks = expanded.in_shape[in_cut] / main_src[in_cut];
        let out_blocks = expanded.in_shape[out_cut_src] / main_src[out_cut_src];

        let main = OffsetRange {
            start: 0,
            end: (in_blocks * out_blocks * outer_loop).saturating_sub(1),
        };
        let (mut input_tail, mut output_tail, mut tail) = (None, None, None);
        let mut last = main.end;
        if split.in_tail_factor != 0 {
            let range = OffsetRange::following(last, out_blocks * outer_loop);
            last = range.end;
            input_tail = Some(range);
        }
        if split.out_tail_factor != 0 {
            let range = OffsetRange::following(last, in_blocks * outer_loop);
            last = range.end;
            output_tail = Some(range);
        }
        if split.in_tail_factor != 0 && split.out_tail_factor != 0 {
            tail = Some(OffsetRange::following(last, outer_loop));
        }
        IntervalRanges {
            main,
            input_tail,
            output_tail,
            tail,
        }
    }

    /// One past the last tile index.
    pub fn tile_count(&self) -> u64 {
        [Some(self.main), self.input_tail, self.output_tail, self.tail]
            .into_iter()
            .flatten()
            .map(|r| r.end + 1)
            .max()
            .unwrap_or(0)
    }
}

/// One input axis moved by a big-rank NDDMA call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AxisDescriptor {
    pub axis: usize,
    /// Extent moved per call; 1 for loop axes outside the tile.
    pub repeat: u64,
    /// Offset of this axis in the destination tile, in elements.
    pub stride: u64,
}

/// Addressing tables for problems whose rank exceeds the NDDMA rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BigDimTables {
    /// Row-major input strides of every reduced axis.
    pub base_in_shape: Shape,
    /// Exactly one descriptor per NDDMA axis, sorted by input axis.
    pub axes: SmallVec<[AxisDescriptor; NDDMA_MAX_DIM_NUM]>,
    /// Elements moved per NDDMA call.
    pub total_nddma_num: u64,
}

impl BigDimTables {
    pub fn new(shape: &ShapeInfo, split: &SplitInfo) -> Self {
        let dim = shape.dim();
        let mut base_in_shape: Shape = SmallVec::from_elem(0, dim);
        let mut axes = SmallVec::<[AxisDescriptor; NDDMA_MAX_DIM_NUM]>::new();
        let mut base_in = 1;
        let mut total_nddma_num = 1;
        for i in (0..dim).rev() {
            base_in_shape[i] = base_in;
            base_in *= shape.reduced_in_shape[i];
            if axes.len() == NDDMA_MAX_DIM_NUM {
                continue;
            }
            let repeat = if i > split.out_cut_index {
                shape.reduced_out_shape[i]
            } else if i == split.out_cut_index {
                split.out_ub_factor
            } else {
                1
            };
            axes.push(AxisDescriptor {
                axis: shape.reduced_perm[i],
                repeat,
                stride: total_nddma_num,
            });
            total_nddma_num *= repeat;
        }
        axes.sort_by_key(|d| d.axis);
        BigDimTables {
            base_in_shape,
            axes,
            total_nddma_num,
        }
    }

    pub fn nddma_idx(&self) -> impl Iterator<Item = usize> + '_ {
        self.axes.iter().map(|d| d.axis)
    }

    pub fn base_nddma_shape(&self) -> impl Iterator<Item = u64> + '_ {
        self.axes.iter().map(|d| d.stride)
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

    fn twice_split() -> SplitInfo {
        SplitInfo {
            in_cut_index: 1,
            out_cut_index: 1,
            in_ub_factor: 221,
            out_ub_factor: 114,
            in_tail_factor: 2048 % 221,
            out_tail_factor: 1024 % 114,
            ub_element: 49152,
        }
    }

    #[test]
    fn test_expansion_pads_on_the_left() {
        let s = info(&[3, 5, 7], &[2, 1, 0], 4);
        let e = ExpandedShape::new(&s).unwrap();
        assert_eq!(e.offset, 2);
        assert_eq!(e.perm, [0, 1, 4, 3, 2]);
        assert_eq!(e.in_shape, [1, 1, 3, 5, 7]);
        assert_eq!(e.out_shape, [1, 1, 7, 5, 3]);
    }

    #[test]
    fn test_expansion_rejects_big_rank() {
        let s = info(&[2, 3, 2, 3, 2, 3], &[5, 4, 3, 2, 1, 0], 4);
        assert_eq!(ExpandedShape::new(&s), None);
    }

    #[test]
    fn test_no_cut_covers_whole_output_axis() {
        let s = info(&[6, 10], &[1, 0], 2);
        let split = SplitInfo {
            out_cut_index: 0,
            out_ub_factor: 10,
            ..SplitInfo::new(100)
        };
        let layout = NddmaLayout::no_cut(&s, &split).unwrap();
        assert_eq!(layout.main.dst, [1, 1, 1, 10, 6]);
        assert_eq!(layout.main.src, [1, 1, 1, 6, 10]);
        assert_eq!(layout.tail.dst, [1, 1, 1, 0, 6]);
    }

    #[test]
    fn test_cut_once_keeps_inner_axes() {
        let s = info(&[4096, 3, 8], &[1, 0, 2], 4);
        let split = SplitInfo {
            in_cut_index: 0,
            out_cut_index: 1,
            in_ub_factor: 9,
            out_ub_factor: 95,
            in_tail_factor: 1,
            out_tail_factor: 11,
            ub_element: 49152,
        };
        let layout = NddmaLayout::cut_once(&s, &split).unwrap();
        assert_eq!(layout.main.dst, [1, 1, 3, 95, 8]);
        assert_eq!(layout.tail.dst, [1, 1, 3, 11, 8]);
        assert_eq!(layout.main.src, [1, 1, 95, 3, 8]);
        assert_eq!(layout.input_tail, TileShapes::default());
    }

    #[test]
    fn test_cut_twice_tile_shapes() {
        let s = info(&[1024, 2048], &[1, 0], 4);
        let layout = NddmaLayout::cut_twice(&s, &twice_split()).unwrap();
        assert_eq!(layout.main.src, [1, 1, 1, 114, 221]);
        assert_eq!(layout.main.dst, [1, 1, 1, 221, 114]);
        assert_eq!(layout.input_tail.src, [1, 1, 1, 114, 59]);
        assert_eq!(layout.output_tail.src, [1, 1, 1, 112, 221]);
        assert_eq!(layout.tail.src, [1, 1, 1, 112, 59]);
    }

    #[test]
    fn test_cut_twice_intervals_are_contiguous() {
        let s = info(&[1024, 2048], &[1, 0], 4);
        let split = twice_split();
        let layout = NddmaLayout::cut_twice(&s, &split).unwrap();
        let ranges = IntervalRanges::cut_twice(&layout, &split);
        assert_eq!(ranges.main, OffsetRange { start: 0, end: 71 });
        assert_eq!(ranges.input_tail, Some(OffsetRange { start: 72, end: 79 }));
        assert_eq!(ranges.output_tail, Some(OffsetRange { start: 80, end: 88 }));
        assert_eq!(ranges.tail, Some(OffsetRange { start: 89, end: 89 }));
        assert_eq!(ranges.tile_count(), 90);
    }

    #[test]
    fn test_cut_twice_without_input_tail() {
        let s = info(&[1024, 2048], &[1, 0], 4);
        let split = SplitInfo {
            in_ub_factor: 256,
            in_tail_factor: 0,
            ..twice_split()
        };
        let layout = NddmaLayout::cut_twice(&s, &split).unwrap();
        let ranges = IntervalRanges::cut_twice(&layout, &split);
        assert_eq!(ranges.main.end, 8 * 8 - 1);
        assert_eq!(ranges.input_tail, None);
        assert_eq!(ranges.output_tail, Some(OffsetRange { start: 64, end: 71 }));
        assert_eq!(ranges.tail, None);
    }

    #[test]
    fn test_big_dim_tables() {
        let s = info(&[4, 5, 6, 7, 8, 9, 10], &[6, 4, 2, 0, 5, 3, 1], 8);
        let split = SplitInfo {
            out_cut_index: 2,
            out_ub_factor: 3,
            ..SplitInfo::new(1 << 20)
        };
        let tables = BigDimTables::new(&s, &split);
        assert_eq!(
            tables.base_in_shape.as_slice(),
            &[151200, 30240, 5040, 720, 90, 10, 1]
        );
        // Output axes 6, 5, 4, 3 whole, axis 2 cut by 3.
        assert_eq!(tables.total_nddma_num, 5 * 7 * 9 * 4 * 3);
        assert_eq!(tables.nddma_idx().collect::<Vec<_>>(), vec![0, 1, 2, 3, 5]);
        assert_eq!(
            tables.base_nddma_shape().collect::<Vec<_>>(),
            vec![5 * 7 * 9, 1, 5 * 7 * 9 * 4, 5, 5 * 7]
        );
    }

    proptest! {
        #[test]
        fn test_expanded_perm_is_permutation(
            dims in prop::collection::vec(2i64..9, 1..=NDDMA_MAX_DIM_NUM)
        ) {
            let n = dims.len() as i64;
            let perm = (0..n).rev().collect::<Vec<_>>();
            let s = info(&dims, &perm, 2);
            let e = ExpandedShape::new(&s).unwrap();
            let mut sorted = e.perm;
            sorted.sort_unstable();
            prop_assert_eq!(sorted, [0, 1, 2, 3, 4]);
            for i in 0..NDDMA_MAX_DIM_NUM {
                prop_assert_eq!(e.out_shape[i], e.in_shape[e.perm[i]]);
            }
        }
    }
}

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Display;

/// The maximum rank of a tensor accepted by the planner.
pub const MAX_SUPPORT_DIMS: usize = 8;
/// The number of axes a single multi-dimensional DMA transfer can describe.
pub const NDDMA_MAX_DIM_NUM: usize = 5;
/// Axes borrowed into the buffer from each side by the gather strategy.
pub const UB_MAX_BORROW_NUM: usize = 3;
pub const UB_MAX_DIM_NUM: usize = 6;
/// Tiles resident in the buffer at once (double buffering).
pub const BUFFER_NUM: u64 = 2;
pub const WORKSPACE_SIZE: u64 = 16 * 1024 * 1024;

pub type DimSize = u64;
pub type Shape = SmallVec<[DimSize; MAX_SUPPORT_DIMS]>;
pub type Perm = SmallVec<[usize; MAX_SUPPORT_DIMS]>;

#[macro_export]
macro_rules! shape {
    ($dim:expr; $n:expr) => {{
        // Bind to a variable with an explicit type to help out type inference.
        let sv: $crate::common::Shape = $crate::smallvec::smallvec![$dim; $n];
        sv
    }};
    ($($dim:expr),*$(,)*) => {{
        let sv: $crate::common::Shape = $crate::smallvec::smallvec![$($dim),*];
        sv
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Float16,
    Bfloat16,
    Uint32,
    Sint32,
    Float32,
    Uint64,
    Sint64,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Uint8 | Dtype::Sint8 => 1,
            Dtype::Uint16 | Dtype::Sint16 | Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Uint32 | Dtype::Sint32 | Dtype::Float32 => 4,
            Dtype::Uint64 | Dtype::Sint64 => 8,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Uint16 => write!(f, "u16"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Uint64 => write!(f, "u64"),
            Dtype::Sint64 => write!(f, "i64"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_shape_macro_repeats() {
        assert_eq!(shape![1; 3], shape![1, 1, 1]);
    }

    proptest! {
        #[test]
        fn test_dtype_sizes_are_powers_of_two(dtype in any::<Dtype>()) {
            prop_assert!(dtype.size().is_power_of_two());
            prop_assert!(dtype.size() <= 8);
        }
    }
}

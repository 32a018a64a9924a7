use divrem::DivCeil;

pub fn ceil_div(lhs: u64, rhs: u64) -> u64 {
    DivCeil::div_ceil(lhs, rhs)
}

/// Rounds `value` up to the next multiple of `align`.
pub fn ceil_align(value: u64, align: u64) -> u64 {
    ceil_div(value, align) * align
}

/// Rounds `value` down to a multiple of `align`.
pub fn floor_align(value: u64, align: u64) -> u64 {
    value / align * align
}

/// Integer square root, rounded down.
pub fn isqrt(n: u64) -> u64 {
    n.isqrt()
}

/// Returns the product of the given extents; the empty product is 1.
pub fn volume(extents: &[u64]) -> u64 {
    extents.iter().product()
}

pub fn join_into_string(c: impl IntoIterator<Item = impl ToString>, separator: &str) -> String {
    c.into_iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ceil_align_examples() {
        assert_eq!(ceil_align(1, 32), 32);
        assert_eq!(ceil_align(32, 32), 32);
        assert_eq!(ceil_align(33, 32), 64);
        assert_eq!(floor_align(33, 32), 32);
    }

    #[test]
    fn test_isqrt_small_values() {
        let expected = [0, 1, 1, 1, 2, 2, 2, 2, 2, 3];
        for (n, e) in expected.into_iter().enumerate() {
            assert_eq!(isqrt(n as u64), e);
        }
    }

    #[test]
    fn test_isqrt_near_perfect_squares() {
        assert_eq!(isqrt(12696), 112);
        assert_eq!(isqrt(49152), 221);
        assert_eq!(isqrt((1 << 32) - 1), (1 << 16) - 1);
        assert_eq!(isqrt(u64::MAX), u64::from(u32::MAX));
    }

    #[test]
    fn test_volume_of_empty_is_one() {
        assert_eq!(volume(&[]), 1);
        assert_eq!(volume(&[2, 3, 4]), 24);
    }

    #[test]
    fn test_join_into_string() {
        assert_eq!(join_into_string([1, 2, 3], "x"), "1x2x3");
    }

    proptest! {
        #[test]
        fn test_isqrt_is_floor_of_root(n in 0u64..(1 << 52)) {
            let r = isqrt(n);
            prop_assert!(r * r <= n);
            prop_assert!((r + 1) * (r + 1) > n);
        }

        #[test]
        fn test_ceil_div_bounds(a in 0u64..1_000_000, b in 1u64..10_000) {
            let q = ceil_div(a, b);
            prop_assert!(q * b >= a);
            prop_assert!(q == 0 || (q - 1) * b < a);
        }
    }
}

//! Arithmetic shared by both execution tiers, so they cannot disagree on
//! edge cases.

use std::cmp::Ordering;

/// `None` when dividing by zero. `MIN / -1` is `MIN`.
#[inline]
pub(crate) fn idiv(a: i32, b: i32) -> Option<i32> {
    (b != 0).then(|| a.wrapping_div(b))
}

/// `None` when dividing by zero. `MIN % -1` is 0.
#[inline]
pub(crate) fn irem(a: i32, b: i32) -> Option<i32> {
    (b != 0).then(|| a.wrapping_rem(b))
}

#[inline]
pub(crate) fn ldiv(a: i64, b: i64) -> Option<i64> {
    (b != 0).then(|| a.wrapping_div(b))
}

#[inline]
pub(crate) fn lrem(a: i64, b: i64) -> Option<i64> {
    (b != 0).then(|| a.wrapping_rem(b))
}

#[inline]
pub(crate) fn ishl(a: i32, b: i32) -> i32 {
    a.wrapping_shl(b as u32 & 0x1f)
}

#[inline]
pub(crate) fn ishr(a: i32, b: i32) -> i32 {
    a.wrapping_shr(b as u32 & 0x1f)
}

#[inline]
pub(crate) fn iushr(a: i32, b: i32) -> i32 {
    ((a as u32) >> (b as u32 & 0x1f)) as i32
}

#[inline]
pub(crate) fn lshl(a: i64, b: i32) -> i64 {
    a.wrapping_shl(b as u32 & 0x3f)
}

#[inline]
pub(crate) fn lshr(a: i64, b: i32) -> i64 {
    a.wrapping_shr(b as u32 & 0x3f)
}

#[inline]
pub(crate) fn lushr(a: i64, b: i32) -> i64 {
    ((a as u64) >> (b as u32 & 0x3f)) as i64
}

#[inline]
pub(crate) fn lcmp(a: i64, b: i64) -> i32 {
    match a.cmp(&b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// `fcmpl`/`dcmpl` pass -1 for `nan`, `fcmpg`/`dcmpg` pass 1.
#[inline]
pub(crate) fn fcmp<T: PartialOrd>(a: T, b: T, nan: i32) -> i32 {
    match a.partial_cmp(&b) {
        None => nan,
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
    }
}

/// Float to integer conversions saturate and map NaN to zero, which is
/// exactly what `as` does.
#[inline]
pub(crate) fn f2i(v: f32) -> i32 {
    v as i32
}

#[inline]
pub(crate) fn f2l(v: f32) -> i64 {
    v as i64
}

#[inline]
pub(crate) fn d2i(v: f64) -> i32 {
    v as i32
}

#[inline]
pub(crate) fn d2l(v: f64) -> i64 {
    v as i64
}

/// Truncated remainder with the sign of the dividend, like C's `fmod`.
#[inline]
pub(crate) fn frem(a: f32, b: f32) -> f32 {
    a % b
}

#[inline]
pub(crate) fn drem(a: f64, b: f64) -> f64 {
    a % b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_value_division() {
        assert_eq!(idiv(i32::MIN, -1), Some(i32::MIN));
        assert_eq!(irem(i32::MIN, -1), Some(0));
        assert_eq!(ldiv(i64::MIN, -1), Some(i64::MIN));
        assert_eq!(lrem(i64::MIN, -1), Some(0));
        assert_eq!(idiv(7, 0), None);
        assert_eq!(lrem(7, 0), None);
        assert_eq!(idiv(-7, 2), Some(-3));
        assert_eq!(irem(-7, 2), Some(-1));
    }

    #[test]
    fn test_shifts_mask_distance() {
        assert_eq!(ishl(1, 33), 2);
        assert_eq!(ishr(-8, 1), -4);
        assert_eq!(iushr(-1, 28), 0xf);
        assert_eq!(lshl(1, 65), 2);
        assert_eq!(lushr(-1, 60), 0xf);
    }

    #[test]
    fn test_float_edges() {
        assert_eq!(-1.0f64 / 0.0, f64::NEG_INFINITY);
        assert_eq!(1.0f64 / -0.0, f64::NEG_INFINITY);
        assert_eq!(fcmp(f32::NAN, 1.0, -1), -1);
        assert_eq!(fcmp(f64::NAN, 1.0, 1), 1);
        assert_eq!(fcmp(0.0f64, -0.0, 1), 0);
        assert_eq!(f2i(f32::NAN), 0);
        assert_eq!(d2i(1e20), i32::MAX);
        assert_eq!(d2l(f64::NEG_INFINITY), i64::MIN);
        assert_eq!(drem(-5.5, 2.0), -1.5);
        assert!(frem(1.0, 0.0).is_nan());
    }
}

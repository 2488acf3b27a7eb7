//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

/// Map a value from one range into another.
pub fn lin_map<T>(source_range: (T, T), target_range: (T, T), value: T) -> T
where
    T: Float,
{
    target_range.0
        + ((value - source_range.0) * (target_range.1 - target_range.0)
            / (source_range.1 - source_range.0))
}

/// Calculates the least nonnegative remainder of `lhs (mod rhs)`.
///
/// Due to floating point round-off the result can equal `rhs.abs()` when
/// `lhs` is a tiny negative number.
pub fn rem_euclid<T>(lhs: T, rhs: T) -> T
where
    T: Float,
{
    let r = lhs % rhs;
    if r < T::zero() {
        r + rhs.abs()
    } else {
        r
    }
}

/// Wrap an angle into the range (-pi, pi].
pub fn wrap_to_pi<T>(angle: T) -> T
where
    T: Float,
{
    let pi_t = T::from(std::f64::consts::PI).unwrap_or_else(T::zero);
    let tau_t = pi_t + pi_t;

    let wrapped = rem_euclid(angle + pi_t, tau_t) - pi_t;

    // The half-open range excludes -pi
    if wrapped <= -pi_t {
        wrapped + tau_t
    } else {
        wrapped
    }
}

/// Element `index` of the van der Corput sequence in the given base, which is
/// one dimension of a Halton sequence.
///
/// Values lie in [0, 1) and fill the interval evenly for consecutive indices,
/// which makes them useful for deterministic sampling of a bounded space.
pub fn halton(index: usize, base: usize) -> f64 {
    let mut result = 0.0;
    let mut fraction = 1.0;
    let mut i = index;

    if base < 2 {
        return 0.0;
    }

    while i > 0 {
        fraction /= base as f64;
        result += fraction * (i % base) as f64;
        i /= base;
    }

    result
}

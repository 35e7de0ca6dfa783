//! Ring and tensor index arithmetic shared by the host and the kernel.
//!
//! The history ring is a flattened `(bin, time_slot)` array and the coefficient
//! tensor a flattened `(bin_input, time, bin_output)` array. In both layouts the
//! bin axis varies fastest:
//!
//! ```text
//! history[bin, slot]         = past[bin + slot * bin_size]
//! coeff[b_in, t, b_out]      = coeffs[b_in + t * bin_size + b_out * bin_size * time_size]
//! ```
//!
//! [`warp`] is written with the same truncating-remainder body as the `warp`
//! helper in `kernels/system.cl`. Rust's `%` and OpenCL C's `%` both truncate
//! toward zero, so the two definitions compute identical values.

/// Non-negative modulo: wraps `index` into `[0, size)` for any sign of `index`.
///
/// `size` must be positive.
#[inline]
pub fn warp(index: i64, size: i64) -> i64 {
    debug_assert!(size > 0, "warp size must be positive");
    let temp = index % size;
    if temp < 0 {
        temp + size
    } else {
        temp
    }
}

/// Ring slot holding the frame `time` blocks before the most recent one.
///
/// `slots` is the ring length (`time_size - 1`) and must be non-zero.
#[inline]
pub fn ring_slot(time_offset: usize, time: usize, slots: usize) -> usize {
    warp(time_offset as i64 - time as i64, slots as i64) as usize
}

/// Flat history offset of `(bin, slot)`.
#[inline]
pub fn history_index(bin: usize, slot: usize, bin_size: usize) -> usize {
    bin + slot * bin_size
}

/// Inverse of [`history_index`].
#[inline]
pub fn history_coords(flat: usize, bin_size: usize) -> (usize, usize) {
    (flat % bin_size, flat / bin_size)
}

/// Flat coefficient offset of `(bin_input, time, bin_output)`.
#[inline]
pub fn coeff_index(
    bin_input: usize,
    time: usize,
    bin_output: usize,
    bin_size: usize,
    time_size: usize,
) -> usize {
    bin_input + time * bin_size + bin_output * bin_size * time_size
}

/// Inverse of [`coeff_index`].
#[inline]
pub fn coeff_coords(flat: usize, bin_size: usize, time_size: usize) -> (usize, usize, usize) {
    let plane = bin_size * time_size;
    let bin_output = flat / plane;
    let rest = flat % plane;
    (rest % bin_size, rest / bin_size, bin_output)
}

/// Number of history slots retained for a given tap count.
#[inline]
pub fn history_slots(time_size: usize) -> usize {
    time_size.saturating_sub(1)
}

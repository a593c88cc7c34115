//! Fixed-width lane kernels for the mix loop.
//!
//! Processes samples in 8-wide lanes with widened `i32` accumulators,
//! written so the auto-vectorizer can lower each lane to one vector
//! operation. Functionally identical to the scalar path; callers must
//! supply buffers whose length is an exact multiple of [`LANES`].

use super::saturate;

pub(super) const LANES: usize = 8;

/// `sum[i] += input[i]` with sign extension to 32 bits.
pub(super) fn accumulate(sum: &mut [i32], input: &[i16]) {
    debug_assert_eq!(sum.len(), input.len());
    debug_assert_eq!(sum.len() % LANES, 0);
    for (s, v) in sum.chunks_exact_mut(LANES).zip(input.chunks_exact(LANES)) {
        for k in 0..LANES {
            s[k] += v[k] as i32;
        }
    }
}

/// `out[i] = saturate(sum[i])`.
pub(super) fn copy_saturated(out: &mut [i16], sum: &[i32]) {
    debug_assert_eq!(out.len(), sum.len());
    debug_assert_eq!(out.len() % LANES, 0);
    for (o, s) in out.chunks_exact_mut(LANES).zip(sum.chunks_exact(LANES)) {
        for k in 0..LANES {
            o[k] = saturate(s[k]);
        }
    }
}

/// `out[i] = saturate(sum[i] - input[i])` — removes a channel's own
/// contribution for the conferencing path.
pub(super) fn subtract_saturated(out: &mut [i16], sum: &[i32], input: &[i16]) {
    debug_assert_eq!(out.len(), sum.len());
    debug_assert_eq!(out.len() % LANES, 0);
    for ((o, s), v) in out
        .chunks_exact_mut(LANES)
        .zip(sum.chunks_exact(LANES))
        .zip(input.chunks_exact(LANES))
    {
        for k in 0..LANES {
            o[k] = saturate(s[k] - v[k] as i32);
        }
    }
}

//! Log-domain arithmetic shared by the decoder, lattice and confusion-network
//! code.
//!
//! All probabilities in this crate live in natural-log space. Two sentinels
//! bound the usable range: `LSMALL` is the floor below which a log value is
//! considered indistinguishable from log(0), and any result that falls under
//! it is clamped to `LZERO`. The clamping is silent; it is the conventional
//! recovery for numeric underflow during long products.

/// Conventional "log of zero".
pub const LZERO: f64 = -1.0e10;

/// Floor under which log values collapse to [`LZERO`].
pub const LSMALL: f64 = -0.5e10;

/// `f32` mirror of [`LZERO`] for token-level scores.
pub const LZERO_F: f32 = -1.0e10;

/// `f32` mirror of [`LSMALL`].
pub const LSMALL_F: f32 = -0.5e10;

/// Smallest exponent for which `exp()` still contributes;
/// `-ln(-LZERO)` ≈ -23.03.
const MIN_LOG_EXP: f64 = -23.025850929940457;

/// Return `ln(exp(x) + exp(y))`, clamped to [`LZERO`] when both inputs are
/// effectively zero.
pub fn log_add(x: f64, y: f64) -> f64 {
    let (hi, lo) = if x < y { (y, x) } else { (x, y) };
    let diff = lo - hi;
    if diff < MIN_LOG_EXP {
        if hi < LSMALL {
            LZERO
        } else {
            hi
        }
    } else {
        hi + (1.0 + diff.exp()).ln()
    }
}

/// Return `ln(exp(x) - exp(y))`; `x` must be the larger operand.
/// Differences that underflow collapse to [`LZERO`].
pub fn log_sub(x: f64, y: f64) -> f64 {
    if x < y {
        return LZERO;
    }
    let diff = y - x;
    if diff < MIN_LOG_EXP {
        if x < LSMALL {
            LZERO
        } else {
            x
        }
    } else {
        let z = 1.0 - diff.exp();
        if z <= 0.0 {
            LZERO
        } else {
            let r = x + z.ln();
            if r < LSMALL {
                LZERO
            } else {
                r
            }
        }
    }
}

/// Convert a log value back to the linear domain, flooring tiny values to 0.
pub fn log_to_lin(x: f64) -> f64 {
    if x < LSMALL {
        0.0
    } else {
        x.exp()
    }
}

/// Clamp an `f32` log score: values below [`LSMALL_F`] become [`LZERO_F`].
pub fn clamp_log(x: f32) -> f32 {
    if x < LSMALL_F {
        LZERO_F
    } else {
        x
    }
}

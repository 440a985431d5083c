//! Level-conversion math shared across the engine.
//!
//! Adapted from the DSP utility layer this engine's effects are written
//! against; only the conversions the engine itself needs live here.

use libm::{expf, logf};

/// Convert decibels to linear gain.
///
/// 0 dB → 1.0, -6 dB → ~0.5, +6 dB → ~2.0.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    // 10^(dB/20) = e^(dB * ln(10)/20)
    const FACTOR: f32 = core::f32::consts::LN_10 / 20.0;
    expf(db * FACTOR)
}

/// Convert linear gain to decibels.
///
/// Gains at or below zero report the silence floor (-120 dB).
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    const FACTOR: f32 = 20.0 / core::f32::consts::LN_10;
    if linear <= 0.0 {
        return -120.0;
    }
    logf(linear) * FACTOR
}

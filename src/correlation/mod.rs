/// This module holds the numerical core of the daily correlation: smoothing of the source
/// spectrum, selection of the segments both stations agree are clean, and the kernel that
/// turns a pair of spectra into lag-domain correlation functions.
pub mod kernel;
pub mod quality;
pub mod smoothing;

pub use kernel::{CcfResult, CorrelationKernel};
pub use quality::{usable_segments, valid_segments};
pub use smoothing::smooth_source_spectrum;

/// Deterministic, non-trivial test spectra (no two rows or bins alike).
#[cfg(test)]
pub(crate) fn test_spectra(rows: usize, bins: usize, seed: f64) -> crate::Spectra {
    ndarray::Array2::from_shape_fn((rows, bins), |(i, k)| {
        let amplitude = 1.0 + 0.5 * ((i as f64 * 1.3 + k as f64 * 0.7 + seed).sin());
        let phase = (i as f64 * 2.1 + k as f64 * 0.37 + seed * 1.9).cos() * std::f64::consts::PI;
        let value = num_complex::Complex::from_polar(amplitude, phase);
        num_complex::Complex::new(value.re as f32, value.im as f32)
    })
}

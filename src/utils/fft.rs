use crate::error::{CcError, Result};
use num_complex::Complex;
use num_traits::Zero;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Turns averaged half cross-spectra into lag-domain correlation functions.
///
/// Planned once per day for a given transform length and reused for every pair.
pub struct LagTransform {
    nfft: usize,
    half_lags: usize,
    ifft: Arc<dyn Fft<f64>>,
}

impl LagTransform {
    /// `half_lags` is clamped to the largest lag the transform can represent.
    pub fn new(nfft: usize, half_lags: usize) -> Result<Self> {
        if nfft < 4 || nfft % 2 != 0 {
            return Err(CcError::configuration(format!(
                "transform length must be even and at least 4, got {nfft}"
            )));
        }
        let half_lags = half_lags.min(nfft / 2 - 1);
        let ifft = FftPlanner::new().plan_fft_inverse(nfft);

        Ok(LagTransform {
            nfft,
            half_lags,
            ifft,
        })
    }

    /// Number of lag samples in every output, `2 * half_lags + 1`.
    pub fn num_lags(&self) -> usize {
        2 * self.half_lags + 1
    }

    /// Inverts a half cross-spectrum (`nfft / 2` bins, DC first).
    ///
    /// The spectrum mean is removed and the DC and Nyquist bins are zeroed before the
    /// Hermitian completion, so the result is real. The inverse is normalized by `1 / nfft`
    /// and the output runs from lag `-half_lags` to `+half_lags`.
    pub fn to_lag_domain(&self, half_spectrum: &[Complex<f64>]) -> Vec<f64> {
        let nfft2 = self.nfft / 2;
        assert_eq!(
            half_spectrum.len(),
            nfft2,
            "half spectrum has {} bins, expected {nfft2}",
            half_spectrum.len()
        );

        // Remove the mean (a spike at zero lag)
        let mean = half_spectrum.iter().sum::<Complex<f64>>() / nfft2 as f64;

        // Hermitian completion
        let mut buffer = vec![Complex::<f64>::zero(); self.nfft];
        for k in 1..nfft2 {
            let value = half_spectrum[k] - mean;
            buffer[k] = value;
            buffer[self.nfft - k] = value.conj();
        }

        self.ifft.process(&mut buffer);

        // Negative lags wrap around to the end of the buffer
        let scale = (self.nfft as f64).recip();
        let half_lags = self.half_lags as isize;
        (-half_lags..=half_lags)
            .map(|lag| {
                let index = lag.rem_euclid(self.nfft as isize) as usize;
                buffer[index].re * scale
            })
            .collect()
    }
}

#[test]
fn test_linear_phase_peaks_at_its_delay() {
    const NFFT: usize = 64;
    const DELAY: usize = 3;
    let transform = LagTransform::new(NFFT, 10).unwrap();

    // Receiver delayed by DELAY samples relative to source
    let half_spectrum: Vec<Complex<f64>> = (0..NFFT / 2)
        .map(|k| {
            Complex::from_polar(
                1.0,
                -2.0 * std::f64::consts::PI * (k * DELAY) as f64 / NFFT as f64,
            )
        })
        .collect();
    let lags = transform.to_lag_domain(&half_spectrum);

    assert_eq!(lags.len(), transform.num_lags());
    let peak = lags
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap();
    assert_eq!(peak, 10 + DELAY);
}

#[test]
fn test_constant_spectrum_vanishes() {
    let transform = LagTransform::new(32, 5).unwrap();
    let lags = transform.to_lag_domain(&vec![Complex::new(2.5, -1.0); 16]);
    assert!(lags.iter().all(|x| x.abs() < 1e-12));
}

#[test]
fn test_half_lags_clamped() {
    let transform = LagTransform::new(16, 100).unwrap();
    assert_eq!(transform.num_lags(), 15);
    assert!(LagTransform::new(15, 3).is_err());
}

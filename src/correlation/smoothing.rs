use crate::config::CcMethod;
use crate::utils::moving_average;
use crate::{FloatType, WideSpectra};
use ndarray::ArrayView2;
use num_complex::Complex;
use num_traits::Zero;

/// Builds the operator applied to every receiver paired with this source.
///
/// For `deconv` and `coherency` the amplitude of each segment's half spectrum is replaced
/// by its moving average over `2 * half_window + 1` bins while the phase is kept; bins with
/// zero amplitude stay zero. For `xcorr` the spectrum is only widened to f64. The output
/// has the same shape as the input: (segments, nfft / 2).
pub fn smooth_source_spectrum(
    spectra: ArrayView2<'_, Complex<FloatType>>,
    half_window: usize,
    method: CcMethod,
) -> WideSpectra {
    let mut smoothed: WideSpectra = spectra.mapv(widen);
    if !method.smooths_source() {
        return smoothed;
    }

    for mut row in smoothed.outer_iter_mut() {
        let amplitudes: Vec<f64> = row.iter().map(|x| x.norm()).collect();
        let averaged = moving_average(&amplitudes, half_window);

        for ((value, &amplitude), &target) in row.iter_mut().zip(&amplitudes).zip(&averaged) {
            *value = if amplitude > 0.0 {
                *value * (target / amplitude)
            } else {
                Complex::zero()
            };
        }
    }

    smoothed
}

/// Moving average of the amplitude of one half spectrum.
pub fn smoothed_amplitude<'a>(
    row: impl IntoIterator<Item = &'a Complex<FloatType>>,
    half_window: usize,
) -> Vec<f64> {
    let amplitudes: Vec<f64> = row.into_iter().map(|x| widen(*x).norm()).collect();
    moving_average(&amplitudes, half_window)
}

pub(crate) fn widen(value: Complex<FloatType>) -> Complex<f64> {
    Complex::new(value.re as f64, value.im as f64)
}

#[test]
fn test_smoothing_preserves_shape_and_phase() {
    let spectra = crate::correlation::test_spectra(5, 64, 0.3);
    let smoothed = smooth_source_spectrum(spectra.view(), 4, CcMethod::Deconv);

    assert_eq!(smoothed.dim(), spectra.dim());
    for (raw, smooth) in spectra.iter().zip(smoothed.iter()) {
        let raw = widen(*raw);
        let mut diff = (raw.arg() - smooth.arg()).abs();
        if diff > std::f64::consts::PI {
            diff = 2.0 * std::f64::consts::PI - diff;
        }
        assert!(diff < 1e-9, "phase changed by {diff}");
    }
}

#[test]
fn test_smoothing_replaces_amplitude_by_moving_average() {
    let spectra = crate::correlation::test_spectra(3, 40, 1.1);
    let smoothed = smooth_source_spectrum(spectra.view(), 3, CcMethod::Coherency);

    for (raw_row, smooth_row) in spectra.outer_iter().zip(smoothed.outer_iter()) {
        let expected = smoothed_amplitude(raw_row.iter(), 3);
        for (value, target) in smooth_row.iter().zip(expected) {
            assert!((value.norm() - target).abs() < 1e-9);
        }
    }
}

#[test]
fn test_segments_smoothed_independently() {
    let mut spectra = crate::correlation::test_spectra(2, 32, 0.0);
    let before = smooth_source_spectrum(spectra.view(), 5, CcMethod::Deconv);

    // Changing the second row leaves the first row's result untouched
    spectra.row_mut(1).fill(Complex::new(100.0, 0.0));
    let after = smooth_source_spectrum(spectra.view(), 5, CcMethod::Deconv);

    assert_eq!(before.row(0), after.row(0));
    assert!(after.row(1).iter().all(|x| (x.re - 100.0).abs() < 1e-9));
}

#[test]
fn test_zero_bins_stay_zero() {
    let mut spectra = crate::correlation::test_spectra(1, 16, 0.5);
    spectra[[0, 7]] = Complex::zero();
    let smoothed = smooth_source_spectrum(spectra.view(), 2, CcMethod::Deconv);

    assert_eq!(smoothed[[0, 7]], Complex::zero());
    assert!(smoothed.iter().all(|x| x.is_finite()));
}

#[test]
fn test_xcorr_leaves_spectrum_unchanged() {
    let spectra = crate::correlation::test_spectra(2, 16, 0.9);
    let smoothed = smooth_source_spectrum(spectra.view(), 4, CcMethod::Xcorr);
    assert_eq!(smoothed, spectra.mapv(widen));
}

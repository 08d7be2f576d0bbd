use super::smoothing::{smoothed_amplitude, widen};
use crate::config::{CcMethod, CcParameters};
use crate::constants::EPSILON;
use crate::error::Result;
use crate::utils::fft::LagTransform;
use crate::{FloatType, Timestamp, WideSpectra};
use ndarray::{Array2, ArrayView2};
use num_complex::Complex;
use num_traits::Zero;
use statrs::statistics::{Data, Median};
use std::collections::BTreeMap;

/// Correlation functions of one (source, receiver) channel pair for one load chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct CcfResult {
    /// One row per sub-stack (a single row without sub-stacking), `2 * maxlag / dt + 1` lags.
    pub data: Array2<FloatType>,
    /// Start time of each row's window.
    pub timestamps: Vec<Timestamp>,
    /// Number of segments averaged into each row.
    pub counts: Vec<usize>,
}

/// Segments averaged into one output row.
#[derive(Debug, Clone, PartialEq)]
struct Group {
    rows: Vec<usize>,
    timestamp: Timestamp,
}

pub struct CorrelationKernel<'a> {
    params: &'a CcParameters,
    transform: LagTransform,
}

impl<'a> CorrelationKernel<'a> {
    pub fn new(params: &'a CcParameters, nfft: usize) -> Result<Self> {
        let transform = LagTransform::new(nfft, params.half_lags())?;
        Ok(CorrelationKernel { params, transform })
    }

    pub fn num_lags(&self) -> usize {
        self.transform.num_lags()
    }

    /// Correlates the usable segments of a pair.
    ///
    /// `source` is the smoothed source spectrum and `receiver` the raw receiver spectrum,
    /// both already restricted to the same usable rows; `timestamps` are those rows' start
    /// times. Returns `None` when the amplitude check rejects every row.
    pub fn correlate(
        &self,
        source: ArrayView2<'_, Complex<f64>>,
        receiver: ArrayView2<'_, Complex<FloatType>>,
        timestamps: &[Timestamp],
    ) -> Option<CcfResult> {
        assert_eq!(source.dim(), receiver.dim(), "source/receiver shape mismatch");
        assert_eq!(source.nrows(), timestamps.len(), "one timestamp per segment");
        if source.nrows() == 0 {
            return None;
        }

        let cross = self.cross_spectra(source, receiver);

        if !self.params.substack {
            // Average the whole chunk, dropping segments with abnormal amplitude first
            let peaks: Vec<f64> = cross
                .outer_iter()
                .map(|row| row.iter().map(|x| x.norm()).fold(0.0, f64::max))
                .collect();
            let kept = reject_outliers(&peaks, self.params.ampmax_factor);
            if kept.is_empty() {
                return None;
            }

            let lags = self.transform.to_lag_domain(&mean_rows(&cross, &kept));
            return Some(CcfResult {
                data: to_rows(&[lags], self.num_lags()),
                timestamps: vec![timestamps[0]],
                counts: vec![kept.len()],
            });
        }

        // Invert each sub-stack, then drop abnormal ones
        let groups = self.substack_groups(timestamps);
        let stacks: Vec<Vec<f64>> = groups
            .iter()
            .map(|group| self.transform.to_lag_domain(&mean_rows(&cross, &group.rows)))
            .collect();
        let peaks: Vec<f64> = stacks
            .iter()
            .map(|lags| lags.iter().map(|x| x.abs()).fold(0.0, f64::max))
            .collect();
        let kept = reject_outliers(&peaks, self.params.ampmax_factor);
        if kept.is_empty() {
            return None;
        }

        let kept_stacks: Vec<Vec<f64>> = kept.iter().map(|&i| stacks[i].clone()).collect();
        Some(CcfResult {
            data: to_rows(&kept_stacks, self.num_lags()),
            timestamps: kept.iter().map(|&i| groups[i].timestamp).collect(),
            counts: kept.iter().map(|&i| groups[i].rows.len()).collect(),
        })
    }

    /// Normalized cross-spectrum of every segment, (segments, nfft / 2).
    fn cross_spectra(
        &self,
        source: ArrayView2<'_, Complex<f64>>,
        receiver: ArrayView2<'_, Complex<FloatType>>,
    ) -> WideSpectra {
        let method = self.params.cc_method;
        let mut cross = Array2::<Complex<f64>>::zeros(source.dim());

        for ((source_row, receiver_row), mut cross_row) in source
            .outer_iter()
            .zip(receiver.outer_iter())
            .zip(cross.outer_iter_mut())
        {
            // Coherency also needs the receiver's smoothed amplitude
            let receiver_amplitude = match method {
                CcMethod::Coherency => {
                    smoothed_amplitude(receiver_row.iter(), self.params.smoothspect_n)
                }
                _ => vec![],
            };

            for (k, value) in cross_row.iter_mut().enumerate() {
                let s = source_row[k];
                let product = s.conj() * widen(receiver_row[k]);
                *value = match method {
                    CcMethod::Xcorr => product,
                    CcMethod::Deconv => product / s.norm().max(EPSILON).powi(2),
                    CcMethod::Coherency => {
                        product / (s.norm().max(EPSILON) * receiver_amplitude[k].max(EPSILON))
                    }
                };
            }
        }

        cross
    }

    /// Splits segments into sub-stack windows of `substack_len` seconds, anchored at the
    /// first segment. Empty windows are left out.
    fn substack_groups(&self, timestamps: &[Timestamp]) -> Vec<Group> {
        // One row per segment
        if self.params.substack_per_segment() {
            return timestamps
                .iter()
                .enumerate()
                .map(|(i, &timestamp)| Group {
                    rows: vec![i],
                    timestamp,
                })
                .collect();
        }

        // Too few segments for a full window: one window over everything
        let start = timestamps[0];
        if timestamps.len() < self.params.segments_per_substack() {
            return vec![Group {
                rows: (0..timestamps.len()).collect(),
                timestamp: start,
            }];
        }

        let window = self.params.substack_len;
        let mut windows: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &timestamp) in timestamps.iter().enumerate() {
            let index = ((timestamp - start) / window).floor().max(0.0) as usize;
            windows.entry(index).or_default().push(i);
        }

        windows
            .into_iter()
            .map(|(index, rows)| Group {
                rows,
                timestamp: start + index as f64 * window,
            })
            .collect()
    }
}

/// Keeps the rows whose peak amplitude is positive and below `factor` times the median peak.
fn reject_outliers(peaks: &[f64], factor: f64) -> Vec<usize> {
    let median = Data::new(peaks.to_vec()).median();
    peaks
        .iter()
        .enumerate()
        .filter(|&(_, &peak)| peak > 0.0 && peak < factor * median)
        .map(|(i, _)| i)
        .collect()
}

fn mean_rows(cross: &WideSpectra, rows: &[usize]) -> Vec<Complex<f64>> {
    let mut mean = vec![Complex::<f64>::zero(); cross.ncols()];
    for &row in rows {
        for (m, &value) in mean.iter_mut().zip(cross.row(row).iter()) {
            *m += value;
        }
    }
    let norm = (rows.len() as f64).recip();
    mean.iter_mut().for_each(|m| *m *= norm);
    mean
}

fn to_rows(rows: &[Vec<f64>], num_lags: usize) -> Array2<FloatType> {
    let mut data = Array2::<FloatType>::zeros((rows.len(), num_lags));
    for (mut out, row) in data.outer_iter_mut().zip(rows) {
        for (o, &value) in out.iter_mut().zip(row) {
            *o = value as FloatType;
        }
    }
    data
}

#[cfg(test)]
fn test_params(substack: bool, substack_multiple: usize, method: CcMethod) -> CcParameters {
    let mut fft = crate::config::test_fft_metadata();
    fft.cc_method = method;
    fft.dt = 1.0;
    fft.maxlag = 10.0;
    fft.cc_len = 3600.0;
    fft.step = 3600.0;
    let overrides = crate::config::CcOverrides {
        substack,
        substack_multiple,
        smoothspect_n: 3,
        ..Default::default()
    };
    CcParameters::resolve("/tmp", &fft, &overrides).unwrap()
}

#[cfg(test)]
fn hourly(n: usize) -> Vec<Timestamp> {
    (0..n).map(|i| 1.26e9 + 3600.0 * i as f64).collect()
}

#[test]
fn test_daily_average_is_single_row() {
    let params = test_params(false, 4, CcMethod::Deconv);
    let kernel = CorrelationKernel::new(&params, 64).unwrap();
    let source = crate::correlation::test_spectra(6, 32, 0.1);
    let receiver = crate::correlation::test_spectra(6, 32, 2.7);
    let smoothed = super::smooth_source_spectrum(source.view(), 3, params.cc_method);

    let result = kernel
        .correlate(smoothed.view(), receiver.view(), &hourly(6))
        .unwrap();

    assert_eq!(result.data.dim(), (1, 21));
    assert_eq!(result.counts, vec![6]);
    assert_eq!(result.timestamps, vec![hourly(6)[0]]);
}

#[test]
fn test_frequency_and_time_domain_averaging_agree() {
    for method in [CcMethod::Xcorr, CcMethod::Deconv, CcMethod::Coherency] {
        let params = test_params(false, 4, method);
        let kernel = CorrelationKernel::new(&params, 64).unwrap();
        let source = super::smooth_source_spectrum(
            crate::correlation::test_spectra(5, 32, 0.4).view(),
            3,
            method,
        );
        let receiver = crate::correlation::test_spectra(5, 32, 1.9);

        let result = kernel
            .correlate(source.view(), receiver.view(), &hourly(5))
            .unwrap();

        // Invert every segment on its own, then average in the lag domain
        let cross = kernel.cross_spectra(source.view(), receiver.view());
        let mut expected = vec![0.0; kernel.num_lags()];
        for row in 0..5 {
            let lags = kernel.transform.to_lag_domain(&mean_rows(&cross, &[row]));
            for (e, l) in expected.iter_mut().zip(lags) {
                *e += l / 5.0;
            }
        }

        let scale = expected.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
        for (got, want) in result.data.row(0).iter().zip(&expected) {
            assert!(
                (*got as f64 - want).abs() <= 1e-5 * scale,
                "{method}: {got} vs {want}"
            );
        }
    }
}

#[test]
fn test_segment_order_does_not_matter() {
    let params = test_params(false, 4, CcMethod::Coherency);
    let kernel = CorrelationKernel::new(&params, 64).unwrap();
    let source = super::smooth_source_spectrum(
        crate::correlation::test_spectra(4, 32, 0.8).view(),
        3,
        params.cc_method,
    );
    let receiver = crate::correlation::test_spectra(4, 32, 3.3);
    let order = [2, 0, 3, 1];

    let forward = kernel
        .correlate(source.view(), receiver.view(), &hourly(4))
        .unwrap();
    let shuffled = kernel
        .correlate(
            source.select(ndarray::Axis(0), &order).view(),
            receiver.select(ndarray::Axis(0), &order).view(),
            &hourly(4),
        )
        .unwrap();

    for (a, b) in forward.data.iter().zip(shuffled.data.iter()) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn test_substack_rows_match_windows() {
    let params = test_params(true, 2, CcMethod::Deconv);
    let kernel = CorrelationKernel::new(&params, 64).unwrap();
    let source = super::smooth_source_spectrum(
        crate::correlation::test_spectra(6, 32, 0.2).view(),
        3,
        params.cc_method,
    );
    let receiver = crate::correlation::test_spectra(6, 32, 0.6);
    let timestamps = hourly(6);

    let result = kernel
        .correlate(source.view(), receiver.view(), &timestamps)
        .unwrap();

    assert_eq!(result.data.nrows(), 3);
    assert_eq!(result.counts, vec![2, 2, 2]);
    assert_eq!(
        result.timestamps,
        vec![timestamps[0], timestamps[2], timestamps[4]]
    );
}

#[test]
fn test_substack_equal_to_segment_keeps_every_segment() {
    let params = test_params(true, 1, CcMethod::Xcorr);
    let kernel = CorrelationKernel::new(&params, 64).unwrap();
    let source = super::smooth_source_spectrum(
        crate::correlation::test_spectra(4, 32, 1.0).view(),
        3,
        params.cc_method,
    );
    let receiver = crate::correlation::test_spectra(4, 32, 1.5);

    let result = kernel
        .correlate(source.view(), receiver.view(), &hourly(4))
        .unwrap();

    assert_eq!(result.data.dim(), (4, 21));
    assert_eq!(result.counts, vec![1; 4]);
    assert_eq!(result.timestamps, hourly(4));
}

#[test]
fn test_sparse_segments_fall_back_to_one_window() {
    let params = test_params(true, 4, CcMethod::Deconv);
    let kernel = CorrelationKernel::new(&params, 64).unwrap();
    let source = super::smooth_source_spectrum(
        crate::correlation::test_spectra(2, 32, 0.2).view(),
        3,
        params.cc_method,
    );
    let receiver = crate::correlation::test_spectra(2, 32, 0.6);

    // Far enough apart to land in different windows
    let timestamps = vec![0.0, 50_000.0];
    let result = kernel
        .correlate(source.view(), receiver.view(), &timestamps)
        .unwrap();

    assert_eq!(result.data.nrows(), 1);
    assert_eq!(result.counts, vec![2]);
    assert_eq!(result.timestamps, vec![0.0]);
}

#[test]
fn test_loud_segment_is_rejected() {
    let params = test_params(false, 4, CcMethod::Xcorr);
    let kernel = CorrelationKernel::new(&params, 64).unwrap();
    let mut receiver = crate::correlation::test_spectra(5, 32, 0.6);
    receiver.row_mut(3).mapv_inplace(|x| x * 1000.0);
    let source = super::smooth_source_spectrum(
        crate::correlation::test_spectra(5, 32, 0.2).view(),
        3,
        params.cc_method,
    );

    let result = kernel
        .correlate(source.view(), receiver.view(), &hourly(5))
        .unwrap();
    assert_eq!(result.counts, vec![4]);
}

#[test]
fn test_all_zero_receiver_yields_nothing() {
    let params = test_params(false, 4, CcMethod::Deconv);
    let kernel = CorrelationKernel::new(&params, 64).unwrap();
    let source = super::smooth_source_spectrum(
        crate::correlation::test_spectra(3, 32, 0.2).view(),
        3,
        params.cc_method,
    );
    let receiver = Array2::<Complex<FloatType>>::zeros((3, 32));

    assert!(kernel
        .correlate(source.view(), receiver.view(), &hourly(3))
        .is_none());
}

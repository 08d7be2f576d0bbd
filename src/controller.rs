//! Day-level driver: loads each memory chunk of a day, walks every ordered pair of channels
//! and hands finished correlations to a [`CcfSink`].
//!
//! Records are produced in a fixed order (chunk, source station, source component,
//! receiver station, receiver component), so re-running a day reproduces its container.
use crate::config::CcParameters;
use crate::correlation::{smooth_source_spectrum, usable_segments, CorrelationKernel};
use crate::error::Result;
use crate::utils::io::{CcfParameters, CcfRecord, CcfSink, DayWriter};
use crate::utils::loader::{load_chunk, ChunkPlan, DataLayout, FftChunk};
use crate::{Day, Timestamp};
use log::{debug, error, info, trace, warn};
use ndarray::Axis;
use std::path::PathBuf;

/// Everything a day needs that does not change between days.
pub struct DayContext<'a> {
    pub params: &'a CcParameters,
    pub layout: &'a DataLayout,
    pub plan: ChunkPlan,
    pub files: &'a [PathBuf],
}

impl<'a> DayContext<'a> {
    pub fn new(params: &'a CcParameters, layout: &'a DataLayout, files: &'a [PathBuf]) -> Self {
        DayContext {
            params,
            layout,
            plan: ChunkPlan::new(layout, params.max_mem_bytes()),
            files,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DaySummary {
    pub chunks: usize,
    /// Pairs handed to the sink.
    pub correlated: usize,
    /// Pairs with a missing receiver channel, no common clean segment, or only rejected rows.
    pub skipped: usize,
}

/// Correlates one day and writes it to `{ccf_dir}/{day}.ccf`.
pub fn process_day(day: &str, ctx: &DayContext<'_>) -> Result<DaySummary> {
    let mut writer = DayWriter::new(&ctx.params.ccf_dir, day);
    let summary = correlate_day(day, ctx, &mut writer)?;
    info!(
        "{day}: {} correlations ({} new) in {} chunk(s), {} pairs skipped",
        summary.correlated,
        writer.written(),
        summary.chunks,
        summary.skipped
    );
    Ok(summary)
}

/// How a worker's days ended.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: Vec<Day>,
    /// Days with no spectra at all, skipped.
    pub unavailable: Vec<Day>,
    pub failed: Vec<Day>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Processes `days` in order. A day without data is skipped with a warning; any other
/// error marks the day as failed and the next day still runs.
pub fn run_days(days: &[Day], ctx: &DayContext<'_>) -> RunSummary {
    let mut summary = RunSummary::default();
    for day in days {
        match process_day(day, ctx) {
            Ok(_) => summary.completed.push(day.clone()),
            Err(err) if err.is_data_unavailable() => {
                warn!("{day}: {err}, skipping");
                summary.unavailable.push(day.clone());
            }
            Err(err) => {
                error!("{day}: {err}");
                summary.failed.push(day.clone());
            }
        }
    }
    summary
}

/// Correlates every chunk of `day`, one chunk in memory at a time.
pub fn correlate_day(
    day: &str,
    ctx: &DayContext<'_>,
    sink: &mut impl CcfSink,
) -> Result<DaySummary> {
    let kernel = CorrelationKernel::new(ctx.params, ctx.layout.nfft)?;
    let mut summary = DaySummary::default();

    for iload in 0..ctx.plan.num_load {
        // Dropped, with all its spectra, at the end of this iteration
        let chunk = load_chunk(day, iload, ctx.layout, &ctx.plan, ctx.files)?;
        correlate_chunk(day, &chunk, ctx, &kernel, sink, &mut summary)?;
        summary.chunks += 1;
    }

    Ok(summary)
}

fn correlate_chunk(
    day: &str,
    chunk: &FftChunk,
    ctx: &DayContext<'_>,
    kernel: &CorrelationKernel<'_>,
    sink: &mut impl CcfSink,
    summary: &mut DaySummary,
) -> Result<()> {
    let params = ctx.params;
    let components = &ctx.layout.components;
    let nsta = chunk.nsta();

    // Without auto-correlation the last station is only ever a receiver
    let sources = if params.auto_corr {
        0..nsta
    } else {
        0..nsta.saturating_sub(1)
    };

    for isource in sources {
        let source_info = &chunk.stations[isource];

        for (icomp_s, &comp_s) in components.iter().enumerate() {
            let source = match chunk.channel(chunk.channel_index(isource, icomp_s)) {
                Some(source) => source,
                None => {
                    debug!("no data for {comp_s} of {}", source_info.station);
                    continue;
                }
            };

            // Computed once, shared by every receiver of this source channel
            let smoothed = smooth_source_spectrum(
                source.spectra.view(),
                params.smoothspect_n,
                params.cc_method,
            );
            let data_type = source_info.channel_label(comp_s);

            let first_receiver = if params.auto_corr { isource } else { isource + 1 };
            for ireceiver in first_receiver..nsta {
                let receiver_info = &chunk.stations[ireceiver];

                for (icomp_r, &comp_r) in components.iter().enumerate() {
                    let receiver_index = chunk.channel_index(ireceiver, icomp_r);
                    let receiver = match chunk.channel(receiver_index) {
                        Some(receiver) => receiver,
                        None => {
                            summary.skipped += 1;
                            continue;
                        }
                    };

                    // Earthquakes and gaps at either end
                    let usable = usable_segments(
                        source.stats.view(),
                        receiver.stats.view(),
                        params.max_over_std,
                    );
                    if usable.is_empty() {
                        trace!(
                            "{data_type} -> {}: no common clean segment",
                            receiver_info.channel_label(comp_r)
                        );
                        summary.skipped += 1;
                        continue;
                    }

                    let timestamps: Vec<Timestamp> =
                        usable.iter().map(|&i| receiver.timestamps[i]).collect();
                    let result = match kernel.correlate(
                        smoothed.select(Axis(0), &usable).view(),
                        receiver.spectra.select(Axis(0), &usable).view(),
                        &timestamps,
                    ) {
                        Some(result) => result,
                        None => {
                            summary.skipped += 1;
                            continue;
                        }
                    };

                    let record = CcfRecord {
                        data_type: data_type.clone(),
                        path: format!("{}{}", receiver_info.channel_label(comp_r), chunk.index),
                        parameters: CcfParameters::new(
                            params,
                            source_info,
                            receiver_info,
                            &result,
                            day,
                        )?,
                        data: result.data,
                    };
                    trace!("{} -> {}", record.data_type, record.path);
                    sink.append(record)?;
                    summary.correlated += 1;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
fn test_params(auto_corr: bool) -> CcParameters {
    let mut fft = crate::config::test_fft_metadata();
    fft.dt = 1.0;
    fft.maxlag = 10.0;
    fft.cc_len = 3600.0;
    fft.step = 3600.0;
    let overrides = crate::config::CcOverrides {
        auto_corr,
        smoothspect_n: 3,
        ..Default::default()
    };
    CcParameters::resolve("/tmp", &fft, &overrides).unwrap()
}

#[cfg(test)]
fn test_chunk(ncomp: usize, channels: Vec<Option<f32>>) -> FftChunk {
    use crate::utils::loader::{ChannelData, StationInfo};

    let nsta = channels.len() / ncomp;
    let stations = (0..nsta)
        .map(|i| StationInfo {
            network: String::from("XX"),
            station: format!("S{i}"),
            longitude: -117.0 + i as f64,
            latitude: 34.0,
        })
        .collect();
    let channels = channels
        .into_iter()
        .enumerate()
        .map(|(i, stat)| {
            stat.map(|stat| ChannelData {
                spectra: crate::correlation::test_spectra(4, 32, i as f64 * 0.9),
                stats: ndarray::Array1::from_elem(4, stat),
                timestamps: ndarray::Array1::from_shape_fn(4, |j| 1.26e9 + 3600.0 * j as f64),
            })
        })
        .collect();
    FftChunk::new(0, stations, ncomp, channels).unwrap()
}

#[cfg(test)]
fn run_chunk(
    params: &CcParameters,
    ncomp: usize,
    chunk: &FftChunk,
) -> (Vec<CcfRecord>, DaySummary) {
    let layout = DataLayout {
        nfft: 64,
        nseg: 4,
        nsta: chunk.nsta(),
        components: crate::constants::COMPONENTS[3 - ncomp..].to_vec(),
    };
    let files: Vec<PathBuf> = vec![];
    let ctx = DayContext::new(params, &layout, &files);
    let kernel = CorrelationKernel::new(params, layout.nfft).unwrap();

    let mut records: Vec<CcfRecord> = vec![];
    let mut summary = DaySummary::default();
    correlate_chunk("2010_01_01", chunk, &ctx, &kernel, &mut records, &mut summary).unwrap();
    (records, summary)
}

#[test]
fn test_pairs_cover_upper_triangle() {
    let params = test_params(false);
    let chunk = test_chunk(1, vec![Some(2.0); 3]);
    let (records, summary) = run_chunk(&params, 1, &chunk);

    let addresses: Vec<(String, String)> = records.iter().map(CcfRecord::address).collect();
    assert_eq!(
        addresses,
        vec![
            (String::from("XXsS0sZ"), String::from("XXsS1sZ0")),
            (String::from("XXsS0sZ"), String::from("XXsS2sZ0")),
            (String::from("XXsS1sZ"), String::from("XXsS2sZ0")),
        ]
    );
    assert_eq!(summary.correlated, 3);
    assert_eq!(summary.skipped, 0);

    let record = &records[0];
    assert_eq!(record.data.dim(), (1, 21));
    assert_eq!(record.parameters.ngood, vec![4]);
    assert_eq!(record.parameters.npts, 21);
    assert_eq!(record.parameters.lon_r, -116.0);
    assert_eq!(record.parameters.date, "2010_01_01");
}

#[test]
fn test_auto_correlation_adds_self_pairs() {
    let chunk = test_chunk(2, vec![Some(2.0); 4]);

    let (without, _) = run_chunk(&test_params(false), 2, &chunk);
    let (with, _) = run_chunk(&test_params(true), 2, &chunk);

    // 2 x 2 component pairs between the stations, plus 4 per station with itself
    assert_eq!(without.len(), 4);
    assert_eq!(with.len(), 12);
    assert!(with
        .iter()
        .any(|r| r.data_type == "XXsS1sN" && r.path == "XXsS1sZ0"));
    assert!(without.iter().all(|r| r.data_type.starts_with("XXsS0")));
}

#[test]
fn test_invalid_channels_never_correlated() {
    let params = test_params(false);
    // S1 has no data, S2 has only gaps
    let chunk = test_chunk(1, vec![Some(2.0), None, Some(0.0), Some(3.0)]);
    let (records, summary) = run_chunk(&params, 1, &chunk);

    assert!(records
        .iter()
        .all(|r| !r.data_type.contains("S1") && !r.path.contains("S1")));
    assert!(records
        .iter()
        .all(|r| !r.data_type.contains("S2") && !r.path.contains("S2")));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, "XXsS3sZ0");
    // S0-S1, S0-S2, S2-S3
    assert_eq!(summary.skipped, 3);
}

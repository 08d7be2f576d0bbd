//! Writes a small spectral dataset (station files plus `fft_metadata.json`) for smoke runs.
//!
//! Every station records the same wavefield, delayed by `delay * station_index` seconds,
//! plus a weaker station-specific part, so correlations peak at the relative delay.
use anyhow::Context;
use clap::Parser;
use log::info;
use ndarray::{Array1, Array2};
use noise_xcorr::config::{CcMethod, FftMetadata};
use noise_xcorr::constants::{COMPONENTS, DAY_FORMAT};
use noise_xcorr::utils::dates::day_list;
use noise_xcorr::utils::loader::{ChannelData, SpectralFileWriter};
use num_complex::Complex;
use rustfft::FftPlanner;
use statrs::statistics::Statistics;
use std::f64::consts::PI;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Writes a synthetic spectral dataset")]
struct Args {
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long, default_value_t = 3)]
    stations: usize,

    /// Number of components, taken from E, N, Z in reverse (1 gives Z only)
    #[arg(long, default_value_t = 1)]
    components: usize,

    #[arg(long, default_value = "2010_01_01")]
    start_date: String,

    #[arg(long, default_value_t = 2)]
    days: i64,

    /// Segments per day
    #[arg(long, default_value_t = 8)]
    nseg: usize,

    #[arg(long, default_value_t = 256)]
    nfft: usize,

    #[arg(long, default_value_t = 0.05)]
    dt: f64,

    /// Delay between consecutive stations, seconds
    #[arg(long, default_value_t = 0.4)]
    delay: f64,

    /// xcorr, deconv or coherency
    #[arg(long, default_value = "deconv")]
    method: CcMethod,
}

/// Frequency (Hz), amplitude and phase offset of each wavefield term.
const TERMS: [(f64, f64, f64); 5] = [
    (0.37, 1.0, 0.3),
    (0.91, 0.8, 1.7),
    (1.63, 0.6, 2.9),
    (2.47, 0.5, 0.8),
    (3.19, 0.4, 2.2),
];

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();
    let args = Args::parse();
    anyhow::ensure!(
        (1..=COMPONENTS.len()).contains(&args.components),
        "between 1 and {} components",
        COMPONENTS.len()
    );

    let cc_len = args.nfft as f64 * args.dt;
    let step = cc_len / 2.0;
    let start = noise_xcorr::config::parse_day(&args.start_date)?;
    let end = (start + chrono::Duration::days(args.days))
        .format(DAY_FORMAT)
        .to_string();
    let days = day_list(&args.start_date, &end, 1)?;
    let components = &COMPONENTS[COMPONENTS.len() - args.components..];

    let fft_dir = args.root.join("FFT");
    std::fs::create_dir_all(&fft_dir)
        .with_context(|| format!("cannot create {}", fft_dir.display()))?;

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(args.nfft);

    for ista in 0..args.stations {
        let path = fft_dir.join(format!("XX.S{ista:02}.npz"));
        let mut writer = SpectralFileWriter::create(&path, -117.0 + 0.1 * ista as f64, 34.0)?;

        for (iday, day) in days.iter().enumerate() {
            let day_start = (start + chrono::Duration::days(iday as i64))
                .and_hms_opt(0, 0, 0)
                .map(|t| t.timestamp() as f64)
                .unwrap_or_default();

            for (icomp, component) in components.iter().enumerate() {
                let mut spectra = Array2::<Complex<f32>>::zeros((args.nseg, args.nfft / 2));
                let mut stats = Array1::<f32>::zeros(args.nseg);
                let timestamps =
                    Array1::from_shape_fn(args.nseg, |iseg| day_start + iseg as f64 * step);

                for iseg in 0..args.nseg {
                    let t0 = timestamps[iseg];
                    let trace: Vec<f64> = (0..args.nfft)
                        .map(|n| {
                            let t = t0 + n as f64 * args.dt;
                            wavefield(t - ista as f64 * args.delay, icomp)
                                + 0.2 * wavefield(1.37 * t + 11.0 * ista as f64, icomp + 3)
                        })
                        .collect();
                    stats[iseg] = max_over_std(&trace) as f32;

                    let mut buffer: Vec<Complex<f64>> =
                        trace.iter().map(|&x| Complex::new(x, 0.0)).collect();
                    fft.process(&mut buffer);
                    for (out, value) in spectra.row_mut(iseg).iter_mut().zip(&buffer) {
                        *out = Complex::new(value.re as f32, value.im as f32);
                    }
                }

                let data = ChannelData {
                    spectra,
                    stats,
                    timestamps,
                };
                writer.add_day(component, day, args.nfft, &data)?;
            }
        }
        writer.finish()?;
        info!("wrote {}", path.display());
    }

    let metadata = FftMetadata {
        dt: args.dt,
        cc_len,
        step,
        maxlag: (cc_len / 4.0).min(10.0),
        cc_method: args.method,
        start_date: args.start_date.clone(),
        end_date: end,
        inc_days: 1,
        fft_dir: PathBuf::from("FFT"),
    };
    metadata.write(&args.root)?;
    info!(
        "{} stations x {} days in {}",
        args.stations,
        days.len(),
        args.root.display()
    );

    Ok(())
}

fn wavefield(t: f64, seed: usize) -> f64 {
    TERMS
        .iter()
        .map(|&(f, a, phase)| a * (2.0 * PI * f * t + phase * (seed + 1) as f64).sin())
        .sum()
}

fn max_over_std(trace: &[f64]) -> f64 {
    let mean = trace.iter().mean();
    let std = trace.iter().population_std_dev();
    let max = trace.iter().fold(0.0_f64, |acc, x| acc.max((x - mean).abs()));
    if std > 0.0 {
        max / std
    } else {
        0.0
    }
}

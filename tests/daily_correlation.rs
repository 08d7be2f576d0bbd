//! End-to-end runs over station files written to a scratch directory.
use ndarray::{Array1, Array2};
use noise_xcorr::config::{CcMethod, CcOverrides, CcParameters, FftMetadata};
use noise_xcorr::constants::BYTES_PER_GB;
use noise_xcorr::controller::{correlate_day, process_day, run_days, DayContext};
use noise_xcorr::error::CcError;
use noise_xcorr::utils::io::{day_container_path, read_container, CcfRecord};
use noise_xcorr::utils::loader::{
    discover_station_files, ChannelData, DataLayout, SpectralFileWriter,
};
use num_complex::Complex;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const DAY: &str = "2010_01_01";
const NFFT: usize = 64;
const NSEG: usize = 4;

fn scratch_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("FFT")).unwrap();
    dir
}

fn channel(seed: f64, stat: f32) -> ChannelData {
    ChannelData {
        spectra: Array2::from_shape_fn((NSEG, NFFT / 2), |(i, k)| {
            let amplitude = 1.0 + 0.5 * (i as f64 * 1.3 + k as f64 * 0.7 + seed).sin();
            let phase =
                (i as f64 * 2.1 + k as f64 * 0.37 + seed * 1.9).cos() * std::f64::consts::PI;
            let value = Complex::from_polar(amplitude, phase);
            Complex::new(value.re as f32, value.im as f32)
        }),
        stats: Array1::from_elem(NSEG, stat),
        timestamps: Array1::from_shape_fn(NSEG, |i| 1.26e9 + 3600.0 * i as f64),
    }
}

/// Writes `FFT/XX.{station}.npz` with one entry per `(component, day, stat)`.
fn write_station(root: &Path, station: &str, seed: f64, entries: &[(&str, &str, f32)]) {
    let path = root.join("FFT").join(format!("XX.{station}.npz"));
    let mut writer = SpectralFileWriter::create(&path, -117.0 + seed, 34.0).unwrap();
    for (i, &(component, day, stat)) in entries.iter().enumerate() {
        writer
            .add_day(component, day, NFFT, &channel(seed + i as f64, stat))
            .unwrap();
    }
    writer.finish().unwrap();
}

fn resolve(root: &Path, overrides: CcOverrides) -> CcParameters {
    let fft = FftMetadata {
        dt: 1.0,
        cc_len: 3600.0,
        step: 3600.0,
        maxlag: 10.0,
        cc_method: CcMethod::Deconv,
        start_date: String::from(DAY),
        end_date: String::from("2010_01_02"),
        inc_days: 1,
        fft_dir: PathBuf::from("FFT"),
    };
    fft.write(root).unwrap();
    let fft = FftMetadata::read(root).unwrap();
    CcParameters::resolve(
        root,
        &fft,
        &CcOverrides {
            smoothspect_n: 3,
            ..overrides
        },
    )
    .unwrap()
}

fn run(root: &Path, overrides: CcOverrides) -> noise_xcorr::error::Result<Vec<CcfRecord>> {
    let params = resolve(root, overrides);
    let files = discover_station_files(&params.fft_dir)?;
    let layout = DataLayout::detect(&files)?;
    let ctx = DayContext::new(&params, &layout, &files);

    let mut records: Vec<CcfRecord> = vec![];
    correlate_day(DAY, &ctx, &mut records)?;
    Ok(records)
}

#[test]
fn test_two_stations_one_record() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", DAY, 2.0)]);

    let records = run(root, CcOverrides::default()).unwrap();

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.data_type, "XXsAsZ");
    assert_eq!(record.path, "XXsBsZ0");
    // 2 * maxlag / dt + 1
    assert_eq!(record.data.dim(), (1, 21));
    assert_eq!(record.parameters.ngood, vec![4]);
    assert_eq!(record.parameters.lon_s, -117.0);
    assert_eq!(record.parameters.lon_r, -116.0);
    assert!(record.data.iter().all(|x| x.is_finite()));
}

#[test]
fn test_receiver_without_clean_segments_gives_nothing() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", DAY, 0.0)]);

    assert!(run(root, CcOverrides::default()).unwrap().is_empty());
}

#[test]
fn test_auto_correlation_adds_self_pairs() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", DAY, 2.0)]);

    let cross = run(root, CcOverrides::default()).unwrap();
    let all = run(
        root,
        CcOverrides {
            auto_corr: true,
            ..CcOverrides::default()
        },
    )
    .unwrap();

    let addresses: Vec<(String, String)> = all.iter().map(CcfRecord::address).collect();
    assert_eq!(cross.len(), 1);
    assert_eq!(
        addresses,
        vec![
            (String::from("XXsAsZ"), String::from("XXsAsZ0")),
            (String::from("XXsAsZ"), String::from("XXsBsZ0")),
            (String::from("XXsBsZ"), String::from("XXsBsZ0")),
        ]
    );
}

#[test]
fn test_station_missing_the_day_is_skipped() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", "2010_01_02", 2.0)]);
    write_station(root, "C", 2.0, &[("Z", DAY, 2.0)]);

    let records = run(root, CcOverrides::default()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, "XXsCsZ0");
    assert!(records
        .iter()
        .all(|r| !r.data_type.contains("sBs") && !r.path.contains("sBs")));
}

#[test]
fn test_day_without_any_data_is_unavailable() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", "2010_01_02", 2.0)]);
    write_station(root, "B", 1.0, &[("Z", "2010_01_02", 2.0)]);

    let err = run(root, CcOverrides::default()).unwrap_err();
    assert!(err.is_data_unavailable());
}

#[test]
fn test_small_budget_splits_day_into_chunks() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", DAY, 2.0)]);

    // Two segments of 2 channels x 32 bins x 8 bytes
    let records = run(
        root,
        CcOverrides {
            max_mem: 1024.0 / BYTES_PER_GB,
            ..CcOverrides::default()
        },
    )
    .unwrap();

    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["XXsBsZ0", "XXsBsZ1"]);
    assert!(records.iter().all(|r| r.parameters.ngood == vec![2]));
    assert_eq!(records[1].parameters.time, vec![1.26e9 + 7200.0]);
}

#[test]
fn test_substacks_are_written_per_window() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0), ("N", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", DAY, 2.0), ("N", DAY, 2.0)]);

    let records = run(
        root,
        CcOverrides {
            substack: true,
            substack_multiple: 2,
            ..CcOverrides::default()
        },
    )
    .unwrap();

    // N-N, N-Z, Z-N, Z-Z
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].data_type, "XXsAsN");
    assert_eq!(records[0].path, "XXsBsN0");
    for record in &records {
        assert_eq!(record.data.dim(), (2, 21));
        assert_eq!(record.parameters.ngood, vec![2, 2]);
        assert!(record.parameters.substack);
    }
}

#[test]
fn test_component_count_mismatch_is_configuration_error() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", DAY, 2.0), ("N", DAY, 2.0)]);

    let err = run(root, CcOverrides::default()).unwrap_err();
    assert!(matches!(err, CcError::Configuration(_)));
}

#[test]
fn test_rerun_leaves_container_unchanged() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", DAY, 2.0)]);

    let params = resolve(root, CcOverrides::default());
    let files = discover_station_files(&params.fft_dir).unwrap();
    let layout = DataLayout::detect(&files).unwrap();
    let ctx = DayContext::new(&params, &layout, &files);

    process_day(DAY, &ctx).unwrap();
    let first = read_container(day_container_path(&params.ccf_dir, DAY)).unwrap();
    process_day(DAY, &ctx).unwrap();
    let second = read_container(day_container_path(&params.ccf_dir, DAY)).unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first, second);
}

#[test]
fn test_nothing_to_write_creates_no_container() {
    let dir = scratch_dir();
    let root = dir.path();
    write_station(root, "A", 0.0, &[("Z", DAY, 2.0)]);
    write_station(root, "B", 1.0, &[("Z", DAY, 50.0)]);

    let params = resolve(root, CcOverrides::default());
    let files = discover_station_files(&params.fft_dir).unwrap();
    let layout = DataLayout::detect(&files).unwrap();
    let ctx = DayContext::new(&params, &layout, &files);

    let summary = process_day(DAY, &ctx).unwrap();
    assert_eq!(summary.correlated, 0);
    assert_eq!(summary.skipped, 1);
    assert!(!day_container_path(&params.ccf_dir, DAY).exists());
}

#[test]
fn test_bad_days_do_not_stop_the_run() {
    let dir = scratch_dir();
    let root = dir.path();
    let entries = [
        ("Z", "2010_01_01", 2.0),
        ("Z", "2010_01_03", 2.0),
        ("Z", "2010_01_04", 2.0),
    ];
    write_station(root, "A", 0.0, &entries);
    write_station(root, "B", 1.0, &entries);

    let params = resolve(root, CcOverrides::default());
    let files = discover_station_files(&params.fft_dir).unwrap();
    let layout = DataLayout::detect(&files).unwrap();
    let ctx = DayContext::new(&params, &layout, &files);

    // A plain file where the third day's container should go
    std::fs::create_dir_all(&params.ccf_dir).unwrap();
    std::fs::write(day_container_path(&params.ccf_dir, "2010_01_03"), b"taken").unwrap();

    let days: Vec<String> = ["2010_01_01", "2010_01_02", "2010_01_03", "2010_01_04"]
        .iter()
        .map(|day| day.to_string())
        .collect();
    let summary = run_days(&days, &ctx);

    assert_eq!(summary.completed, vec!["2010_01_01", "2010_01_04"]);
    assert_eq!(summary.unavailable, vec!["2010_01_02"]);
    assert_eq!(summary.failed, vec!["2010_01_03"]);
    assert!(summary.has_failures());
    for day in ["2010_01_01", "2010_01_04"] {
        let records = read_container(day_container_path(&params.ccf_dir, day)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "XXsBsZ0");
    }
}

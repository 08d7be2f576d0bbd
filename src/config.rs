//! Correlation parameters.
//!
//! The prior stage leaves a flat parameter record (`fft_metadata.json`) next to its spectra.
//! This stage reads it once, applies the handful of overrides exposed on the command line,
//! validates the result and writes its own record (`cc_metadata.json`) for later stages.
//! The resolved [`CcParameters`] is immutable and passed by reference to every component.
use crate::constants::*;
use crate::error::{CcError, Result};
use chrono::NaiveDate;
use serde_derive::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// How the cross-spectrum of a source/receiver pair is normalized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CcMethod {
    /// Plain cross-correlation, no amplitude normalization.
    Xcorr,
    /// Divide by the squared (smoothed) source amplitude.
    Deconv,
    /// Divide by the product of the (smoothed) source and receiver amplitudes.
    Coherency,
}

impl CcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CcMethod::Xcorr => "xcorr",
            CcMethod::Deconv => "deconv",
            CcMethod::Coherency => "coherency",
        }
    }

    /// Whether the source spectrum is replaced by its amplitude-smoothed version.
    pub fn smooths_source(&self) -> bool {
        !matches!(self, CcMethod::Xcorr)
    }
}

impl std::fmt::Display for CcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CcMethod {
    type Err = CcError;

    fn from_str(s: &str) -> Result<Self> {
        [CcMethod::Xcorr, CcMethod::Deconv, CcMethod::Coherency]
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| {
                CcError::configuration(format!(
                    "unknown cc_method {s}, expected xcorr, deconv or coherency"
                ))
            })
    }
}

/// Parameter record left by the spectra stage. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FftMetadata {
    pub dt: f64,
    pub cc_len: f64,
    pub step: f64,
    pub maxlag: f64,
    pub cc_method: CcMethod,
    pub start_date: String,
    pub end_date: String,
    pub inc_days: i64,
    #[serde(alias = "FFTDIR")]
    pub fft_dir: PathBuf,
}

impl FftMetadata {
    /// Reads `fft_metadata.json` from `root`.
    pub fn read(root: impl AsRef<Path>) -> Result<FftMetadata> {
        let path = root.as_ref().join(FFT_METADATA_FILE);
        let file = File::open(&path).map_err(|err| {
            CcError::configuration(format!(
                "cannot find metadata file used for fft {}: {err}",
                path.display()
            ))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            CcError::configuration(format!("malformed metadata in {}: {err}", path.display()))
        })
    }

    pub fn write(&self, root: impl AsRef<Path>) -> Result<()> {
        write_json(&root.as_ref().join(FFT_METADATA_FILE), self)
    }
}

/// Values this stage adds on top of the spectra-stage record.
#[derive(Debug, Clone, PartialEq)]
pub struct CcOverrides {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub auto_corr: bool,
    pub substack: bool,
    pub substack_multiple: usize,
    pub smoothspect_n: usize,
    pub max_over_std: f32,
    pub max_kurtosis: f32,
    pub max_mem: f64,
    pub ampmax_factor: f64,
}

impl Default for CcOverrides {
    fn default() -> Self {
        CcOverrides {
            start_date: None,
            end_date: None,
            auto_corr: false,
            substack: false,
            substack_multiple: DEFAULT_SUBSTACK_MULTIPLE,
            smoothspect_n: DEFAULT_SMOOTHSPECT_N,
            max_over_std: DEFAULT_MAX_OVER_STD,
            max_kurtosis: DEFAULT_MAX_KURTOSIS,
            max_mem: DEFAULT_MAX_MEM,
            ampmax_factor: DEFAULT_AMPMAX_FACTOR,
        }
    }
}

/// Resolved, validated correlation parameters for the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CcParameters {
    /// Sampling interval in seconds.
    pub dt: f64,
    /// Length of one segment in seconds.
    pub cc_len: f64,
    /// Step between segment starts in seconds.
    pub step: f64,
    /// Largest lag kept in the output, in seconds.
    pub maxlag: f64,
    pub cc_method: CcMethod,
    /// Half-width of the amplitude smoothing window, in frequency bins.
    pub smoothspect_n: usize,
    pub substack: bool,
    /// Sub-stack length in seconds, an integer multiple of `cc_len`.
    pub substack_len: f64,
    pub start_date: String,
    pub end_date: String,
    pub inc_days: i64,
    pub max_over_std: f32,
    pub max_kurtosis: f32,
    /// Memory budget per worker in GB.
    pub max_mem: f64,
    pub auto_corr: bool,
    pub ampmax_factor: f64,
    pub fft_dir: PathBuf,
    pub ccf_dir: PathBuf,
}

impl CcParameters {
    /// Combines the spectra-stage record with this stage's overrides. Output goes to `root/CCF`.
    pub fn resolve(
        root: impl AsRef<Path>,
        fft: &FftMetadata,
        overrides: &CcOverrides,
    ) -> Result<CcParameters> {
        let params = CcParameters {
            dt: fft.dt,
            cc_len: fft.cc_len,
            step: fft.step,
            maxlag: fft.maxlag,
            cc_method: fft.cc_method,
            smoothspect_n: overrides.smoothspect_n,
            substack: overrides.substack,
            substack_len: overrides.substack_multiple as f64 * fft.cc_len,
            start_date: overrides
                .start_date
                .clone()
                .unwrap_or_else(|| fft.start_date.clone()),
            end_date: overrides
                .end_date
                .clone()
                .unwrap_or_else(|| fft.end_date.clone()),
            inc_days: fft.inc_days,
            max_over_std: overrides.max_over_std,
            max_kurtosis: overrides.max_kurtosis,
            max_mem: overrides.max_mem,
            auto_corr: overrides.auto_corr,
            ampmax_factor: overrides.ampmax_factor,
            // A relative spectra directory is taken relative to the project root
            fft_dir: root.as_ref().join(&fft.fft_dir),
            ccf_dir: root.as_ref().join(CCF_SUBDIR),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("dt", self.dt),
            ("cc_len", self.cc_len),
            ("step", self.step),
            ("maxlag", self.maxlag),
            ("max_mem", self.max_mem),
            ("ampmax_factor", self.ampmax_factor),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(CcError::configuration(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(self.max_over_std > 0.0) {
            return Err(CcError::configuration("max_over_std must be positive"));
        }
        if self.maxlag < self.dt {
            return Err(CcError::configuration(format!(
                "maxlag ({}) is shorter than one sample ({})",
                self.maxlag, self.dt
            )));
        }

        // Sub-stacks are built from whole segments
        let multiple = self.substack_len / self.cc_len;
        if multiple < 1.0 || (multiple - multiple.round()).abs() > 1e-9 {
            return Err(CcError::configuration(format!(
                "substack_len ({}) must be an integer multiple of cc_len ({})",
                self.substack_len, self.cc_len
            )));
        }

        // One day is the unit of correlation in this stage
        if self.inc_days != 1 {
            return Err(CcError::configuration(format!(
                "inc_days must be 1 for daily correlation, got {}",
                self.inc_days
            )));
        }
        let start = parse_day(&self.start_date)?;
        let end = parse_day(&self.end_date)?;
        if end <= start {
            return Err(CcError::configuration(format!(
                "end_date {} is not after start_date {}",
                self.end_date, self.start_date
            )));
        }
        Ok(())
    }

    pub fn max_mem_bytes(&self) -> f64 {
        self.max_mem * BYTES_PER_GB
    }

    /// Number of segments that make up one full sub-stack window.
    pub fn segments_per_substack(&self) -> usize {
        ((self.substack_len / self.step).round() as usize).max(1)
    }

    /// Whether every sub-stack is a single segment.
    pub fn substack_per_segment(&self) -> bool {
        (self.substack_len - self.cc_len).abs() < 1e-9 * self.cc_len
    }

    /// Number of lag samples kept on each side of zero lag.
    pub fn half_lags(&self) -> usize {
        (self.maxlag / self.dt + 1e-6).floor() as usize
    }

    pub fn write(&self, root: impl AsRef<Path>) -> Result<()> {
        write_json(&root.as_ref().join(CC_METADATA_FILE), self)
    }

    pub fn read(root: impl AsRef<Path>) -> Result<CcParameters> {
        let path = root.as_ref().join(CC_METADATA_FILE);
        let file = File::open(&path).map_err(|err| {
            CcError::configuration(format!("cannot open {}: {err}", path.display()))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            CcError::configuration(format!("malformed metadata in {}: {err}", path.display()))
        })
    }
}

/// Parses a `YYYY_MM_DD` day.
pub fn parse_day(day: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(day, DAY_FORMAT)
        .map_err(|err| CcError::configuration(format!("invalid date {day}: {err}")))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).map_err(|err| CcError::io(path, err))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|err| {
        CcError::io(path, std::io::Error::new(std::io::ErrorKind::Other, err))
    })?;
    writer.flush().map_err(|err| CcError::io(path, err))
}

#[cfg(test)]
pub(crate) fn test_fft_metadata() -> FftMetadata {
    FftMetadata {
        dt: 0.05,
        cc_len: 3600.0,
        step: 1800.0,
        maxlag: 2.0,
        cc_method: CcMethod::Deconv,
        start_date: String::from("2010_01_01"),
        end_date: String::from("2010_01_02"),
        inc_days: 1,
        fft_dir: PathBuf::from("FFT"),
    }
}

#[test]
fn test_resolve_applies_overrides() {
    let overrides = CcOverrides {
        end_date: Some(String::from("2010_01_05")),
        substack: true,
        substack_multiple: 2,
        ..CcOverrides::default()
    };
    let params = CcParameters::resolve("/data", &test_fft_metadata(), &overrides).unwrap();

    assert_eq!(params.start_date, "2010_01_01");
    assert_eq!(params.end_date, "2010_01_05");
    assert_eq!(params.substack_len, 7200.0);
    assert_eq!(params.segments_per_substack(), 4);
    assert!(!params.substack_per_segment());
    assert_eq!(params.fft_dir, PathBuf::from("/data/FFT"));
    assert_eq!(params.ccf_dir, PathBuf::from("/data/CCF"));
}

#[test]
fn test_half_lags_counts_whole_samples() {
    let params =
        CcParameters::resolve("/data", &test_fft_metadata(), &CcOverrides::default()).unwrap();

    // 2 s at 20 Hz
    assert_eq!(params.half_lags(), 40);
}

#[test]
fn test_rejects_multi_day_increment() {
    let mut fft = test_fft_metadata();
    fft.inc_days = 2;
    let err = CcParameters::resolve("/data", &fft, &CcOverrides::default()).unwrap_err();
    assert!(matches!(err, CcError::Configuration(_)));
}

#[test]
fn test_rejects_zero_substack_multiple() {
    let overrides = CcOverrides {
        substack_multiple: 0,
        ..CcOverrides::default()
    };
    let err = CcParameters::resolve("/data", &test_fft_metadata(), &overrides).unwrap_err();
    assert!(matches!(err, CcError::Configuration(_)));
}

#[test]
fn test_missing_fft_metadata_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = FftMetadata::read(dir.path()).unwrap_err();
    assert!(matches!(err, CcError::Configuration(_)));
}

#[test]
fn test_metadata_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();

    let fft = test_fft_metadata();
    fft.write(dir.path()).unwrap();
    let read_back = FftMetadata::read(dir.path()).unwrap();
    assert_eq!(read_back, fft);
    let params = CcParameters::resolve(dir.path(), &read_back, &CcOverrides::default()).unwrap();
    params.write(dir.path()).unwrap();

    assert_eq!(CcParameters::read(dir.path()).unwrap(), params);
}

#[test]
fn test_method_parses_its_own_name() {
    for method in [CcMethod::Xcorr, CcMethod::Deconv, CcMethod::Coherency] {
        assert_eq!(method.as_str().parse::<CcMethod>().unwrap(), method);
    }
    assert!(matches!(
        "Deconv".parse::<CcMethod>(),
        Err(CcError::Configuration(_))
    ));
}

#[test]
fn test_reads_legacy_fftdir_key() {
    let json = r#"{"dt": 0.05, "cc_len": 3600, "step": 1800, "maxlag": 200,
        "cc_method": "coherency", "start_date": "2010_01_01", "end_date": "2010_01_02",
        "inc_days": 1, "FFTDIR": "/mnt/FFT", "freqmin": 0.05}"#;
    let fft: FftMetadata = serde_json::from_str(json).unwrap();
    assert_eq!(fft.cc_method, CcMethod::Coherency);
    assert_eq!(fft.fft_dir, PathBuf::from("/mnt/FFT"));
}

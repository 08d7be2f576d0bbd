/// Labels of the three recording axes, indexed by component position within a station.
pub const COMPONENTS: [&str; 3] = ["E", "N", "Z"];

/// Bytes per stored spectral value (complex64).
pub const BYTES_PER_COMPLEX: usize = 8;

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// How many station files are opened when probing the spectral layout and the component count.
pub const LAYOUT_CANDIDATES: usize = 5;

/// Guard used wherever a spectral amplitude ends up in a denominator.
pub const EPSILON: f64 = 1e-20;

/// Rows whose peak amplitude reaches this multiple of the median peak are treated as outliers.
pub const DEFAULT_AMPMAX_FACTOR: f64 = 20.0;

/// Default half-width (in bins) of the moving window used to smooth spectral amplitudes.
pub const DEFAULT_SMOOTHSPECT_N: usize = 10;

/// Maximum ratio between the maximum absolute amplitude and the std of a segment.
pub const DEFAULT_MAX_OVER_STD: f32 = 10.0;

pub const DEFAULT_MAX_KURTOSIS: f32 = 10.0;

/// Memory allowed per worker, in GB.
pub const DEFAULT_MAX_MEM: f64 = 4.0;

/// Sub-stack length as a multiple of the segment length.
pub const DEFAULT_SUBSTACK_MULTIPLE: usize = 4;

/// Prior stage (spectra) parameter record, relative to the project root.
pub const FFT_METADATA_FILE: &str = "fft_metadata.json";

/// This stage's resolved parameter record, relative to the project root.
pub const CC_METADATA_FILE: &str = "cc_metadata.json";

pub const CCF_SUBDIR: &str = "CCF";

pub const STATION_FILE_EXTENSION: &str = "npz";

pub const CCF_FILE_EXTENSION: &str = "ccf";

/// Day naming used for array paths and output containers.
pub const DAY_FORMAT: &str = "%Y_%m_%d";

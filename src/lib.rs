pub mod config;
pub mod constants;
pub mod controller;
pub mod correlation;
pub mod error;
pub mod utils;

// Note that the on-disk spectra and the written correlation functions are single precision,
// while everything in between (smoothing, normalization, inverse transforms) runs in f64.
pub type FloatType = f32;

pub type ChannelIndex = usize;
pub type SegmentIndex = usize;
pub type Timestamp = f64;
pub type Day = String;
pub type Spectra = ndarray::Array2<num_complex::Complex<FloatType>>;
pub type WideSpectra = ndarray::Array2<num_complex::Complex<f64>>;

//! Small DSP building blocks shared by sources and submixes.
//!
//! All buffers are interleaved `f32`, frame-major: `buf[frame * channels + channel]`.

pub mod buffer;
pub mod envelope;
pub mod filter;
pub mod ramp;
pub mod spectrum;

pub use envelope::EnvelopeFollower;
pub use filter::{OnePoleHighPass, OnePoleLowPass};
pub use ramp::{ChannelMapRamp, Ramp};
pub use spectrum::SpectrumAnalyzer;

/// Amplitude below which an envelope counts as silent (-96 dB)
pub const ENVELOPE_TAIL_THRESHOLD: f32 = 1.58489e-5;

/// Cutoff at or above which the low-pass filter is bypassed
pub const MAX_FILTER_FREQUENCY: f32 = 20_000.0;

/// Cutoff at or below which the high-pass filter is bypassed
pub const MIN_FILTER_FREQUENCY: f32 = 0.0;

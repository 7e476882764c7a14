//! Mixer configuration.
//!
//! ```
//! use mischpult::MixerConfig;
//!
//! let config = MixerConfig::new(48_000)
//!     .with_channels(2)
//!     .with_block_frames(512)
//!     .with_max_sources(64);
//! assert!(config.validate().is_ok());
//! ```

use core::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{MixerError, MixerResult};

/// Largest channel count any buffer in the graph can carry (7.1)
pub const MAX_CHANNELS: usize = 8;

/// Switches for individual pipeline stages.
///
/// Everything is enabled by default. Disabling a stage replaces it with a
/// pass-through, which is useful when profiling or bisecting a glitch.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProcessingToggles {
    pub filtering: bool,
    pub high_pass_filtering: bool,
    pub envelope_following: bool,
    pub source_effects: bool,
    pub distance_attenuation: bool,
    pub plugins: bool,
}

impl Default for ProcessingToggles {
    fn default() -> Self {
        Self {
            filtering: true,
            high_pass_filtering: true,
            envelope_following: true,
            source_effects: true,
            distance_attenuation: true,
            plugins: true,
        }
    }
}

/// Static configuration of a [`Mixer`](crate::Mixer)
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MixerConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Frames rendered per block (the "callback size" of the graph)
    pub block_frames: usize,
    /// Number of device output channels
    pub device_channels: usize,
    /// Size of the source slot pool
    pub max_sources: usize,
    /// Submixes (including master) the tree preallocates room for
    pub max_submixes: usize,
    /// Worker threads used to render sources. 0 renders on the calling thread.
    pub source_workers: usize,
    /// Capacity of the render → control event ring
    pub event_capacity: usize,
    /// How long [`MixerHandle::flush`](crate::MixerHandle::flush) waits for the render thread
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub flush_timeout: Duration,
    /// The spatialization plugin sends its output elsewhere, sources stay mono
    pub spatialization_is_external_send: bool,
    /// The reverb plugin sends its output elsewhere, nothing is mixed back in
    pub reverb_is_external_send: bool,
    pub toggles: ProcessingToggles,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_frames: 512,
            device_channels: 2,
            max_sources: 32,
            max_submixes: 64,
            source_workers: 0,
            event_capacity: 1024,
            flush_timeout: Duration::from_millis(500),
            spatialization_is_external_send: false,
            reverb_is_external_send: false,
            toggles: ProcessingToggles::default(),
        }
    }
}

impl MixerConfig {
    /// Default configuration at the given sample rate
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    /// Set the number of device output channels (builder pattern)
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.device_channels = channels;
        self
    }

    /// Set the number of frames per block (builder pattern)
    pub fn with_block_frames(mut self, frames: usize) -> Self {
        self.block_frames = frames;
        self
    }

    /// Set the size of the source pool (builder pattern)
    pub fn with_max_sources(mut self, sources: usize) -> Self {
        self.max_sources = sources;
        self
    }

    /// Render sources on `workers` threads (builder pattern)
    pub fn with_source_workers(mut self, workers: usize) -> Self {
        self.source_workers = workers;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_toggles(mut self, toggles: ProcessingToggles) -> Self {
        self.toggles = toggles;
        self
    }

    /// Duration of one block in seconds
    #[inline]
    pub fn block_duration_secs(&self) -> f64 {
        self.block_frames as f64 / self.sample_rate as f64
    }

    /// Check that every value is usable
    pub fn validate(&self) -> MixerResult<()> {
        if self.sample_rate == 0 {
            return Err(MixerError::InvalidConfig("sample rate must be non-zero".into()));
        }
        if self.block_frames == 0 {
            return Err(MixerError::InvalidConfig("block size must be non-zero".into()));
        }
        if self.max_sources == 0 {
            return Err(MixerError::InvalidConfig("source pool must hold at least one source".into()));
        }
        if self.max_submixes == 0 {
            return Err(MixerError::InvalidConfig("submix tree needs room for the master".into()));
        }
        if self.event_capacity == 0 {
            return Err(MixerError::InvalidConfig("event ring needs capacity".into()));
        }
        if self.device_channels == 0 || self.device_channels > MAX_CHANNELS {
            return Err(MixerError::InvalidChannelCount {
                channels: self.device_channels,
                max: MAX_CHANNELS,
            });
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
mod duration_millis {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

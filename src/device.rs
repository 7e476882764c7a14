//! CPAL device discovery.
//!
//! [`CpalDevice`] finds an output device and opens a [`CpalOutput`] on it,
//! which runs a [`MixerRenderer`] from the device callback.
//!
//! # Example: play through the default device
//!
//! ```no_run
//! # #[cfg(feature = "cpal_sink")]
//! # fn main() {
//! use mischpult::{CpalDevice, Mixer};
//!
//! let device = CpalDevice::default_output().unwrap();
//! let mixer = Mixer::new(device.mixer_config()).unwrap();
//! let (mut handle, renderer) = mixer.split();
//! let output = device.open(renderer).unwrap();
//!
//! // ... acquire and play sources through `handle`, call `handle.update()` regularly
//! # let _ = (&mut handle, output);
//! # }
//! # #[cfg(not(feature = "cpal_sink"))]
//! # fn main() {}
//! ```
//!
//! [`CpalOutput`]: crate::sink::CpalOutput
//! [`MixerRenderer`]: crate::MixerRenderer

#[cfg(feature = "cpal_sink")]
use cpal::traits::{DeviceTrait, HostTrait};

use crate::config::MixerConfig;

/// A discovered audio output device.
///
/// Use [`CpalDevice::default_output`] to get the system default, or
/// [`CpalDevice::list_outputs`] to enumerate all available devices.
pub struct CpalDevice {
    #[cfg(feature = "cpal_sink")]
    device: cpal::Device,
    #[cfg(feature = "cpal_sink")]
    config: cpal::SupportedStreamConfig,

    name: String,
    sample_rate: u32,
    channels: u16,
}

impl CpalDevice {
    /// Get the system's default output device.
    ///
    /// Returns `None` if no audio device is available.
    #[cfg(feature = "cpal_sink")]
    pub fn default_output() -> Option<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device()?;
        Self::from_device(device)
    }

    #[cfg(not(feature = "cpal_sink"))]
    pub fn default_output() -> Option<Self> {
        None
    }

    /// List all available audio output devices.
    ///
    /// Returns an empty list if no devices are found or if enumeration fails.
    #[cfg(feature = "cpal_sink")]
    pub fn list_outputs() -> Vec<Self> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| devices.filter_map(Self::from_device).collect())
            .unwrap_or_default()
    }

    #[cfg(not(feature = "cpal_sink"))]
    pub fn list_outputs() -> Vec<Self> {
        Vec::new()
    }

    #[cfg(feature = "cpal_sink")]
    fn from_device(device: cpal::Device) -> Option<Self> {
        let config = device.default_output_config().ok()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Some(Self {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            name,
            device,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device's sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// A mixer configuration matching this device
    pub fn mixer_config(&self) -> MixerConfig {
        MixerConfig::new(self.sample_rate).with_channels(self.channels as usize)
    }

    /// Start an output stream on this device, rendered by `renderer`
    #[cfg(feature = "cpal_sink")]
    pub fn open(&self, renderer: crate::MixerRenderer) -> crate::MixerResult<crate::sink::CpalOutput> {
        crate::sink::CpalOutput::new(&self.device, &self.config, renderer)
    }
}

//! Mischpult - real-time audio mixing graph
//!
//! Design principles:
//! - The render thread never locks, allocates or frees; the control thread
//!   prepares everything and ships it over lock-free rings
//! - All mutation is a queued command, executed at the start of a block
//! - Sources live in a fixed pool, addressed by generation-checked handles
//! - Buses are double-buffered, so they may feed each other in any order
//! - Submixes form a tree that converts between channel layouts and
//!   soundfield formats on the way up to the device
//!
//! # Example
//!
//! ```
//! use mischpult::decoder::BufferDecoder;
//! use mischpult::format::ChannelFormat;
//! use mischpult::source::SourceInitParams;
//! use mischpult::submix::SubmixSettings;
//! use mischpult::{Mixer, MixerConfig};
//!
//! let mut mixer = Mixer::new(MixerConfig::new(48_000)).unwrap();
//! let music = mixer.register_submix(SubmixSettings::new(ChannelFormat::Stereo)).unwrap();
//!
//! let source = mixer.acquire_source().unwrap();
//! let samples = vec![0.25; 48_000 * 2];
//! let params = SourceInitParams::new(BufferDecoder::new(samples, 2), 48_000).with_submix_send(music, 1.0);
//! mixer.init_source(source, params).unwrap();
//! mixer.play(source).unwrap();
//! mixer.update();
//!
//! let (mut handle, mut renderer) = mixer.split();
//! let mut out = vec![0.0; 1024];
//! renderer.render(&mut out);
//! assert!((out[1000] - 0.25).abs() < 1e-6);
//! handle.release_source(source);
//! ```

pub mod bus;
pub mod command;
pub mod config;
pub mod decoder;
pub mod device;
pub mod dsp;
pub mod effect;
pub mod error;
pub mod format;
mod garbage;
pub mod mixer;
pub mod plugin;
#[cfg(feature = "cpal_sink")]
pub mod sink;
pub mod source;
pub mod source_manager;
pub mod submix;

pub use config::{MixerConfig, ProcessingToggles, MAX_CHANNELS};
pub use device::CpalDevice;
pub use error::{MixerError, MixerResult};
pub use mixer::{Mixer, MixerHandle, MixerRenderer};
pub use source::{BusId, SourceHandle};
pub use source_manager::MixerEvent;
pub use submix::SubmixId;

#[cfg(feature = "cpal_sink")]
pub use sink::CpalOutput;

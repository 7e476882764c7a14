//! Platform outputs that drive a [`MixerRenderer`](crate::MixerRenderer)

mod cpal_output;

pub use cpal_output::CpalOutput;

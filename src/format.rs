//! Channel formats, speaker layouts, gain matrices and soundfield codecs.
//!
//! Every submix renders in one [`ChannelFormat`]. Channel-based formats are
//! converted to each other with a gain matrix built by [`fill_channel_map`];
//! soundfield formats go through a [`SoundfieldCodec`].
//!
//! Gain matrices are laid out `map[input_channel * output_channels + output_channel]`.

use core::f32::consts::{FRAC_1_SQRT_2, SQRT_2};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::MAX_CHANNELS;

/// Channels carried by a first-order ambisonics stream (W, X, Y, Z)
pub const AMBISONICS_CHANNELS: usize = 4;

/// Output format of a submix, or the format a source renders for a submix send
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChannelFormat {
    /// Whatever the output device currently uses
    #[default]
    Device,
    Mono,
    Stereo,
    Quad,
    FiveDotOne,
    SevenDotOne,
    /// First-order ambisonics soundfield
    Ambisonics,
}

impl ChannelFormat {
    pub const ALL: [ChannelFormat; 7] = [
        ChannelFormat::Device,
        ChannelFormat::Mono,
        ChannelFormat::Stereo,
        ChannelFormat::Quad,
        ChannelFormat::FiveDotOne,
        ChannelFormat::SevenDotOne,
        ChannelFormat::Ambisonics,
    ];

    /// Dense index, used for per-format storage on source slots
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            ChannelFormat::Device => 0,
            ChannelFormat::Mono => 1,
            ChannelFormat::Stereo => 2,
            ChannelFormat::Quad => 3,
            ChannelFormat::FiveDotOne => 4,
            ChannelFormat::SevenDotOne => 5,
            ChannelFormat::Ambisonics => 6,
        }
    }

    /// Number of channels of this format given the device's channel count
    #[inline]
    pub const fn channels(self, device_channels: usize) -> usize {
        match self {
            ChannelFormat::Device => device_channels,
            ChannelFormat::Mono => 1,
            ChannelFormat::Stereo => 2,
            ChannelFormat::Quad => 4,
            ChannelFormat::FiveDotOne => 6,
            ChannelFormat::SevenDotOne => 8,
            ChannelFormat::Ambisonics => AMBISONICS_CHANNELS,
        }
    }

    #[inline]
    pub const fn is_soundfield(self) -> bool {
        matches!(self, ChannelFormat::Ambisonics)
    }
}

/// Loudspeaker positions known to the gain matrix builder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Speaker {
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    SideLeft,
    SideRight,
}

impl Speaker {
    /// Azimuth in radians, counter-clockwise from straight ahead (left is positive)
    pub fn azimuth(self) -> f32 {
        let degrees: f32 = match self {
            Speaker::FrontLeft => 30.0,
            Speaker::FrontRight => -30.0,
            Speaker::FrontCenter | Speaker::LowFrequency => 0.0,
            Speaker::SideLeft => 110.0,
            Speaker::SideRight => -110.0,
            Speaker::BackLeft => 150.0,
            Speaker::BackRight => -150.0,
        };
        degrees.to_radians()
    }

    #[inline]
    fn is_left(self) -> bool {
        matches!(self, Speaker::FrontLeft | Speaker::SideLeft | Speaker::BackLeft)
    }

    #[inline]
    fn is_right(self) -> bool {
        matches!(self, Speaker::FrontRight | Speaker::SideRight | Speaker::BackRight)
    }
}

use Speaker::*;

/// Speaker order for an interleaved buffer with `channels` channels
pub fn speakers(channels: usize) -> &'static [Speaker] {
    match channels {
        1 => &[FrontCenter],
        2 => &[FrontLeft, FrontRight],
        3 => &[FrontLeft, FrontRight, FrontCenter],
        4 => &[FrontLeft, FrontRight, SideLeft, SideRight],
        5 => &[FrontLeft, FrontRight, FrontCenter, SideLeft, SideRight],
        6 => &[FrontLeft, FrontRight, FrontCenter, LowFrequency, SideLeft, SideRight],
        7 => &[FrontLeft, FrontRight, FrontCenter, LowFrequency, SideLeft, SideRight, BackLeft],
        _ => &[
            FrontLeft,
            FrontRight,
            FrontCenter,
            LowFrequency,
            BackLeft,
            BackRight,
            SideLeft,
            SideRight,
        ],
    }
}

/// Gain of `input` speaker routed into `output` speaker when the output
/// layout is `outputs`
fn speaker_gain(input: Speaker, output: Speaker, outputs: &[Speaker]) -> f32 {
    if input == output {
        return 1.0;
    }
    if outputs.contains(&input) {
        return 0.0;
    }

    match input {
        LowFrequency => 0.0,
        FrontCenter => {
            if matches!(output, FrontLeft | FrontRight) {
                FRAC_1_SQRT_2
            } else {
                0.0
            }
        }
        _ if outputs == [FrontCenter] => FRAC_1_SQRT_2,
        SideLeft | BackLeft if matches!(output, SideLeft | BackLeft) => 1.0,
        SideRight | BackRight if matches!(output, SideRight | BackRight) => 1.0,
        SideLeft | BackLeft | SideRight | BackRight => {
            let has_surround = outputs.iter().any(|s| matches!(s, SideLeft | SideRight | BackLeft | BackRight));
            let same_side = (input.is_left() && output.is_left()) || (input.is_right() && output.is_right());
            if !has_surround && same_side && matches!(output, FrontLeft | FrontRight) {
                FRAC_1_SQRT_2
            } else {
                0.0
            }
        }
        FrontLeft | FrontRight => 0.0,
    }
}

/// Build the gain matrix converting `in_channels` into `out_channels`.
///
/// Writes `in_channels * out_channels` coefficients into `map` and returns
/// that count. With `center_only`, mono input goes to the center speaker
/// alone when the output has one.
///
/// Notable coefficients: mono into stereo is 1/√2 per side, stereo into mono
/// is 1/√2 per side (so mono → stereo → mono is unity), center into a layout
/// without a center is 1/√2 per front side, and LFE is dropped when the
/// output has no LFE channel.
pub fn fill_channel_map(in_channels: usize, out_channels: usize, center_only: bool, map: &mut [f32]) -> usize {
    let in_channels = in_channels.clamp(1, MAX_CHANNELS);
    let out_channels = out_channels.clamp(1, MAX_CHANNELS);
    let len = in_channels * out_channels;
    let map = &mut map[..len];
    map.iter_mut().for_each(|g| *g = 0.0);

    if in_channels == out_channels {
        for ch in 0..in_channels {
            map[ch * out_channels + ch] = 1.0;
        }
        return len;
    }

    let outputs = speakers(out_channels);

    if in_channels == 1 {
        let center = outputs.iter().position(|s| *s == FrontCenter);
        match center {
            Some(c) if center_only => map[c] = 1.0,
            _ => {
                for (out_ch, speaker) in outputs.iter().enumerate() {
                    if matches!(speaker, FrontLeft | FrontRight) {
                        map[out_ch] = FRAC_1_SQRT_2;
                    }
                }
            }
        }
        return len;
    }

    for (in_ch, input) in speakers(in_channels).iter().enumerate() {
        for (out_ch, output) in outputs.iter().enumerate() {
            map[in_ch * out_channels + out_ch] = speaker_gain(*input, *output, outputs);
        }
    }
    len
}

/// An explicit gain matrix supplied by the caller (usually a spatializer)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelMap {
    gains: [f32; MAX_CHANNELS * MAX_CHANNELS],
    len: usize,
}

impl ChannelMap {
    /// Copy `gains` into a map; `None` if it has more than 64 coefficients
    pub fn new(gains: &[f32]) -> Option<Self> {
        if gains.len() > MAX_CHANNELS * MAX_CHANNELS {
            return None;
        }
        let mut map = Self {
            gains: [0.0; MAX_CHANNELS * MAX_CHANNELS],
            len: gains.len(),
        };
        map.gains[..gains.len()].copy_from_slice(gains);
        Some(map)
    }

    /// The matrix [`fill_channel_map`] would build
    pub fn default_for(in_channels: usize, out_channels: usize, center_only: bool) -> Self {
        let mut gains = [0.0; MAX_CHANNELS * MAX_CHANNELS];
        let len = fill_channel_map(in_channels, out_channels, center_only, &mut gains);
        Self { gains, len }
    }

    /// An all-zero matrix of the given shape
    pub fn silent(in_channels: usize, out_channels: usize) -> Self {
        Self {
            gains: [0.0; MAX_CHANNELS * MAX_CHANNELS],
            len: (in_channels * out_channels).min(MAX_CHANNELS * MAX_CHANNELS),
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.gains[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Encodes channel audio into a soundfield and decodes it back
pub trait SoundfieldCodec: Send {
    /// Channels of the soundfield representation
    fn soundfield_channels(&self) -> usize {
        AMBISONICS_CHANNELS
    }

    /// Encode a mono signal arriving from the given direction, adding into `output`
    fn encode_point(&mut self, input: &[f32], azimuth: f32, elevation: f32, output: &mut [f32]);

    /// Encode a channel-based buffer, placing each channel at its speaker position.
    ///
    /// `output` is overwritten.
    fn encode(&mut self, input: &[f32], in_channels: usize, output: &mut [f32]);

    /// Decode the soundfield into `out_channels` speakers, overwriting `output`
    fn decode(&mut self, input: &[f32], output: &mut [f32], out_channels: usize);

    /// Convert between two soundfields of the same kind, overwriting `output`
    fn transcode(&mut self, input: &[f32], output: &mut [f32]) {
        let len = input.len().min(output.len());
        output[..len].copy_from_slice(&input[..len]);
    }
}

/// Default codec: first-order ambisonics, FuMa-style W weighting
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstOrderAmbisonics;

impl FirstOrderAmbisonics {
    #[inline]
    fn coefficients(azimuth: f32, elevation: f32) -> [f32; AMBISONICS_CHANNELS] {
        let (sin_az, cos_az) = azimuth.sin_cos();
        let (sin_el, cos_el) = elevation.sin_cos();
        [FRAC_1_SQRT_2, cos_az * cos_el, sin_az * cos_el, sin_el]
    }
}

impl SoundfieldCodec for FirstOrderAmbisonics {
    fn encode_point(&mut self, input: &[f32], azimuth: f32, elevation: f32, output: &mut [f32]) {
        let coeffs = Self::coefficients(azimuth, elevation);
        for (s, frame) in input.iter().zip(output.chunks_exact_mut(AMBISONICS_CHANNELS)) {
            for (o, c) in frame.iter_mut().zip(coeffs.iter()) {
                *o += s * c;
            }
        }
    }

    fn encode(&mut self, input: &[f32], in_channels: usize, output: &mut [f32]) {
        let in_channels = in_channels.max(1);
        let layout = speakers(in_channels);
        let mut coeffs = [[0.0; AMBISONICS_CHANNELS]; MAX_CHANNELS];
        for (c, speaker) in coeffs.iter_mut().zip(layout.iter()) {
            if *speaker != LowFrequency {
                *c = Self::coefficients(speaker.azimuth(), 0.0);
            }
        }

        for (src, dst) in input
            .chunks_exact(in_channels)
            .zip(output.chunks_exact_mut(AMBISONICS_CHANNELS))
        {
            dst.iter_mut().for_each(|d| *d = 0.0);
            for (s, c) in src.iter().zip(coeffs.iter()) {
                for (d, c) in dst.iter_mut().zip(c.iter()) {
                    *d += s * c;
                }
            }
        }
    }

    fn decode(&mut self, input: &[f32], output: &mut [f32], out_channels: usize) {
        let out_channels = out_channels.max(1);
        let layout = speakers(out_channels);

        for (src, dst) in input
            .chunks_exact(AMBISONICS_CHANNELS)
            .zip(output.chunks_exact_mut(out_channels))
        {
            let omni = src[0] * SQRT_2;
            if out_channels == 1 {
                dst[0] = omni;
                continue;
            }
            for (d, speaker) in dst.iter_mut().zip(layout.iter()) {
                *d = if *speaker == LowFrequency {
                    0.0
                } else {
                    let (sin_az, cos_az) = speaker.azimuth().sin_cos();
                    0.5 * (omni + src[1] * cos_az + src[2] * sin_az)
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(in_ch: usize, out_ch: usize) -> Vec<f32> {
        let mut m = [0.0; MAX_CHANNELS * MAX_CHANNELS];
        let len = fill_channel_map(in_ch, out_ch, false, &mut m);
        m[..len].to_vec()
    }

    #[test]
    fn mono_stereo_mono_is_identity() {
        let up = map(1, 2);
        let down = map(2, 1);
        assert_eq!(up, [FRAC_1_SQRT_2, FRAC_1_SQRT_2]);
        let round_trip: f32 = (0..2).map(|ch| up[ch] * down[ch]).sum();
        assert!((round_trip - 1.0).abs() < 1e-6);
    }

    #[test]
    fn center_folds_into_front_pair_and_lfe_is_dropped() {
        let m = map(6, 2);
        // rows: FL FR C LFE SL SR
        assert_eq!(&m[0..2], &[1.0, 0.0]);
        assert_eq!(&m[2..4], &[0.0, 1.0]);
        assert_eq!(&m[4..6], &[FRAC_1_SQRT_2, FRAC_1_SQRT_2]);
        assert_eq!(&m[6..8], &[0.0, 0.0]);
        assert_eq!(&m[8..10], &[FRAC_1_SQRT_2, 0.0]);
        assert_eq!(&m[10..12], &[0.0, FRAC_1_SQRT_2]);
    }

    #[test]
    fn center_only_mono() {
        let mut m = [0.0; MAX_CHANNELS * MAX_CHANNELS];
        let len = fill_channel_map(1, 6, true, &mut m);
        assert_eq!(&m[..len], &[0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn ambisonics_round_trip_at_speaker_position() {
        let mut codec = FirstOrderAmbisonics;
        let mut field = [0.0; AMBISONICS_CHANNELS];
        codec.encode_point(&[1.0], Speaker::FrontLeft.azimuth(), 0.0, &mut field);

        let mut out = [0.0; 2];
        codec.decode(&field, &mut out, 2);
        assert!((out[0] - 1.0).abs() < 1e-5, "{out:?}");
        assert!(out[1] < out[0]);
    }

    #[test]
    fn ambisonics_mono_decode_is_omni() {
        let mut codec = FirstOrderAmbisonics;
        let mut field = [0.0; AMBISONICS_CHANNELS];
        codec.encode(&[0.5, 0.5], 2, &mut field);
        let mut out = [0.0];
        codec.decode(&field, &mut out, 1);
        assert!((out[0] - 1.0).abs() < 1e-5);
    }
}

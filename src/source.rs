//! Source slots and their per-block render pipeline.
//!
//! A [`SourceHandle`] names one slot of the fixed-size pool. Slots are owned by
//! the render thread; the control thread only ever reaches them through
//! commands. Every block, a playing slot runs:
//!
//! 1. resample its decoder (or copy its bus's previous block)
//! 2. snapshot for pre-effect bus sends
//! 3. volume ramp, or the stop fade
//! 4. source effects, envelope follower, snapshot for post-effect bus sends
//! 5. low-pass then high-pass filter
//! 6. distance attenuation
//! 7. reverb, occlusion and spatialization plugin voices
//! 8. one output buffer per format its submix sends need
//!
//! Slots flagged output-to-bus-only stop after step 4.

use core::mem;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::bus::BusStore;
use crate::config::{ProcessingToggles, MAX_CHANNELS};
use crate::decoder::SourceDecoder;
use crate::dsp::buffer::{apply_gain_ramp, average_amplitude, mix_converted, mix_in, silence};
use crate::dsp::{
    ChannelMapRamp, EnvelopeFollower, OnePoleHighPass, OnePoleLowPass, Ramp, ENVELOPE_TAIL_THRESHOLD,
    MAX_FILTER_FREQUENCY, MIN_FILTER_FREQUENCY,
};
use crate::effect::{process_chain, Effect, EffectContext, SourceEffectSlot};
use crate::format::{ChannelFormat, ChannelMap, FirstOrderAmbisonics, SoundfieldCodec};
use crate::garbage::{Garbage, GarbageSender};
use crate::plugin::{PluginInput, PluginRequest, PluginState, SourceVoices, SpatializationParams};
use crate::submix::SubmixId;

/// Most submixes a single source can send to
pub const MAX_SUBMIX_SENDS: usize = 16;

pub const MIN_PITCH: f32 = 0.01;
pub const MAX_PITCH: f32 = 8.0;

const FORMAT_COUNT: usize = ChannelFormat::ALL.len();

pub(crate) const EVENT_DONE: u8 = 1;
pub(crate) const EVENT_TAILS_DONE: u8 = 1 << 1;
pub(crate) const EVENT_NEEDS_SPEAKER_MAP: u8 = 1 << 2;

/// Generation-checked reference to a source slot.
///
/// The index is reused after release; the generation is bumped every time,
/// so a handle held past its release is detected instead of silently
/// steering a different sound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    index: u32,
    generation: u32,
}

impl SourceHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Externally chosen identifier of a [`MixerBus`](crate::bus::MixerBus)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BusId(pub u32);

/// Render-side state of a slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PlayState {
    /// Free, or acquired but not yet initialized
    #[default]
    Uninitialized,
    /// Initialized, waiting for `play`
    Initialized,
    Playing,
    Paused,
    /// Fading out (or silenced) on its way to `Done`
    Stopping,
    /// Finished; waiting for release
    Done,
}

impl PlayState {
    /// States in which the slot renders audio
    #[inline]
    pub fn is_audible(self) -> bool {
        matches!(self, PlayState::Playing | PlayState::Stopping)
    }

    #[inline]
    pub fn is_initialized(self) -> bool {
        !matches!(self, PlayState::Uninitialized)
    }
}

/// Which buffer a bus send taps
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BusSendStage {
    /// Straight out of the decoder, before volume and effects
    PreEffect,
    /// After volume and the source effect chain
    PostEffect,
}

/// A source feeding a bus
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BusSend {
    pub bus: BusId,
    pub level: f32,
    pub stage: BusSendStage,
    /// Channel count used if this send creates the bus
    pub channels: usize,
}

impl BusSend {
    pub fn post_effect(bus: BusId, level: f32) -> Self {
        Self {
            bus,
            level,
            stage: BusSendStage::PostEffect,
            channels: 2,
        }
    }

    pub fn pre_effect(bus: BusId, level: f32) -> Self {
        Self {
            bus,
            level,
            stage: BusSendStage::PreEffect,
            channels: 2,
        }
    }

    /// Channel count of the bus if it does not exist yet (builder pattern)
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels.clamp(1, MAX_CHANNELS);
        self
    }
}

/// A source feeding a submix
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubmixSend {
    pub submix: SubmixId,
    pub level: f32,
}

/// Everything needed to start a source.
///
/// # Example
///
/// ```
/// use mischpult::decoder::BufferDecoder;
/// use mischpult::source::{BusId, BusSend, SourceInitParams};
///
/// let params = SourceInitParams::new(BufferDecoder::new(vec![0.0; 4800], 1), 48_000)
///     .with_bus_send(BusSend::post_effect(BusId(7), 0.5))
///     .with_envelope_times(10.0, 100.0);
/// assert_eq!(params.channels(), 1);
/// ```
pub struct SourceInitParams {
    pub(crate) decoder: Option<Box<dyn SourceDecoder>>,
    pub(crate) channels: usize,
    pub(crate) sample_rate: u32,
    pub(crate) submix_sends: Vec<SubmixSend>,
    pub(crate) bus_sends: Vec<BusSend>,
    pub(crate) bus_id: Option<BusId>,
    pub(crate) bus_duration_secs: Option<f32>,
    pub(crate) effects: Vec<SourceEffectSlot>,
    pub(crate) effect_chain_id: Option<u32>,
    pub(crate) play_effect_tails: bool,
    pub(crate) output_to_bus_only: bool,
    pub(crate) is_procedural: bool,
    pub(crate) is_3d: bool,
    pub(crate) center_only: bool,
    pub(crate) envelope_attack_ms: f32,
    pub(crate) envelope_release_ms: f32,
    pub(crate) spatialization: PluginRequest,
    pub(crate) occlusion: PluginRequest,
    pub(crate) reverb: PluginRequest,
}

impl SourceInitParams {
    /// A source playing `decoder`, recorded at `sample_rate`
    pub fn new<D: SourceDecoder + 'static>(decoder: D, sample_rate: u32) -> Self {
        let channels = decoder.channels();
        Self::with_decoder(Some(Box::new(decoder)), channels, sample_rate)
    }

    /// A bus source: plays whatever is sent to `bus`, one block late
    pub fn from_bus(bus: BusId, channels: usize) -> Self {
        let mut params = Self::with_decoder(None, channels, 0);
        params.bus_id = Some(bus);
        params
    }

    fn with_decoder(decoder: Option<Box<dyn SourceDecoder>>, channels: usize, sample_rate: u32) -> Self {
        Self {
            decoder,
            channels,
            sample_rate,
            submix_sends: Vec::new(),
            bus_sends: Vec::new(),
            bus_id: None,
            bus_duration_secs: None,
            effects: Vec::new(),
            effect_chain_id: None,
            play_effect_tails: false,
            output_to_bus_only: false,
            is_procedural: false,
            is_3d: false,
            center_only: false,
            envelope_attack_ms: 10.0,
            envelope_release_ms: 100.0,
            spatialization: PluginRequest::default(),
            occlusion: PluginRequest::default(),
            reverb: PluginRequest::default(),
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Stop a bus source after this many seconds (builder pattern)
    pub fn with_bus_duration(mut self, secs: f32) -> Self {
        self.bus_duration_secs = Some(secs.max(0.0));
        self
    }

    pub fn with_submix_send(mut self, submix: SubmixId, level: f32) -> Self {
        self.submix_sends.push(SubmixSend { submix, level });
        self
    }

    pub fn with_bus_send(mut self, send: BusSend) -> Self {
        self.bus_sends.push(send);
        self
    }

    /// Append an effect to the source's chain
    pub fn with_effect<E: Effect + 'static>(mut self, effect: E) -> Self {
        self.effects.push(SourceEffectSlot::new(effect));
        self
    }

    /// Use a shared effect chain, later replaceable with
    /// [`MixerHandle::update_source_effect_chain`](crate::MixerHandle::update_source_effect_chain)
    pub fn with_effect_chain(mut self, chain_id: u32, effects: Vec<SourceEffectSlot>, play_tails: bool) -> Self {
        self.effect_chain_id = Some(chain_id);
        self.effects = effects;
        self.play_effect_tails = play_tails;
        self
    }

    /// Keep rendering effects after the decoder ends until they decay (builder pattern)
    pub fn with_effect_tails(mut self, play_tails: bool) -> Self {
        self.play_effect_tails = play_tails;
        self
    }

    /// Only feed buses; skip filters, plugins and submix output
    pub fn output_to_bus_only(mut self) -> Self {
        self.output_to_bus_only = true;
        self
    }

    /// Generated on the fly; stop fades are not honored
    pub fn procedural(mut self) -> Self {
        self.is_procedural = true;
        self
    }

    /// Positioned in 3D; channel maps come from the caller
    pub fn with_3d(mut self, is_3d: bool) -> Self {
        self.is_3d = is_3d;
        self
    }

    /// Route mono to the center speaker only, where there is one
    pub fn with_center_channel_only(mut self, center_only: bool) -> Self {
        self.center_only = center_only;
        self
    }

    pub fn with_envelope_times(mut self, attack_ms: f32, release_ms: f32) -> Self {
        self.envelope_attack_ms = attack_ms;
        self.envelope_release_ms = release_ms;
        self
    }

    pub fn with_spatialization(mut self, request: PluginRequest) -> Self {
        self.spatialization = request;
        self
    }

    pub fn with_occlusion(mut self, request: PluginRequest) -> Self {
        self.occlusion = request;
        self
    }

    pub fn with_reverb(mut self, request: PluginRequest) -> Self {
        self.reverb = request;
        self
    }
}

/// A submix send as stored on the render side, format already resolved
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SlotSubmixSend {
    pub submix: SubmixId,
    pub level: f32,
    pub format: ChannelFormat,
}

/// Render-side form of [`SourceInitParams`], assembled on the control thread
pub(crate) struct SlotInit {
    pub handle: SourceHandle,
    pub decoder: Option<Box<dyn SourceDecoder>>,
    pub channels: usize,
    pub out_channels: usize,
    pub sample_rate: u32,
    pub submix_sends: Vec<SlotSubmixSend>,
    pub bus_id: Option<BusId>,
    pub bus_duration_secs: Option<f32>,
    pub effects: Vec<SourceEffectSlot>,
    pub effect_chain_id: Option<u32>,
    pub play_effect_tails: bool,
    pub output_to_bus_only: bool,
    pub is_procedural: bool,
    pub is_3d: bool,
    pub center_only: bool,
    pub envelope_attack_ms: f32,
    pub envelope_release_ms: f32,
    pub voices: SourceVoices,
    pub format_buffers: [Option<Vec<f32>>; FORMAT_COUNT],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MapKind {
    Default,
    Explicit,
    Silent,
}

/// Output of a slot for one channel format
pub(crate) struct FormatOutput {
    pub buffer: Vec<f32>,
    pub channels: usize,
    map: ChannelMapRamp,
    map_shape: (usize, usize),
    kind: MapKind,
}

impl FormatOutput {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            channels: 0,
            map: ChannelMapRamp::new(),
            map_shape: (0, 0),
            kind: MapKind::Default,
        }
    }

    fn reset(&mut self) {
        self.map.reset();
        self.map_shape = (0, 0);
        self.kind = MapKind::Default;
    }

    /// Make sure the map matches `in_ch → out_ch`.
    ///
    /// Returns `true` when an explicit map had to be dropped.
    fn prepare(&mut self, in_ch: usize, out_ch: usize, is_3d: bool, center_only: bool) -> bool {
        if self.map_shape == (in_ch, out_ch) {
            return false;
        }
        let dropped = self.kind == MapKind::Explicit;
        let map = if is_3d && self.kind != MapKind::Default {
            self.kind = MapKind::Silent;
            ChannelMap::silent(in_ch, out_ch)
        } else {
            self.kind = MapKind::Default;
            ChannelMap::default_for(in_ch, out_ch, center_only)
        };
        self.map.set_target(map.as_slice());
        self.map_shape = (in_ch, out_ch);
        dropped
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fetch {
    Ready,
    Starved,
    Finished,
}

/// Per-block constants shared by every slot
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockContext {
    pub frames: usize,
    pub sample_rate: u32,
    pub device_channels: usize,
    pub toggles: ProcessingToggles,
    pub spatialization_is_external_send: bool,
    pub reverb_is_external_send: bool,
    pub spatialization_channels: usize,
}

/// One voice of the pool, owned by the render thread
pub(crate) struct SourceSlot {
    pub handle: SourceHandle,
    pub state: PlayState,
    decoder: Option<Box<dyn SourceDecoder>>,
    /// Channels out of the decoder (or bus)
    pub channels: usize,
    /// Channels after plugins
    pub out_channels: usize,
    rate_ratio: f32,
    block_rate: f32,

    // resampler
    alpha: f32,
    current: [f32; MAX_CHANNELS],
    next: [f32; MAX_CHANNELS],
    chunk: Vec<f32>,
    chunk_frames: usize,
    chunk_cursor: usize,
    end_pending: bool,

    pitch: Ramp,
    volume: Ramp,
    distance_attenuation: Ramp,
    lpf_frequency: Ramp,
    hpf_frequency: Ramp,
    lpf: OnePoleLowPass,
    hpf: OnePoleHighPass,
    lpf_bypassed: bool,
    hpf_bypassed: bool,
    pub spatialization: SpatializationParams,

    effects: Vec<SourceEffectSlot>,
    pub effect_chain_id: Option<u32>,
    play_effect_tails: bool,
    envelope: EnvelopeFollower,
    pub tails_done: bool,

    fade_total: usize,
    fade_remaining: usize,

    pub bus_id: Option<BusId>,
    bus_duration_frames: Option<u64>,
    bus_frames_emitted: u64,
    pub pre_effect_sends: usize,
    pub post_effect_sends: usize,
    pub submix_sends: Vec<SlotSubmixSend>,
    pub output_to_bus_only: bool,
    is_procedural: bool,
    pub is_3d: bool,
    center_only: bool,
    pub needs_speaker_map: bool,

    pub is_last_buffer: bool,
    pub frames_played: u64,
    pub events: u8,

    source: Vec<f32>,
    pre_effect: Vec<f32>,
    post_effect: Vec<f32>,
    scratch: Vec<f32>,
    outputs: [FormatOutput; FORMAT_COUNT],
    codec: FirstOrderAmbisonics,
    voices: SourceVoices,
}

impl SourceSlot {
    pub fn new(index: u32, block_frames: usize, sample_rate: u32) -> Self {
        let len = block_frames * MAX_CHANNELS;
        Self {
            handle: SourceHandle::new(index, 0),
            state: PlayState::Uninitialized,
            decoder: None,
            channels: 1,
            out_channels: 1,
            rate_ratio: 1.0,
            block_rate: sample_rate as f32 / block_frames.max(1) as f32,
            alpha: 2.0,
            current: [0.0; MAX_CHANNELS],
            next: [0.0; MAX_CHANNELS],
            chunk: vec![0.0; len],
            chunk_frames: 0,
            chunk_cursor: 0,
            end_pending: false,
            pitch: Ramp::unset(1.0),
            volume: Ramp::unset(1.0),
            distance_attenuation: Ramp::unset(1.0),
            lpf_frequency: Ramp::unset(MAX_FILTER_FREQUENCY),
            hpf_frequency: Ramp::unset(MIN_FILTER_FREQUENCY),
            lpf: OnePoleLowPass::new(sample_rate as f32),
            hpf: OnePoleHighPass::new(sample_rate as f32),
            lpf_bypassed: true,
            hpf_bypassed: true,
            spatialization: SpatializationParams::default(),
            effects: Vec::new(),
            effect_chain_id: None,
            play_effect_tails: false,
            envelope: EnvelopeFollower::new(1.0, 0.0, 0.0),
            tails_done: false,
            fade_total: 0,
            fade_remaining: 0,
            bus_id: None,
            bus_duration_frames: None,
            bus_frames_emitted: 0,
            pre_effect_sends: 0,
            post_effect_sends: 0,
            submix_sends: Vec::with_capacity(MAX_SUBMIX_SENDS),
            output_to_bus_only: false,
            is_procedural: false,
            is_3d: false,
            center_only: false,
            needs_speaker_map: false,
            is_last_buffer: false,
            frames_played: 0,
            events: 0,
            source: vec![0.0; len],
            pre_effect: vec![0.0; len],
            post_effect: vec![0.0; len],
            scratch: vec![0.0; len],
            outputs: core::array::from_fn(|_| FormatOutput::new()),
            codec: FirstOrderAmbisonics,
            voices: SourceVoices::default(),
        }
    }

    /// Populate the slot from an init command
    pub fn init(&mut self, init: SlotInit, block_frames: usize, sample_rate: u32, garbage: &mut GarbageSender) {
        self.handle = init.handle;
        self.state = PlayState::Initialized;
        self.decoder = init.decoder;
        self.channels = init.channels.clamp(1, MAX_CHANNELS);
        self.out_channels = init.out_channels.clamp(1, MAX_CHANNELS);
        self.rate_ratio = if init.sample_rate == 0 {
            1.0
        } else {
            init.sample_rate as f32 / sample_rate as f32
        };
        self.block_rate = sample_rate as f32 / block_frames.max(1) as f32;

        self.alpha = 2.0;
        self.current = [0.0; MAX_CHANNELS];
        self.next = [0.0; MAX_CHANNELS];
        self.chunk_frames = 0;
        self.chunk_cursor = 0;
        self.end_pending = false;

        self.pitch = Ramp::unset(1.0);
        self.volume = Ramp::unset(1.0);
        self.distance_attenuation = Ramp::unset(1.0);
        self.lpf_frequency = Ramp::unset(MAX_FILTER_FREQUENCY);
        self.hpf_frequency = Ramp::unset(MIN_FILTER_FREQUENCY);
        self.lpf.reset();
        self.hpf.reset();
        self.lpf_bypassed = true;
        self.hpf_bypassed = true;
        self.spatialization = SpatializationParams::default();

        let old_effects = mem::replace(&mut self.effects, init.effects);
        if old_effects.capacity() > 0 {
            garbage.dispose(Garbage::SourceEffects(old_effects));
        }
        self.effect_chain_id = init.effect_chain_id;
        self.play_effect_tails = init.play_effect_tails;
        self.envelope = EnvelopeFollower::new(self.block_rate, init.envelope_attack_ms, init.envelope_release_ms);
        self.tails_done = false;

        self.fade_total = 0;
        self.fade_remaining = 0;

        self.bus_id = init.bus_id;
        self.bus_duration_frames = init
            .bus_duration_secs
            .map(|secs| (secs as f64 * sample_rate as f64).round() as u64);
        self.bus_frames_emitted = 0;
        self.pre_effect_sends = 0;
        self.post_effect_sends = 0;

        self.submix_sends.clear();
        for send in init.submix_sends.iter().take(MAX_SUBMIX_SENDS) {
            self.submix_sends.push(*send);
        }
        if init.submix_sends.len() > MAX_SUBMIX_SENDS {
            tracing::warn!(handle = ?self.handle, "too many submix sends, extra sends ignored");
        }
        if init.submix_sends.capacity() > 0 {
            garbage.dispose(Garbage::SubmixSends(init.submix_sends));
        }

        self.output_to_bus_only = init.output_to_bus_only;
        self.is_procedural = init.is_procedural;
        self.is_3d = init.is_3d;
        self.center_only = init.center_only;
        self.needs_speaker_map = false;
        self.is_last_buffer = false;
        self.frames_played = 0;
        self.events = 0;

        for (output, buffer) in self.outputs.iter_mut().zip(init.format_buffers) {
            output.reset();
            if let Some(buffer) = buffer {
                if output.buffer.is_empty() {
                    output.buffer = buffer;
                } else {
                    garbage.dispose(Garbage::Samples(buffer));
                }
            }
        }

        self.voices = init.voices;
        tracing::debug!(handle = ?self.handle, channels = self.channels, bus = ?self.bus_id, "source initialized");
    }

    /// Tear the slot down. Returns the decoder so it can wait for async work.
    pub fn release(&mut self, garbage: &mut GarbageSender) -> Option<Box<dyn SourceDecoder>> {
        if !matches!(self.state, PlayState::Done | PlayState::Uninitialized) {
            tracing::trace!(handle = ?self.handle, state = ?self.state, "release forces stop");
        }
        self.state = PlayState::Uninitialized;

        if !self.effects.is_empty() {
            garbage.dispose(Garbage::SourceEffects(mem::take(&mut self.effects)));
        }
        let voices = mem::take(&mut self.voices);
        garbage.dispose_opt(voices.spatialization, Garbage::Voice);
        garbage.dispose_opt(voices.occlusion, Garbage::Voice);
        garbage.dispose_opt(voices.reverb, Garbage::Voice);

        self.effect_chain_id = None;
        self.bus_id = None;
        self.pre_effect_sends = 0;
        self.post_effect_sends = 0;
        self.submix_sends.clear();
        self.is_last_buffer = false;
        self.needs_speaker_map = false;
        self.events = 0;

        tracing::debug!(handle = ?self.handle, "source released");
        self.decoder.take()
    }

    #[inline]
    pub fn matches(&self, handle: SourceHandle) -> bool {
        self.handle == handle && self.state.is_initialized()
    }

    pub fn plugin_states(&self) -> [PluginState; 3] {
        [
            self.voices.spatialization_state,
            self.voices.occlusion_state,
            self.voices.reverb_state,
        ]
    }

    #[inline]
    pub fn envelope_value(&self) -> f32 {
        self.envelope.value()
    }

    // ---- state machine ----

    pub fn play(&mut self) {
        match self.state {
            PlayState::Initialized | PlayState::Paused => self.state = PlayState::Playing,
            _ => {}
        }
    }

    pub fn pause(&mut self) {
        if self.state == PlayState::Playing {
            self.state = PlayState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == PlayState::Paused {
            self.state = PlayState::Playing;
        }
    }

    /// Stop right away: the next block is silent and the slot finishes
    pub fn stop(&mut self) {
        match self.state {
            PlayState::Uninitialized | PlayState::Done => {}
            _ => {
                self.state = PlayState::Stopping;
                self.fade_remaining = 0;
                self.fade_total = 0;
            }
        }
    }

    /// Fade out over `fade_frames` (rounded up to a multiple of 4), then finish
    pub fn stop_with_fade(&mut self, fade_frames: usize) {
        if self.state != PlayState::Playing {
            return;
        }
        if self.is_procedural || fade_frames == 0 {
            return self.stop();
        }
        let frames = (fade_frames + 3) & !3;
        self.state = PlayState::Stopping;
        self.fade_total = frames;
        self.fade_remaining = frames;
    }

    // ---- parameters ----

    pub fn set_volume(&mut self, volume: f32) {
        if self.state == PlayState::Stopping {
            return;
        }
        self.volume.set_target(volume.max(0.0));
    }

    pub fn set_pitch(&mut self, pitch: f32) {
        self.pitch.set_target(pitch.clamp(MIN_PITCH, MAX_PITCH));
    }

    pub fn set_lpf_frequency(&mut self, frequency: f32) {
        self.lpf_frequency.set_target(frequency.clamp(MIN_FILTER_FREQUENCY, MAX_FILTER_FREQUENCY));
    }

    pub fn set_hpf_frequency(&mut self, frequency: f32) {
        self.hpf_frequency.set_target(frequency.clamp(MIN_FILTER_FREQUENCY, MAX_FILTER_FREQUENCY));
    }

    pub fn set_distance_attenuation(&mut self, attenuation: f32) {
        self.distance_attenuation.set_target(attenuation.max(0.0));
    }

    pub fn set_spatialization_params(&mut self, params: SpatializationParams) {
        self.spatialization = params;
    }

    /// Install an explicit gain matrix for `format`.
    ///
    /// A map whose size does not match the slot's current channel layout is
    /// dropped; 3D slots are then flagged as needing a new one.
    pub fn set_channel_map(
        &mut self,
        format: ChannelFormat,
        map: &ChannelMap,
        is_3d: bool,
        center_only: bool,
        device_channels: usize,
    ) {
        self.is_3d = is_3d;
        self.center_only = center_only;

        let out_ch = format.channels(device_channels);
        let expected = self.out_channels * out_ch;
        if format.is_soundfield() {
            tracing::debug!(handle = ?self.handle, "channel map ignored for soundfield format");
            return;
        }
        if map.len() != expected {
            tracing::warn!(
                handle = ?self.handle,
                expected,
                got = map.len(),
                "channel map does not match the channel count, dropping it"
            );
            if is_3d {
                self.flag_speaker_map();
            }
            return;
        }

        let output = &mut self.outputs[format.index()];
        output.map.set_target(map.as_slice());
        output.map_shape = (self.out_channels, out_ch);
        output.kind = MapKind::Explicit;
        self.needs_speaker_map = false;
    }

    /// The device's channel count changed
    pub fn on_device_channels_changed(&mut self, device_channels: usize) {
        let out_ch = ChannelFormat::Device.channels(device_channels);
        let in_ch = self.out_channels;
        let output = &mut self.outputs[ChannelFormat::Device.index()];
        if self.is_3d {
            output.map.set_target(ChannelMap::silent(in_ch, out_ch).as_slice());
            output.kind = MapKind::Silent;
            output.map_shape = (in_ch, out_ch);
            self.flag_speaker_map();
        } else {
            output.reset();
        }
    }

    fn flag_speaker_map(&mut self) {
        if !self.needs_speaker_map {
            self.needs_speaker_map = true;
            self.events |= EVENT_NEEDS_SPEAKER_MAP;
        }
    }

    // ---- effects ----

    pub fn set_effect_bypass(&mut self, index: usize, bypass: bool) {
        match self.effects.get_mut(index) {
            Some(slot) => slot.bypass = bypass,
            None => tracing::debug!(handle = ?self.handle, index, "effect bypass for missing effect ignored"),
        }
    }

    /// Swap in a rebuilt effect chain; the old one goes back to the control thread
    pub fn replace_effects(&mut self, effects: Vec<SourceEffectSlot>, play_tails: bool, garbage: &mut GarbageSender) {
        let old = mem::replace(&mut self.effects, effects);
        self.play_effect_tails = play_tails;
        if old.capacity() > 0 {
            garbage.dispose(Garbage::SourceEffects(old));
        }
    }

    // ---- submix sends ----

    /// Give `format` its output buffer; a spare is handed back if one is already there
    pub fn install_format_buffer(&mut self, format: ChannelFormat, buffer: Vec<f32>, garbage: &mut GarbageSender) {
        let output = &mut self.outputs[format.index()];
        if output.buffer.is_empty() {
            output.buffer = buffer;
        } else {
            garbage.dispose(Garbage::Samples(buffer));
        }
    }

    pub fn set_submix_send(&mut self, send: SlotSubmixSend, buffer: Option<Vec<f32>>, garbage: &mut GarbageSender) {
        if let Some(buffer) = buffer {
            self.install_format_buffer(send.format, buffer, garbage);
        }

        if let Some(existing) = self.submix_sends.iter_mut().find(|s| s.submix == send.submix) {
            *existing = send;
        } else if self.submix_sends.len() < MAX_SUBMIX_SENDS {
            self.submix_sends.push(send);
        } else {
            tracing::warn!(handle = ?self.handle, submix = ?send.submix, "submix send limit reached, send ignored");
        }
    }

    pub fn clear_submix_send(&mut self, submix: SubmixId) {
        self.submix_sends.retain(|s| s.submix != submix);
    }

    /// Point a send at `to` after `from` went away. An existing send to `to` wins.
    pub fn retarget_submix_send(&mut self, from: SubmixId, to: SubmixId, format: ChannelFormat) {
        if self.submix_send_level(to).is_some() {
            return self.clear_submix_send(from);
        }
        if let Some(send) = self.submix_sends.iter_mut().find(|s| s.submix == from) {
            send.submix = to;
            send.format = format;
        }
    }

    /// Level of the send to `submix`, if any
    #[inline]
    pub fn submix_send_level(&self, submix: SubmixId) -> Option<f32> {
        self.submix_sends.iter().find(|s| s.submix == submix).map(|s| s.level)
    }

    /// Rendered output for `format`, with its channel count
    pub fn output(&self, format: ChannelFormat) -> Option<(&[f32], usize)> {
        let output = &self.outputs[format.index()];
        if output.channels == 0 || output.buffer.is_empty() {
            return None;
        }
        Some((&output.buffer, output.channels))
    }

    /// Buffer tapped by a bus send of the given stage
    #[inline]
    pub fn bus_send_buffer(&self, stage: BusSendStage, frames: usize) -> &[f32] {
        let len = frames * self.channels;
        match stage {
            BusSendStage::PreEffect => &self.pre_effect[..len],
            BusSendStage::PostEffect => &self.post_effect[..len],
        }
    }

    // ---- render ----

    /// Render one block
    pub fn render(&mut self, ctx: &BlockContext, buses: &BusStore) {
        if !self.state.is_audible() {
            return;
        }
        let frames = ctx.frames;
        let len = frames * self.channels;

        match self.bus_id {
            Some(bus) => self.read_bus(frames, buses, bus),
            None => self.resample(frames),
        }

        if self.pre_effect_sends > 0 {
            self.pre_effect[..len].copy_from_slice(&self.source[..len]);
        }

        self.apply_volume(frames);
        self.process_effects(ctx);

        if self.post_effect_sends > 0 {
            self.post_effect[..len].copy_from_slice(&self.source[..len]);
        }

        if !self.output_to_bus_only {
            self.apply_filters(ctx);
            if ctx.toggles.distance_attenuation {
                apply_gain_ramp(
                    &mut self.source[..len],
                    self.channels,
                    self.distance_attenuation.start(),
                    self.distance_attenuation.target(),
                );
            }
            let channels = self.process_plugins(ctx);
            self.render_formats(ctx, channels);
        }

        self.pitch.finish_block();
        self.volume.finish_block();
        self.distance_attenuation.finish_block();
        self.lpf_frequency.finish_block();
        self.hpf_frequency.finish_block();
    }

    /// Fetch the next decoded frame into `next`
    fn advance(&mut self) -> Fetch {
        if self.end_pending {
            return Fetch::Finished;
        }
        match self.ensure_chunk() {
            Fetch::Ready => {
                let ch = self.channels;
                let start = self.chunk_cursor * ch;
                self.current = self.next;
                self.next[..ch].copy_from_slice(&self.chunk[start..start + ch]);
                self.chunk_cursor += 1;
                self.frames_played += 1;
                Fetch::Ready
            }
            Fetch::Finished => {
                // Hold the final frame for one more step so it is heard
                self.current = self.next;
                self.end_pending = true;
                Fetch::Ready
            }
            Fetch::Starved => Fetch::Starved,
        }
    }

    fn ensure_chunk(&mut self) -> Fetch {
        if self.chunk_cursor < self.chunk_frames {
            return Fetch::Ready;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Fetch::Finished;
        };
        let frames = decoder.read(&mut self.chunk);
        self.chunk_frames = frames;
        self.chunk_cursor = 0;
        if frames > 0 {
            Fetch::Ready
        } else if decoder.is_finished() {
            Fetch::Finished
        } else {
            Fetch::Starved
        }
    }

    fn resample(&mut self, frames: usize) {
        let ch = self.channels;
        if self.is_last_buffer {
            silence(&mut self.source[..frames * ch]);
            return;
        }

        let pitch_start = self.pitch.start();
        let pitch_step = self.pitch.step(frames);

        for i in 0..frames {
            while self.alpha >= 1.0 {
                match self.advance() {
                    Fetch::Ready => self.alpha -= 1.0,
                    Fetch::Starved => {
                        silence(&mut self.source[i * ch..frames * ch]);
                        return;
                    }
                    Fetch::Finished => {
                        self.is_last_buffer = true;
                        silence(&mut self.source[i * ch..frames * ch]);
                        return;
                    }
                }
            }

            let alpha = self.alpha;
            let out = &mut self.source[i * ch..(i + 1) * ch];
            for ((o, c), n) in out.iter_mut().zip(&self.current[..ch]).zip(&self.next[..ch]) {
                *o = c + alpha * (n - c);
            }

            self.alpha += (pitch_start + pitch_step * i as f32) * self.rate_ratio;
        }
    }

    fn read_bus(&mut self, frames: usize, buses: &BusStore, bus: BusId) {
        let ch = self.channels;
        let out = &mut self.source[..frames * ch];
        silence(out);
        if self.is_last_buffer {
            return;
        }

        match buses.get(bus) {
            Some(bus) => mix_converted(bus.previous_buffer(), bus.channels(), out, ch, 1.0),
            None => tracing::trace!(?bus, "bus source reading a missing bus"),
        }

        let mut emitted = frames;
        if let Some(limit) = self.bus_duration_frames {
            let remaining = limit.saturating_sub(self.bus_frames_emitted) as usize;
            if remaining <= frames {
                silence(&mut out[remaining * ch..]);
                self.is_last_buffer = true;
                emitted = remaining;
            }
            self.bus_frames_emitted += emitted as u64;
        }
        self.frames_played += emitted as u64;
    }

    fn apply_volume(&mut self, frames: usize) {
        let ch = self.channels;
        let start = self.volume.start();
        let step = self.volume.step(frames);
        let stopping = self.state == PlayState::Stopping;

        for (i, frame) in self.source[..frames * ch].chunks_exact_mut(ch).enumerate() {
            let mut gain = start + step * i as f32;
            if stopping {
                if self.fade_remaining == 0 {
                    gain = 0.0;
                } else {
                    gain *= self.fade_remaining as f32 / self.fade_total as f32;
                    self.fade_remaining -= 1;
                }
            }
            frame.iter_mut().for_each(|s| *s *= gain);
        }

        if stopping && self.fade_remaining == 0 {
            self.is_last_buffer = true;
        }
    }

    fn process_effects(&mut self, ctx: &BlockContext) {
        let len = ctx.frames * self.channels;
        let effects_on = ctx.toggles.source_effects && !self.effects.is_empty();

        if effects_on {
            let effect_ctx = EffectContext {
                sample_rate: ctx.sample_rate,
                channels: self.channels,
                frames: ctx.frames,
            };
            process_chain(&mut self.effects, &effect_ctx, &mut self.source[..len]);
        }

        if ctx.toggles.envelope_following {
            self.envelope.process(average_amplitude(&self.source[..len]));
        }

        if self.is_last_buffer && !self.tails_done {
            let wants_tails = self.play_effect_tails && effects_on;
            if !wants_tails || self.envelope.value() < ENVELOPE_TAIL_THRESHOLD {
                self.tails_done = true;
                self.events |= EVENT_TAILS_DONE;
            }
        }
    }

    fn apply_filters(&mut self, ctx: &BlockContext) {
        if !ctx.toggles.filtering {
            return;
        }
        let frames = ctx.frames;
        let ch = self.channels;
        let use_hpf = ctx.toggles.high_pass_filtering;

        for (i, frame) in self.source[..frames * ch].chunks_exact_mut(ch).enumerate() {
            let lpf_frequency = self.lpf_frequency.value_at(i, frames);
            if lpf_frequency >= MAX_FILTER_FREQUENCY {
                self.lpf_bypassed = true;
            } else {
                if self.lpf_bypassed {
                    self.lpf.reset();
                    self.lpf_bypassed = false;
                }
                self.lpf.set_frequency(lpf_frequency);
                self.lpf.process_frame(frame);
            }

            if !use_hpf {
                continue;
            }
            let hpf_frequency = self.hpf_frequency.value_at(i, frames);
            if hpf_frequency <= MIN_FILTER_FREQUENCY {
                self.hpf_bypassed = true;
            } else {
                if self.hpf_bypassed {
                    self.hpf.reset();
                    self.hpf_bypassed = false;
                }
                self.hpf.set_frequency(hpf_frequency);
                self.hpf.process_frame(frame);
            }
        }
    }

    /// Run plugin voices; returns the channel count afterwards
    fn process_plugins(&mut self, ctx: &BlockContext) -> usize {
        let frames = ctx.frames;
        let ch = self.channels;
        let len = frames * ch;
        if !ctx.toggles.plugins {
            return ch;
        }

        if let Some(voice) = self.voices.reverb.as_mut() {
            silence(&mut self.scratch[..len]);
            let input = PluginInput {
                handle: self.handle,
                samples: &self.source[..len],
                channels: ch,
                frames,
                spatialization: &self.spatialization,
            };
            voice.process_audio(&input, &mut self.scratch[..len]);
            if !ctx.reverb_is_external_send {
                mix_in(&mut self.source[..len], &self.scratch[..len], 1.0);
            }
        }

        if let Some(voice) = self.voices.occlusion.as_mut() {
            silence(&mut self.scratch[..len]);
            let input = PluginInput {
                handle: self.handle,
                samples: &self.source[..len],
                channels: ch,
                frames,
                spatialization: &self.spatialization,
            };
            voice.process_audio(&input, &mut self.scratch[..len]);
            self.source[..len].copy_from_slice(&self.scratch[..len]);
        }

        if ch == 1 {
            if let Some(voice) = self.voices.spatialization.as_mut() {
                let out_ch = ctx.spatialization_channels.clamp(1, MAX_CHANNELS);
                silence(&mut self.scratch[..frames * out_ch]);
                let input = PluginInput {
                    handle: self.handle,
                    samples: &self.source[..len],
                    channels: ch,
                    frames,
                    spatialization: &self.spatialization,
                };
                voice.process_audio(&input, &mut self.scratch[..frames * out_ch]);
                if !ctx.spatialization_is_external_send {
                    mem::swap(&mut self.source, &mut self.scratch);
                    return out_ch;
                }
            }
        }
        ch
    }

    fn render_formats(&mut self, ctx: &BlockContext, in_ch: usize) {
        let frames = ctx.frames;
        let mut mask = 0u8;
        for send in &self.submix_sends {
            mask |= 1 << send.format.index();
        }

        for format in ChannelFormat::ALL {
            if mask & (1 << format.index()) == 0 {
                continue;
            }
            let out_ch = format.channels(ctx.device_channels);
            let output = &mut self.outputs[format.index()];
            if output.buffer.len() < frames * out_ch {
                debug_assert!(output.buffer.is_empty(), "format buffer too small");
                output.channels = 0;
                continue;
            }
            output.channels = out_ch;

            if format.is_soundfield() {
                let dst = &mut output.buffer[..frames * out_ch];
                silence(dst);
                if in_ch == 1 {
                    let azimuth = self.spatialization.azimuth;
                    let elevation = self.spatialization.elevation;
                    self.codec.encode_point(&self.source[..frames], azimuth, elevation, dst);
                } else {
                    self.codec.encode(&self.source[..frames * in_ch], in_ch, dst);
                }
                continue;
            }

            if output.prepare(in_ch, out_ch, self.is_3d, self.center_only) && self.is_3d {
                self.needs_speaker_map = true;
                self.events |= EVENT_NEEDS_SPEAKER_MAP;
            }
            let output = &mut self.outputs[format.index()];
            let dst = &mut output.buffer[..frames * out_ch];
            for (f, (src, dst)) in self.source[..frames * in_ch]
                .chunks_exact(in_ch)
                .zip(dst.chunks_exact_mut(out_ch))
                .enumerate()
            {
                for (o, d) in dst.iter_mut().enumerate() {
                    *d = src
                        .iter()
                        .enumerate()
                        .map(|(i, s)| s * output.map.value_at(i * out_ch + o, f, frames))
                        .sum();
                }
            }
            output.map.finish_block();
        }
    }

    /// Read pending events and clear them
    #[inline]
    pub fn take_events(&mut self) -> u8 {
        mem::take(&mut self.events)
    }

    /// Finish the slot once its last buffer played and its tails decayed.
    ///
    /// Returns `true` on the transition.
    pub fn try_finish(&mut self) -> bool {
        if self.state.is_audible() && self.is_last_buffer && self.tails_done {
            self.state = PlayState::Done;
            self.events |= EVENT_DONE;
            tracing::debug!(handle = ?self.handle, frames = self.frames_played, "source done");
            return true;
        }
        false
    }

    /// The decoder is being torn down elsewhere; finish now
    pub fn check_begin_destroy(&mut self) {
        let destroying = self.decoder.as_ref().is_some_and(|d| d.is_begin_destroy());
        if destroying && self.state.is_audible() && !self.is_last_buffer {
            tracing::debug!(handle = ?self.handle, "decoder began destruction, finishing source");
            self.is_last_buffer = true;
            self.tails_done = true;
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::BufferDecoder;
    use crate::garbage::garbage_channel;

    const FRAMES: usize = 64;
    const RATE: u32 = 48_000;

    fn ctx() -> BlockContext {
        BlockContext {
            frames: FRAMES,
            sample_rate: RATE,
            device_channels: 2,
            toggles: ProcessingToggles::default(),
            spatialization_is_external_send: false,
            reverb_is_external_send: false,
            spatialization_channels: 2,
        }
    }

    fn slot_with(samples: Vec<f32>, channels: usize, sample_rate: u32) -> SourceSlot {
        let (mut garbage, _collector) = garbage_channel(16);
        let mut slot = SourceSlot::new(0, FRAMES, RATE);
        let mut format_buffers: [Option<Vec<f32>>; FORMAT_COUNT] = Default::default();
        format_buffers[ChannelFormat::Device.index()] = Some(vec![0.0; FRAMES * MAX_CHANNELS]);
        slot.init(
            SlotInit {
                handle: SourceHandle::new(0, 1),
                decoder: Some(Box::new(BufferDecoder::new(samples, channels))),
                channels,
                out_channels: channels,
                sample_rate,
                submix_sends: vec![SlotSubmixSend {
                    submix: SubmixId::MASTER,
                    level: 1.0,
                    format: ChannelFormat::Device,
                }],
                bus_id: None,
                bus_duration_secs: None,
                effects: Vec::new(),
                effect_chain_id: None,
                play_effect_tails: false,
                output_to_bus_only: false,
                is_procedural: false,
                is_3d: false,
                center_only: false,
                envelope_attack_ms: 10.0,
                envelope_release_ms: 100.0,
                voices: SourceVoices::default(),
                format_buffers,
            },
            FRAMES,
            RATE,
            &mut garbage,
        );
        slot
    }

    #[test]
    fn unity_pitch_reproduces_input() {
        let input: Vec<f32> = (0..FRAMES * 2).map(|i| i as f32).collect();
        let mut slot = slot_with(input, 1, RATE);
        slot.play();
        slot.render(&ctx(), &BusStore::default());
        let block: Vec<f32> = slot.source[..FRAMES].to_vec();
        assert_eq!(block, (0..FRAMES).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn half_rate_source_is_interpolated() {
        let mut slot = slot_with(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], 1, RATE / 2);
        slot.play();
        slot.render(&ctx(), &BusStore::default());
        assert_eq!(&slot.source[..6], &[0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn finished_decoder_sets_last_buffer() {
        let mut slot = slot_with(vec![1.0; 10], 1, RATE);
        slot.play();
        slot.render(&ctx(), &BusStore::default());
        assert!(slot.is_last_buffer);
        assert_eq!(&slot.source[..10], &[1.0; 10]);
        assert!(slot.source[10..FRAMES].iter().all(|s| *s == 0.0));

        assert!(slot.tails_done);
        assert!(slot.try_finish());
        assert_eq!(slot.state, PlayState::Done);
        assert!(!slot.try_finish());
        assert_eq!(slot.take_events(), EVENT_TAILS_DONE | EVENT_DONE);
    }

    #[test]
    fn first_volume_snaps_then_ramps() {
        let mut slot = slot_with(vec![1.0; FRAMES * 4], 1, RATE);
        slot.play();
        slot.set_volume(0.5);
        slot.render(&ctx(), &BusStore::default());
        assert!(slot.source[..FRAMES].iter().all(|s| *s == 0.5));

        slot.set_volume(1.0);
        slot.render(&ctx(), &BusStore::default());
        let step = 0.5 / FRAMES as f32;
        for pair in slot.source[..FRAMES].windows(2) {
            assert!((pair[1] - pair[0] - step).abs() < 1e-6);
        }
    }

    #[test]
    fn stop_with_fade_rounds_to_four_and_finishes() {
        let mut slot = slot_with(vec![1.0; FRAMES * 4], 1, RATE);
        slot.play();
        slot.stop_with_fade(6);
        assert_eq!(slot.fade_total, 8);
        slot.set_volume(0.0); // ignored while stopping
        slot.render(&ctx(), &BusStore::default());
        assert_eq!(slot.source[0], 1.0);
        assert!(slot.source[7] > 0.0);
        assert_eq!(slot.source[8], 0.0);
        assert!(slot.is_last_buffer);
        assert!(slot.try_finish());
    }

    #[test]
    fn procedural_sources_stop_immediately() {
        let mut slot = slot_with(vec![1.0; FRAMES * 4], 1, RATE);
        slot.is_procedural = true;
        slot.play();
        slot.stop_with_fade(100);
        assert_eq!(slot.fade_total, 0);
        slot.render(&ctx(), &BusStore::default());
        assert!(slot.source[..FRAMES].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn mono_device_output_uses_default_map() {
        let mut slot = slot_with(vec![1.0; FRAMES * 4], 1, RATE);
        slot.play();
        slot.render(&ctx(), &BusStore::default());
        let (out, channels) = slot.output(ChannelFormat::Device).unwrap();
        assert_eq!(channels, 2);
        assert!((out[0] - core::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((out[1] - core::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn mismatched_channel_map_flags_3d_slot() {
        let mut slot = slot_with(vec![1.0; FRAMES * 4], 1, RATE);
        let map = ChannelMap::new(&[1.0, 0.0, 0.0]).unwrap();
        slot.set_channel_map(ChannelFormat::Device, &map, true, false, 2);
        assert!(slot.needs_speaker_map);
        assert_eq!(slot.take_events(), EVENT_NEEDS_SPEAKER_MAP);

        let map = ChannelMap::new(&[1.0, 0.0]).unwrap();
        slot.set_channel_map(ChannelFormat::Device, &map, true, false, 2);
        assert!(!slot.needs_speaker_map);
        slot.play();
        slot.render(&ctx(), &BusStore::default());
        let (out, _) = slot.output(ChannelFormat::Device).unwrap();
        assert_eq!(&out[..2], &[1.0, 0.0]);
    }

    #[test]
    fn device_change_silences_3d_until_new_map() {
        let mut slot = slot_with(vec![1.0; FRAMES * 4], 1, RATE);
        slot.is_3d = true;
        slot.play();
        slot.on_device_channels_changed(6);
        assert!(slot.needs_speaker_map);

        let mut context = ctx();
        context.device_channels = 6;
        slot.render(&context, &BusStore::default());
        let (out, channels) = slot.output(ChannelFormat::Device).unwrap();
        assert_eq!(channels, 6);
        assert!(out[..FRAMES * 6].iter().all(|s| *s == 0.0));
    }
}

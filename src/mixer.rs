//! The mixer: control handle, renderer, and the glue between them.
//!
//! A [`Mixer`] is built from a [`MixerConfig`] and then usually split:
//!
//! - [`MixerHandle`] stays on the control thread. Every mutating call checks
//!   its arguments, turns them into a command and queues it. Nothing reaches
//!   the render thread until [`MixerHandle::update`] (or
//!   [`flush`](MixerHandle::flush)).
//! - [`MixerRenderer`] goes to the audio callback. [`MixerRenderer::render`]
//!   fills any interleaved buffer, rendering fixed-size blocks internally.
//!
//! Used un-split, [`Mixer::update`] drains the commands synchronously, which
//! is handy for offline rendering and tests.
//!
//! # Example
//!
//! ```
//! use mischpult::decoder::BufferDecoder;
//! use mischpult::source::SourceInitParams;
//! use mischpult::{Mixer, MixerConfig};
//!
//! let config = MixerConfig::new(48_000).with_block_frames(256);
//! let mut mixer = Mixer::new(config).unwrap();
//!
//! let source = mixer.acquire_source().unwrap();
//! mixer
//!     .init_source(source, SourceInitParams::new(BufferDecoder::new(vec![0.5; 48_000], 1), 48_000))
//!     .unwrap();
//! mixer.play(source).unwrap();
//! mixer.update();
//!
//! let mut out = vec![0.0; 512 * 2];
//! mixer.render(&mut out);
//! assert!(out.iter().any(|s| *s != 0.0));
//! ```

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rtrb::Consumer;

use crate::bus::MixerBus;
use crate::command::{command_queue, CommandReceiver, CommandSender};
use crate::config::{MixerConfig, MAX_CHANNELS};
use crate::dsp::SpectrumAnalyzer;
use crate::effect::{SourceEffectSlot, SubmixEffectSlot};
use crate::error::{MixerError, MixerResult};
use crate::format::{ChannelFormat, ChannelMap};
use crate::garbage::{garbage_channel, GarbageCollector, GarbageSender};
use crate::plugin::{Plugins, SpatializationParams};
use crate::source::{BusId, BusSend, BusSendStage, SlotInit, SlotSubmixSend, SourceHandle, SourceInitParams, SubmixSend};
use crate::source_manager::{
    event_channel, BusAttachment, MixerEvent, SourceInit, SourcePool, SourceRegistry, Telemetry,
};
use crate::submix::{
    tap_channel, ListenerId, Readout, SubmixEnvelope, SubmixId, SubmixNode, SubmixReader, SubmixRegistry,
    SubmixSettings, SubmixSpectrum, SubmixTree, RECORDING_TAP,
};

const COMMAND_CAPACITY: usize = 256;

/// Device channel count shared by both ends.
///
/// `current` is the latest count either end was told about, `pending` a
/// change the renderer has yet to apply (0 when none).
struct DeviceChannels {
    current: AtomicUsize,
    pending: AtomicUsize,
}

impl DeviceChannels {
    fn new(channels: usize) -> Self {
        Self {
            current: AtomicUsize::new(channels),
            pending: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    fn request(&self, channels: usize) {
        self.current.store(channels, Ordering::Release);
        self.pending.store(channels, Ordering::Release);
    }

    fn take_pending(&self) -> usize {
        self.pending.swap(0, Ordering::Acquire)
    }
}

/// Everything the render thread owns; the context every command runs against
pub(crate) struct RenderGraph {
    pub sources: SourcePool,
    pub submixes: SubmixTree,
}

/// A complete mixer, before it is split between threads
pub struct Mixer {
    handle: MixerHandle,
    renderer: MixerRenderer,
}

impl Mixer {
    pub fn new(config: MixerConfig) -> MixerResult<Self> {
        Self::with_plugins(config, Plugins::default())
    }

    /// Build a mixer whose sources may use `plugins`
    pub fn with_plugins(config: MixerConfig, plugins: Plugins) -> MixerResult<Self> {
        config.validate()?;

        let (commands, receiver) = command_queue(COMMAND_CAPACITY);
        let (garbage, collector) = garbage_channel(config.max_sources * 8 + 256);
        let (event_tx, event_rx) = event_channel(config.event_capacity);
        let telemetry = Arc::new(Telemetry::new(config.max_sources));
        let clock = Arc::new(AtomicU64::new(0));
        let device = Arc::new(DeviceChannels::new(config.device_channels));

        let master = SubmixNode::new(
            SubmixId::MASTER,
            SubmixSettings::new(ChannelFormat::Device),
            config.block_frames,
            config.device_channels,
        );
        let graph = RenderGraph {
            sources: SourcePool::new(
                &config,
                plugins.spatialization_channels(),
                garbage,
                event_tx,
                telemetry.clone(),
            ),
            submixes: SubmixTree::new(Box::new(master), config.max_submixes),
        };

        tracing::debug!(
            sample_rate = config.sample_rate,
            block_frames = config.block_frames,
            channels = config.device_channels,
            sources = config.max_sources,
            "mixer created"
        );

        let renderer = MixerRenderer {
            graph,
            commands: receiver,
            block: vec![0.0; config.block_frames * MAX_CHANNELS],
            block_len: 0,
            cursor: 0,
            frames: config.block_frames,
            device_channels: config.device_channels,
            device: device.clone(),
            clock: clock.clone(),
        };

        let handle = MixerHandle {
            registry: SourceRegistry::new(config.max_sources),
            submixes: SubmixRegistry::new(),
            config,
            commands,
            plugins,
            events: event_rx,
            garbage: collector,
            telemetry,
            clock,
            device,
        };

        Ok(Self { handle, renderer })
    }

    /// Separate the control side from the render side
    pub fn split(self) -> (MixerHandle, MixerRenderer) {
        (self.handle, self.renderer)
    }

    /// Submit queued commands and run them right away on this thread
    pub fn update(&mut self) {
        self.handle.update();
        self.renderer.drain_commands();
        self.handle.collect_garbage();
    }

    /// Render into `out`; see [`MixerRenderer::render`]
    pub fn render(&mut self, out: &mut [f32]) {
        self.renderer.render(out);
    }

    pub fn renderer(&mut self) -> &mut MixerRenderer {
        &mut self.renderer
    }
}

impl Deref for Mixer {
    type Target = MixerHandle;

    fn deref(&self) -> &MixerHandle {
        &self.handle
    }
}

impl DerefMut for Mixer {
    fn deref_mut(&mut self) -> &mut MixerHandle {
        &mut self.handle
    }
}

/// Render-thread end of a [`Mixer`]
pub struct MixerRenderer {
    graph: RenderGraph,
    commands: CommandReceiver<RenderGraph>,
    block: Vec<f32>,
    block_len: usize,
    cursor: usize,
    frames: usize,
    device_channels: usize,
    device: Arc<DeviceChannels>,
    clock: Arc<AtomicU64>,
}

impl MixerRenderer {
    #[inline]
    pub fn device_channels(&self) -> usize {
        self.device_channels
    }

    #[inline]
    pub fn block_frames(&self) -> usize {
        self.frames
    }

    /// The output device changed its channel count; applied at the next block
    /// and visible to the handle right away
    pub fn set_device_channels(&mut self, channels: usize) {
        if channels == 0 || channels > MAX_CHANNELS {
            tracing::warn!(channels, "unsupported device channel count ignored");
            return;
        }
        self.device.request(channels);
    }

    /// Fill `out` with interleaved audio for the current device channel count.
    ///
    /// `out` may have any length; blocks that do not fit are carried over to
    /// the next call.
    pub fn render(&mut self, out: &mut [f32]) {
        let mut written = 0;
        while written < out.len() {
            if self.cursor == self.block_len {
                self.render_block();
            }
            let n = (self.block_len - self.cursor).min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.block[self.cursor..self.cursor + n]);
            self.cursor += n;
            written += n;
        }
    }

    pub(crate) fn drain_commands(&mut self) -> usize {
        let count = self.commands.drain(&mut self.graph);
        if count > 0 {
            tracing::trace!(count, "commands executed");
        }
        count
    }

    fn apply_device_channels(&mut self) {
        let channels = self.device.take_pending();
        if channels == 0 || channels == self.device_channels {
            return;
        }
        tracing::debug!(from = self.device_channels, to = channels, "device channel count changed");
        self.device_channels = channels;
        self.graph.sources.set_device_channels(channels);
        self.graph.submixes.on_device_channels_changed(channels);
    }

    fn render_block(&mut self) {
        self.drain_commands();
        self.apply_device_channels();

        let RenderGraph { sources, submixes } = &mut self.graph;
        sources.compute_next_block();
        let ctx = *sources.context();
        submixes.process(sources.slots(), &ctx, &mut self.block);

        self.block_len = self.frames * self.device_channels;
        self.cursor = 0;
        self.clock.fetch_add(self.frames as u64, Ordering::Release);
    }
}

impl Drop for MixerRenderer {
    fn drop(&mut self) {
        self.graph.sources.flush_pending_cleanup();
    }
}

/// Control-thread end of a [`Mixer`]
pub struct MixerHandle {
    config: MixerConfig,
    commands: CommandSender<RenderGraph>,
    registry: SourceRegistry,
    submixes: SubmixRegistry,
    plugins: Plugins,
    events: Consumer<MixerEvent>,
    garbage: GarbageCollector,
    telemetry: Arc<Telemetry>,
    clock: Arc<AtomicU64>,
    device: Arc<DeviceChannels>,
}

impl MixerHandle {
    #[inline]
    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    // ---- queue ----

    /// Hand queued commands to the render thread and free what it returned.
    ///
    /// Returns `true` if a batch was submitted.
    pub fn update(&mut self) -> bool {
        let submitted = self.commands.update();
        self.collect_garbage();
        submitted
    }

    /// Submit everything and wait until the render thread ran it
    pub fn flush(&mut self) -> MixerResult<()> {
        let result = self.commands.flush(self.config.flush_timeout);
        self.collect_garbage();
        result
    }

    /// Commands waiting for the next [`update`](Self::update)
    #[inline]
    pub fn pending_commands(&self) -> usize {
        self.commands.pending()
    }

    pub(crate) fn collect_garbage(&mut self) -> usize {
        self.garbage.collect()
    }

    /// Drain the events published by the render thread
    pub fn poll_events(&mut self) -> impl Iterator<Item = MixerEvent> + '_ {
        core::iter::from_fn(move || self.events.pop().ok())
    }

    /// Frames rendered so far
    #[inline]
    pub fn audio_clock_frames(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Seconds rendered so far
    pub fn audio_clock(&self) -> f64 {
        self.audio_clock_frames() as f64 / self.config.sample_rate as f64
    }

    fn enqueue(&mut self, command: impl FnOnce(&mut RenderGraph) + Send + 'static) {
        self.commands.enqueue(command);
    }

    fn source_command(
        &mut self,
        handle: SourceHandle,
        command: impl FnOnce(&mut SourcePool) + Send + 'static,
    ) -> MixerResult<()> {
        self.registry.active(handle)?;
        self.enqueue(move |graph| command(&mut graph.sources));
        Ok(())
    }

    fn submix_command(
        &mut self,
        id: SubmixId,
        command: impl FnOnce(&mut SubmixNode, &mut GarbageSender) + Send + 'static,
    ) -> MixerResult<()> {
        self.submixes.format(id)?;
        self.enqueue(move |graph| {
            let garbage = graph.sources.garbage();
            match graph.submixes.node_mut(id) {
                Some(node) => command(node, garbage),
                None => tracing::warn!(submix = ?id, "command for missing submix dropped"),
            }
        });
        Ok(())
    }

    fn spare_bus(&self, bus: BusId, channels: usize) -> Box<MixerBus> {
        Box::new(MixerBus::new(
            bus,
            channels.clamp(1, MAX_CHANNELS),
            self.config.block_frames,
            self.config.max_sources,
        ))
    }

    // ---- sources ----

    /// Reserve a free source slot
    pub fn acquire_source(&mut self) -> MixerResult<SourceHandle> {
        let handle = self.registry.acquire()?;
        tracing::trace!(?handle, "source acquired");
        Ok(handle)
    }

    /// Set up an acquired slot. Must come before any other call for `handle`.
    pub fn init_source(&mut self, handle: SourceHandle, params: SourceInitParams) -> MixerResult<()> {
        let channels = params.channels;
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(MixerError::InvalidChannelCount {
                channels,
                max: MAX_CHANNELS,
            });
        }

        let mut sends = params.submix_sends;
        if sends.is_empty() && !params.output_to_bus_only {
            sends.push(SubmixSend {
                submix: SubmixId::MASTER,
                level: 1.0,
            });
        }
        let mut formats = Vec::with_capacity(sends.len());
        for send in &sends {
            formats.push(self.submixes.format(send.submix)?);
        }

        let mut buses = Vec::with_capacity(params.bus_sends.len() + 1);
        if let Some(bus) = params.bus_id {
            buses.push(BusAttachment {
                bus,
                stage: None,
                level: 1.0,
                spare: self.spare_bus(bus, channels),
            });
        }
        for send in &params.bus_sends {
            buses.push(BusAttachment {
                bus: send.bus,
                stage: Some(send.stage),
                level: send.level,
                spare: self.spare_bus(send.bus, send.channels),
            });
        }

        let block_frames = self.config.block_frames;
        let record = self.registry.begin_init(handle)?;
        let voices = self.plugins.init_source(
            handle,
            channels,
            &params.spatialization,
            &params.occlusion,
            &params.reverb,
        );
        record.plugin_states = [voices.spatialization_state, voices.occlusion_state, voices.reverb_state];
        record.chain_id = params.effect_chain_id;
        record.submix_sends = sends.iter().map(|s| s.submix).collect();

        let mut format_buffers: [Option<Vec<f32>>; ChannelFormat::ALL.len()] = Default::default();
        let mut slot_sends = Vec::with_capacity(sends.len());
        for (send, format) in sends.iter().zip(formats) {
            if let Some(buffer) = record.format_buffer(format, block_frames) {
                format_buffers[format.index()] = Some(buffer);
            }
            slot_sends.push(SlotSubmixSend {
                submix: send.submix,
                level: send.level,
                format,
            });
        }

        let spatialized = voices.spatialization.is_some() && channels == 1 && !self.config.spatialization_is_external_send;
        let out_channels = if spatialized {
            self.plugins.spatialization_channels()
        } else {
            channels
        };

        let init = SourceInit {
            slot: SlotInit {
                handle,
                decoder: params.decoder,
                channels,
                out_channels,
                sample_rate: params.sample_rate,
                submix_sends: slot_sends,
                bus_id: params.bus_id,
                bus_duration_secs: params.bus_duration_secs,
                effects: params.effects,
                effect_chain_id: params.effect_chain_id,
                play_effect_tails: params.play_effect_tails,
                output_to_bus_only: params.output_to_bus_only,
                is_procedural: params.is_procedural,
                is_3d: params.is_3d,
                center_only: params.center_only,
                envelope_attack_ms: params.envelope_attack_ms,
                envelope_release_ms: params.envelope_release_ms,
                voices,
                format_buffers,
            },
            buses,
        };
        self.enqueue(move |graph| graph.sources.init_source(init));
        tracing::trace!(?handle, channels, "source init queued");
        Ok(())
    }

    /// Give the slot back. Stale or already released handles are ignored.
    pub fn release_source(&mut self, handle: SourceHandle) {
        let Some(released) = self.registry.release(handle) else {
            tracing::trace!(?handle, "release of stale handle ignored");
            return;
        };
        self.plugins.release_source(handle, released.plugin_states);
        if released.was_initialized {
            self.enqueue(move |graph| graph.sources.release_source(handle));
        }
    }

    pub fn play(&mut self, handle: SourceHandle) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.play(handle))
    }

    pub fn pause(&mut self, handle: SourceHandle) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.pause(handle))
    }

    pub fn resume(&mut self, handle: SourceHandle) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.resume(handle))
    }

    /// Silence the source from the next block on
    pub fn stop(&mut self, handle: SourceHandle) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.stop(handle))
    }

    /// Fade out over `fade_frames`, rounded up to a multiple of 4
    pub fn stop_with_fade(&mut self, handle: SourceHandle, fade_frames: usize) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.stop_with_fade(handle, fade_frames))
    }

    pub fn set_volume(&mut self, handle: SourceHandle, volume: f32) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.set_volume(handle, volume))
    }

    pub fn set_pitch(&mut self, handle: SourceHandle, pitch: f32) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.set_pitch(handle, pitch))
    }

    pub fn set_lpf_frequency(&mut self, handle: SourceHandle, frequency: f32) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.set_lpf_frequency(handle, frequency))
    }

    pub fn set_hpf_frequency(&mut self, handle: SourceHandle, frequency: f32) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.set_hpf_frequency(handle, frequency))
    }

    pub fn set_distance_attenuation(&mut self, handle: SourceHandle, attenuation: f32) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.set_distance_attenuation(handle, attenuation))
    }

    pub fn set_spatialization_params(&mut self, handle: SourceHandle, params: SpatializationParams) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.set_spatialization_params(handle, params))
    }

    /// Install an explicit gain matrix, `gains[in_ch * out_channels + out_ch]`
    pub fn set_channel_map(
        &mut self,
        handle: SourceHandle,
        format: ChannelFormat,
        gains: &[f32],
        is_3d: bool,
        center_only: bool,
    ) -> MixerResult<()> {
        let map = ChannelMap::new(gains).ok_or(MixerError::InvalidChannelCount {
            channels: gains.len(),
            max: MAX_CHANNELS * MAX_CHANNELS,
        })?;
        self.source_command(handle, move |sources| {
            sources.set_channel_map(handle, format, &map, is_3d, center_only)
        })
    }

    pub fn set_submix_send(&mut self, handle: SourceHandle, submix: SubmixId, level: f32) -> MixerResult<()> {
        let format = self.submixes.format(submix)?;
        let block_frames = self.config.block_frames;
        let record = self.registry.active(handle)?;
        let buffer = record.format_buffer(format, block_frames);
        if !record.submix_sends.contains(&submix) {
            record.submix_sends.push(submix);
        }
        let send = SlotSubmixSend { submix, level, format };
        self.enqueue(move |graph| graph.sources.set_submix_send(handle, send, buffer));
        Ok(())
    }

    pub fn clear_submix_send(&mut self, handle: SourceHandle, submix: SubmixId) -> MixerResult<()> {
        self.registry.active(handle)?.submix_sends.retain(|s| *s != submix);
        self.enqueue(move |graph| graph.sources.clear_submix_send(handle, submix));
        Ok(())
    }

    /// Feed a bus from this source; the bus is created on first use
    pub fn set_bus_send(&mut self, handle: SourceHandle, send: BusSend) -> MixerResult<()> {
        let spare = self.spare_bus(send.bus, send.channels);
        self.source_command(handle, move |sources| {
            sources.set_bus_send(handle, send.bus, send.stage, send.level, spare)
        })
    }

    pub fn clear_bus_send(&mut self, handle: SourceHandle, bus: BusId, stage: BusSendStage) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.clear_bus_send(handle, bus, stage))
    }

    pub fn set_source_effect_bypass(&mut self, handle: SourceHandle, index: usize, bypass: bool) -> MixerResult<()> {
        self.source_command(handle, move |sources| sources.set_effect_bypass(handle, index, bypass))
    }

    /// Rebuild the chain of every source using `chain_id`.
    ///
    /// `build` is called once per source. Returns the number of sources updated.
    pub fn update_source_effect_chain<F>(&mut self, chain_id: u32, mut build: F, play_tails: bool) -> usize
    where
        F: FnMut() -> Vec<SourceEffectSlot>,
    {
        let chains: Vec<(SourceHandle, Vec<SourceEffectSlot>)> = self
            .registry
            .using_chain(chain_id)
            .into_iter()
            .map(|handle| (handle, build()))
            .collect();
        let count = chains.len();
        if count > 0 {
            self.enqueue(move |graph| graph.sources.replace_effect_chain(chain_id, chains, play_tails));
        }
        count
    }

    // ---- read-backs ----

    pub fn num_frames_played(&self, handle: SourceHandle) -> u64 {
        if !self.registry.is_live(handle) {
            return 0;
        }
        self.telemetry.frames_played(handle)
    }

    /// Latest block-rate envelope of the source's post-effect signal
    pub fn envelope_value(&self, handle: SourceHandle) -> f32 {
        if !self.registry.is_live(handle) {
            return 0.0;
        }
        self.telemetry.envelope(handle)
    }

    pub fn needs_speaker_map(&self, handle: SourceHandle) -> bool {
        self.registry.is_live(handle) && self.telemetry.needs_speaker_map(handle)
    }

    pub fn is_done(&self, handle: SourceHandle) -> bool {
        self.registry.is_live(handle) && self.telemetry.is_done(handle)
    }

    /// Initialized slots as of the last rendered block
    pub fn num_active_sources(&self) -> usize {
        self.telemetry.active_sources()
    }

    pub fn num_active_buses(&self) -> usize {
        self.telemetry.active_buses()
    }

    /// Slots currently acquired on the control side
    pub fn num_acquired_sources(&self) -> usize {
        self.registry.num_acquired()
    }

    // ---- submixes ----

    pub fn register_submix(&mut self, settings: SubmixSettings) -> MixerResult<SubmixId> {
        let parent = settings.parent;
        let id = self.submixes.register(settings.format, parent, settings.endpoint)?;
        let node = Box::new(SubmixNode::new(id, settings, self.config.block_frames, self.device.current()));
        self.enqueue(move |graph| {
            let device_channels = graph.sources.context().device_channels;
            graph.submixes.insert(node, parent, device_channels, graph.sources.garbage());
        });
        tracing::debug!(submix = ?id, ?parent, "submix registration queued");
        Ok(id)
    }

    /// Remove a submix. Its children and the sources sending to it move to the master.
    pub fn unregister_submix(&mut self, id: SubmixId) -> MixerResult<()> {
        self.submixes.unregister(id)?;

        let block_frames = self.config.block_frames;
        let mut buffers = Vec::new();
        for handle in self.registry.sending_to(id) {
            let record = self.registry.active(handle)?;
            if let Some(buffer) = record.format_buffer(ChannelFormat::Device, block_frames) {
                buffers.push((handle, buffer));
            }
            record.submix_sends.retain(|s| *s != id);
            if !record.submix_sends.contains(&SubmixId::MASTER) {
                record.submix_sends.push(SubmixId::MASTER);
            }
        }

        self.enqueue(move |graph| {
            graph.submixes.remove(id, graph.sources.garbage());
            graph
                .sources
                .retarget_submix_sends(id, SubmixId::MASTER, ChannelFormat::Device, buffers);
        });
        Ok(())
    }

    pub fn set_submix_parent(&mut self, child: SubmixId, parent: SubmixId) -> MixerResult<()> {
        self.submixes.set_parent(child, parent)?;
        self.enqueue(move |graph| graph.submixes.set_parent(child, parent));
        Ok(())
    }

    pub fn submix_parent(&self, id: SubmixId) -> Option<SubmixId> {
        self.submixes.parent(id)
    }

    /// Submixes registered, master included
    pub fn num_submixes(&self) -> usize {
        self.submixes.len()
    }

    pub fn set_submix_effect_chain(&mut self, id: SubmixId, effects: Vec<SubmixEffectSlot>) -> MixerResult<()> {
        self.submix_command(id, move |node, garbage| node.replace_effects(effects, garbage))
    }

    pub fn set_submix_effect_bypass(&mut self, id: SubmixId, index: usize, bypass: bool) -> MixerResult<()> {
        self.submix_command(id, move |node, _| node.set_effect_bypass(index, bypass))
    }

    /// Fade the submix output to `volume` over one block
    pub fn set_submix_output_volume(&mut self, id: SubmixId, volume: f32) -> MixerResult<()> {
        self.submix_command(id, move |node, _| node.set_output_volume(volume))
    }

    fn submix_channels(&self, id: SubmixId) -> MixerResult<usize> {
        Ok(self.submixes.format(id)?.channels(self.device.current()))
    }

    /// Record the submix output into a ring of `capacity` samples.
    ///
    /// A new recording replaces the previous one.
    pub fn start_recording(&mut self, id: SubmixId, capacity: usize) -> MixerResult<SubmixReader> {
        let (tap, reader) = tap_channel(RECORDING_TAP, capacity, self.submix_channels(id)?);
        self.submix_command(id, move |node, garbage| {
            node.remove_tap(RECORDING_TAP, garbage);
            node.add_tap(tap, garbage);
        })?;
        Ok(reader)
    }

    pub fn stop_recording(&mut self, id: SubmixId) -> MixerResult<()> {
        self.submix_command(id, |node, garbage| node.remove_tap(RECORDING_TAP, garbage))
    }

    /// Listen to the raw submix output through a ring of `capacity` samples
    pub fn add_buffer_listener(&mut self, id: SubmixId, capacity: usize) -> MixerResult<(ListenerId, SubmixReader)> {
        let channels = self.submix_channels(id)?;
        let listener = self.submixes.next_listener();
        let (tap, reader) = tap_channel(listener.0, capacity, channels);
        self.submix_command(id, move |node, garbage| node.add_tap(tap, garbage))?;
        Ok((listener, reader))
    }

    pub fn remove_buffer_listener(&mut self, id: SubmixId, listener: ListenerId) -> MixerResult<()> {
        self.submix_command(id, move |node, garbage| node.remove_tap(listener.0, garbage))
    }

    /// Follow the per-channel envelope of the submix output
    pub fn start_envelope_following(&mut self, id: SubmixId, attack_ms: f32, release_ms: f32) -> MixerResult<Readout> {
        let readout = Readout::new(MAX_CHANNELS);
        let envelope = SubmixEnvelope::new(self.config.sample_rate, attack_ms, release_ms, readout.clone());
        self.submix_command(id, move |node, garbage| node.set_envelope(Some(envelope), garbage))?;
        Ok(readout)
    }

    pub fn stop_envelope_following(&mut self, id: SubmixId) -> MixerResult<()> {
        self.submix_command(id, |node, garbage| node.set_envelope(None, garbage))
    }

    /// Measure the magnitude at each of `frequencies` (Hz) every block
    pub fn start_spectrum_analysis(&mut self, id: SubmixId, frequencies: &[f32]) -> MixerResult<Readout> {
        let readout = Readout::new(frequencies.len());
        let analyzer = SpectrumAnalyzer::new(self.config.sample_rate as f32, frequencies);
        let spectrum = SubmixSpectrum::new(analyzer, readout.clone());
        self.submix_command(id, move |node, garbage| node.set_spectrum(Some(spectrum), garbage))?;
        Ok(readout)
    }

    pub fn stop_spectrum_analysis(&mut self, id: SubmixId) -> MixerResult<()> {
        self.submix_command(id, |node, garbage| node.set_spectrum(None, garbage))
    }

    // ---- device ----

    /// Latest device channel count, from this handle or the renderer
    #[inline]
    pub fn device_channels(&self) -> usize {
        self.device.current()
    }

    /// The output device now has `channels` channels
    pub fn notify_device_changed(&mut self, channels: usize) -> MixerResult<()> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(MixerError::InvalidChannelCount {
                channels,
                max: MAX_CHANNELS,
            });
        }
        self.device.request(channels);
        Ok(())
    }
}

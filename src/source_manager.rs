//! Source bookkeeping on both sides of the command queue.
//!
//! The control thread owns a [`SourceRegistry`]: the LIFO free list, the
//! generation of every index and whatever it needs to know to build commands
//! (which output formats a slot already has buffers for, which effect chain it
//! uses, which plugins enabled themselves for it).
//!
//! The render thread owns a [`SourcePool`]: the slots themselves, the buses,
//! and the per-block phases that turn commands into a rendered block of every
//! source. Results flow back through [`Telemetry`] atomics and an `rtrb` ring
//! of [`MixerEvent`]s.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::bus::{BusStore, MixerBus};
use crate::config::{MixerConfig, MAX_CHANNELS};
use crate::decoder::SourceDecoder;
use crate::effect::SourceEffectSlot;
use crate::error::{MixerError, MixerResult};
use crate::format::{ChannelFormat, ChannelMap};
use crate::garbage::{Garbage, GarbageSender};
use crate::plugin::{PluginState, SpatializationParams};
use crate::source::{
    BlockContext, BusId, BusSendStage, PlayState, SlotInit, SlotSubmixSend, SourceHandle, SourceSlot, EVENT_DONE,
    EVENT_NEEDS_SPEAKER_MAP, EVENT_TAILS_DONE,
};
use crate::submix::SubmixId;

/// Notifications from the render thread, read with
/// [`MixerHandle::poll_events`](crate::MixerHandle::poll_events)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixerEvent {
    /// The source played its last buffer and its effect tails decayed
    SourceDone(SourceHandle),
    /// The source's effect tails fell below the silence threshold
    EffectTailsDone(SourceHandle),
    /// A 3D source has no usable channel map for the current device
    NeedsSpeakerMap(SourceHandle),
    /// A command reached a slot that was already released or reused
    CommandDropped(SourceHandle),
}

// ---- control side ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotStatus {
    Free,
    /// Acquired, `init_source` not called yet
    Initializing,
    Active,
}

pub(crate) struct SlotRecord {
    status: SlotStatus,
    generation: u32,
    pub chain_id: Option<u32>,
    pub plugin_states: [PluginState; 3],
    /// Formats the render-side slot already holds a buffer for, one bit per format
    allocated_formats: u8,
    pub submix_sends: Vec<SubmixId>,
}

impl SlotRecord {
    /// A fresh output buffer for `format`, unless the slot already has one
    pub fn format_buffer(&mut self, format: ChannelFormat, block_frames: usize) -> Option<Vec<f32>> {
        let bit = 1 << format.index();
        if self.allocated_formats & bit != 0 {
            return None;
        }
        self.allocated_formats |= bit;
        Some(vec![0.0; block_frames * MAX_CHANNELS])
    }
}

/// What the control thread must still do after freeing an index
pub(crate) struct Released {
    pub plugin_states: [PluginState; 3],
    /// The render thread holds state for this slot
    pub was_initialized: bool,
}

/// Control-thread view of the slot pool
pub(crate) struct SourceRegistry {
    records: Vec<SlotRecord>,
    free: Vec<u32>,
}

impl SourceRegistry {
    pub fn new(capacity: usize) -> Self {
        let records = (0..capacity)
            .map(|_| SlotRecord {
                status: SlotStatus::Free,
                generation: 0,
                chain_id: None,
                plugin_states: [PluginState::Absent; 3],
                allocated_formats: 0,
                submix_sends: Vec::new(),
            })
            .collect();
        Self {
            records,
            free: (0..capacity as u32).rev().collect(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Slots currently acquired
    #[inline]
    pub fn num_acquired(&self) -> usize {
        self.records.len() - self.free.len()
    }

    pub fn acquire(&mut self) -> MixerResult<SourceHandle> {
        let index = self.free.pop().ok_or(MixerError::NoFreeSource {
            capacity: self.capacity(),
        })?;
        let record = &mut self.records[index as usize];
        record.status = SlotStatus::Initializing;
        Ok(SourceHandle::new(index, record.generation))
    }

    fn live(&mut self, handle: SourceHandle) -> MixerResult<&mut SlotRecord> {
        match self.records.get_mut(handle.index()) {
            Some(record) if record.generation == handle.generation() && record.status != SlotStatus::Free => {
                Ok(record)
            }
            _ => Err(MixerError::StaleSource(handle)),
        }
    }

    /// Whether `handle` still refers to its acquisition
    pub fn is_live(&self, handle: SourceHandle) -> bool {
        self.records
            .get(handle.index())
            .is_some_and(|r| r.generation == handle.generation() && r.status != SlotStatus::Free)
    }

    /// The record of an initialized source
    pub fn active(&mut self, handle: SourceHandle) -> MixerResult<&mut SlotRecord> {
        let record = self.live(handle)?;
        if record.status != SlotStatus::Active {
            return Err(MixerError::NotInitialized(handle));
        }
        Ok(record)
    }

    /// Mark an acquired source initialized
    pub fn begin_init(&mut self, handle: SourceHandle) -> MixerResult<&mut SlotRecord> {
        let record = self.live(handle)?;
        if record.status == SlotStatus::Active {
            return Err(MixerError::AlreadyInitialized(handle));
        }
        record.status = SlotStatus::Active;
        Ok(record)
    }

    /// Free the index and bump its generation. `None` for a stale handle.
    pub fn release(&mut self, handle: SourceHandle) -> Option<Released> {
        let record = self.live(handle).ok()?;
        let released = Released {
            plugin_states: record.plugin_states,
            was_initialized: record.status == SlotStatus::Active,
        };
        record.status = SlotStatus::Free;
        record.generation = record.generation.wrapping_add(1);
        record.chain_id = None;
        record.plugin_states = [PluginState::Absent; 3];
        record.submix_sends.clear();
        self.free.push(handle.index() as u32);
        Some(released)
    }

    /// Active sources using effect chain `chain_id`
    pub fn using_chain(&self, chain_id: u32) -> Vec<SourceHandle> {
        self.active_handles()
            .filter(|(_, r)| r.chain_id == Some(chain_id))
            .map(|(h, _)| h)
            .collect()
    }

    /// Active sources with a send to `submix`
    pub fn sending_to(&self, submix: SubmixId) -> Vec<SourceHandle> {
        self.active_handles()
            .filter(|(_, r)| r.submix_sends.contains(&submix))
            .map(|(h, _)| h)
            .collect()
    }

    fn active_handles(&self) -> impl Iterator<Item = (SourceHandle, &SlotRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == SlotStatus::Active)
            .map(|(i, r)| (SourceHandle::new(i as u32, r.generation), r))
    }
}

// ---- read-backs ----

#[derive(Default)]
struct SlotTelemetry {
    generation: AtomicU32,
    frames_played: AtomicU64,
    envelope: AtomicU32,
    done: AtomicBool,
    needs_speaker_map: AtomicBool,
}

/// Values the render thread publishes once per block
pub(crate) struct Telemetry {
    slots: Box<[SlotTelemetry]>,
    active_sources: AtomicUsize,
    active_buses: AtomicUsize,
}

impl Telemetry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| SlotTelemetry::default()).collect(),
            active_sources: AtomicUsize::new(0),
            active_buses: AtomicUsize::new(0),
        }
    }

    fn slot(&self, handle: SourceHandle) -> Option<&SlotTelemetry> {
        self.slots
            .get(handle.index())
            .filter(|t| t.generation.load(Ordering::Acquire) == handle.generation())
    }

    pub fn frames_played(&self, handle: SourceHandle) -> u64 {
        self.slot(handle).map_or(0, |t| t.frames_played.load(Ordering::Relaxed))
    }

    pub fn envelope(&self, handle: SourceHandle) -> f32 {
        self.slot(handle)
            .map_or(0.0, |t| f32::from_bits(t.envelope.load(Ordering::Relaxed)))
    }

    pub fn is_done(&self, handle: SourceHandle) -> bool {
        self.slot(handle).is_some_and(|t| t.done.load(Ordering::Relaxed))
    }

    pub fn needs_speaker_map(&self, handle: SourceHandle) -> bool {
        self.slot(handle)
            .is_some_and(|t| t.needs_speaker_map.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn active_sources(&self) -> usize {
        self.active_sources.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn active_buses(&self) -> usize {
        self.active_buses.load(Ordering::Relaxed)
    }

    fn publish(&self, slot: &SourceSlot) {
        let Some(t) = self.slots.get(slot.handle.index()) else {
            return;
        };
        t.frames_played.store(slot.frames_played, Ordering::Relaxed);
        t.envelope.store(slot.envelope_value().to_bits(), Ordering::Relaxed);
        t.done.store(slot.state == PlayState::Done, Ordering::Relaxed);
        t.needs_speaker_map.store(slot.needs_speaker_map, Ordering::Relaxed);
        t.generation.store(slot.handle.generation(), Ordering::Release);
    }
}

// ---- render side ----

/// A bus a newly initialized source sends to or plays, with a spare in case it does not exist
pub(crate) struct BusAttachment {
    pub bus: BusId,
    /// `None` when the source *is* a bus source for this bus
    pub stage: Option<BusSendStage>,
    pub level: f32,
    pub spare: Box<MixerBus>,
}

/// Everything an `init_source` command carries
pub(crate) struct SourceInit {
    pub slot: SlotInit,
    pub buses: Vec<BusAttachment>,
}

pub(crate) fn event_channel(capacity: usize) -> (Producer<MixerEvent>, Consumer<MixerEvent>) {
    RingBuffer::new(capacity)
}

/// Render-thread owner of every source slot and bus
pub(crate) struct SourcePool {
    slots: Vec<SourceSlot>,
    buses: BusStore,
    pending_cleanup: Vec<Box<dyn SourceDecoder>>,
    garbage: GarbageSender,
    events: Producer<MixerEvent>,
    telemetry: Arc<Telemetry>,
    ctx: BlockContext,
    workers: Option<rayon::ThreadPool>,
}

impl SourcePool {
    pub fn new(
        config: &MixerConfig,
        spatialization_channels: usize,
        garbage: GarbageSender,
        events: Producer<MixerEvent>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let slots = (0..config.max_sources as u32)
            .map(|i| SourceSlot::new(i, config.block_frames, config.sample_rate))
            .collect();

        let workers = match config.source_workers {
            0 => None,
            n => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .thread_name(|i| format!("mischpult-source-{i}"))
                .build()
                .map_err(|e| tracing::warn!("source worker pool unavailable, rendering inline: {e}"))
                .ok(),
        };

        Self {
            slots,
            buses: BusStore::with_capacity(config.max_sources),
            pending_cleanup: Vec::with_capacity(config.max_sources),
            garbage,
            events,
            telemetry,
            ctx: BlockContext {
                frames: config.block_frames,
                sample_rate: config.sample_rate,
                device_channels: config.device_channels,
                toggles: config.toggles,
                spatialization_is_external_send: config.spatialization_is_external_send,
                reverb_is_external_send: config.reverb_is_external_send,
                spatialization_channels,
            },
            workers,
        }
    }

    #[inline]
    pub fn context(&self) -> &BlockContext {
        &self.ctx
    }

    #[inline]
    pub fn slots(&self) -> &[SourceSlot] {
        &self.slots
    }

    #[inline]
    pub fn buses(&self) -> &BusStore {
        &self.buses
    }

    #[inline]
    pub fn garbage(&mut self) -> &mut GarbageSender {
        &mut self.garbage
    }

    fn emit(&mut self, event: MixerEvent) {
        if self.events.push(event).is_err() {
            tracing::warn!(?event, "event ring full, event dropped");
        }
    }

    /// The slot `handle` names, if it still does
    fn slot_mut(&mut self, handle: SourceHandle) -> Option<&mut SourceSlot> {
        let live = self.slots.get(handle.index()).is_some_and(|s| s.matches(handle));
        if !live {
            tracing::debug!(?handle, "dropping command for stale source");
            self.emit(MixerEvent::CommandDropped(handle));
            return None;
        }
        self.slots.get_mut(handle.index())
    }

    // ---- commands ----

    pub fn init_source(&mut self, init: SourceInit) {
        let SourceInit { slot: slot_init, mut buses } = init;
        let index = slot_init.handle.index();
        let Some(slot) = self.slots.get_mut(index) else {
            tracing::warn!(handle = ?slot_init.handle, "init for out-of-range slot ignored");
            return;
        };
        if slot.state.is_initialized() {
            tracing::warn!(handle = ?slot.handle, "slot re-initialized before release, releasing first");
            let old = slot.handle;
            self.release_source(old);
        }

        let (block_frames, sample_rate) = (self.ctx.frames, self.ctx.sample_rate);
        let slot = &mut self.slots[index];
        slot.init(slot_init, block_frames, sample_rate, &mut self.garbage);

        for attachment in buses.drain(..) {
            let Some(bus) = self
                .buses
                .get_or_insert(attachment.bus, Some(attachment.spare), &mut self.garbage)
            else {
                continue;
            };
            match attachment.stage {
                None => bus.add_instance(index as u32),
                Some(stage) => {
                    if bus.add_send(stage, index as u32, attachment.level) {
                        let slot = &mut self.slots[index];
                        match stage {
                            BusSendStage::PreEffect => slot.pre_effect_sends += 1,
                            BusSendStage::PostEffect => slot.post_effect_sends += 1,
                        }
                    }
                }
            }
        }
        self.telemetry.publish(&self.slots[index]);
        if buses.capacity() > 0 {
            self.garbage.dispose(Garbage::BusAttachments(buses));
        }
    }

    pub fn release_source(&mut self, handle: SourceHandle) {
        if self.slot_mut(handle).is_none() {
            return;
        }
        let decoder = self.slots[handle.index()].release(&mut self.garbage);
        self.buses.forget_source(handle.index() as u32);

        if let Some(decoder) = decoder {
            if decoder.is_async_work_done() {
                self.garbage.dispose(Garbage::Decoder(decoder));
            } else {
                tracing::trace!(?handle, "decoder parked until async work completes");
                self.pending_cleanup.push(decoder);
            }
        }
        if let Some(t) = self.telemetry.slots.get(handle.index()) {
            t.done.store(false, Ordering::Relaxed);
        }
    }

    pub fn play(&mut self, handle: SourceHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.play();
        }
    }

    pub fn pause(&mut self, handle: SourceHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.pause();
        }
    }

    pub fn resume(&mut self, handle: SourceHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.resume();
        }
    }

    pub fn stop(&mut self, handle: SourceHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.stop();
        }
    }

    pub fn stop_with_fade(&mut self, handle: SourceHandle, fade_frames: usize) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.stop_with_fade(fade_frames);
        }
    }

    pub fn set_volume(&mut self, handle: SourceHandle, volume: f32) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.set_volume(volume);
        }
    }

    pub fn set_pitch(&mut self, handle: SourceHandle, pitch: f32) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.set_pitch(pitch);
        }
    }

    pub fn set_lpf_frequency(&mut self, handle: SourceHandle, frequency: f32) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.set_lpf_frequency(frequency);
        }
    }

    pub fn set_hpf_frequency(&mut self, handle: SourceHandle, frequency: f32) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.set_hpf_frequency(frequency);
        }
    }

    pub fn set_distance_attenuation(&mut self, handle: SourceHandle, attenuation: f32) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.set_distance_attenuation(attenuation);
        }
    }

    pub fn set_spatialization_params(&mut self, handle: SourceHandle, params: SpatializationParams) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.set_spatialization_params(params);
        }
    }

    pub fn set_channel_map(
        &mut self,
        handle: SourceHandle,
        format: ChannelFormat,
        map: &ChannelMap,
        is_3d: bool,
        center_only: bool,
    ) {
        let device_channels = self.ctx.device_channels;
        if let Some(slot) = self.slot_mut(handle) {
            slot.set_channel_map(format, map, is_3d, center_only, device_channels);
        }
    }

    pub fn set_submix_send(&mut self, handle: SourceHandle, send: SlotSubmixSend, buffer: Option<Vec<f32>>) {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.matches(handle) => slot.set_submix_send(send, buffer, &mut self.garbage),
            _ => {
                self.garbage.dispose_opt(buffer, Garbage::Samples);
                self.emit(MixerEvent::CommandDropped(handle));
            }
        }
    }

    pub fn clear_submix_send(&mut self, handle: SourceHandle, submix: SubmixId) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.clear_submix_send(submix);
        }
    }

    /// `removed` is gone: its senders now feed `to`, buffers for `format` shipped alongside
    pub fn retarget_submix_sends(
        &mut self,
        removed: SubmixId,
        to: SubmixId,
        format: ChannelFormat,
        mut buffers: Vec<(SourceHandle, Vec<f32>)>,
    ) {
        for (handle, buffer) in buffers.drain(..) {
            match self.slots.get_mut(handle.index()) {
                Some(slot) if slot.matches(handle) => slot.install_format_buffer(format, buffer, &mut self.garbage),
                _ => self.garbage.dispose(Garbage::Samples(buffer)),
            }
        }
        for slot in self.slots.iter_mut().filter(|s| s.state.is_initialized()) {
            slot.retarget_submix_send(removed, to, format);
        }
        if buffers.capacity() > 0 {
            self.garbage.dispose(Garbage::FormatBuffers(buffers));
        }
    }

    pub fn set_bus_send(
        &mut self,
        handle: SourceHandle,
        bus: BusId,
        stage: BusSendStage,
        level: f32,
        spare: Box<MixerBus>,
    ) {
        if self.slot_mut(handle).is_none() {
            self.garbage.dispose(Garbage::Bus(spare));
            return;
        }
        let index = handle.index();
        let Some(bus) = self.buses.get_or_insert(bus, Some(spare), &mut self.garbage) else {
            return;
        };
        if bus.add_send(stage, index as u32, level) {
            let slot = &mut self.slots[index];
            match stage {
                BusSendStage::PreEffect => slot.pre_effect_sends += 1,
                BusSendStage::PostEffect => slot.post_effect_sends += 1,
            }
        }
    }

    pub fn clear_bus_send(&mut self, handle: SourceHandle, bus: BusId, stage: BusSendStage) {
        if self.slot_mut(handle).is_none() {
            return;
        }
        let index = handle.index();
        let removed = self
            .buses
            .get_mut(bus)
            .is_some_and(|b| b.remove_send(stage, index as u32));
        if removed {
            let slot = &mut self.slots[index];
            match stage {
                BusSendStage::PreEffect => slot.pre_effect_sends = slot.pre_effect_sends.saturating_sub(1),
                BusSendStage::PostEffect => slot.post_effect_sends = slot.post_effect_sends.saturating_sub(1),
            }
        }
    }

    pub fn set_effect_bypass(&mut self, handle: SourceHandle, index: usize, bypass: bool) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.set_effect_bypass(index, bypass);
        }
    }

    /// Install rebuilt chains on every slot that used `chain_id`
    pub fn replace_effect_chain(
        &mut self,
        chain_id: u32,
        mut chains: Vec<(SourceHandle, Vec<SourceEffectSlot>)>,
        play_tails: bool,
    ) {
        for (handle, effects) in chains.drain(..) {
            match self.slots.get_mut(handle.index()) {
                Some(slot) if slot.matches(handle) && slot.effect_chain_id == Some(chain_id) => {
                    slot.replace_effects(effects, play_tails, &mut self.garbage)
                }
                _ => self.garbage.dispose(Garbage::SourceEffects(effects)),
            }
        }
        if chains.capacity() > 0 {
            self.garbage.dispose(Garbage::EffectChains(chains));
        }
    }

    /// The device now has `channels` outputs
    pub fn set_device_channels(&mut self, channels: usize) {
        self.ctx.device_channels = channels;
        for slot in self.slots.iter_mut().filter(|s| s.state.is_initialized()) {
            slot.on_device_channels_changed(channels);
        }
    }

    // ---- per block ----

    /// Phases 2 to 7 of a block; the command queue was drained just before
    pub fn compute_next_block(&mut self) {
        self.poll_pending_cleanup();
        for slot in self.slots.iter_mut() {
            slot.check_begin_destroy();
        }

        self.render_sources(false);
        self.buses.mix_all(&self.slots);
        self.render_sources(true);
        self.buses.update_all();
        self.buses.remove_unused(&mut self.garbage);

        self.finish_block();
    }

    fn poll_pending_cleanup(&mut self) {
        let mut i = 0;
        while i < self.pending_cleanup.len() {
            if self.pending_cleanup[i].is_async_work_done() {
                let decoder = self.pending_cleanup.swap_remove(i);
                self.garbage.dispose(Garbage::Decoder(decoder));
            } else {
                i += 1;
            }
        }
    }

    /// Wait for every parked decoder. Only for shutdown.
    pub fn flush_pending_cleanup(&mut self) {
        for mut decoder in self.pending_cleanup.drain(..) {
            decoder.finish_async_work();
            self.garbage.dispose(Garbage::Decoder(decoder));
        }
    }

    fn render_sources(&mut self, bus_sources: bool) {
        let ctx = self.ctx;
        let buses = &self.buses;
        let render = |slot: &mut SourceSlot| {
            if slot.bus_id.is_some() == bus_sources {
                slot.render(&ctx, buses);
            }
        };

        match &self.workers {
            Some(pool) => {
                let partition = self.slots.len().div_ceil(pool.current_num_threads()).max(1);
                let slots = &mut self.slots;
                pool.install(|| {
                    slots
                        .par_chunks_mut(partition)
                        .for_each(|chunk| chunk.iter_mut().for_each(render))
                });
            }
            None => self.slots.iter_mut().for_each(render),
        }
    }

    fn finish_block(&mut self) {
        let mut active = 0;
        for i in 0..self.slots.len() {
            let slot = &mut self.slots[i];
            if !slot.state.is_initialized() {
                continue;
            }
            active += 1;
            slot.try_finish();
            let events = slot.take_events();
            let handle = slot.handle;
            self.telemetry.publish(&self.slots[i]);

            if events & EVENT_TAILS_DONE != 0 {
                self.emit(MixerEvent::EffectTailsDone(handle));
            }
            if events & EVENT_DONE != 0 {
                self.emit(MixerEvent::SourceDone(handle));
            }
            if events & EVENT_NEEDS_SPEAKER_MAP != 0 {
                self.emit(MixerEvent::NeedsSpeakerMap(handle));
            }
        }
        self.telemetry.active_sources.store(active, Ordering::Relaxed);
        self.telemetry.active_buses.store(self.buses.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_list_is_lifo_and_handles_are_unique() {
        let mut registry = SourceRegistry::new(3);
        let a = registry.acquire().unwrap();
        let b = registry.acquire().unwrap();
        let c = registry.acquire().unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert_eq!(registry.acquire(), Err(MixerError::NoFreeSource { capacity: 3 }));

        assert!(registry.release(b).is_some());
        let d = registry.acquire().unwrap();
        assert_eq!(d.index(), b.index());
        assert_ne!(d.generation(), b.generation());
    }

    #[test]
    fn release_is_idempotent_and_stale_handles_are_rejected() {
        let mut registry = SourceRegistry::new(2);
        let handle = registry.acquire().unwrap();
        assert_eq!(registry.active(handle).err(), Some(MixerError::NotInitialized(handle)));
        registry.begin_init(handle).unwrap();
        assert_eq!(registry.begin_init(handle).err(), Some(MixerError::AlreadyInitialized(handle)));

        assert!(registry.release(handle).is_some());
        assert!(registry.release(handle).is_none());
        assert_eq!(registry.active(handle).err(), Some(MixerError::StaleSource(handle)));
        assert_eq!(registry.num_acquired(), 0);
    }

    #[test]
    fn format_buffers_are_shipped_once_per_index() {
        let mut registry = SourceRegistry::new(1);
        let handle = registry.acquire().unwrap();
        let record = registry.begin_init(handle).unwrap();
        assert!(record.format_buffer(ChannelFormat::Stereo, 16).is_some());
        assert!(record.format_buffer(ChannelFormat::Stereo, 16).is_none());
        registry.release(handle);

        let handle = registry.acquire().unwrap();
        let record = registry.begin_init(handle).unwrap();
        assert!(record.format_buffer(ChannelFormat::Stereo, 16).is_none());
        assert_eq!(
            record.format_buffer(ChannelFormat::Mono, 16).map(|b| b.len()),
            Some(16 * MAX_CHANNELS)
        );
    }

    #[test]
    fn telemetry_ignores_other_generations() {
        let telemetry = Telemetry::new(1);
        let slot = SourceSlot::new(0, 16, 48_000);
        telemetry.publish(&slot);
        assert_eq!(telemetry.frames_played(SourceHandle::new(0, 0)), 0);
        assert!(!telemetry.is_done(SourceHandle::new(0, 1)));
        assert_eq!(telemetry.active_sources(), 0);
    }
}

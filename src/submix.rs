//! The submix tree.
//!
//! Submixes form a tree rooted at [`SubmixId::MASTER`]. Every block the tree
//! is evaluated post-order: a node first renders its children, each of which
//! converts its own output into the node's [`ChannelFormat`], then mixes in
//! the sources that send to it, runs its effect chain, fades its output
//! volume, feeds its taps and meters, and finally converts the result into
//! its parent's format.
//!
//! Endpoint submixes have no parent. Their output is summed into the device
//! buffer next to the master's.
//!
//! The render-side tree lives in a `petgraph` [`StableGraph`] with edges
//! pointing from parent to child, so node indices stay valid while submixes
//! come and go.

use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::Direction;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::config::MAX_CHANNELS;
use crate::dsp::buffer::{apply_channel_map, apply_gain_ramp, mix_in, silence};
use crate::dsp::{EnvelopeFollower, Ramp, SpectrumAnalyzer};
use crate::error::{MixerError, MixerResult};
use crate::effect::{EffectContext, SubmixEffectSlot};
use crate::format::{fill_channel_map, ChannelFormat, FirstOrderAmbisonics, SoundfieldCodec};
use crate::garbage::{Garbage, GarbageSender};
use crate::source::{BlockContext, SourceSlot};

/// Opaque identifier of a submix, never reused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmixId(u32);

impl SubmixId {
    /// Root of the tree, always present
    pub const MASTER: SubmixId = SubmixId(0);

    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// How a submix is created by [`MixerHandle::register_submix`](crate::MixerHandle::register_submix).
///
/// # Example
///
/// ```
/// use mischpult::effect::{Gain, SubmixEffectSlot};
/// use mischpult::format::ChannelFormat;
/// use mischpult::submix::{SubmixId, SubmixSettings};
///
/// let settings = SubmixSettings::new(ChannelFormat::Stereo)
///     .with_parent(SubmixId::MASTER)
///     .with_effect(SubmixEffectSlot::new(Gain::new(0.5)).with_dry_level(0.25))
///     .with_output_volume(0.8);
/// assert_eq!(settings.format(), ChannelFormat::Stereo);
/// ```
pub struct SubmixSettings {
    pub(crate) format: ChannelFormat,
    pub(crate) parent: Option<SubmixId>,
    pub(crate) endpoint: bool,
    pub(crate) output_volume: f32,
    pub(crate) effects: Vec<SubmixEffectSlot>,
    pub(crate) codec: Option<Box<dyn SoundfieldCodec>>,
}

impl SubmixSettings {
    pub fn new(format: ChannelFormat) -> Self {
        Self {
            format,
            parent: None,
            endpoint: false,
            output_volume: 1.0,
            effects: Vec::new(),
            codec: None,
        }
    }

    #[inline]
    pub fn format(&self) -> ChannelFormat {
        self.format
    }

    /// Attach under `parent` instead of the master (builder pattern)
    pub fn with_parent(mut self, parent: SubmixId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Bypass the master and sum straight into the device output (builder pattern)
    pub fn as_endpoint(mut self) -> Self {
        self.endpoint = true;
        self
    }

    pub fn with_output_volume(mut self, volume: f32) -> Self {
        self.output_volume = volume.max(0.0);
        self
    }

    pub fn with_effect(mut self, effect: SubmixEffectSlot) -> Self {
        self.effects.push(effect);
        self
    }

    /// Use `codec` for soundfield conversions instead of first-order ambisonics
    pub fn with_codec<C: SoundfieldCodec + 'static>(mut self, codec: C) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }
}

/// Lock-free values published by the render thread.
///
/// Used for submix envelopes (one value per channel) and spectrum bands.
#[derive(Clone, Debug)]
pub struct Readout {
    values: Arc<[AtomicU32]>,
}

impl Readout {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            values: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Latest value at `index`, 0.0 if out of range
    pub fn get(&self, index: usize) -> f32 {
        self.values
            .get(index)
            .map_or(0.0, |v| f32::from_bits(v.load(Ordering::Relaxed)))
    }

    pub fn to_vec(&self) -> Vec<f32> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    pub(crate) fn publish(&self, values: &[f32]) {
        for (slot, value) in self.values.iter().zip(values) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }
}

/// Render-side end of a buffer tap
pub(crate) struct Tap {
    pub id: u32,
    producer: Producer<f32>,
}

impl Tap {
    /// Push as many samples as fit; returns the number written
    fn write(&mut self, samples: &[f32]) -> usize {
        let n = self.producer.slots().min(samples.len());
        if n == 0 {
            return 0;
        }
        match self.producer.write_chunk_uninit(n) {
            Ok(chunk) => chunk.fill_from_iter(samples.iter().copied()),
            Err(_) => 0,
        }
    }
}

/// Reads the raw output of a submix, as recorded or listened to.
///
/// Samples are interleaved in the submix's own channel format.
pub struct SubmixReader {
    consumer: Consumer<f32>,
    channels: usize,
}

impl SubmixReader {
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples ready to be read
    #[inline]
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    /// Copy up to `out.len()` samples; returns the number read
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let n = self.consumer.slots().min(out.len());
        match self.consumer.read_chunk(n) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out[..first.len()].copy_from_slice(first);
                out[first.len()..first.len() + second.len()].copy_from_slice(second);
                chunk.commit_all();
                n
            }
            Err(_) => 0,
        }
    }

    /// The submix stopped feeding this reader
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }
}

pub(crate) fn tap_channel(id: u32, capacity: usize, channels: usize) -> (Tap, SubmixReader) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (Tap { id, producer }, SubmixReader { consumer, channels })
}

/// Per-channel envelope meter of a submix
pub(crate) struct SubmixEnvelope {
    followers: [EnvelopeFollower; MAX_CHANNELS],
    values: [f32; MAX_CHANNELS],
    readout: Readout,
}

impl SubmixEnvelope {
    pub fn new(sample_rate: u32, attack_ms: f32, release_ms: f32, readout: Readout) -> Self {
        Self {
            followers: core::array::from_fn(|_| EnvelopeFollower::new(sample_rate as f32, attack_ms, release_ms)),
            values: [0.0; MAX_CHANNELS],
            readout,
        }
    }

    fn process(&mut self, buffer: &[f32], channels: usize) {
        for frame in buffer.chunks_exact(channels) {
            for (follower, sample) in self.followers.iter_mut().zip(frame) {
                follower.process(*sample);
            }
        }
        for (value, follower) in self.values.iter_mut().zip(&self.followers).take(channels) {
            *value = follower.value();
        }
        self.readout.publish(&self.values[..channels]);
    }
}

/// Band magnitudes of a submix
pub(crate) struct SubmixSpectrum {
    analyzer: SpectrumAnalyzer,
    magnitudes: Vec<f32>,
    readout: Readout,
}

impl SubmixSpectrum {
    pub fn new(analyzer: SpectrumAnalyzer, readout: Readout) -> Self {
        let magnitudes = vec![0.0; analyzer.frequencies().len()];
        Self {
            analyzer,
            magnitudes,
            readout,
        }
    }
}

/// A submix as owned by the render thread
pub(crate) struct SubmixNode {
    id: SubmixId,
    format: ChannelFormat,
    channels: usize,
    endpoint: bool,
    codec: Box<dyn SoundfieldCodec>,
    effects: Vec<SubmixEffectSlot>,
    volume: Ramp,
    mix: Vec<f32>,
    dry: Vec<f32>,
    downmix: Vec<f32>,
    output: Vec<f32>,
    output_channels: usize,
    children: Vec<NodeIndex>,
    taps: Vec<Tap>,
    envelope: Option<SubmixEnvelope>,
    spectrum: Option<SubmixSpectrum>,
}

const MAX_TAPS: usize = 8;

impl SubmixNode {
    /// Build a node on the control thread, buffers sized for `block_frames`
    pub fn new(id: SubmixId, settings: SubmixSettings, block_frames: usize, device_channels: usize) -> Self {
        let len = block_frames * MAX_CHANNELS;
        let mut volume = Ramp::unset(1.0);
        volume.set_target(settings.output_volume);
        Self {
            id,
            format: settings.format,
            channels: settings.format.channels(device_channels),
            endpoint: settings.endpoint,
            codec: settings.codec.unwrap_or_else(|| Box::new(FirstOrderAmbisonics)),
            effects: settings.effects,
            volume,
            mix: vec![0.0; len],
            dry: vec![0.0; len],
            downmix: vec![0.0; block_frames * 2],
            output: vec![0.0; len],
            output_channels: 0,
            children: Vec::with_capacity(16),
            taps: Vec::with_capacity(MAX_TAPS),
            envelope: None,
            spectrum: None,
        }
    }

    #[inline]
    pub fn id(&self) -> SubmixId {
        self.id
    }

    #[inline]
    pub fn format(&self) -> ChannelFormat {
        self.format
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Converted output of the last block, with its channel count
    #[inline]
    pub fn output(&self, frames: usize) -> (&[f32], usize) {
        (&self.output[..frames * self.output_channels], self.output_channels)
    }

    pub fn set_output_volume(&mut self, volume: f32) {
        self.volume.set_target(volume.max(0.0));
    }

    pub fn set_effect_bypass(&mut self, index: usize, bypass: bool) {
        match self.effects.get_mut(index) {
            Some(slot) => slot.bypass = bypass,
            None => tracing::debug!(submix = ?self.id, index, "effect bypass for missing submix effect ignored"),
        }
    }

    pub fn replace_effects(&mut self, effects: Vec<SubmixEffectSlot>, garbage: &mut GarbageSender) {
        let old = mem::replace(&mut self.effects, effects);
        if old.capacity() > 0 {
            garbage.dispose(Garbage::SubmixEffects(old));
        }
    }

    pub fn add_tap(&mut self, tap: Tap, garbage: &mut GarbageSender) {
        if self.taps.len() >= MAX_TAPS {
            tracing::warn!(submix = ?self.id, "submix tap limit reached, tap dropped");
            garbage.dispose(Garbage::Tap(tap));
            return;
        }
        self.taps.push(tap);
    }

    pub fn remove_tap(&mut self, id: u32, garbage: &mut GarbageSender) {
        if let Some(pos) = self.taps.iter().position(|t| t.id == id) {
            garbage.dispose(Garbage::Tap(self.taps.swap_remove(pos)));
        }
    }

    pub fn set_envelope(&mut self, envelope: Option<SubmixEnvelope>, garbage: &mut GarbageSender) {
        let old = mem::replace(&mut self.envelope, envelope);
        garbage.dispose_opt(old, Garbage::Envelope);
    }

    pub fn set_spectrum(&mut self, spectrum: Option<SubmixSpectrum>, garbage: &mut GarbageSender) {
        let old = mem::replace(&mut self.spectrum, spectrum);
        garbage.dispose_opt(old, Garbage::Spectrum);
    }

    fn on_device_channels_changed(&mut self, device_channels: usize) {
        self.channels = self.format.channels(device_channels);
    }

    /// Everything after the children were mixed in
    fn render(&mut self, slots: &[SourceSlot], ctx: &BlockContext, parent_format: ChannelFormat) {
        let frames = ctx.frames;
        let ch = self.channels;
        let len = frames * ch;

        for slot in slots {
            if !slot.state.is_audible() || slot.output_to_bus_only {
                continue;
            }
            let Some(level) = slot.submix_send_level(self.id) else {
                continue;
            };
            match slot.output(self.format) {
                Some((buffer, channels)) if channels == ch => mix_in(&mut self.mix[..len], &buffer[..len], level),
                Some((_, channels)) => {
                    tracing::trace!(submix = ?self.id, channels, expected = ch, "source output skipped, channel mismatch")
                }
                None => {}
            }
        }

        self.process_effects(ctx);

        apply_gain_ramp(&mut self.mix[..len], ch, self.volume.start(), self.volume.target());
        self.volume.finish_block();

        for tap in self.taps.iter_mut() {
            let written = tap.write(&self.mix[..len]);
            if written < len {
                tracing::trace!(submix = ?self.id, tap = tap.id, dropped = len - written, "submix tap overrun");
            }
        }
        if let Some(envelope) = self.envelope.as_mut() {
            envelope.process(&self.mix[..len], ch);
        }
        if let Some(spectrum) = self.spectrum.as_mut() {
            spectrum.analyzer.analyze(&self.mix[..len], ch, &mut spectrum.magnitudes);
            spectrum.readout.publish(&spectrum.magnitudes);
        }

        self.convert(parent_format, ctx);
    }

    fn process_effects(&mut self, ctx: &BlockContext) {
        let frames = ctx.frames;
        let ch = self.channels;
        let len = frames * ch;
        let downmix_allowed = ch != 2 && !self.format.is_soundfield();

        for slot in self.effects.iter_mut().filter(|slot| !slot.bypass) {
            let dry_level = slot.dry_level;
            if dry_level > 0.0 {
                self.dry[..len].copy_from_slice(&self.mix[..len]);
            }

            if downmix_allowed && slot.effect.wants_stereo_downmix() {
                let mut map = [0.0; MAX_CHANNELS * MAX_CHANNELS];
                let stereo = &mut self.downmix[..frames * 2];
                fill_channel_map(ch, 2, false, &mut map);
                apply_channel_map(&self.mix[..len], ch, stereo, 2, &map);
                let stereo_ctx = EffectContext {
                    sample_rate: ctx.sample_rate,
                    channels: 2,
                    frames,
                };
                slot.effect.process(&stereo_ctx, stereo);
                fill_channel_map(2, ch, false, &mut map);
                apply_channel_map(stereo, 2, &mut self.mix[..len], ch, &map);
            } else {
                let effect_ctx = EffectContext {
                    sample_rate: ctx.sample_rate,
                    channels: ch,
                    frames,
                };
                slot.effect.process(&effect_ctx, &mut self.mix[..len]);
            }

            if dry_level > 0.0 {
                mix_in(&mut self.mix[..len], &self.dry[..len], dry_level);
            }
        }
    }

    /// Convert the mix into `parent_format`, overwriting the output buffer
    fn convert(&mut self, parent_format: ChannelFormat, ctx: &BlockContext) {
        let frames = ctx.frames;
        let ch = self.channels;
        let out_ch = parent_format.channels(ctx.device_channels);
        self.output_channels = out_ch;

        let src = &self.mix[..frames * ch];
        let dst = &mut self.output[..frames * out_ch];

        match (self.format.is_soundfield(), parent_format.is_soundfield()) {
            (false, false) if ch == out_ch => dst.copy_from_slice(src),
            (false, false) => {
                let mut map = [0.0; MAX_CHANNELS * MAX_CHANNELS];
                fill_channel_map(ch, out_ch, false, &mut map);
                apply_channel_map(src, ch, dst, out_ch, &map);
            }
            (true, false) => self.codec.decode(src, dst, out_ch),
            (false, true) => self.codec.encode(src, ch, dst),
            (true, true) => self.codec.transcode(src, dst),
        }
    }
}

/// The render-side tree
pub(crate) struct SubmixTree {
    graph: StableGraph<Box<SubmixNode>, ()>,
    ids: HashMap<SubmixId, NodeIndex>,
    master: NodeIndex,
    endpoints: Vec<NodeIndex>,
}

impl SubmixTree {
    /// A tree holding only the master, with room for `capacity` nodes
    pub fn new(master: Box<SubmixNode>, capacity: usize) -> Self {
        let mut graph = StableGraph::with_capacity(capacity, capacity);
        let mut ids = HashMap::with_capacity(capacity);
        let id = master.id;
        let master = graph.add_node(master);
        ids.insert(id, master);
        Self {
            graph,
            ids,
            master,
            endpoints: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn contains(&self, id: SubmixId) -> bool {
        self.ids.contains_key(&id)
    }

    pub fn node(&self, id: SubmixId) -> Option<&SubmixNode> {
        self.ids.get(&id).and_then(|idx| self.graph.node_weight(*idx)).map(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: SubmixId) -> Option<&mut SubmixNode> {
        let idx = *self.ids.get(&id)?;
        self.graph.node_weight_mut(idx).map(|n| n.as_mut())
    }

    /// Parent of `id`, `None` for the master and endpoints
    pub fn parent(&self, id: SubmixId) -> Option<SubmixId> {
        let idx = *self.ids.get(&id)?;
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .next()
            .map(|p| self.graph[p].id)
    }

    pub fn insert(
        &mut self,
        mut node: Box<SubmixNode>,
        parent: Option<SubmixId>,
        device_channels: usize,
        garbage: &mut GarbageSender,
    ) {
        let id = node.id;
        node.on_device_channels_changed(device_channels);
        if self.ids.contains_key(&id) {
            tracing::warn!(submix = ?id, "submix registered twice, ignoring");
            garbage.dispose(Garbage::Submix(node));
            return;
        }

        let endpoint = node.endpoint;
        let idx = self.graph.add_node(node);
        self.ids.insert(id, idx);

        if endpoint {
            self.endpoints.push(idx);
        } else {
            let parent_idx = self.parent_index(id, parent);
            self.graph.add_edge(parent_idx, idx, ());
        }
        tracing::debug!(submix = ?id, ?parent, endpoint, "submix registered");
    }

    fn parent_index(&self, child: SubmixId, parent: Option<SubmixId>) -> NodeIndex {
        match parent {
            None => self.master,
            Some(parent) => match self.ids.get(&parent) {
                Some(idx) => *idx,
                None => {
                    tracing::warn!(submix = ?child, ?parent, "parent submix missing, attaching to master");
                    self.master
                }
            },
        }
    }

    /// Remove `id`; its children move under the master
    pub fn remove(&mut self, id: SubmixId, garbage: &mut GarbageSender) -> bool {
        if id == SubmixId::MASTER {
            tracing::warn!("refusing to remove the master submix");
            return false;
        }
        let Some(idx) = self.ids.remove(&id) else {
            tracing::warn!(submix = ?id, "removing unknown submix");
            return false;
        };

        let mut children = mem::take(&mut self.graph[idx].children);
        children.clear();
        children.extend(self.graph.neighbors_directed(idx, Direction::Outgoing));
        for child in &children {
            self.graph.add_edge(self.master, *child, ());
        }
        self.endpoints.retain(|e| *e != idx);

        if let Some(mut node) = self.graph.remove_node(idx) {
            node.children = children;
            garbage.dispose(Garbage::Submix(node));
        }
        tracing::debug!(submix = ?id, "submix removed");
        true
    }

    pub fn set_parent(&mut self, child: SubmixId, parent: SubmixId) {
        let (Some(child_idx), Some(parent_idx)) = (self.ids.get(&child).copied(), self.ids.get(&parent).copied())
        else {
            tracing::warn!(?child, ?parent, "re-parenting unknown submix skipped");
            return;
        };

        loop {
            let old_parent = self.graph.neighbors_directed(child_idx, Direction::Incoming).next();
            let Some(edge) = old_parent.and_then(|p| self.graph.find_edge(p, child_idx)) else {
                break;
            };
            self.graph.remove_edge(edge);
        }
        self.endpoints.retain(|e| *e != child_idx);
        self.graph[child_idx].endpoint = false;
        self.graph.add_edge(parent_idx, child_idx, ());
    }

    pub fn on_device_channels_changed(&mut self, device_channels: usize) {
        for node in self.graph.node_weights_mut() {
            node.on_device_channels_changed(device_channels);
        }
    }

    /// Evaluate the whole tree and sum master and endpoints into `out`
    pub fn process(&mut self, slots: &[SourceSlot], ctx: &BlockContext, out: &mut [f32]) {
        let len = ctx.frames * ctx.device_channels;
        let out = &mut out[..len];
        silence(out);

        for i in 0..=self.endpoints.len() {
            let root = if i == 0 { self.master } else { self.endpoints[i - 1] };
            self.process_node(root, ChannelFormat::Device, slots, ctx);
            let (buffer, _) = self.graph[root].output(ctx.frames);
            mix_in(out, buffer, 1.0);
        }
    }

    fn process_node(&mut self, idx: NodeIndex, parent_format: ChannelFormat, slots: &[SourceSlot], ctx: &BlockContext) {
        let frames = ctx.frames;
        let mut children = mem::take(&mut self.graph[idx].children);
        children.clear();
        children.extend(self.graph.neighbors_directed(idx, Direction::Outgoing));

        let format = self.graph[idx].format;
        let len = frames * self.graph[idx].channels;
        silence(&mut self.graph[idx].mix[..len]);

        for child in children.iter().copied() {
            if !self.graph.contains_node(child) {
                tracing::warn!(submix = ?self.graph[idx].id, "missing child submix skipped");
                continue;
            }
            self.process_node(child, format, slots, ctx);

            let child_output = mem::take(&mut self.graph[child].output);
            let child_channels = self.graph[child].output_channels;
            let node = &mut self.graph[idx];
            if child_channels == node.channels {
                mix_in(&mut node.mix[..len], &child_output[..len], 1.0);
            } else {
                tracing::warn!(submix = ?node.id, child_channels, "child output does not match, skipped");
            }
            self.graph[child].output = child_output;
        }

        self.graph[idx].children = children;
        self.graph[idx].render(slots, ctx, parent_format);
    }
}

/// Identifies a buffer listener added with
/// [`MixerHandle::add_buffer_listener`](crate::MixerHandle::add_buffer_listener)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u32);

/// Tap id reserved for recordings
pub(crate) const RECORDING_TAP: u32 = 0;

/// Control-thread mirror of the tree, used to validate commands before they are sent
pub(crate) struct SubmixRegistry {
    graph: DiGraphMap<SubmixId, ()>,
    formats: HashMap<SubmixId, ChannelFormat>,
    endpoints: Vec<SubmixId>,
    next_id: u32,
    next_tap: u32,
}

impl SubmixRegistry {
    pub fn new() -> Self {
        let mut graph = DiGraphMap::new();
        graph.add_node(SubmixId::MASTER);
        let mut formats = HashMap::new();
        formats.insert(SubmixId::MASTER, ChannelFormat::Device);
        Self {
            graph,
            formats,
            endpoints: Vec::new(),
            next_id: 1,
            next_tap: RECORDING_TAP + 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn format(&self, id: SubmixId) -> MixerResult<ChannelFormat> {
        self.formats.get(&id).copied().ok_or(MixerError::UnknownSubmix(id))
    }

    pub fn parent(&self, id: SubmixId) -> Option<SubmixId> {
        self.graph.neighbors_directed(id, Direction::Incoming).next()
    }

    pub fn is_endpoint(&self, id: SubmixId) -> bool {
        self.endpoints.contains(&id)
    }

    pub fn register(&mut self, format: ChannelFormat, parent: Option<SubmixId>, endpoint: bool) -> MixerResult<SubmixId> {
        let id = SubmixId::new(self.next_id);
        if let Some(parent) = parent {
            self.format(parent)?;
            if endpoint {
                return Err(MixerError::InvalidSubmixParent { child: id, parent });
            }
        }
        self.next_id += 1;

        self.graph.add_node(id);
        self.formats.insert(id, format);
        if endpoint {
            self.endpoints.push(id);
        } else {
            self.graph.add_edge(parent.unwrap_or(SubmixId::MASTER), id, ());
        }
        Ok(id)
    }

    /// Forget `id`; its children move under the master
    pub fn unregister(&mut self, id: SubmixId) -> MixerResult<()> {
        if id == SubmixId::MASTER {
            return Err(MixerError::CannotRemoveMaster);
        }
        self.format(id)?;
        let children: Vec<SubmixId> = self.graph.neighbors_directed(id, Direction::Outgoing).collect();
        self.graph.remove_node(id);
        for child in children {
            self.graph.add_edge(SubmixId::MASTER, child, ());
        }
        self.formats.remove(&id);
        self.endpoints.retain(|e| *e != id);
        Ok(())
    }

    /// Move `child` under `parent`, refusing anything that would close a cycle
    pub fn set_parent(&mut self, child: SubmixId, parent: SubmixId) -> MixerResult<()> {
        if child == SubmixId::MASTER {
            return Err(MixerError::CannotRemoveMaster);
        }
        self.format(child)?;
        self.format(parent)?;
        if child == parent || has_path_connecting(&self.graph, child, parent, None) {
            return Err(MixerError::SubmixCycle { child, parent });
        }

        let parents: Vec<SubmixId> = self.graph.neighbors_directed(child, Direction::Incoming).collect();
        for old in parents {
            self.graph.remove_edge(old, child);
        }
        self.graph.add_edge(parent, child, ());
        self.endpoints.retain(|e| *e != child);
        Ok(())
    }

    pub fn next_listener(&mut self) -> ListenerId {
        let id = ListenerId(self.next_tap);
        self.next_tap += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingToggles;
    use crate::effect::Gain;
    use crate::garbage::garbage_channel;
    use core::f32::consts::FRAC_1_SQRT_2;

    const FRAMES: usize = 8;

    fn ctx() -> BlockContext {
        BlockContext {
            frames: FRAMES,
            sample_rate: 48_000,
            device_channels: 2,
            toggles: ProcessingToggles::default(),
            spatialization_is_external_send: false,
            reverb_is_external_send: false,
            spatialization_channels: 2,
        }
    }

    fn node(id: u32, settings: SubmixSettings) -> Box<SubmixNode> {
        Box::new(SubmixNode::new(SubmixId::new(id), settings, FRAMES, 2))
    }

    fn tree() -> SubmixTree {
        SubmixTree::new(node(0, SubmixSettings::new(ChannelFormat::Device)), 8)
    }

    /// Mono child producing a constant 1.0 through an effect
    fn constant_effect(ctx: &EffectContext, buffer: &mut [f32]) {
        assert_eq!(buffer.len(), ctx.frames * ctx.channels);
        buffer.iter_mut().for_each(|s| *s = 1.0);
    }

    #[test]
    fn mono_child_under_stereo_parent_uses_mono_to_stereo_gains() {
        let (mut garbage, _collector) = garbage_channel(8);
        let mut tree = tree();
        let child = node(
            1,
            SubmixSettings::new(ChannelFormat::Mono).with_effect(SubmixEffectSlot::new(constant_effect)),
        );
        tree.insert(child, None, 2, &mut garbage);

        let mut out = vec![0.0; FRAMES * 2];
        tree.process(&[], &ctx(), &mut out);
        for s in out {
            assert!((s - FRAC_1_SQRT_2).abs() < 1e-6);
        }
    }

    #[test]
    fn endpoints_bypass_master() {
        let (mut garbage, _collector) = garbage_channel(8);
        let mut tree = tree();
        tree.insert(
            node(
                1,
                SubmixSettings::new(ChannelFormat::Stereo)
                    .as_endpoint()
                    .with_effect(SubmixEffectSlot::new(constant_effect)),
            ),
            None,
            2,
            &mut garbage,
        );
        tree.node_mut(SubmixId::MASTER)
            .unwrap()
            .replace_effects(vec![SubmixEffectSlot::new(Gain::new(0.0))], &mut garbage);

        let mut out = vec![0.0; FRAMES * 2];
        tree.process(&[], &ctx(), &mut out);
        assert!(out.iter().all(|s| (*s - 1.0).abs() < 1e-6));
        assert_eq!(tree.parent(SubmixId::new(1)), None);
    }

    #[test]
    fn dry_level_and_bypass() {
        let (mut garbage, _collector) = garbage_channel(8);
        let mut tree = tree();
        let settings = SubmixSettings::new(ChannelFormat::Stereo)
            .with_effect(SubmixEffectSlot::new(constant_effect))
            .with_effect(SubmixEffectSlot::new(Gain::new(0.0)).with_dry_level(0.5));
        tree.insert(node(1, settings), None, 2, &mut garbage);

        let mut out = vec![0.0; FRAMES * 2];
        tree.process(&[], &ctx(), &mut out);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));

        tree.node_mut(SubmixId::new(1)).unwrap().set_effect_bypass(1, true);
        tree.process(&[], &ctx(), &mut out);
        assert!(out.iter().all(|s| (*s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn removing_a_node_reparents_children_to_master() {
        let (mut garbage, mut collector) = garbage_channel(8);
        let mut tree = tree();
        tree.insert(node(1, SubmixSettings::new(ChannelFormat::Stereo)), None, 2, &mut garbage);
        tree.insert(
            node(2, SubmixSettings::new(ChannelFormat::Stereo)),
            Some(SubmixId::new(1)),
            2,
            &mut garbage,
        );
        assert_eq!(tree.parent(SubmixId::new(2)), Some(SubmixId::new(1)));

        assert!(tree.remove(SubmixId::new(1), &mut garbage));
        assert_eq!(tree.parent(SubmixId::new(2)), Some(SubmixId::MASTER));
        assert!(!tree.remove(SubmixId::MASTER, &mut garbage));
        assert_eq!(collector.collect(), 1);
    }

    #[test]
    fn output_volume_fades_over_one_block() {
        let (mut garbage, _collector) = garbage_channel(8);
        let mut tree = tree();
        tree.insert(
            node(1, SubmixSettings::new(ChannelFormat::Stereo).with_effect(SubmixEffectSlot::new(constant_effect))),
            None,
            2,
            &mut garbage,
        );
        let mut out = vec![0.0; FRAMES * 2];
        tree.process(&[], &ctx(), &mut out);

        tree.node_mut(SubmixId::new(1)).unwrap().set_output_volume(0.0);
        tree.process(&[], &ctx(), &mut out);
        assert_eq!(out[0], 1.0);
        assert!(out[FRAMES * 2 - 1] > 0.0 && out[FRAMES * 2 - 1] < 1.0);
        tree.process(&[], &ctx(), &mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn taps_and_meters_see_the_submix_output() {
        let (mut garbage, _collector) = garbage_channel(8);
        let mut tree = tree();
        tree.insert(
            node(1, SubmixSettings::new(ChannelFormat::Mono).with_effect(SubmixEffectSlot::new(constant_effect))),
            None,
            2,
            &mut garbage,
        );
        let (tap, mut reader) = tap_channel(1, 64, 1);
        let envelope = Readout::new(MAX_CHANNELS);
        let node = tree.node_mut(SubmixId::new(1)).unwrap();
        node.add_tap(tap, &mut garbage);
        node.set_envelope(Some(SubmixEnvelope::new(48_000, 0.0, 100.0, envelope.clone())), &mut garbage);

        let mut out = vec![0.0; FRAMES * 2];
        tree.process(&[], &ctx(), &mut out);

        let mut recorded = [0.0; 64];
        assert_eq!(reader.read(&mut recorded), FRAMES);
        assert!(recorded[..FRAMES].iter().all(|s| *s == 1.0));
        assert!((envelope.get(0) - 1.0).abs() < 1e-6);
        assert_eq!(envelope.get(1), 0.0);
    }

    #[test]
    fn ambisonics_child_is_decoded_for_the_parent() {
        let (mut garbage, _collector) = garbage_channel(8);
        let mut tree = tree();
        let omni = |_: &EffectContext, buffer: &mut [f32]| {
            for frame in buffer.chunks_exact_mut(4) {
                frame.copy_from_slice(&[FRAC_1_SQRT_2, 0.0, 0.0, 0.0]);
            }
        };
        tree.insert(
            node(1, SubmixSettings::new(ChannelFormat::Ambisonics).with_effect(SubmixEffectSlot::new(omni))),
            None,
            2,
            &mut garbage,
        );
        let mut out = vec![0.0; FRAMES * 2];
        tree.process(&[], &ctx(), &mut out);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-5), "{out:?}");
    }

    #[test]
    fn registry_rejects_cycles_and_master_removal() {
        let mut registry = SubmixRegistry::new();
        let a = registry.register(ChannelFormat::Stereo, None, false).unwrap();
        let b = registry.register(ChannelFormat::Stereo, Some(a), false).unwrap();
        let c = registry.register(ChannelFormat::Mono, Some(b), false).unwrap();

        assert_eq!(registry.set_parent(a, c), Err(MixerError::SubmixCycle { child: a, parent: c }));
        assert_eq!(registry.set_parent(a, a), Err(MixerError::SubmixCycle { child: a, parent: a }));
        assert_eq!(registry.unregister(SubmixId::MASTER), Err(MixerError::CannotRemoveMaster));

        registry.set_parent(c, a).unwrap();
        assert_eq!(registry.parent(c), Some(a));

        registry.unregister(a).unwrap();
        assert_eq!(registry.parent(b), Some(SubmixId::MASTER));
        assert_eq!(registry.parent(c), Some(SubmixId::MASTER));
        assert_eq!(registry.format(a), Err(MixerError::UnknownSubmix(a)));
    }

    #[test]
    fn registry_endpoints_have_no_parent() {
        let mut registry = SubmixRegistry::new();
        let e = registry.register(ChannelFormat::Stereo, None, true).unwrap();
        assert!(registry.is_endpoint(e));
        assert_eq!(registry.parent(e), None);
        assert!(matches!(
            registry.register(ChannelFormat::Stereo, Some(e), true),
            Err(MixerError::InvalidSubmixParent { .. })
        ));
        let child = registry.register(ChannelFormat::Mono, Some(e), false).unwrap();
        assert_eq!(registry.parent(child), Some(e));
        assert_ne!(registry.next_listener(), registry.next_listener());
    }
}

//! Buses: double-buffered intermediate mixes.
//!
//! Sources send their pre- or post-effect signal to a bus at a send level.
//! Once per block every bus sums its contributions into its *current* half.
//! Bus sources (slots initialized with [`SourceInitParams::from_bus`]) play
//! the *previous* half, so a bus read in block N holds exactly what was sent
//! in block N−1. That one-block delay is what lets buses feed each other
//! without any ordering between them.
//!
//! [`SourceInitParams::from_bus`]: crate::source::SourceInitParams::from_bus

use hashbrown::HashMap;

use crate::dsp::buffer::{mix_converted, silence};
use crate::garbage::{Garbage, GarbageSender};
use crate::source::{BusId, BusSendStage, SourceSlot};

#[derive(Clone, Copy, Debug, PartialEq)]
struct BusSendEntry {
    source: u32,
    level: f32,
}

/// A double-buffered mix shared between sources
pub struct MixerBus {
    id: BusId,
    channels: usize,
    frames: usize,
    buffers: [Vec<f32>; 2],
    current: usize,
    pre_effect_sends: Vec<BusSendEntry>,
    post_effect_sends: Vec<BusSendEntry>,
    instances: Vec<u32>,
}

impl MixerBus {
    /// Allocate a bus able to track `max_sources` contributors
    pub(crate) fn new(id: BusId, channels: usize, frames: usize, max_sources: usize) -> Self {
        let len = channels * frames;
        Self {
            id,
            channels,
            frames,
            buffers: [vec![0.0; len], vec![0.0; len]],
            current: 0,
            pre_effect_sends: Vec::with_capacity(max_sources),
            post_effect_sends: Vec::with_capacity(max_sources),
            instances: Vec::with_capacity(max_sources),
        }
    }

    #[inline]
    pub fn id(&self) -> BusId {
        self.id
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// The half being mixed this block
    #[inline]
    pub fn current_buffer(&self) -> &[f32] {
        &self.buffers[self.current]
    }

    /// Last block's mix, read by bus sources
    #[inline]
    pub fn previous_buffer(&self) -> &[f32] {
        &self.buffers[self.current ^ 1]
    }

    fn sends_mut(&mut self, stage: BusSendStage) -> &mut Vec<BusSendEntry> {
        match stage {
            BusSendStage::PreEffect => &mut self.pre_effect_sends,
            BusSendStage::PostEffect => &mut self.post_effect_sends,
        }
    }

    /// Add or update a send. Returns `true` if the send is new.
    pub(crate) fn add_send(&mut self, stage: BusSendStage, source: u32, level: f32) -> bool {
        let sends = self.sends_mut(stage);
        if let Some(entry) = sends.iter_mut().find(|e| e.source == source) {
            entry.level = level;
            return false;
        }
        sends.push(BusSendEntry { source, level });
        true
    }

    /// Returns `true` if a send was removed
    pub(crate) fn remove_send(&mut self, stage: BusSendStage, source: u32) -> bool {
        let sends = self.sends_mut(stage);
        let before = sends.len();
        sends.retain(|e| e.source != source);
        sends.len() != before
    }

    pub(crate) fn add_instance(&mut self, source: u32) {
        if !self.instances.contains(&source) {
            self.instances.push(source);
        }
    }

    pub(crate) fn remove_instance(&mut self, source: u32) {
        self.instances.retain(|i| *i != source);
    }

    #[inline]
    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    #[inline]
    pub fn num_sends(&self) -> usize {
        self.pre_effect_sends.len() + self.post_effect_sends.len()
    }

    /// No instance plays it and nothing sends to it
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.instances.is_empty() && self.pre_effect_sends.is_empty() && self.post_effect_sends.is_empty()
    }

    /// Sum every contribution into the current half
    pub(crate) fn mix_buffer(&mut self, slots: &[SourceSlot]) {
        let frames = self.frames;
        let channels = self.channels;
        let current = &mut self.buffers[self.current];
        silence(current);

        let sends = self
            .pre_effect_sends
            .iter()
            .map(|e| (e, BusSendStage::PreEffect))
            .chain(self.post_effect_sends.iter().map(|e| (e, BusSendStage::PostEffect)));

        for (entry, stage) in sends {
            let Some(slot) = slots.get(entry.source as usize) else {
                continue;
            };
            if !slot.state.is_audible() {
                continue;
            }
            mix_converted(
                slot.bus_send_buffer(stage, frames),
                slot.channels,
                current,
                channels,
                entry.level,
            );
        }
    }

    /// Swap halves once every consumer has read this block
    #[inline]
    pub(crate) fn update(&mut self) {
        self.current ^= 1;
    }
}

/// Every live bus, keyed by id
#[derive(Default)]
pub struct BusStore {
    buses: HashMap<BusId, Box<MixerBus>>,
}

impl BusStore {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buses: HashMap::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn get(&self, id: BusId) -> Option<&MixerBus> {
        self.buses.get(&id).map(|b| b.as_ref())
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: BusId) -> Option<&mut MixerBus> {
        self.buses.get_mut(&id).map(|b| b.as_mut())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buses.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    /// Get the bus, creating it from `spare` if it does not exist yet.
    ///
    /// An unneeded spare is handed back to the control thread.
    pub(crate) fn get_or_insert(
        &mut self,
        id: BusId,
        spare: Option<Box<MixerBus>>,
        garbage: &mut GarbageSender,
    ) -> Option<&mut MixerBus> {
        if self.buses.contains_key(&id) {
            garbage.dispose_opt(spare, Garbage::Bus);
        } else if let Some(bus) = spare {
            tracing::debug!(?id, channels = bus.channels, "bus created");
            self.buses.insert(id, bus);
        } else {
            tracing::warn!(?id, "bus referenced before creation");
            return None;
        }
        self.get_mut(id)
    }

    /// Drop `source` from every send list and instance list
    pub(crate) fn forget_source(&mut self, source: u32) {
        for bus in self.buses.values_mut() {
            bus.remove_send(BusSendStage::PreEffect, source);
            bus.remove_send(BusSendStage::PostEffect, source);
            bus.remove_instance(source);
        }
    }

    /// Remove buses with zero instances and zero sends
    pub(crate) fn remove_unused(&mut self, garbage: &mut GarbageSender) {
        for (id, bus) in self.buses.extract_if(|_, bus| bus.is_unused()) {
            tracing::debug!(?id, "bus removed");
            garbage.dispose(Garbage::Bus(bus));
        }
    }

    pub(crate) fn mix_all(&mut self, slots: &[SourceSlot]) {
        for bus in self.buses.values_mut() {
            bus.mix_buffer(slots);
        }
    }

    pub(crate) fn update_all(&mut self) {
        for bus in self.buses.values_mut() {
            bus.update();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_is_silent_before_the_first_swap() {
        let mut bus = MixerBus::new(BusId(1), 2, 4, 8);
        assert!(bus.previous_buffer().iter().all(|s| *s == 0.0));
        bus.mix_buffer(&[]);
        bus.update();
        assert!(bus.previous_buffer().iter().all(|s| *s == 0.0));
    }

    #[test]
    fn sends_and_instances_track_usage() {
        let mut bus = MixerBus::new(BusId(1), 1, 4, 8);
        assert!(bus.is_unused());
        assert!(bus.add_send(BusSendStage::PostEffect, 3, 0.5));
        assert!(!bus.add_send(BusSendStage::PostEffect, 3, 0.7));
        assert_eq!(bus.num_sends(), 1);
        bus.add_instance(5);
        assert!(bus.remove_send(BusSendStage::PostEffect, 3));
        assert!(!bus.is_unused());
        bus.remove_instance(5);
        assert!(bus.is_unused());
    }
}

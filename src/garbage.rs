//! Deferred deallocation for objects removed on the render thread.
//!
//! Freeing a decoder, an effect chain or a sample buffer can hit the system
//! allocator. The render thread instead pushes such objects into an `rtrb`
//! ring; the control thread drops them on its next
//! [`update`](crate::MixerHandle::update).

use rtrb::{Consumer, Producer, RingBuffer};

use crate::bus::MixerBus;
use crate::decoder::SourceDecoder;
use crate::effect::{SourceEffectSlot, SubmixEffectSlot};
use crate::plugin::PluginVoice;
use crate::source::{SlotSubmixSend, SourceHandle};
use crate::source_manager::BusAttachment;
use crate::submix::{SubmixEnvelope, SubmixNode, SubmixSpectrum, Tap};

/// Something the render thread no longer needs.
///
/// Payloads are never read, only dropped by the collector.
#[allow(dead_code)]
pub(crate) enum Garbage {
    Decoder(Box<dyn SourceDecoder>),
    SourceEffects(Vec<SourceEffectSlot>),
    SubmixEffects(Vec<SubmixEffectSlot>),
    Voice(Box<dyn PluginVoice>),
    Samples(Vec<f32>),
    SubmixSends(Vec<SlotSubmixSend>),
    Bus(Box<MixerBus>),
    Submix(Box<SubmixNode>),
    Tap(Tap),
    BusAttachments(Vec<BusAttachment>),
    FormatBuffers(Vec<(SourceHandle, Vec<f32>)>),
    EffectChains(Vec<(SourceHandle, Vec<SourceEffectSlot>)>),
    Envelope(SubmixEnvelope),
    Spectrum(SubmixSpectrum),
}

/// Render-thread end
pub(crate) struct GarbageSender {
    producer: Producer<Garbage>,
}

impl GarbageSender {
    /// Hand `garbage` to the control thread.
    ///
    /// If the ring is full the object is dropped in place.
    pub fn dispose(&mut self, garbage: Garbage) {
        if let Err(rtrb::PushError::Full(garbage)) = self.producer.push(garbage) {
            tracing::warn!("garbage ring full, dropping on the render thread");
            drop(garbage);
        }
    }

    pub fn dispose_opt<T>(&mut self, value: Option<T>, wrap: impl FnOnce(T) -> Garbage) {
        if let Some(value) = value {
            self.dispose(wrap(value));
        }
    }
}

/// Control-thread end
pub(crate) struct GarbageCollector {
    consumer: Consumer<Garbage>,
}

impl GarbageCollector {
    /// Drop everything the render thread handed over; returns the number of objects
    pub fn collect(&mut self) -> usize {
        let mut count = 0;
        while let Ok(garbage) = self.consumer.pop() {
            drop(garbage);
            count += 1;
        }
        if count > 0 {
            tracing::trace!(count, "collected render-thread garbage");
        }
        count
    }
}

pub(crate) fn garbage_channel(capacity: usize) -> (GarbageSender, GarbageCollector) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (GarbageSender { producer }, GarbageCollector { consumer })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_dropped_by_the_collector() {
        let (mut tx, mut rx) = garbage_channel(2);
        tx.dispose(Garbage::Samples(vec![0.0; 16]));
        tx.dispose(Garbage::Samples(vec![0.0; 16]));
        // Full: dropped in place without panicking
        tx.dispose(Garbage::Samples(vec![0.0; 16]));
        assert_eq!(rx.collect(), 2);
        assert_eq!(rx.collect(), 0);
    }
}

//! Effects processed on sources and submixes.
//!
//! An effect transforms one interleaved block in place. Source chains run in
//! order, each effect's output feeding the next. Submix chains additionally
//! support a per-effect dry level and a forced stereo downmix (see
//! [`SubmixEffectSlot`]).

mod gain;
mod slew_limiter;

use core::marker::PhantomData;

pub use gain::{Gain, GainMessage};
pub use slew_limiter::{SlewLimiter, SlewLimiterMessage};

/// Block information passed to every effect
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EffectContext {
    pub sample_rate: u32,
    pub channels: usize,
    pub frames: usize,
}

/// An audio effect on an interleaved block
pub trait Effect: Send {
    /// Process `buffer` (`ctx.frames * ctx.channels` samples) in place
    fn process(&mut self, ctx: &EffectContext, buffer: &mut [f32]);

    /// Ask submixes to feed this effect a stereo downmix and upmix its result back
    fn wants_stereo_downmix(&self) -> bool {
        false
    }
}

impl<F> Effect for F
where
    F: FnMut(&EffectContext, &mut [f32]) + Send,
{
    fn process(&mut self, ctx: &EffectContext, buffer: &mut [f32]) {
        self(ctx, buffer)
    }
}

/// One entry of a source effect chain
pub struct SourceEffectSlot {
    pub effect: Box<dyn Effect>,
    pub bypass: bool,
}

impl SourceEffectSlot {
    pub fn new<E: Effect + 'static>(effect: E) -> Self {
        Self {
            effect: Box::new(effect),
            bypass: false,
        }
    }
}

/// One entry of a submix effect chain
pub struct SubmixEffectSlot {
    pub effect: Box<dyn Effect>,
    /// Amount of the pre-effect signal mixed back in after processing
    pub dry_level: f32,
    pub bypass: bool,
}

impl SubmixEffectSlot {
    pub fn new<E: Effect + 'static>(effect: E) -> Self {
        Self {
            effect: Box::new(effect),
            dry_level: 0.0,
            bypass: false,
        }
    }

    /// Mix `level` of the unprocessed signal into the output (builder pattern)
    pub fn with_dry_level(mut self, level: f32) -> Self {
        self.dry_level = level;
        self
    }
}

/// Handle for sending messages to an effect living on the render thread
pub struct Handle<M: Send + 'static> {
    pub(crate) sender: rtrb::Producer<M>,
    pub(crate) _marker: PhantomData<M>,
}

impl<M: Send + 'static> Handle<M> {
    /// Send a message to the effect
    pub fn send(&mut self, msg: M) -> Result<(), M> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }
}

pub(crate) fn message_channel<M: Send + 'static>(capacity: usize) -> (Handle<M>, rtrb::Consumer<M>) {
    let (sender, receiver) = rtrb::RingBuffer::new(capacity);
    (
        Handle {
            sender,
            _marker: PhantomData,
        },
        receiver,
    )
}

/// Run a source chain in order, skipping bypassed entries
pub(crate) fn process_chain(chain: &mut [SourceEffectSlot], ctx: &EffectContext, buffer: &mut [f32]) {
    for slot in chain.iter_mut().filter(|slot| !slot.bypass) {
        slot.effect.process(ctx, buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_runs_in_order_and_skips_bypassed() {
        let ctx = EffectContext {
            sample_rate: 48_000,
            channels: 1,
            frames: 2,
        };
        let mut chain = vec![
            SourceEffectSlot::new(|_: &EffectContext, b: &mut [f32]| b.iter_mut().for_each(|s| *s += 1.0)),
            SourceEffectSlot::new(|_: &EffectContext, b: &mut [f32]| b.iter_mut().for_each(|s| *s *= 3.0)),
            SourceEffectSlot::new(|_: &EffectContext, b: &mut [f32]| b.iter_mut().for_each(|s| *s = 0.0)),
        ];
        chain[2].bypass = true;

        let mut buffer = [1.0, 2.0];
        process_chain(&mut chain, &ctx, &mut buffer);
        assert_eq!(buffer, [6.0, 9.0]);
    }
}

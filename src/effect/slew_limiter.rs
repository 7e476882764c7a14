//! Slew rate limiter effect

use rtrb::Consumer;

use super::{message_channel, Effect, EffectContext, Handle};
use crate::config::MAX_CHANNELS;

/// Messages to control the slew limiter
#[derive(Clone, Copy, Debug)]
pub enum SlewLimiterMessage {
    /// Set the maximum rate of change per sample (0.0 - 1.0)
    SetRate(f32),
    /// Set rate in units per second (converted using the block's sample rate)
    SetRatePerSecond(f32),
}

/// A slew rate limiter that smooths sudden changes in audio
///
/// Useful for:
/// - Smoothing control signals
/// - Creating portamento/glide effects
/// - Reducing harsh transients
pub struct SlewLimiter {
    /// Maximum change per sample
    rate: f32,
    /// Last output value per channel
    last: [f32; MAX_CHANNELS],
    /// Cached rate per second for recalculation
    rate_per_second: Option<f32>,
    messages: Option<Consumer<SlewLimiterMessage>>,
}

impl SlewLimiter {
    /// Create a new slew limiter with the given rate per sample
    ///
    /// A rate of 1.0 means the signal can change by at most 1.0 per sample.
    /// Lower values = more smoothing.
    pub fn new(rate: f32) -> Self {
        Self {
            rate: rate.abs(),
            last: [0.0; MAX_CHANNELS],
            rate_per_second: None,
            messages: None,
        }
    }

    /// Create with a rate specified in units per second
    ///
    /// For example, `from_rate_per_second(1000.0)` at 48kHz means
    /// the signal can change by ~0.02 per sample.
    pub fn from_rate_per_second(rate: f32) -> Self {
        Self {
            rate: 0.0, // Set on first process
            last: [0.0; MAX_CHANNELS],
            rate_per_second: Some(rate),
            messages: None,
        }
    }

    /// Attach a message handle (builder pattern)
    pub fn with_handle(mut self) -> (Self, Handle<SlewLimiterMessage>) {
        let (handle, consumer) = message_channel(16);
        self.messages = Some(consumer);
        (self, handle)
    }

    #[inline]
    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Effect for SlewLimiter {
    fn process(&mut self, ctx: &EffectContext, buffer: &mut [f32]) {
        if let Some(messages) = self.messages.as_mut() {
            while let Ok(msg) = messages.pop() {
                match msg {
                    SlewLimiterMessage::SetRate(r) => {
                        self.rate = r.abs();
                        self.rate_per_second = None;
                    }
                    SlewLimiterMessage::SetRatePerSecond(r) => self.rate_per_second = Some(r),
                }
            }
        }

        if let Some(rps) = self.rate_per_second {
            self.rate = rps.abs() / ctx.sample_rate as f32;
        }

        let max_delta = self.rate;
        let channels = ctx.channels.clamp(1, MAX_CHANNELS);

        for frame in buffer.chunks_exact_mut(channels) {
            for (sample, last) in frame.iter_mut().zip(self.last.iter_mut()) {
                let delta = (*sample - *last).clamp(-max_delta, max_delta);
                *last += delta;
                *sample = *last;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_step_per_sample() {
        let ctx = EffectContext {
            sample_rate: 48_000,
            channels: 1,
            frames: 4,
        };
        let mut limiter = SlewLimiter::new(0.25);
        let mut buffer = [1.0; 4];
        limiter.process(&ctx, &mut buffer);
        assert_eq!(buffer, [0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn rate_per_second_uses_block_sample_rate() {
        let ctx = EffectContext {
            sample_rate: 1_000,
            channels: 2,
            frames: 1,
        };
        let (mut limiter, mut handle) = SlewLimiter::new(1.0).with_handle();
        handle.send(SlewLimiterMessage::SetRatePerSecond(100.0)).unwrap();
        let mut buffer = [1.0, -1.0];
        limiter.process(&ctx, &mut buffer);
        assert!((limiter.rate() - 0.1).abs() < 1e-6);
        assert!((buffer[0] - 0.1).abs() < 1e-6);
        assert!((buffer[1] + 0.1).abs() < 1e-6);
    }
}

//! Gain/volume control effect

use rtrb::Consumer;

use super::{message_channel, Effect, EffectContext, Handle};

/// Messages to control gain
#[derive(Clone, Copy, Debug)]
pub enum GainMessage {
    /// Set the gain multiplier (1.0 = unity, 0.0 = silence)
    SetGain(f32),
}

/// A gain (volume) control with one-pole smoothing
///
/// Supports any number of channels; all channels share one smoothed gain.
pub struct Gain {
    gain: f32,
    /// Smoothing to prevent clicks on rapid gain changes
    smoothed_gain: f32,
    /// Smoothing coefficient (0.0 = instant, 1.0 = no change)
    smooth_coeff: f32,
    messages: Option<Consumer<GainMessage>>,
}

impl Gain {
    /// Create a new gain effect with the specified gain value
    pub fn new(gain: f32) -> Self {
        Self {
            gain,
            smoothed_gain: gain,
            smooth_coeff: 0.995, // ~4ms at 48kHz
            messages: None,
        }
    }

    /// Create a gain effect plus a handle for changing it while it plays
    ///
    /// # Example
    ///
    /// ```
    /// use mischpult::effect::{Gain, GainMessage};
    ///
    /// let (gain, mut handle) = Gain::with_handle(1.0);
    /// handle.send(GainMessage::SetGain(0.5)).unwrap();
    /// # drop(gain);
    /// ```
    pub fn with_handle(gain: f32) -> (Self, Handle<GainMessage>) {
        let (handle, consumer) = message_channel(16);
        let mut effect = Self::new(gain);
        effect.messages = Some(consumer);
        (effect, handle)
    }

    /// Set the smoothing time in milliseconds
    pub fn with_smoothing_ms(mut self, ms: f32, sample_rate: u32) -> Self {
        // Time constant: after `ms` milliseconds, we've reached ~63% of target
        let samples = (ms / 1000.0) * sample_rate as f32;
        self.smooth_coeff = if samples > 0.0 { (-1.0 / samples).exp() } else { 0.0 };
        self
    }

    /// Disable smoothing for instant gain changes
    pub fn without_smoothing(mut self) -> Self {
        self.smooth_coeff = 0.0;
        self
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Effect for Gain {
    fn process(&mut self, ctx: &EffectContext, buffer: &mut [f32]) {
        if let Some(messages) = self.messages.as_mut() {
            while let Ok(msg) = messages.pop() {
                match msg {
                    GainMessage::SetGain(g) => self.gain = g,
                }
            }
        }

        let target_gain = self.gain;
        let smooth_coeff = self.smooth_coeff;
        let mut gain = self.smoothed_gain;

        for frame in buffer.chunks_exact_mut(ctx.channels.max(1)) {
            gain = target_gain + smooth_coeff * (gain - target_gain);
            frame.iter_mut().for_each(|s| *s *= gain);
        }

        self.smoothed_gain = gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: EffectContext = EffectContext {
        sample_rate: 48_000,
        channels: 2,
        frames: 4,
    };

    #[test]
    fn unsmoothed_gain_is_exact() {
        let mut gain = Gain::new(0.5).without_smoothing();
        let mut buffer = [1.0; 8];
        gain.process(&CTX, &mut buffer);
        assert_eq!(buffer, [0.5; 8]);
    }

    #[test]
    fn handle_changes_gain_smoothly() {
        let (gain, mut handle) = Gain::with_handle(1.0);
        let mut gain = gain.with_smoothing_ms(1.0, 48_000);
        handle.send(GainMessage::SetGain(0.0)).unwrap();

        let mut buffer = [1.0; 8];
        gain.process(&CTX, &mut buffer);
        assert_eq!(gain.gain(), 0.0);
        // Smoothed: moving down, but not there yet
        assert!(buffer[0] < 1.0 && buffer[0] > 0.9);
        assert!(buffer[6] < buffer[0]);
        assert_eq!(buffer[0], buffer[1]);
    }
}

//! One-pole filters over interleaved buffers

use core::f32::consts::PI;

use crate::config::MAX_CHANNELS;

/// One-pole low-pass, `y[n] = a0 * x[n] + b1 * y[n-1]`, with per-channel memory
#[derive(Clone, Debug)]
pub struct OnePoleLowPass {
    sample_rate: f32,
    frequency: f32,
    a0: f32,
    b1: f32,
    z1: [f32; MAX_CHANNELS],
}

impl OnePoleLowPass {
    pub fn new(sample_rate: f32) -> Self {
        let mut filter = Self {
            sample_rate,
            frequency: -1.0,
            a0: 1.0,
            b1: 0.0,
            z1: [0.0; MAX_CHANNELS],
        };
        filter.set_frequency(sample_rate * 0.5);
        filter
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    /// Recompute coefficients; a no-op if the cutoff did not change
    #[inline]
    pub fn set_frequency(&mut self, frequency: f32) {
        if frequency == self.frequency {
            return;
        }
        self.frequency = frequency;
        let normalized = (frequency / self.sample_rate).clamp(0.0, 0.5);
        self.b1 = (-2.0 * PI * normalized).exp();
        self.a0 = 1.0 - self.b1;
    }

    /// Clear the filter memory
    pub fn reset(&mut self) {
        self.z1 = [0.0; MAX_CHANNELS];
    }

    /// Filter a single frame in place
    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        for (sample, z1) in frame.iter_mut().zip(self.z1.iter_mut()) {
            let y = self.a0 * *sample + self.b1 * *z1;
            *z1 = y;
            *sample = y;
        }
    }

    /// Filter an interleaved buffer in place at a fixed cutoff
    pub fn process(&mut self, buffer: &mut [f32], channels: usize) {
        for frame in buffer.chunks_exact_mut(channels.max(1)) {
            self.process_frame(frame);
        }
    }
}

/// One-pole high-pass: the input minus its one-pole low-passed version
#[derive(Clone, Debug)]
pub struct OnePoleHighPass {
    low_pass: OnePoleLowPass,
}

impl OnePoleHighPass {
    pub fn new(sample_rate: f32) -> Self {
        let mut low_pass = OnePoleLowPass::new(sample_rate);
        low_pass.set_frequency(0.0);
        Self { low_pass }
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.low_pass.frequency()
    }

    #[inline]
    pub fn set_frequency(&mut self, frequency: f32) {
        self.low_pass.set_frequency(frequency);
    }

    pub fn reset(&mut self) {
        self.low_pass.reset();
    }

    #[inline]
    pub fn process_frame(&mut self, frame: &mut [f32]) {
        let low = &mut self.low_pass;
        for (sample, z1) in frame.iter_mut().zip(low.z1.iter_mut()) {
            let y = low.a0 * *sample + low.b1 * *z1;
            *z1 = y;
            *sample -= y;
        }
    }

    pub fn process(&mut self, buffer: &mut [f32], channels: usize) {
        for frame in buffer.chunks_exact_mut(channels.max(1)) {
            self.process_frame(frame);
        }
    }
}

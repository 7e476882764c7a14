//! Band magnitudes via the Goertzel algorithm

use core::f32::consts::PI;

/// Measures the magnitude of a fixed set of frequencies over each block
#[derive(Clone, Debug)]
pub struct SpectrumAnalyzer {
    sample_rate: f32,
    frequencies: Vec<f32>,
    coefficients: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: f32, frequencies: &[f32]) -> Self {
        let coefficients = frequencies
            .iter()
            .map(|f| 2.0 * (2.0 * PI * f / sample_rate).cos())
            .collect();
        Self {
            sample_rate,
            frequencies: frequencies.to_vec(),
            coefficients,
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    #[inline]
    pub fn frequencies(&self) -> &[f32] {
        &self.frequencies
    }

    /// Analyse one channel of an interleaved buffer (channels are averaged).
    ///
    /// Writes one normalized magnitude per band into `magnitudes`.
    pub fn analyze(&self, buffer: &[f32], channels: usize, magnitudes: &mut [f32]) {
        let channels = channels.max(1);
        let frames = buffer.len() / channels;
        if frames == 0 {
            magnitudes.iter_mut().for_each(|m| *m = 0.0);
            return;
        }
        let scale = 1.0 / channels as f32;

        for (coeff, magnitude) in self.coefficients.iter().zip(magnitudes.iter_mut()) {
            let (mut s1, mut s2) = (0.0f32, 0.0f32);
            for frame in buffer.chunks_exact(channels) {
                let x = frame.iter().sum::<f32>() * scale;
                let s0 = x + coeff * s1 - s2;
                s2 = s1;
                s1 = s0;
            }
            let power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
            *magnitude = 2.0 * power.max(0.0).sqrt() / frames as f32;
        }
    }
}

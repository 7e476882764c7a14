//! Peak envelope follower with separate attack and release times

/// Follows the amplitude of a control-rate signal.
///
/// Sources run this once per block on the block's average amplitude, so the
/// follower's sample rate is `sample_rate / block_frames`.
#[derive(Clone, Debug)]
pub struct EnvelopeFollower {
    rate: f32,
    attack_ms: f32,
    release_ms: f32,
    attack_coeff: f32,
    release_coeff: f32,
    value: f32,
}

fn time_coefficient(ms: f32, rate: f32) -> f32 {
    let samples = 0.001 * ms * rate;
    if samples <= 0.0 {
        0.0
    } else {
        (0.01f32.ln() / samples).exp()
    }
}

impl EnvelopeFollower {
    /// `rate` is the rate at which [`process`](Self::process) is called, in Hz
    pub fn new(rate: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            rate,
            attack_ms,
            release_ms,
            attack_coeff: time_coefficient(attack_ms, rate),
            release_coeff: time_coefficient(release_ms, rate),
            value: 0.0,
        }
    }

    pub fn set_attack_ms(&mut self, attack_ms: f32) {
        self.attack_ms = attack_ms;
        self.attack_coeff = time_coefficient(attack_ms, self.rate);
    }

    pub fn set_release_ms(&mut self, release_ms: f32) {
        self.release_ms = release_ms;
        self.release_coeff = time_coefficient(release_ms, self.rate);
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.rate = rate;
        self.attack_coeff = time_coefficient(self.attack_ms, rate);
        self.release_coeff = time_coefficient(self.release_ms, rate);
    }

    /// Feed one value; returns the new envelope
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let input = input.abs();
        let coeff = if input > self.value {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.value = coeff * (self.value - input) + input;
        self.value
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::ENVELOPE_TAIL_THRESHOLD;

    #[test]
    fn attacks_then_decays_below_threshold() {
        // ~94 blocks per second at 512 frames / 48 kHz
        let mut env = EnvelopeFollower::new(48_000.0 / 512.0, 10.0, 100.0);
        for _ in 0..20 {
            env.process(1.0);
        }
        assert!(env.value() > 0.99);

        let mut blocks = 0;
        while env.process(0.0) > ENVELOPE_TAIL_THRESHOLD {
            blocks += 1;
            assert!(blocks < 1000, "envelope never decayed");
        }
    }

    #[test]
    fn zero_times_follow_instantly() {
        let mut env = EnvelopeFollower::new(100.0, 0.0, 0.0);
        assert_eq!(env.process(0.5), 0.5);
        assert_eq!(env.process(0.1), 0.1);
    }
}

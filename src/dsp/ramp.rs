//! Per-block linear parameter ramps

use crate::config::MAX_CHANNELS;

/// A scalar parameter interpolated linearly across exactly one block.
///
/// Frame `i` of an `n`-frame block sees `start + i * (target - start) / n`.
/// At the end of the block the ramp settles on `target`, which becomes the
/// start of the next block.
///
/// A ramp created with [`Ramp::unset`] snaps to the first target it receives
/// before its first block, instead of fading in from its initial value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ramp {
    start: f32,
    target: f32,
    snap_next: bool,
}

impl Ramp {
    /// A ramp resting at `value`
    pub const fn new(value: f32) -> Self {
        Self {
            start: value,
            target: value,
            snap_next: false,
        }
    }

    /// A ramp whose first target is applied without interpolation
    pub const fn unset(value: f32) -> Self {
        Self {
            start: value,
            target: value,
            snap_next: true,
        }
    }

    /// Set the value to reach by the end of the next block
    #[inline]
    pub fn set_target(&mut self, target: f32) {
        if self.snap_next {
            self.start = target;
            self.snap_next = false;
        }
        self.target = target;
    }

    #[inline]
    pub fn start(&self) -> f32 {
        self.start
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    /// Per-frame increment across a block of `frames`
    #[inline]
    pub fn step(&self, frames: usize) -> f32 {
        if frames == 0 {
            0.0
        } else {
            (self.target - self.start) / frames as f32
        }
    }

    /// Interpolated value at `frame` of a block of `frames`
    #[inline]
    pub fn value_at(&self, frame: usize, frames: usize) -> f32 {
        self.start + self.step(frames) * frame as f32
    }

    /// Settle on the target once the block has been rendered.
    ///
    /// From here on every new target is interpolated.
    #[inline]
    pub fn finish_block(&mut self) {
        self.start = self.target;
        self.snap_next = false;
    }
}

impl Default for Ramp {
    fn default() -> Self {
        Self::new(0.0)
    }
}

const MAP_LEN: usize = MAX_CHANNELS * MAX_CHANNELS;

/// A gain matrix ramped per frame from its previous value to a new target.
///
/// Matrices are indexed `map[input_channel * output_channels + output_channel]`.
#[derive(Clone, Debug)]
pub struct ChannelMapRamp {
    start: [f32; MAP_LEN],
    target: [f32; MAP_LEN],
    len: usize,
    snap_next: bool,
}

impl ChannelMapRamp {
    pub fn new() -> Self {
        Self {
            start: [0.0; MAP_LEN],
            target: [0.0; MAP_LEN],
            len: 0,
            snap_next: true,
        }
    }

    /// Number of coefficients in the current map (0 when unset)
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set a new target matrix.
    ///
    /// A map of a different size than the current one (or the first map) is
    /// applied immediately, there is nothing sensible to interpolate from.
    pub fn set_target(&mut self, map: &[f32]) {
        let len = map.len().min(MAP_LEN);
        if self.snap_next || len != self.len {
            self.start[..len].copy_from_slice(&map[..len]);
            self.snap_next = false;
        }
        self.target[..len].copy_from_slice(&map[..len]);
        self.len = len;
    }

    /// Forget the map; the next one snaps
    pub fn reset(&mut self) {
        self.len = 0;
        self.snap_next = true;
    }

    #[inline]
    pub fn target(&self) -> &[f32] {
        &self.target[..self.len]
    }

    /// Interpolated coefficient `index` at `frame` of a block of `frames`
    #[inline]
    pub fn value_at(&self, index: usize, frame: usize, frames: usize) -> f32 {
        let start = self.start[index];
        let target = self.target[index];
        if frames == 0 || start == target {
            return target;
        }
        start + (target - start) * frame as f32 / frames as f32
    }

    pub fn finish_block(&mut self) {
        self.start[..self.len].copy_from_slice(&self.target[..self.len]);
    }
}

impl Default for ChannelMapRamp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_interpolates_over_one_block() {
        let mut ramp = Ramp::new(0.0);
        ramp.set_target(1.0);
        assert_eq!(ramp.value_at(0, 4), 0.0);
        assert_eq!(ramp.value_at(2, 4), 0.5);
        assert_eq!(ramp.step(4), 0.25);

        ramp.finish_block();
        assert_eq!(ramp.start(), ramp.target());
        assert_eq!(ramp.value_at(0, 4), 1.0);
    }

    #[test]
    fn unset_ramp_snaps_on_first_target() {
        let mut ramp = Ramp::unset(0.0);
        ramp.set_target(0.8);
        assert_eq!(ramp.start(), 0.8);
        assert_eq!(ramp.value_at(0, 512), 0.8);

        ramp.set_target(0.2);
        assert_eq!(ramp.start(), 0.8);
        assert!((ramp.value_at(256, 512) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn unset_ramp_interpolates_once_a_block_was_rendered() {
        let mut ramp = Ramp::unset(1.0);
        ramp.finish_block();

        ramp.set_target(0.0);
        assert_eq!(ramp.value_at(0, 4), 1.0);
        assert_eq!(ramp.value_at(2, 4), 0.5);
    }

    #[test]
    fn channel_map_snaps_on_size_change() {
        let mut map = ChannelMapRamp::new();
        map.set_target(&[1.0, 0.0]);
        assert_eq!(map.value_at(0, 0, 8), 1.0);

        map.set_target(&[0.0, 1.0]);
        assert_eq!(map.value_at(0, 4, 8), 0.5);

        map.set_target(&[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(map.value_at(0, 0, 8), 0.5);
        assert_eq!(map.len(), 4);
    }
}

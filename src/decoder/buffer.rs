//! In-memory decoder over pre-decoded samples

use super::SourceDecoder;

/// Plays pre-decoded interleaved samples.
///
/// For streaming large files use a [`StreamDecoder`](super::StreamDecoder)
/// fed by a decoder thread instead.
///
/// # Example
///
/// ```
/// use mischpult::decoder::{BufferDecoder, SourceDecoder};
///
/// let mut decoder = BufferDecoder::new(vec![0.1, 0.2, 0.3], 1).with_looping(true);
/// let mut chunk = [0.0; 4];
/// assert_eq!(decoder.read(&mut chunk), 4);
/// assert_eq!(chunk, [0.1, 0.2, 0.3, 0.1]);
/// assert!(!decoder.is_finished());
/// ```
pub struct BufferDecoder {
    samples: Vec<f32>,
    channels: usize,
    position: usize,
    looping: bool,
}

impl BufferDecoder {
    /// Create a decoder from interleaved samples
    pub fn new(samples: Vec<f32>, channels: usize) -> Self {
        let channels = channels.max(1);
        let mut samples = samples;
        // Drop a trailing partial frame
        samples.truncate(samples.len() - samples.len() % channels);
        Self {
            samples,
            channels,
            position: 0,
            looping: false,
        }
    }

    /// Restart from the beginning when the end is reached (builder pattern)
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Total number of frames
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// Current read position in frames
    #[inline]
    pub fn position(&self) -> usize {
        self.position / self.channels
    }

    /// Jump to `frame`, clamped to the end
    pub fn seek(&mut self, frame: usize) {
        self.position = (frame * self.channels).min(self.samples.len());
    }
}

impl SourceDecoder for BufferDecoder {
    #[inline]
    fn channels(&self) -> usize {
        self.channels
    }

    fn read(&mut self, buffer: &mut [f32]) -> usize {
        let wanted = buffer.len() - buffer.len() % self.channels;
        let mut written = 0;

        while written < wanted {
            if self.position >= self.samples.len() {
                if self.looping && !self.samples.is_empty() {
                    self.position = 0;
                } else {
                    break;
                }
            }
            let count = (wanted - written).min(self.samples.len() - self.position);
            buffer[written..written + count]
                .copy_from_slice(&self.samples[self.position..self.position + count]);
            written += count;
            self.position += count;
        }

        written / self.channels
    }

    #[inline]
    fn is_finished(&self) -> bool {
        !self.looping && self.position >= self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_until_the_end() {
        let mut decoder = BufferDecoder::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2);
        let mut chunk = [0.0; 4];
        assert_eq!(decoder.read(&mut chunk), 2);
        assert_eq!(chunk, [1.0, 2.0, 3.0, 4.0]);
        assert!(!decoder.is_finished());

        assert_eq!(decoder.read(&mut chunk), 1);
        assert_eq!(&chunk[..2], &[5.0, 6.0]);
        assert!(decoder.is_finished());
        assert_eq!(decoder.read(&mut chunk), 0);
    }

    #[test]
    fn partial_trailing_frame_is_dropped() {
        let decoder = BufferDecoder::new(vec![1.0, 2.0, 3.0], 2);
        assert_eq!(decoder.frames(), 1);
    }

    #[test]
    fn empty_looping_buffer_does_not_spin() {
        let mut decoder = BufferDecoder::new(Vec::new(), 1).with_looping(true);
        let mut chunk = [0.0; 4];
        assert_eq!(decoder.read(&mut chunk), 0);
    }
}

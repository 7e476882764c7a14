//! Streaming decoder fed through a ring buffer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};

use super::SourceDecoder;

/// Shared flags between the feeding thread and the render thread
#[derive(Default)]
struct StreamState {
    end_of_stream: AtomicBool,
    busy: AtomicBool,
    destroy: AtomicBool,
}

/// Render-side end of a streamed source.
///
/// Interleaved samples arrive through an `rtrb` ring buffer from a decoding
/// thread holding the matching [`StreamFeeder`]. Running dry before the
/// feeder marked the end of stream is a starve, not the end.
///
/// # Example
///
/// ```
/// use mischpult::decoder::{SourceDecoder, StreamDecoder};
///
/// let (mut feeder, mut decoder) = StreamDecoder::new(2, 4096);
/// feeder.push(&[0.5, -0.5]);
/// feeder.finish();
///
/// let mut chunk = [0.0; 8];
/// assert_eq!(decoder.read(&mut chunk), 1);
/// assert!(decoder.is_finished());
/// ```
pub struct StreamDecoder {
    consumer: Consumer<f32>,
    channels: usize,
    state: Arc<StreamState>,
}

/// Decoding-thread end of a [`StreamDecoder`]
pub struct StreamFeeder {
    producer: Producer<f32>,
    channels: usize,
    state: Arc<StreamState>,
}

impl StreamDecoder {
    /// Create a connected feeder/decoder pair holding up to `capacity` samples
    pub fn new(channels: usize, capacity: usize) -> (StreamFeeder, StreamDecoder) {
        let channels = channels.max(1);
        let (producer, consumer) = RingBuffer::new(capacity.max(channels));
        let state = Arc::new(StreamState::default());

        let feeder = StreamFeeder {
            producer,
            channels,
            state: state.clone(),
        };
        let decoder = StreamDecoder {
            consumer,
            channels,
            state,
        };
        (feeder, decoder)
    }

    /// Whole frames currently buffered
    #[inline]
    pub fn frames_available(&self) -> usize {
        self.consumer.slots() / self.channels
    }
}

impl StreamFeeder {
    /// Push as many whole frames of `samples` as fit; returns the number of frames pushed
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let frames = (self.producer.slots() / self.channels).min(samples.len() / self.channels);
        let count = frames * self.channels;
        for &sample in &samples[..count] {
            // Space was checked above
            if self.producer.push(sample).is_err() {
                break;
            }
        }
        frames
    }

    /// Free space in frames
    #[inline]
    pub fn frames_free(&self) -> usize {
        self.producer.slots() / self.channels
    }

    /// No more samples will be pushed
    pub fn finish(&mut self) {
        self.state.end_of_stream.store(true, Ordering::Release);
    }

    /// Mark a background operation (seek, prefetch) as in flight
    pub fn set_busy(&self, busy: bool) {
        self.state.busy.store(busy, Ordering::Release);
    }

    /// Ask the slot playing this stream to stop right away
    pub fn begin_destroy(&self) {
        self.state.destroy.store(true, Ordering::Release);
    }
}

impl SourceDecoder for StreamDecoder {
    #[inline]
    fn channels(&self) -> usize {
        self.channels
    }

    fn read(&mut self, buffer: &mut [f32]) -> usize {
        let frames = (buffer.len() / self.channels).min(self.frames_available());
        let count = frames * self.channels;
        let chunk = match self.consumer.read_chunk(count) {
            Ok(chunk) => chunk,
            Err(_) => return 0,
        };
        let (first, second) = chunk.as_slices();
        buffer[..first.len()].copy_from_slice(first);
        buffer[first.len()..count].copy_from_slice(second);
        chunk.commit_all();
        frames
    }

    fn is_finished(&self) -> bool {
        self.state.end_of_stream.load(Ordering::Acquire) && self.consumer.is_empty()
    }

    fn is_async_work_done(&self) -> bool {
        !self.state.busy.load(Ordering::Acquire)
    }

    fn finish_async_work(&mut self) {
        while !self.is_async_work_done() {
            std::thread::yield_now();
        }
    }

    fn is_begin_destroy(&self) -> bool {
        self.state.destroy.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starved_stream_is_not_finished() {
        let (mut feeder, mut decoder) = StreamDecoder::new(1, 16);
        let mut chunk = [0.0; 4];
        assert_eq!(decoder.read(&mut chunk), 0);
        assert!(!decoder.is_finished());

        feeder.push(&[1.0, 2.0]);
        assert_eq!(decoder.read(&mut chunk), 2);
        assert_eq!(&chunk[..2], &[1.0, 2.0]);

        feeder.finish();
        assert!(decoder.is_finished());
    }

    #[test]
    fn push_only_accepts_whole_frames() {
        let (mut feeder, decoder) = StreamDecoder::new(2, 5);
        assert_eq!(feeder.push(&[1.0; 8]), 2);
        assert_eq!(decoder.frames_available(), 2);
    }

    #[test]
    fn busy_flag_tracks_async_work() {
        let (feeder, decoder) = StreamDecoder::new(1, 4);
        feeder.set_busy(true);
        assert!(!decoder.is_async_work_done());
        feeder.set_busy(false);
        assert!(decoder.is_async_work_done());
        feeder.begin_destroy();
        assert!(decoder.is_begin_destroy());
    }
}

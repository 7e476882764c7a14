//! Decoders feed sample data into source slots.
//!
//! A slot pulls decoded chunks from its [`SourceDecoder`] on the render
//! thread. Decoding itself (file I/O, codecs) happens elsewhere; the decoder
//! only hands over frames that are already available.

mod buffer;
mod stream;

pub use buffer::BufferDecoder;
pub use stream::{StreamDecoder, StreamFeeder};

/// Source of interleaved `f32` frames for one source slot
pub trait SourceDecoder: Send {
    /// Number of interleaved channels produced by [`read`](Self::read)
    fn channels(&self) -> usize;

    /// Fill `buffer` with up to `buffer.len() / channels` frames.
    ///
    /// Returns the number of frames written. Returning fewer frames than
    /// requested while [`is_finished`](Self::is_finished) is `false` means
    /// the decoder is starved, not done.
    fn read(&mut self, buffer: &mut [f32]) -> usize;

    /// No more frames will ever be produced
    fn is_finished(&self) -> bool;

    /// Any background work touching this decoder has completed, so it may be dropped
    fn is_async_work_done(&self) -> bool {
        true
    }

    /// Block until background work completes. Only called during shutdown.
    fn finish_async_work(&mut self) {}

    /// The owning asset is being torn down; the slot should finish immediately
    fn is_begin_destroy(&self) -> bool {
        false
    }
}

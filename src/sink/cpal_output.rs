//! CPAL audio output

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig, SupportedStreamConfig};
use dasp_sample::{FromSample, Sample};

use crate::error::{MixerError, MixerResult};
use crate::mixer::MixerRenderer;

/// Frames rendered per pass inside one device callback
const SCRATCH_FRAMES: usize = 4096;

/// A running output stream rendering a mixer.
///
/// The CPAL stream runs on its own thread and owns the renderer; the device
/// callback renders straight into the device buffer. Dropping the output
/// stops the stream.
pub struct CpalOutput {
    channels: usize,
    sample_rate: u32,
    /// Frames handed to the device so far
    frames_played: Arc<AtomicU64>,
    had_error: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open a stream on `device` and start rendering
    pub fn new(
        device: &cpal::Device,
        config: &SupportedStreamConfig,
        mut renderer: MixerRenderer,
    ) -> MixerResult<Self> {
        let channels = config.channels() as usize;
        let sample_format = config.sample_format();
        let stream_config = config.config();
        let sample_rate = stream_config.sample_rate.0;

        if renderer.device_channels() != channels {
            tracing::debug!(
                mixer = renderer.device_channels(),
                device = channels,
                "adopting the device channel count"
            );
            renderer.set_device_channels(channels);
        }

        let frames_played = Arc::new(AtomicU64::new(0));
        let had_error = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        // Streams are not Send on every platform, so the stream lives on this thread
        let device = device.clone();
        let thread_frames = frames_played.clone();
        let thread_error = had_error.clone();
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("mischpult-output".into())
            .spawn(move || {
                let stream = build_stream(
                    &device,
                    sample_format,
                    &stream_config,
                    renderer,
                    thread_frames,
                    thread_error,
                )
                .and_then(|stream| stream.play().map(|_| stream).map_err(|e| e.to_string()));

                let stream = match stream {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while !thread_stop.load(Ordering::Acquire) {
                    std::thread::park();
                }
                drop(stream);
            })
            .map_err(|e| MixerError::Output(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(MixerError::Output(e)),
            Err(_) => return Err(MixerError::Output("output thread exited".into())),
        }

        tracing::debug!(channels, sample_rate, ?sample_format, "output stream started");

        Ok(Self {
            channels,
            sample_rate,
            frames_played,
            had_error,
            stop,
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames the device has requested so far
    #[inline]
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    /// Check and clear the stream error flag
    pub fn check_error(&self) -> bool {
        self.had_error.swap(false, Ordering::Relaxed)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

fn build_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    stream_config: &StreamConfig,
    renderer: MixerRenderer,
    frames_played: Arc<AtomicU64>,
    had_error: Arc<AtomicBool>,
) -> Result<cpal::Stream, String> {
    let stream = match sample_format {
        SampleFormat::F32 => build_typed::<f32>(device, stream_config, renderer, frames_played, had_error),
        SampleFormat::I16 => build_typed::<i16>(device, stream_config, renderer, frames_played, had_error),
        SampleFormat::U16 => build_typed::<u16>(device, stream_config, renderer, frames_played, had_error),
        other => return Err(format!("unsupported sample format: {other:?}")),
    };
    stream.map_err(|e| e.to_string())
}

fn build_typed<T>(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    mut renderer: MixerRenderer,
    frames_played: Arc<AtomicU64>,
    had_error: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = stream_config.channels as usize;
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * channels];

    device.build_output_stream(
        stream_config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for chunk in data.chunks_mut(scratch.len()) {
                let rendered = &mut scratch[..chunk.len()];
                renderer.render(rendered);
                for (out, sample) in chunk.iter_mut().zip(rendered.iter()) {
                    *out = sample.clamp(-1.0, 1.0).to_sample::<T>();
                }
            }
            frames_played.fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
        },
        move |err| {
            had_error.store(true, Ordering::Relaxed);
            tracing::warn!("output stream error: {err}");
        },
        None,
    )
}

//! Interleaved buffer helpers

use itertools::izip;

/// Zero a buffer
#[inline]
pub fn silence(buffer: &mut [f32]) {
    buffer.iter_mut().for_each(|s| *s = 0.0);
}

/// Apply a gain that moves linearly from `start` to `end` over the buffer's frames.
///
/// Frame `i` is scaled by `start + i * (end - start) / frames`.
pub fn apply_gain_ramp(buffer: &mut [f32], channels: usize, start: f32, end: f32) {
    let channels = channels.max(1);
    let frames = buffer.len() / channels;
    if start == end {
        if start != 1.0 {
            buffer.iter_mut().for_each(|s| *s *= start);
        }
        return;
    }

    let step = (end - start) / frames as f32;
    for (i, frame) in buffer.chunks_exact_mut(channels).enumerate() {
        let gain = start + step * i as f32;
        frame.iter_mut().for_each(|s| *s *= gain);
    }
}

/// `dst += src * gain`
#[inline]
pub fn mix_in(dst: &mut [f32], src: &[f32], gain: f32) {
    if gain == 0.0 {
        return;
    }
    for (d, s) in izip!(dst.iter_mut(), src) {
        *d += *s * gain;
    }
}

/// `dst += convert(src) * gain` across channel layouts.
///
/// Mono into stereo duplicates, stereo into mono averages, any other mismatch
/// pairs channels by index and drops the rest.
pub fn mix_converted(src: &[f32], src_channels: usize, dst: &mut [f32], dst_channels: usize, gain: f32) {
    if gain == 0.0 {
        return;
    }
    let (src_channels, dst_channels) = (src_channels.max(1), dst_channels.max(1));
    if src_channels == dst_channels {
        return mix_in(dst, src, gain);
    }

    let frames = (src.len() / src_channels).min(dst.len() / dst_channels);
    let src_frames = src.chunks_exact(src_channels).take(frames);
    let dst_frames = dst.chunks_exact_mut(dst_channels).take(frames);

    match (src_channels, dst_channels) {
        (1, 2) => {
            for (s, d) in izip!(src_frames, dst_frames) {
                d[0] += s[0] * gain;
                d[1] += s[0] * gain;
            }
        }
        (2, 1) => {
            for (s, d) in izip!(src_frames, dst_frames) {
                d[0] += 0.5 * (s[0] + s[1]) * gain;
            }
        }
        _ => {
            for (s, d) in izip!(src_frames, dst_frames) {
                for (d, s) in izip!(d.iter_mut(), s) {
                    *d += *s * gain;
                }
            }
        }
    }
}

/// Mean absolute sample value
pub fn average_amplitude(buffer: &[f32]) -> f32 {
    if buffer.is_empty() {
        return 0.0;
    }
    buffer.iter().map(|s| s.abs()).sum::<f32>() / buffer.len() as f32
}

/// Apply a gain matrix, `map[in_ch * out_channels + out_ch]`, frame by frame.
///
/// `out` is overwritten.
pub fn apply_channel_map(
    input: &[f32],
    in_channels: usize,
    out: &mut [f32],
    out_channels: usize,
    map: &[f32],
) {
    let frames = (input.len() / in_channels.max(1)).min(out.len() / out_channels.max(1));
    for frame in 0..frames {
        let src = &input[frame * in_channels..(frame + 1) * in_channels];
        let dst = &mut out[frame * out_channels..(frame + 1) * out_channels];
        for (out_ch, d) in dst.iter_mut().enumerate() {
            *d = src
                .iter()
                .enumerate()
                .map(|(in_ch, s)| s * map[in_ch * out_channels + out_ch])
                .sum();
        }
    }
}

use std::f32::consts::FRAC_1_SQRT_2;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mischpult::decoder::BufferDecoder;
use mischpult::format::ChannelFormat;
use mischpult::plugin::{
    OcclusionPlugin, PluginInput, PluginRequest, PluginSettings, PluginVoice, Plugins, ReverbPlugin,
    SpatializationParams, SpatializationPlugin,
};
use mischpult::source::{BusSend, SourceInitParams};
use mischpult::submix::SubmixSettings;
use mischpult::{BusId, Mixer, MixerConfig, MixerError, MixerEvent, SourceHandle, SubmixId};

const RATE: u32 = 48_000;
const FRAMES: usize = 512;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(channels: usize) -> MixerConfig {
    MixerConfig::new(RATE)
        .with_channels(channels)
        .with_block_frames(FRAMES)
        .with_max_sources(8)
}

fn mixer(channels: usize) -> Mixer {
    init_tracing();
    Mixer::new(config(channels)).unwrap()
}

fn mixer_with_plugins(config: MixerConfig, plugins: Plugins) -> Mixer {
    init_tracing();
    Mixer::with_plugins(config, plugins).unwrap()
}

fn constant(value: f32, channels: usize, frames: usize) -> SourceInitParams {
    SourceInitParams::new(BufferDecoder::new(vec![value; frames * channels], channels), RATE)
}

fn block(mixer: &mut Mixer) -> Vec<f32> {
    let mut out = vec![0.0; FRAMES * mixer.device_channels()];
    mixer.render(&mut out);
    out
}

fn assert_all(buffer: &[f32], expected: f32) {
    for (i, s) in buffer.iter().enumerate() {
        assert!((s - expected).abs() < 1e-5, "sample {i} is {s}, expected {expected}");
    }
}

#[test]
fn silent_without_sources() {
    let mut mixer = mixer(2);
    let source = mixer.acquire_source().unwrap();
    mixer.init_source(source, constant(1.0, 1, RATE as usize)).unwrap();
    mixer.update();

    // initialized but never played
    for _ in 0..3 {
        assert_all(&block(&mut mixer), 0.0);
    }
    assert_eq!(mixer.num_active_sources(), 1);
}

#[test]
fn constant_mono_source_reaches_device_gain() {
    let mut mixer = mixer(2);
    let source = mixer.acquire_source().unwrap();
    mixer.init_source(source, constant(1.0, 1, RATE as usize)).unwrap();
    mixer.set_volume(source, 1.0).unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    let mut last = Vec::new();
    for _ in 0..10 {
        last = block(&mut mixer);
    }
    assert_all(&last, FRAC_1_SQRT_2);
    assert_eq!(mixer.num_frames_played(source), (10 * FRAMES) as u64 + 1);
    assert_eq!(mixer.audio_clock_frames(), (10 * FRAMES) as u64);
}

#[test]
fn volume_changes_are_ramped() {
    let mut mixer = mixer(1);
    let source = mixer.acquire_source().unwrap();
    mixer.init_source(source, constant(1.0, 1, RATE as usize)).unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    let mut rendered = block(&mut mixer);
    for volume in [0.0, 0.8, 0.1, 1.0] {
        mixer.set_volume(source, volume).unwrap();
        mixer.update();
        rendered.extend(block(&mut mixer));
    }
    rendered.extend(block(&mut mixer));

    // the steepest ramp goes 0.0 -> 1.0 within one block
    let slope = 1.0 / FRAMES as f32;
    for pair in rendered.windows(2) {
        assert!((pair[1] - pair[0]).abs() <= slope + 1e-5, "jump {} -> {}", pair[0], pair[1]);
    }
    assert!((rendered.last().copied().unwrap() - 1.0).abs() < 1e-5);
}

#[test]
fn mono_through_stereo_back_to_mono_is_unity() {
    let mut mixer = mixer(1);
    let stereo = mixer
        .register_submix(SubmixSettings::new(ChannelFormat::Stereo))
        .unwrap();
    let source = mixer.acquire_source().unwrap();
    mixer
        .init_source(source, constant(1.0, 1, RATE as usize).with_submix_send(stereo, 1.0))
        .unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    block(&mut mixer);
    assert_all(&block(&mut mixer), 1.0);
}

#[test]
fn mono_submix_under_stereo_master() {
    let mut mixer = mixer(2);
    let mono = mixer
        .register_submix(SubmixSettings::new(ChannelFormat::Mono))
        .unwrap();
    assert_eq!(mixer.submix_parent(mono), Some(SubmixId::MASTER));

    let source = mixer.acquire_source().unwrap();
    mixer
        .init_source(source, constant(0.5, 2, RATE as usize).with_submix_send(mono, 1.0))
        .unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    // stereo 0.5 folds to mono 0.5 * 2 / √2, then spreads at 1/√2 per side
    assert_all(&block(&mut mixer), 0.5);
}

#[test]
fn bus_source_hears_the_previous_block() {
    let mut mixer = mixer(1);
    let reverb = BusId(7);

    let bus_source = mixer.acquire_source().unwrap();
    mixer
        .init_source(bus_source, SourceInitParams::from_bus(reverb, 1))
        .unwrap();

    let a = mixer.acquire_source().unwrap();
    let b = mixer.acquire_source().unwrap();
    for (handle, value) in [(a, 1.0), (b, 0.5)] {
        let params = constant(value, 1, RATE as usize)
            .with_bus_send(BusSend::post_effect(reverb, 0.5))
            .output_to_bus_only();
        mixer.init_source(handle, params).unwrap();
    }
    for handle in [bus_source, a, b] {
        mixer.play(handle).unwrap();
    }
    mixer.update();

    // nothing was mixed before the first block
    assert_all(&block(&mut mixer), 0.0);
    // 0.5 * (1.0 + 0.5)
    assert_all(&block(&mut mixer), 0.75);
    assert_eq!(mixer.num_active_buses(), 1);

    mixer.stop(a).unwrap();
    mixer.update();
    // the stop silences a in this block, the bus source still plays last block's mix
    assert_all(&block(&mut mixer), 0.75);
    assert_all(&block(&mut mixer), 0.25);
}

#[test]
fn released_slot_is_acquired_next() {
    let mut mixer = mixer(2);
    let handles: Vec<_> = (0..8).map(|_| mixer.acquire_source().unwrap()).collect();
    assert_eq!(mixer.acquire_source(), Err(MixerError::NoFreeSource { capacity: 8 }));

    let mut indices: Vec<_> = handles.iter().map(|h| h.index()).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), 8);

    mixer.release_source(handles[5]);
    mixer.release_source(handles[5]);
    let again = mixer.acquire_source().unwrap();
    assert_eq!(again.index(), handles[5].index());
    assert_ne!(again, handles[5]);
    assert_eq!(mixer.acquire_source(), Err(MixerError::NoFreeSource { capacity: 8 }));
}

#[test]
fn submix_cycles_are_rejected() {
    let mut mixer = mixer(2);
    let a = mixer.register_submix(SubmixSettings::new(ChannelFormat::Stereo)).unwrap();
    let b = mixer
        .register_submix(SubmixSettings::new(ChannelFormat::Stereo).with_parent(a))
        .unwrap();
    assert_eq!(mixer.set_submix_parent(a, b), Err(MixerError::SubmixCycle { child: a, parent: b }));
    assert_eq!(mixer.set_submix_parent(a, a), Err(MixerError::SubmixCycle { child: a, parent: a }));
    assert_eq!(
        mixer.set_submix_parent(SubmixId::MASTER, a),
        Err(MixerError::CannotRemoveMaster)
    );
    assert_eq!(mixer.unregister_submix(SubmixId::MASTER), Err(MixerError::CannotRemoveMaster));
}

#[test]
fn unregistered_submix_sends_fall_back_to_master() {
    let mut mixer = mixer(2);
    let stereo = mixer.register_submix(SubmixSettings::new(ChannelFormat::Stereo)).unwrap();
    let source = mixer.acquire_source().unwrap();
    mixer
        .init_source(source, constant(0.5, 2, RATE as usize).with_submix_send(stereo, 1.0))
        .unwrap();
    mixer.play(source).unwrap();
    mixer.update();
    block(&mut mixer);

    mixer.unregister_submix(stereo).unwrap();
    mixer.update();
    assert_eq!(mixer.num_submixes(), 1);
    // the default map of the master takes over on the next block
    block(&mut mixer);
    assert_all(&block(&mut mixer), 0.5);
    assert_eq!(
        mixer.set_submix_output_volume(stereo, 0.0),
        Err(MixerError::UnknownSubmix(stereo))
    );
}

#[test]
fn submix_output_volume_and_listener() {
    let mut mixer = mixer(2);
    let stereo = mixer.register_submix(SubmixSettings::new(ChannelFormat::Stereo)).unwrap();
    let source = mixer.acquire_source().unwrap();
    mixer
        .init_source(source, constant(1.0, 2, RATE as usize).with_submix_send(stereo, 1.0))
        .unwrap();
    mixer.play(source).unwrap();
    let (_, mut reader) = mixer.add_buffer_listener(stereo, FRAMES * 2 * 4).unwrap();
    let envelope = mixer.start_envelope_following(stereo, 1.0, 100.0).unwrap();
    mixer.update();
    block(&mut mixer);

    mixer.set_submix_output_volume(stereo, 0.0).unwrap();
    mixer.update();
    block(&mut mixer);
    assert_all(&block(&mut mixer), 0.0);

    assert_eq!(reader.channels(), 2);
    let mut heard = vec![0.0; FRAMES * 2];
    assert_eq!(reader.read(&mut heard), FRAMES * 2);
    assert_all(&heard, 1.0);
    assert!(envelope.get(0) > 0.0);
}

#[test]
fn finished_sources_report_done() {
    let mut mixer = mixer(2);
    let short = mixer.acquire_source().unwrap();
    mixer.init_source(short, constant(1.0, 1, 100)).unwrap();
    mixer.play(short).unwrap();
    mixer.update();

    block(&mut mixer);
    block(&mut mixer);
    let events: Vec<_> = mixer.poll_events().collect();
    assert!(events.contains(&MixerEvent::SourceDone(short)));
    assert!(mixer.is_done(short));

    mixer.release_source(short);
    mixer.update();
    assert!(!mixer.is_done(short));
    assert_eq!(mixer.play(short), Err(MixerError::StaleSource(short)));
}

#[test]
fn flush_times_out_without_a_renderer() {
    init_tracing();
    let config = MixerConfig::new(RATE).with_flush_timeout(Duration::from_millis(20));
    let (mut handle, _renderer) = Mixer::new(config).unwrap().split();
    let source = handle.acquire_source().unwrap();
    handle.init_source(source, constant(1.0, 1, 16)).unwrap();
    assert_eq!(handle.flush(), Err(MixerError::FlushTimeout { millis: 20 }));
}

#[test]
fn renderer_runs_on_its_own_thread() {
    init_tracing();
    let config = MixerConfig::new(RATE).with_block_frames(64).with_source_workers(2);
    let (mut handle, mut renderer) = Mixer::new(config).unwrap().split();

    let running = Arc::new(AtomicBool::new(true));
    let render_thread = {
        let running = running.clone();
        thread::spawn(move || {
            let mut out = vec![0.0; 64 * 2];
            while running.load(Ordering::Relaxed) {
                renderer.render(&mut out);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let sources: Vec<_> = (0..4).map(|_| handle.acquire_source().unwrap()).collect();
    for source in &sources {
        handle.init_source(*source, constant(0.1, 1, RATE as usize)).unwrap();
        handle.play(*source).unwrap();
    }
    handle.flush().unwrap();

    let start = handle.audio_clock_frames();
    while handle.audio_clock_frames() < start + 64 * 4 {
        thread::sleep(Duration::from_millis(1));
    }
    for source in &sources {
        assert!(handle.num_frames_played(*source) > 0);
    }

    for source in sources {
        handle.release_source(source);
    }
    handle.flush().unwrap();
    running.store(false, Ordering::Relaxed);
    render_thread.join().unwrap();
}

/// Pans a mono source between left and right by `position[0]`
struct PanVoice;

impl PluginVoice for PanVoice {
    fn process_audio(&mut self, input: &PluginInput<'_>, output: &mut [f32]) {
        let right = input.spatialization.position[0];
        for (frame, s) in output.chunks_exact_mut(2).zip(input.samples) {
            frame[0] = s * (1.0 - right);
            frame[1] = s * right;
        }
    }
}

struct Panner {
    released: Arc<AtomicUsize>,
}

impl SpatializationPlugin for Panner {
    fn on_init_source(
        &mut self,
        _handle: SourceHandle,
        channels: usize,
        _settings: Option<&PluginSettings>,
    ) -> Option<Box<dyn PluginVoice>> {
        (channels == 1).then(|| Box::new(PanVoice) as Box<dyn PluginVoice>)
    }

    fn on_release_source(&mut self, _handle: SourceHandle) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Writes `input * gain` to the output
struct ScaleVoice(f32);

impl PluginVoice for ScaleVoice {
    fn process_audio(&mut self, input: &PluginInput<'_>, output: &mut [f32]) {
        for (o, s) in output.iter_mut().zip(input.samples) {
            *o = s * self.0;
        }
    }
}

struct Occluder;

impl OcclusionPlugin for Occluder {
    fn on_init_source(
        &mut self,
        _handle: SourceHandle,
        _channels: usize,
        _settings: Option<&PluginSettings>,
    ) -> Option<Box<dyn PluginVoice>> {
        Some(Box::new(ScaleVoice(0.5)))
    }
}

struct Reverb;

impl ReverbPlugin for Reverb {
    fn on_init_source(
        &mut self,
        _handle: SourceHandle,
        _channels: usize,
        settings: Option<&PluginSettings>,
    ) -> Option<Box<dyn PluginVoice>> {
        let wet = settings.and_then(|s| s.downcast_ref::<f32>()).copied().unwrap_or(0.25);
        Some(Box::new(ScaleVoice(wet)))
    }
}

#[test]
fn spatialized_mono_source_becomes_stereo() {
    let released = Arc::new(AtomicUsize::new(0));
    let plugins = Plugins::new().with_spatialization(Panner {
        released: released.clone(),
    });
    let mut mixer = mixer_with_plugins(config(2), plugins);

    let source = mixer.acquire_source().unwrap();
    mixer
        .init_source(
            source,
            constant(1.0, 1, RATE as usize).with_spatialization(PluginRequest::enabled()),
        )
        .unwrap();
    let params = SpatializationParams {
        position: [0.25, 0.0, 0.0],
        ..SpatializationParams::default()
    };
    mixer.set_spatialization_params(source, params).unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    // stereo straight to a stereo device, no mono spread
    let out = block(&mut mixer);
    for frame in out.chunks_exact(2) {
        assert!((frame[0] - 0.75).abs() < 1e-5, "left is {}", frame[0]);
        assert!((frame[1] - 0.25).abs() < 1e-5, "right is {}", frame[1]);
    }

    mixer.release_source(source);
    mixer.update();
    assert_eq!(released.load(Ordering::Relaxed), 1);
}

#[test]
fn spatialization_is_skipped_when_not_requested() {
    let plugins = Plugins::new().with_spatialization(Panner {
        released: Arc::new(AtomicUsize::new(0)),
    });
    let mut mixer = mixer_with_plugins(config(2), plugins);

    let source = mixer.acquire_source().unwrap();
    mixer.init_source(source, constant(1.0, 1, RATE as usize)).unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    assert_all(&block(&mut mixer), FRAC_1_SQRT_2);
}

#[test]
fn reverb_is_mixed_in_before_occlusion() {
    let plugins = Plugins::new().with_occlusion(Occluder).with_reverb(Reverb);
    let mut mixer = mixer_with_plugins(config(1), plugins);

    let source = mixer.acquire_source().unwrap();
    let params = constant(1.0, 1, RATE as usize)
        .with_occlusion(PluginRequest::enabled())
        .with_reverb(PluginRequest::enabled());
    mixer.init_source(source, params).unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    // (1.0 + 0.25) * 0.5
    assert_all(&block(&mut mixer), 0.625);
}

#[test]
fn external_reverb_leaves_the_source_dry() {
    let mut config = config(1);
    config.reverb_is_external_send = true;
    let mut mixer = mixer_with_plugins(config, Plugins::new().with_reverb(Reverb));

    let source = mixer.acquire_source().unwrap();
    let wet: PluginSettings = Arc::new(0.9_f32);
    let params = constant(1.0, 1, RATE as usize).with_reverb(PluginRequest::enabled().with_settings(wet));
    mixer.init_source(source, params).unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    assert_all(&block(&mut mixer), 1.0);
}

#[test]
fn distance_attenuation_scales_and_ramps() {
    let mut mixer = mixer(1);
    let source = mixer.acquire_source().unwrap();
    mixer.init_source(source, constant(1.0, 1, RATE as usize)).unwrap();
    mixer.set_distance_attenuation(source, 0.5).unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    // the first value applies right away
    assert_all(&block(&mut mixer), 0.5);

    mixer.set_distance_attenuation(source, 0.25).unwrap();
    mixer.update();
    let ramp = block(&mut mixer);
    assert!((ramp[0] - 0.5).abs() < 1e-5);
    assert!((ramp[FRAMES / 2] - 0.375).abs() < 1e-5);
    assert_all(&block(&mut mixer), 0.25);
}

#[test]
fn low_pass_removes_high_frequencies() {
    let mut mixer = mixer(1);
    let nyquist: Vec<f32> = (0..RATE as usize).map(|n| if n % 2 == 0 { 1.0 } else { -1.0 }).collect();
    let source = mixer.acquire_source().unwrap();
    mixer
        .init_source(source, SourceInitParams::new(BufferDecoder::new(nyquist, 1), RATE))
        .unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    let unfiltered = block(&mut mixer);
    assert!(unfiltered.iter().all(|s| (s.abs() - 1.0).abs() < 1e-5));

    mixer.set_lpf_frequency(source, 100.0).unwrap();
    mixer.update();
    for _ in 0..3 {
        block(&mut mixer);
    }
    let filtered = block(&mut mixer);
    let peak = filtered.iter().fold(0.0_f32, |peak, s| peak.max(s.abs()));
    assert!(peak < 0.02, "peak {peak}");
}

#[test]
fn high_pass_removes_dc() {
    let mut mixer = mixer(1);
    let source = mixer.acquire_source().unwrap();
    mixer.init_source(source, constant(1.0, 1, RATE as usize)).unwrap();
    mixer.set_hpf_frequency(source, 200.0).unwrap();
    mixer.play(source).unwrap();
    mixer.update();

    let first = block(&mut mixer);
    assert!(first[0] > 0.9);
    for _ in 0..4 {
        block(&mut mixer);
    }
    assert!(block(&mut mixer).iter().all(|s| s.abs() < 1e-3));
}

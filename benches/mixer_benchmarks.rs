use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use mischpult::decoder::BufferDecoder;
use mischpult::effect::{Gain, SubmixEffectSlot};
use mischpult::format::ChannelFormat;
use mischpult::source::{BusId, BusSend, SourceInitParams};
use mischpult::submix::SubmixSettings;
use mischpult::{Mixer, MixerConfig};

const RATE: u32 = 48_000;
const FRAMES: usize = 480;

fn playing_mixer(sources: usize, workers: usize) -> Mixer {
    let config = MixerConfig::new(RATE)
        .with_block_frames(FRAMES)
        .with_max_sources(sources + 1)
        .with_source_workers(workers);
    let mut mixer = Mixer::new(config).unwrap();

    let music = mixer
        .register_submix(SubmixSettings::new(ChannelFormat::Stereo).with_effect(SubmixEffectSlot::new(Gain::new(0.5))))
        .unwrap();
    let reverb = BusId(1);
    let bus_source = mixer.acquire_source().unwrap();
    mixer
        .init_source(bus_source, SourceInitParams::from_bus(reverb, 2))
        .unwrap();
    mixer.play(bus_source).unwrap();

    for i in 0..sources {
        let samples: Vec<f32> = (0..RATE as usize).map(|n| ((n + i) as f32 * 0.01).sin() * 0.1).collect();
        let decoder = BufferDecoder::new(samples, 1).with_looping(true);
        let params = SourceInitParams::new(decoder, 44_100)
            .with_submix_send(music, 1.0)
            .with_bus_send(BusSend::post_effect(reverb, 0.2).with_channels(2));
        let source = mixer.acquire_source().unwrap();
        mixer.init_source(source, params).unwrap();
        mixer.play(source).unwrap();
    }
    mixer.update();
    mixer
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Mixer.render()");
    for sources in [1, 16, 64] {
        group.bench_with_input(BenchmarkId::new("inline", sources), &sources, |b, &sources| {
            let mut mixer = playing_mixer(sources, 0);
            let mut out = vec![0.0; FRAMES * 2];
            b.iter(|| mixer.render(black_box(&mut out)))
        });
        group.bench_with_input(BenchmarkId::new("workers", sources), &sources, |b, &sources| {
            let mut mixer = playing_mixer(sources, 4);
            let mut out = vec![0.0; FRAMES * 2];
            b.iter(|| mixer.render(black_box(&mut out)))
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

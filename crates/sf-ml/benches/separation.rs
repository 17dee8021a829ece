//! Separation benchmarks on randomly initialised tiny HTDemucs / HDemucs

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use sf_ml::separation::{ApplyOptions, SeparationConfig, apply_model};
use sf_ml::{HDemucs, HDemucsConfig, HTDemucs, HTDemucsConfig};

fn tiny_model() -> HTDemucs {
    let config = HTDemucsConfig::tiny();
    let store = config.random_weights(7);
    HTDemucs::load(&store, config, "bench").unwrap()
}

fn mix(frames: usize) -> Array2<f32> {
    Array2::from_shape_fn((2, frames), |(c, i)| {
        let t = i as f32 / 8000.0;
        0.4 * (2.0 * std::f32::consts::PI * 220.0 * t).sin() + 0.1 * c as f32
    })
}

fn bench_forward(c: &mut Criterion) {
    let model = tiny_model();
    let mut group = c.benchmark_group("htdemucs_forward");

    for frames in [1000, 4000] {
        let input = mix(frames);
        group.bench_with_input(BenchmarkId::from_parameter(frames), &frames, |b, _| {
            b.iter(|| model.forward(black_box(input.view())).unwrap())
        });
    }

    group.finish();
}

fn bench_forward_v3(c: &mut Criterion) {
    let config = HDemucsConfig::tiny();
    let store = config.random_weights(7);
    let model = HDemucs::load(&store, config, "bench-v3").unwrap();
    let input = mix(4000);
    c.bench_function("hdemucs_forward/4000", |b| {
        b.iter(|| model.forward(black_box(input.view())).unwrap())
    });
}

fn bench_apply(c: &mut Criterion) {
    let model = tiny_model();
    let input = mix(8000 * 3);
    let mut group = c.benchmark_group("apply_model_3s");

    for (label, config) in [
        ("fast", SeparationConfig::fast()),
        ("default", SeparationConfig::default()),
        ("shifts_2", SeparationConfig::default().with_shifts(2)),
    ] {
        let options = ApplyOptions::from(&config);
        group.bench_function(label, |b| {
            b.iter(|| apply_model(&model, black_box(input.view()), &options).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward, bench_forward_v3, bench_apply);
criterion_main!(benches);

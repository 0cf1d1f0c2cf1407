use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use fusion_calib::math::{estimate_accel_step, estimate_magn_step, normalize};
use fusion_calib::{
    Datum, Engine, EngineConfig, FusionConfig, FusionCore, InstanceConfig, Pipeline,
    QUEUE_CAPACITY, Triple,
};
use nalgebra::{Quaternion, Vector3};
use rand::prelude::*;
use rand_pcg::Pcg64;
use std::f32::consts::PI;

/// 100 Hz in 10 µs ticks
const PERIOD: u32 = 1_000;

// Pre-generated sensor data to eliminate RNG overhead during benchmarks
struct PreGeneratedData {
    samples: Vec<Triple>,
    index: usize,
}

impl PreGeneratedData {
    fn new(count: usize, seed: u64) -> Self {
        let mut rng = Pcg64::seed_from_u64(seed);
        let mut samples = Vec::with_capacity(count);

        for i in 0..count {
            let time = i as f32 * 0.01;
            let phase = time * 0.5 * 2.0 * PI;

            // Q8.8 rad/s
            let gyro = Vector3::new(
                50.0 * phase.sin() + rng.random_range(-2.0..2.0),
                50.0 * (phase * 1.3).cos() + rng.random_range(-2.0..2.0),
                50.0 * (phase * 0.7).sin() + rng.random_range(-2.0..2.0),
            );

            let accel = Vector3::new(
                -0.1 * phase.sin() + rng.random_range(-0.002..0.002),
                0.1 * phase.cos() + rng.random_range(-0.002..0.002),
                1.0 + rng.random_range(-0.002..0.002),
            );

            let magn = Vector3::new(
                25.0 + 2.0 * phase.cos() + rng.random_range(-0.5..0.5),
                2.0 * phase.sin() + rng.random_range(-0.5..0.5),
                -40.0 + rng.random_range(-0.5..0.5),
            );

            samples.push(Triple::new(i as u32 * PERIOD, gyro, accel, magn));
        }

        Self { samples, index: 0 }
    }

    fn next(&mut self) -> Triple {
        let sample = self.samples[self.index];
        self.index = (self.index + 1) % self.samples.len();
        sample
    }
}

fn synchronous_engine(pipeline: Pipeline) -> (Engine, fusion_calib::Handle) {
    let mut engine = Engine::new(EngineConfig {
        queue_depth: 0,
        ..Default::default()
    })
    .expect("engine");
    let handle = engine
        .add_instance(InstanceConfig::default(), pipeline)
        .expect("instance");
    (engine, handle)
}

/// Gradient steps in isolation
fn bench_gradient_steps(c: &mut Criterion) {
    let q = Quaternion::new(0.98, 0.1, -0.05, 0.15);
    let accel = normalize(Vector3::new(0.05, -0.1, 0.99));
    let magn = normalize(Vector3::new(22.0, 5.0, -41.0));

    c.bench_function("accel_step", |b| {
        b.iter(|| estimate_accel_step(black_box(q), black_box(accel), 0.01))
    });
    c.bench_function("magn_step", |b| {
        b.iter(|| estimate_magn_step(black_box(q), black_box(magn), 0.005))
    });
}

/// Fusion core alone, one triple per iteration
fn bench_fusion_core(c: &mut Criterion) {
    let core = FusionCore::new(FusionConfig::default());
    let mut data = PreGeneratedData::new(1000, 42);
    core.update_triple(data.next());

    c.bench_function("fusion_core_triple", |b| {
        b.iter(|| core.update_triple(black_box(data.next())))
    });
}

/// Full synchronous pipeline for each profile
fn bench_pipelines(c: &mut Criterion) {
    let profiles = [
        ("core_only", Pipeline::CORE_ONLY),
        ("rectified", Pipeline::RECTIFIED),
        ("points", Pipeline::POINTS),
        ("full", Pipeline::FULL),
    ];

    let mut group = c.benchmark_group("pipeline_triple");
    for (name, pipeline) in profiles {
        let (engine, handle) = synchronous_engine(pipeline);
        let mut data = PreGeneratedData::new(1000, 7);
        group.bench_function(name, |b| {
            b.iter(|| engine.submit_triple(handle, black_box(data.next())))
        });
    }
    group.finish();
}

/// Single-datum dispatch, sensors interleaved
fn bench_single_datums(c: &mut Criterion) {
    let (engine, handle) = synchronous_engine(Pipeline::FULL);
    let mut data = PreGeneratedData::new(1000, 11);

    c.bench_function("pipeline_single_datums", |b| {
        b.iter(|| {
            for datum in data.next().datums() {
                let _ = engine.submit(handle, black_box(datum));
            }
        })
    });
}

/// Fill the queue, then pump it on the caller thread
fn bench_queue_round_trip(c: &mut Criterion) {
    let mut engine = Engine::new(EngineConfig {
        queue_depth: QUEUE_CAPACITY,
        ..Default::default()
    })
    .expect("engine");
    let handle = engine
        .add_instance(InstanceConfig::default(), Pipeline::FULL)
        .expect("instance");
    let data = PreGeneratedData::new(QUEUE_CAPACITY, 3);

    c.bench_function("queue_fill_and_process", |b| {
        b.iter_batched(
            || data.samples.clone(),
            |batch| {
                for triple in batch {
                    let _ = engine.submit_triple(handle, triple);
                }
                engine.process_queued()
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_engine_creation(c: &mut Criterion) {
    c.bench_function("engine_with_instance", |b| {
        b.iter(|| synchronous_engine(black_box(Pipeline::FULL)))
    });
}

fn bench_datum_construction(c: &mut Criterion) {
    let triple = PreGeneratedData::new(1, 1).next();
    c.bench_function("triple_datums", |b| b.iter(|| black_box(triple).datums()));
    c.bench_function("datum_new", |b| {
        b.iter(|| Datum::gyro(black_box(10), black_box(triple.gyro)))
    });
}

criterion_group!(
    benches,
    bench_gradient_steps,
    bench_fusion_core,
    bench_pipelines,
    bench_single_datums,
    bench_queue_round_trip,
    bench_engine_creation,
    bench_datum_construction
);

criterion_main!(benches);

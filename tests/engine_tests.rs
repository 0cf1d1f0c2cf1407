use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use fusion_calib::{
    Datum, Engine, EngineConfig, Error, FusionState, Handle, InstanceConfig, MAX_INSTANCES,
    Pipeline, PointEntry, QUEUE_CAPACITY, StabilityState, Status, Triple, ZeroingPolicy,
};
use nalgebra::{Quaternion, Vector3};

const PERIOD: u32 = 1_000;

fn engine(queue_depth: usize) -> Engine {
    Engine::new(EngineConfig {
        queue_depth,
        idle_sleep_us: 100,
    })
    .unwrap()
}

/// Slowly tumbling device: gyro about x, accel and magnetometer consistent
fn sample(k: u32) -> Triple {
    let angle = 0.5 * k as f32 * 0.01;
    let (s, c) = angle.sin_cos();
    Triple::new(
        k * PERIOD,
        Vector3::new(0.5 * 256.0, 0.0, 0.0),
        Vector3::new(0.0, s, c),
        Vector3::new(25.0, -40.0 * s, -40.0 * c),
    )
}

#[test]
fn test_queued_matches_synchronous() {
    let mut direct = engine(0);
    let mut queued = engine(16);
    let a = direct.add_instance(InstanceConfig::default(), Pipeline::FULL).unwrap();
    let b = queued.add_instance(InstanceConfig::default(), Pipeline::FULL).unwrap();

    for batch in 0..20 {
        for k in batch * 10..(batch + 1) * 10 {
            let triple = sample(k);
            direct.submit_triple(a, triple).unwrap();
            assert_eq!(queued.submit_triple(b, triple), Ok(Status::Queued));
        }
        assert_eq!(queued.process_queued(), Ok(10));
    }

    let direct = direct.get_estimate(a).unwrap();
    let queued = queued.get_estimate(b).unwrap();
    assert_eq!(direct, queued);
    assert_eq!(direct.state, FusionState::NormalOp);
}

#[test]
fn test_single_datums_keep_fifo_order() {
    let mut engine = engine(32);
    let handle = engine.add_instance(InstanceConfig::default(), Pipeline::CORE_ONLY).unwrap();

    // Magnetometer first, then accel: only valid as a revisit in this order
    engine
        .submit(handle, Datum::magn(0, Vector3::new(20.0, 0.0, -40.0)))
        .unwrap();
    engine
        .submit(handle, Datum::accel(PERIOD, Vector3::new(0.0, 0.0, 1.0)))
        .unwrap();
    assert_eq!(engine.pending(), 2);
    engine.drain();

    let estimate = engine.get_estimate(handle).unwrap();
    assert_eq!(estimate.state, FusionState::ZeroedBoth);
    assert!(estimate.ready);
}

#[test]
fn test_overflow_reports_and_counts() {
    let mut engine = engine(QUEUE_CAPACITY);
    let handle = engine.add_instance(InstanceConfig::default(), Pipeline::CORE_ONLY).unwrap();

    let mut overflows = 0;
    for k in 0..(QUEUE_CAPACITY as u32 + 10) {
        match engine.submit(handle, Datum::gyro(k * PERIOD, Vector3::zeros())) {
            Ok(Status::Queued) => {}
            Ok(Status::Overflow) => overflows += 1,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(overflows, 10);
    assert_eq!(engine.overflow_count(), 10);
    assert_eq!(engine.pending(), QUEUE_CAPACITY);
}

#[test]
fn test_consumer_with_concurrent_producers() {
    let mut engine = engine(QUEUE_CAPACITY);
    let handles: Vec<Handle> = (0..MAX_INSTANCES)
        .map(|_| engine.add_instance(InstanceConfig::default(), Pipeline::FULL).unwrap())
        .collect();
    engine.start().unwrap();

    let overflows = AtomicUsize::new(0);
    thread::scope(|scope| {
        for &handle in &handles {
            let engine = &engine;
            let overflows = &overflows;
            scope.spawn(move || {
                for k in 0..250 {
                    match engine.submit_triple(handle, sample(k)) {
                        Ok(Status::Overflow) => {
                            overflows.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Status::Queued) => {}
                        other => panic!("unexpected {:?}", other),
                    }
                }
            });
        }
    });

    engine.drain();
    assert_eq!(engine.pending(), 0);
    assert_eq!(engine.overflow_count() as usize, overflows.load(Ordering::Relaxed));

    // Evictions may have hit any instance; one more triple each reaches all of them
    for &handle in &handles {
        assert_eq!(engine.submit_triple(handle, sample(250)), Ok(Status::Queued));
    }
    engine.drain();

    for handle in handles {
        let estimate = engine.get_estimate(handle).unwrap();
        assert!(estimate.state.is_initialized());
        assert!((estimate.quaternion.norm() - 1.0).abs() < 1e-4);
        assert!(estimate.quaternion.coords.iter().all(|c| c.is_finite()));
    }
    engine.stop();
    assert!(!engine.is_running());
}

#[test]
fn test_stop_leaves_queue_intact() {
    let mut engine = engine(8);
    let handle = engine.add_instance(InstanceConfig::default(), Pipeline::CORE_ONLY).unwrap();
    engine.start().unwrap();
    engine.stop();

    engine.submit(handle, Datum::gyro(0, Vector3::zeros())).unwrap();
    assert_eq!(engine.pending(), 1);
    assert_eq!(engine.process_queued(), Ok(1));
}

#[test]
fn test_rezero_and_reference() {
    let mut engine = engine(0);
    let handle = engine.add_instance(InstanceConfig::default(), Pipeline::CORE_ONLY).unwrap();

    let tilted = Triple::new(
        0,
        Vector3::zeros(),
        Vector3::new(0.0, 0.5, 0.8),
        Vector3::new(20.0, 0.0, -40.0),
    );
    let status = engine.submit_triple(handle, tilted).unwrap();
    assert_eq!(status, Status::Zeroed(ZeroingPolicy::Synchronized));

    engine.set_reference(handle).unwrap();
    let estimate = engine.get_estimate(handle).unwrap();
    assert!(estimate.euler.norm() < 1e-3);
    assert_ne!(estimate.quaternion, Quaternion::identity());

    engine.clear_reference(handle).unwrap();
    engine.rezero(handle).unwrap();
    let estimate = engine.get_estimate(handle).unwrap();
    assert_eq!(estimate.state, FusionState::Uninitialized);
    assert!(!estimate.ready);
}

#[test]
fn test_point_callback_and_polling() {
    let mut engine = engine(0);
    let handle = engine.add_instance(InstanceConfig::default(), Pipeline::POINTS).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    engine
        .set_point_callback(
            handle,
            Some(Box::new(move |point: &PointEntry| {
                assert!(point.gyro_count > 0);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let mut tick = 0;
    for _ in 0..300 {
        engine.submit(handle, Datum::gyro(tick, Vector3::zeros())).unwrap();
        tick += PERIOD;
    }
    assert_eq!(engine.stability_state(handle), Ok(StabilityState::Stable));
    let status = engine.submit(handle, Datum::gyro(tick, Vector3::new(900.0, 0.0, 0.0)));
    assert_eq!(status, Ok(Status::PointCaptured));

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(engine.points(handle).map(|p| p.len()), Ok(1));
    assert_eq!(engine.captured_points(handle), Ok(1));

    // Stats are not part of this pipeline
    assert_eq!(engine.stats(handle).unwrap().gyro_bias[0].samples, 0);
}

#[test]
fn test_stats_gated_by_stability() {
    let mut engine = engine(0);
    let handle = engine.add_instance(InstanceConfig::default(), Pipeline::STATS).unwrap();

    let bias = Vector3::new(3.0, -1.0, 0.5);
    let mut tick = 0;
    for _ in 0..400 {
        engine.submit(handle, Datum::gyro(tick, bias)).unwrap();
        tick += PERIOD;
    }

    let stats = engine.stats(handle).unwrap();
    // Only the last 2 s of the 4 s were stable
    let samples = stats.gyro_bias[0].samples;
    assert!(samples > 150 && samples < 250, "{}", samples);
    assert!((stats.gyro_bias_mean() - bias).norm() < 1e-4);
}

#[test]
fn test_invalid_handles_rejected_everywhere() {
    let engine = engine(4);
    let bogus = Handle::from_index(3);
    let expected = Err(Error::InvalidHandle { handle: 3, live: 0 });

    assert_eq!(engine.submit(bogus, Datum::gyro(0, Vector3::zeros())), expected);
    assert_eq!(engine.submit_triple(bogus, sample(0)), expected);
    assert!(engine.get_estimate(bogus).is_err());
    assert!(engine.points(bogus).is_err());
    assert!(engine.stats(bogus).is_err());
    assert!(engine.rezero(bogus).is_err());
    assert_eq!(engine.pending(), 0);
}

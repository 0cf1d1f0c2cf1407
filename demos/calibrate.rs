//! Stationary-point calibration demonstration
//!
//! Replays a recorded stream through a queued engine with a background
//! consumer, harvests a still period as a one point gyro calibration and
//! commits the resulting bias.
//!
//! Run with: `cargo run --example calibrate`

use fusion_calib::{
    CalibrationMode, CalibrationStatus, Datum, Engine, EngineConfig, InstanceConfig, Pipeline,
    PointEntry, SensorType, Status, Subsystem, SubsystemConfig,
};
use nalgebra::Vector3;
use serde::Deserialize;
use std::error::Error;
use std::thread;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct SensorRecord {
    tick: u32,
    sensor: String,
    x: f32,
    y: f32,
    z: f32,
}

fn main() -> Result<(), Box<dyn Error>> {
    println!("Calibration example - one point gyro bias from a still period");

    let mut reader = csv::Reader::from_path("testdata/sensor_stream.csv")?;
    let mut datums = Vec::new();
    for result in reader.deserialize() {
        let record: SensorRecord = result?;
        let sensor = match record.sensor.as_str() {
            "gyro" => SensorType::Gyro,
            "accel" => SensorType::Accel,
            "magn" => SensorType::Magn,
            other => return Err(format!("unknown sensor {other}").into()),
        };
        datums.push(Datum::new(sensor, record.tick, Vector3::new(record.x, record.y, record.z)));
    }
    println!("Loaded {} samples", datums.len());

    let mut engine = Engine::new(EngineConfig::default())?;
    let imu = engine.add_instance(InstanceConfig::default(), Pipeline::FULL)?;
    engine.set_point_callback(
        imu,
        Some(Box::new(|point: &PointEntry| {
            println!(
                "Point captured: ticks {}..{}, gyro {:.2?}",
                point.start,
                point.end,
                point.gyro_filtered.as_slice()
            );
        })),
    )?;
    engine.start_calibration(imu, CalibrationMode::OnePointGyro)?;
    engine.start()?;

    let mut overflows = 0;
    for datum in datums {
        if engine.submit(imu, datum)? == Status::Overflow {
            overflows += 1;
        }
        // Pace the producer roughly like a live sensor burst
        if engine.pending() > engine.config().queue_depth / 2 {
            thread::sleep(Duration::from_micros(200));
        }
    }
    engine.drain();
    engine.stop();
    println!("Queue overflows: {overflows}");

    match engine.calibration_status(imu)? {
        CalibrationStatus::Ready(result) => {
            println!("Calibration ready, gyro bias {:.3?}, fom {:.4}", result.gyro_bias.as_slice(), result.fom);
            engine.save_calibration(imu)?;
        }
        other => println!("Calibration not ready: {other:?}"),
    }

    if let SubsystemConfig::Rectify(rectify) = engine.subsystem_config(imu, Subsystem::Rectify)? {
        println!("Live gyro bias: {:.3?}", rectify.gyro.bias.as_slice());
    }

    let estimate = engine.get_estimate(imu)?;
    println!(
        "Final orientation: roll {:.1}°, pitch {:.1}°, heading {:.1}° ({:?})",
        estimate.euler.x.to_degrees(),
        estimate.euler.y.to_degrees(),
        estimate.heading().to_degrees(),
        estimate.state
    );

    let stats = engine.stats(imu)?;
    println!(
        "Accel magnitude {:.3} ± {:.3}, magnetometer magnitude {:.2} ± {:.2}",
        stats.accel_magnitude.mean,
        stats.accel_magnitude.deviation,
        stats.magn_magnitude.mean,
        stats.magn_magnitude.deviation
    );
    Ok(())
}

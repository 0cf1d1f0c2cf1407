use fusion_calib::{
    CalibrationMode, CalibrationStatus, Datum, Engine, EngineConfig, FusionState, Handle,
    InstanceConfig, Pipeline, SensorType, Subsystem, SubsystemConfig,
};
use nalgebra::Vector3;
use serde::Deserialize;
use std::error::Error;

/// Recorded stream: 3 s still, a 90° turn about z in 1 s, 3 s still.
/// Gyro carries a (3, -2, 1) Q8.8 bias; 100 Hz per sensor.
const STREAM: &str = "testdata/sensor_stream.csv";

#[derive(Debug, Deserialize)]
struct Row {
    tick: u32,
    sensor: String,
    x: f32,
    y: f32,
    z: f32,
}

impl Row {
    fn datum(&self) -> Option<Datum> {
        let sensor = match self.sensor.as_str() {
            "gyro" => SensorType::Gyro,
            "accel" => SensorType::Accel,
            "magn" => SensorType::Magn,
            _ => return None,
        };
        Some(Datum::new(sensor, self.tick, Vector3::new(self.x, self.y, self.z)))
    }
}

fn load_stream() -> Result<Vec<Datum>, Box<dyn Error>> {
    let mut reader = csv::Reader::from_path(STREAM)?;
    let mut datums = Vec::new();
    for result in reader.deserialize() {
        let row: Row = result?;
        if let Some(datum) = row.datum() {
            datums.push(datum);
        }
    }
    Ok(datums)
}

fn run(queue_depth: usize) -> Result<(Engine, Handle), Box<dyn Error>> {
    let datums = load_stream()?;
    assert_eq!(datums.len(), 2100);

    let mut engine = Engine::new(EngineConfig {
        queue_depth,
        ..Default::default()
    })?;
    let handle = engine.add_instance(InstanceConfig::default(), Pipeline::FULL)?;
    engine.start_calibration(handle, CalibrationMode::OnePointGyro)?;

    for datum in datums {
        engine.submit(handle, datum)?;
        if queue_depth > 0 && engine.pending() >= queue_depth {
            engine.process_queued()?;
        }
    }
    engine.drain();
    Ok((engine, handle))
}

#[test]
fn test_stream_heading_follows_turn() -> Result<(), Box<dyn Error>> {
    let (engine, handle) = run(0)?;

    let estimate = engine.get_estimate(handle)?;
    assert_eq!(estimate.state, FusionState::NormalOp);
    assert!(estimate.ready);

    let heading = estimate.heading().to_degrees();
    assert!((heading - 90.0).abs() < 5.0, "heading {}", heading);
    assert!(estimate.euler.x.to_degrees().abs() < 3.0);
    assert!(estimate.euler.y.to_degrees().abs() < 3.0);
    Ok(())
}

#[test]
fn test_stream_harvests_one_point_and_calibrates() -> Result<(), Box<dyn Error>> {
    let (engine, handle) = run(0)?;

    // Only the first still period ended in motion
    assert_eq!(engine.points(handle)?.len(), 1);
    assert!(matches!(
        engine.calibration_status(handle)?,
        CalibrationStatus::Ready(_)
    ));

    engine.save_calibration(handle)?;
    let SubsystemConfig::Rectify(rectify) = engine.subsystem_config(handle, Subsystem::Rectify)?
    else {
        panic!("rectify config expected");
    };
    let expected = Vector3::new(-3.0, 2.0, -1.0);
    assert!(
        (rectify.gyro.bias - expected).norm() < 0.3,
        "bias {:?}",
        rectify.gyro.bias
    );
    Ok(())
}

#[test]
fn test_stream_statistics() -> Result<(), Box<dyn Error>> {
    let (engine, handle) = run(0)?;
    let stats = engine.stats(handle)?;

    assert!((stats.accel_magnitude.mean - 1.0).abs() < 0.01);
    assert!(stats.accel_quality.mean > 0.9);
    let field = (20.0_f32 * 20.0 + 40.0 * 40.0).sqrt();
    assert!((stats.magn_magnitude.mean - field).abs() < 0.5);
    assert!(stats.magn_magnitude.deviation < 0.5);

    // Residual gyro bias seen while still
    assert!((stats.gyro_bias_mean() - Vector3::new(3.0, -2.0, 1.0)).norm() < 0.5);
    Ok(())
}

#[test]
fn test_stream_queued_matches_synchronous() -> Result<(), Box<dyn Error>> {
    let (direct, a) = run(0)?;
    let (queued, b) = run(32)?;

    assert_eq!(direct.get_estimate(a)?, queued.get_estimate(b)?);
    assert_eq!(queued.overflow_count(), 0);
    assert_eq!(direct.stats(a)?, queued.stats(b)?);
    Ok(())
}

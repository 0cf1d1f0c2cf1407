use fusion_calib::{Engine, EngineConfig, InstanceConfig, Pipeline, Triple};
use nalgebra::Vector3;

const SAMPLE_PERIOD: u32 = 1_000; // 10 ms in 10 µs ticks

fn main() -> fusion_calib::Result<()> {
    let mut engine = Engine::new(EngineConfig {
        queue_depth: 0,
        ..Default::default()
    })?;
    let imu = engine.add_instance(InstanceConfig::default(), Pipeline::CORE_ONLY)?;

    for k in 0..10 {
        // this loop should repeat each time a new sample set is available
        let gyroscope = Vector3::new(0.0, 0.0, 0.0); // replace with gyroscope data in Q8.8 rad/s
        let accelerometer = Vector3::new(0.0, 0.0, 1.0); // replace with accelerometer data in g
        let magnetometer = Vector3::new(20.0, 0.0, -40.0); // replace with magnetometer data

        let tick = k * SAMPLE_PERIOD;
        engine.submit_triple(imu, Triple::new(tick, gyroscope, accelerometer, magnetometer))?;

        let euler = engine.get_estimate(imu)?.euler;
        println!(
            "Roll: {:.2}, Pitch: {:.2}, Yaw: {:.2}",
            euler.x.to_degrees(),
            euler.y.to_degrees(),
            euler.z.to_degrees()
        );
    }
    Ok(())
}

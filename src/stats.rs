//! Running diagnostics ("autocal" statistics) for one instance
//!
//! Every metric is an exponentially weighted mean and mean absolute
//! deviation. The blend factor is `elapsed_seconds × alpha`, clamped to
//! [0, 1], so the time constant does not depend on the sample rate. The
//! first sample seeds the mean directly.

use nalgebra::Vector3;

use crate::error::Status;
use crate::types::{Datum, Fom, SensorType, StatsConfig, Tick, ticks_to_seconds};

/// Exponentially weighted mean/deviation of one scalar
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Metric {
    /// Smoothed value
    pub mean: f32,
    /// Smoothed absolute deviation from the mean
    pub deviation: f32,
    /// Samples folded in
    pub samples: u32,
    last_tick: Tick,
}

impl Metric {
    /// Fold in one sample taken at `tick`
    pub fn update(&mut self, value: f32, tick: Tick, alpha: f32) {
        if self.samples == 0 {
            self.mean = value;
            self.deviation = 0.0;
        } else {
            let k = (ticks_to_seconds(self.last_tick, tick) * alpha).clamp(0.0, 1.0);
            let error = value - self.mean;
            self.mean += k * error;
            self.deviation += k * (error.abs() - self.deviation);
        }
        self.samples = self.samples.saturating_add(1);
        self.last_tick = tick;
    }
}

/// All diagnostics tracked for one instance
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsSnapshot {
    /// Gyro reading per axis while stable (residual bias)
    pub gyro_bias: [Metric; 3],
    /// Accelerometer magnitude
    pub accel_magnitude: Metric,
    /// Accelerometer quality weight
    pub accel_quality: Metric,
    /// Magnetometer magnitude
    pub magn_magnitude: Metric,
    /// Angle between magnetic field and estimated up, radians
    pub magn_angle: Metric,
    /// Combined magnetometer quality weight
    pub magn_quality: Metric,
}

impl StatsSnapshot {
    /// Mean residual gyro bias as a vector
    pub fn gyro_bias_mean(&self) -> Vector3<f32> {
        Vector3::new(
            self.gyro_bias[0].mean,
            self.gyro_bias[1].mean,
            self.gyro_bias[2].mean,
        )
    }
}

/// Per-instance statistics collector
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsCollector {
    config: StatsConfig,
    snapshot: StatsSnapshot,
}

impl StatsCollector {
    /// Create an empty collector
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            snapshot: StatsSnapshot::default(),
        }
    }

    /// Current config
    pub fn config(&self) -> StatsConfig {
        self.config
    }

    /// Replace the config; accumulated statistics are kept
    pub fn set_config(&mut self, config: StatsConfig) {
        self.config = config;
    }

    /// Copy of every metric
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot
    }

    /// Forget all accumulated statistics
    pub fn reset(&mut self) {
        self.snapshot = StatsSnapshot::default();
    }

    /// Fold in one processed datum
    ///
    /// `fom` is the fusion core's figure of merit for the datum; `None`
    /// means it was not valid and magnitude/quality metrics are left alone.
    /// Gyro bias only updates while the device is `stable`.
    pub fn collect(&mut self, datum: Datum, fom: Option<Fom>, stable: bool) -> Status {
        if !self.config.enabled {
            return Status::Disabled;
        }

        let alpha = self.config.alpha;
        let tick = datum.tick;
        let stats = &mut self.snapshot;

        match (datum.sensor, fom) {
            (SensorType::Gyro, _) => {
                if stable {
                    for (metric, value) in stats.gyro_bias.iter_mut().zip(datum.value.iter()) {
                        metric.update(*value, tick, alpha);
                    }
                }
            }
            (SensorType::Accel, Some(Fom::Accel { magnitude, weight, .. })) => {
                stats.accel_magnitude.update(magnitude, tick, alpha);
                stats.accel_quality.update(weight, tick, alpha);
            }
            (
                SensorType::Magn,
                Some(Fom::Magn {
                    magnitude,
                    weight,
                    angle,
                    angle_weight,
                    ..
                }),
            ) => {
                stats.magn_magnitude.update(magnitude, tick, alpha);
                stats.magn_angle.update(angle, tick, alpha);
                stats.magn_quality.update(weight * angle_weight, tick, alpha);
            }
            _ => {}
        }

        Status::Ok
    }
}

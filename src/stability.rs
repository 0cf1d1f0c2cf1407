//! Motion stability detection and calibration point harvesting
//!
//! The detector watches each sensor's deviation from its running
//! exponential mean. While nothing deviates for `hold_time` the device is
//! held; after `stable_time` it is stable and a [`PointEntry`] accumulates
//! filtered gyro/accel/magn vectors. The first deviation after that
//! finalizes the entry into a fixed ring buffer.
//!
//! ```text
//! Reset -> Move <-> Hold -> Stable
//!           ^                  |
//!           +---- deviation ---+
//! ```

use heapless::HistoryBuffer;
use log::{debug, warn};
use nalgebra::Vector3;

use crate::error::Status;
use crate::types::{
    Datum, PointEntry, SensorType, StabilityConfig, StabilityState, Tick, ticks_to_seconds,
};

/// Finalized points kept for polling
pub const POINT_CAPACITY: usize = 8;

/// Called with each stored point
pub type PointCallback = Box<dyn FnMut(&PointEntry) + Send>;

/// Result of feeding one datum to the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// State after the datum
    pub state: StabilityState,
    /// `PointCaptured`, `NoCapacity`, `Disabled` or `Ok`
    pub status: Status,
    /// Point stored by this datum, if any
    pub point: Option<PointEntry>,
}

/// Running mean for one sensor
#[derive(Debug, Clone, Copy, Default)]
struct Track {
    mean: Vector3<f32>,
    warm: bool,
}

/// Per-instance stability detector
pub struct StabilityDetector {
    config: StabilityConfig,
    state: StabilityState,
    tracks: [Track; 3],
    /// Tick of the last deviation
    stable_since: Tick,
    last_gyro_tick: Tick,
    entry: PointEntry,
    points: HistoryBuffer<PointEntry, POINT_CAPACITY>,
    captured: u32,
    /// Calibration-scoped target, takes precedence over the config's
    target_override: Option<u32>,
    callback: Option<PointCallback>,
    hazard_reported: bool,
}

impl StabilityDetector {
    /// Create a detector in the `Reset` state
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            state: StabilityState::Reset,
            tracks: [Track::default(); 3],
            stable_since: 0,
            last_gyro_tick: 0,
            entry: PointEntry::open(0),
            points: HistoryBuffer::new(),
            captured: 0,
            target_override: None,
            callback: None,
            hazard_reported: false,
        }
    }

    /// Current config
    pub fn config(&self) -> StabilityConfig {
        self.config
    }

    /// Replace the config; filter state is kept
    pub fn set_config(&mut self, config: StabilityConfig) {
        self.config = config;
        self.hazard_reported = false;
    }

    /// Current state
    pub fn state(&self) -> StabilityState {
        self.state
    }

    /// Stored points, oldest first
    pub fn points(&self) -> impl Iterator<Item = &PointEntry> {
        self.points.oldest_ordered()
    }

    /// Most recently stored point
    pub fn latest_point(&self) -> Option<&PointEntry> {
        self.points.recent()
    }

    /// Points captured toward the current target
    pub fn captured(&self) -> u32 {
        self.captured
    }

    /// Points stored before further ones report `NoCapacity`
    pub fn target(&self) -> u32 {
        self.target_override.unwrap_or(self.config.target_points)
    }

    /// Override the capture target without touching the config; `None`
    /// returns to `StabilityConfig::target_points`
    pub fn set_target(&mut self, target: Option<u32>) {
        self.target_override = target;
    }

    /// Restart the capture counter (stored points stay readable)
    pub fn reset_points(&mut self) {
        self.captured = 0;
    }

    /// Return to `Reset`, dropping filters, the open entry and stored points
    pub fn reset(&mut self) {
        self.state = StabilityState::Reset;
        self.tracks = [Track::default(); 3];
        self.entry = PointEntry::open(0);
        self.points.clear();
        self.captured = 0;
    }

    /// Register the completion callback, replacing any previous one
    pub fn set_callback(&mut self, callback: PointCallback) {
        self.callback = Some(callback);
    }

    /// Remove the completion callback
    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Feed one (rectified) datum
    pub fn process(&mut self, datum: Datum) -> Detection {
        if !self.sensor_enabled(datum.sensor) {
            return self.detection(Status::Disabled, None);
        }

        let index = datum.sensor.index();
        let value = datum.value;

        // Sensors arrive asynchronously; each warms up on its own first sample
        if !self.tracks[index].warm {
            self.tracks[index] = Track {
                mean: value,
                warm: true,
            };
            if datum.sensor == SensorType::Gyro && self.state == StabilityState::Reset {
                self.state = StabilityState::Move;
                self.stable_since = datum.tick;
                self.last_gyro_tick = datum.tick;
                self.entry = PointEntry::open(datum.tick);
            }
            return self.detection(Status::Ok, None);
        }

        let track = &mut self.tracks[index];
        let deviation = (value - track.mean).norm_squared();
        track.mean += (value - track.mean) * self.config.mean_alpha;

        if self.state == StabilityState::Reset {
            return self.detection(Status::Ok, None);
        }

        let threshold = self.threshold(datum.sensor);
        if threshold <= 0.0 {
            self.report_hazard(datum.sensor);
        }
        let unstable = threshold > 0.0 && deviation > threshold * threshold;

        let mut status = Status::Ok;
        let mut point = None;

        if unstable {
            self.stable_since = datum.tick;
            if self.state == StabilityState::Stable {
                (status, point) = self.finalize(datum.tick);
            }
            self.state = StabilityState::Move;
        } else if datum.sensor == SensorType::Gyro {
            let elapsed = ticks_to_seconds(self.stable_since, datum.tick);
            let next = if elapsed >= self.config.stable_time {
                StabilityState::Stable
            } else if elapsed >= self.config.hold_time {
                StabilityState::Hold
            } else {
                StabilityState::Move
            };
            if next == StabilityState::Stable && self.state != StabilityState::Stable {
                self.enter_stable();
            }
            self.state = next;
        }

        if datum.sensor == SensorType::Gyro {
            let dt = ticks_to_seconds(self.last_gyro_tick, datum.tick);
            self.last_gyro_tick = datum.tick;
            if self.state != StabilityState::Stable {
                self.entry.gyro_accumulated += value * dt;
                self.entry.motion_time += dt;
            }
        }

        if self.state == StabilityState::Stable {
            self.accumulate(datum);
        }

        self.detection(status, point)
    }

    fn sensor_enabled(&self, sensor: SensorType) -> bool {
        self.config.enabled
            && match sensor {
                SensorType::Gyro => true,
                SensorType::Accel => self.config.accel_enabled,
                SensorType::Magn => self.config.magn_enabled,
            }
    }

    fn threshold(&self, sensor: SensorType) -> f32 {
        match sensor {
            SensorType::Gyro => self.config.gyro_threshold,
            SensorType::Accel => self.config.accel_threshold,
            SensorType::Magn => self.config.magn_threshold,
        }
    }

    fn report_hazard(&mut self, sensor: SensorType) {
        if !self.hazard_reported {
            warn!("{:?} deviation threshold is zero; instability never detected", sensor);
            self.hazard_reported = true;
        }
    }

    /// Seed the point's filters from the running means
    fn enter_stable(&mut self) {
        self.entry.gyro_filtered = self.tracks[SensorType::Gyro.index()].mean;
        self.entry.accel_filtered = self.tracks[SensorType::Accel.index()].mean;
        self.entry.magn_filtered = self.tracks[SensorType::Magn.index()].mean;
    }

    fn accumulate(&mut self, datum: Datum) {
        let alpha = self.config.point_alpha;
        let entry = &mut self.entry;
        let (filtered, count) = match datum.sensor {
            SensorType::Gyro => (&mut entry.gyro_filtered, &mut entry.gyro_count),
            SensorType::Accel => (&mut entry.accel_filtered, &mut entry.accel_count),
            SensorType::Magn => (&mut entry.magn_filtered, &mut entry.magn_count),
        };
        *filtered += (datum.value - *filtered) * alpha;
        *count += 1;
        entry.end = datum.tick;
    }

    /// Close the current entry and open a new one at `tick`
    fn finalize(&mut self, tick: Tick) -> (Status, Option<PointEntry>) {
        let point = self.entry;
        self.entry = PointEntry::open(tick);

        let target = self.target();
        if self.captured >= target {
            debug!("stability point dropped, target {} reached", target);
            return (Status::NoCapacity, None);
        }

        self.points.write(point);
        self.captured += 1;
        debug!(
            "stability point {} captured ({} gyro samples, {:.2}s motion)",
            self.captured, point.gyro_count, point.motion_time
        );

        if let Some(callback) = self.callback.as_mut() {
            callback(&point);
        }

        (Status::PointCaptured, Some(point))
    }

    fn detection(&self, status: Status, point: Option<PointEntry>) -> Detection {
        Detection {
            state: self.state,
            status,
            point,
        }
    }
}

impl Default for StabilityDetector {
    fn default() -> Self {
        Self::new(StabilityConfig::default())
    }
}

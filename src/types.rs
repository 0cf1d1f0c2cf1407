//! Core types, configuration structs and conventions for the fusion pipeline

use nalgebra::{Matrix3, Vector3};

use crate::error::{Error, Result};

/// Timestamp in fixed 10 µs ticks
///
/// Ticks wrap; differences are always taken with wrapping subtraction.
pub type Tick = u32;

/// Seconds per tick
pub const TICK_SECONDS: f32 = 1.0e-5;

/// Ticks per second
pub const TICKS_PER_SECOND: u32 = 100_000;

/// Seconds elapsed from `from` to `to`, tolerant of counter wrap
pub fn ticks_to_seconds(from: Tick, to: Tick) -> f32 {
    to.wrapping_sub(from) as f32 * TICK_SECONDS
}

/// Sensor that produced a datum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SensorType {
    /// Angular rate
    Gyro,
    /// Specific force; reads +up when still
    Accel,
    /// Magnetic field
    Magn,
}

impl SensorType {
    /// All sensor types in pipeline order
    pub const ALL: [SensorType; 3] = [SensorType::Gyro, SensorType::Accel, SensorType::Magn];

    /// Dense index for per-sensor arrays
    pub fn index(self) -> usize {
        match self {
            SensorType::Gyro => 0,
            SensorType::Accel => 1,
            SensorType::Magn => 2,
        }
    }
}

/// One timestamped, typed sensor sample
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_calib::{Datum, SensorType};
///
/// let datum = Datum::accel(1_000, Vector3::new(0.0, 0.0, 1.0));
/// assert_eq!(datum.sensor, SensorType::Accel);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datum {
    /// Producing sensor
    pub sensor: SensorType,
    /// Sample in device units
    pub value: Vector3<f32>,
    /// Sample time in ticks
    pub tick: Tick,
}

impl Datum {
    /// Create a datum for any sensor
    pub fn new(sensor: SensorType, tick: Tick, value: Vector3<f32>) -> Self {
        Self { sensor, value, tick }
    }

    /// Gyroscope datum
    pub fn gyro(tick: Tick, value: Vector3<f32>) -> Self {
        Self::new(SensorType::Gyro, tick, value)
    }

    /// Accelerometer datum
    pub fn accel(tick: Tick, value: Vector3<f32>) -> Self {
        Self::new(SensorType::Accel, tick, value)
    }

    /// Magnetometer datum
    pub fn magn(tick: Tick, value: Vector3<f32>) -> Self {
        Self::new(SensorType::Magn, tick, value)
    }
}

/// Synchronized gyro/accel/magn sample sharing one timestamp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triple {
    /// Sample time in ticks
    pub tick: Tick,
    /// Angular rate
    pub gyro: Vector3<f32>,
    /// Specific force
    pub accel: Vector3<f32>,
    /// Magnetic field
    pub magn: Vector3<f32>,
}

impl Triple {
    /// Create a synchronized triple
    pub fn new(tick: Tick, gyro: Vector3<f32>, accel: Vector3<f32>, magn: Vector3<f32>) -> Self {
        Self { tick, gyro, accel, magn }
    }

    /// The three member datums in pipeline order (gyro, accel, magn)
    pub fn datums(&self) -> [Datum; 3] {
        [
            Datum::gyro(self.tick, self.gyro),
            Datum::accel(self.tick, self.accel),
            Datum::magn(self.tick, self.magn),
        ]
    }
}

/// How the fusion core established its orientation reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZeroingPolicy {
    /// Neither accelerometer nor magnetometer enabled; identity start
    GyroOnly,
    /// Built from the measured up vector alone
    AccelOnly,
    /// Built from the magnetometer with an assumed up of `[0, 0, 1]`
    MagnOnly,
    /// Built from a synchronized accel + magn pair
    Synchronized,
    /// Second reference arrived later; rebuilt against the current estimate
    Revisit,
}

/// Fusion core lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionState {
    /// No reference observed yet
    #[default]
    Uninitialized,
    /// Identity start for a gyro-only configuration
    ZeroedGyro,
    /// Up resolved, north still pending
    ZeroedAccel,
    /// Built from the magnetometer alone (accelerometer disabled)
    ZeroedMagn,
    /// Built from a synchronized pair
    ZeroedBoth,
    /// North saved from a magnetometer-first build, accelerometer pending
    ZeroedSave,
    /// Every enabled reference resolved; normal fusion running
    NormalOp,
}

impl FusionState {
    /// True once any zeroing policy has run
    pub fn is_initialized(self) -> bool {
        self != FusionState::Uninitialized
    }
}

/// Stability detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StabilityState {
    /// Waiting for the first gyro sample
    #[default]
    Reset,
    /// Deviation seen recently
    Move,
    /// Quiet for at least the hold time
    Hold,
    /// Quiet for at least the stable time; point accumulating
    Stable,
}

/// Figure of merit for one processed datum
///
/// Each variant carries only the fields meaningful for its sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fom {
    /// Gyroscope integration step
    Gyro {
        /// Angular rate magnitude in rad/s
        magnitude: f32,
        /// Rotation applied this step in radians
        delta: f32,
    },
    /// Accelerometer correction
    Accel {
        /// Raw vector magnitude
        magnitude: f32,
        /// Quality weight in [0, 1]
        weight: f32,
        /// Gradient scalar component; near zero when converged
        delta: f32,
    },
    /// Magnetometer correction
    Magn {
        /// Raw vector magnitude
        magnitude: f32,
        /// Magnitude quality weight in [0, 1]
        weight: f32,
        /// Angle between field and estimated up, radians
        angle: f32,
        /// Angle quality weight in [0, 1]
        angle_weight: f32,
        /// Gradient scalar component; near zero when converged
        delta: f32,
    },
}

impl Fom {
    /// Sensor this FOM describes
    pub fn sensor(&self) -> SensorType {
        match self {
            Fom::Gyro { .. } => SensorType::Gyro,
            Fom::Accel { .. } => SensorType::Accel,
            Fom::Magn { .. } => SensorType::Magn,
        }
    }

    /// Combined quality weight actually applied to the correction
    pub fn weight(&self) -> f32 {
        match *self {
            Fom::Gyro { .. } => 1.0,
            Fom::Accel { weight, .. } => weight,
            Fom::Magn { weight, angle_weight, .. } => weight * angle_weight,
        }
    }

    /// Measured magnitude
    pub fn magnitude(&self) -> f32 {
        match *self {
            Fom::Gyro { magnitude, .. }
            | Fom::Accel { magnitude, .. }
            | Fom::Magn { magnitude, .. } => magnitude,
        }
    }

    /// Convergence delta
    pub fn delta(&self) -> f32 {
        match *self {
            Fom::Gyro { delta, .. } | Fom::Accel { delta, .. } | Fom::Magn { delta, .. } => delta,
        }
    }
}

/// Summary of one "held still" episode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointEntry {
    /// Time-weighted gyro integral accumulated while moving before this episode
    pub gyro_accumulated: Vector3<f32>,
    /// Seconds of motion covered by `gyro_accumulated`
    pub motion_time: f32,
    /// Exponentially filtered gyro while stable
    pub gyro_filtered: Vector3<f32>,
    /// Exponentially filtered accelerometer while stable
    pub accel_filtered: Vector3<f32>,
    /// Exponentially filtered magnetometer while stable
    pub magn_filtered: Vector3<f32>,
    /// Entry opened (first sample after the previous episode)
    pub start: Tick,
    /// Last stable sample
    pub end: Tick,
    /// Gyro samples folded into `gyro_filtered`
    pub gyro_count: u32,
    /// Accelerometer samples folded into `accel_filtered`
    pub accel_count: u32,
    /// Magnetometer samples folded into `magn_filtered`
    pub magn_count: u32,
}

impl PointEntry {
    /// Fresh entry opened at `start`
    pub fn open(start: Tick) -> Self {
        Self {
            gyro_accumulated: Vector3::zeros(),
            motion_time: 0.0,
            gyro_filtered: Vector3::zeros(),
            accel_filtered: Vector3::zeros(),
            magn_filtered: Vector3::zeros(),
            start,
            end: start,
            gyro_count: 0,
            accel_count: 0,
            magn_count: 0,
        }
    }

    /// Filtered vector for one sensor
    pub fn filtered(&self, sensor: SensorType) -> Vector3<f32> {
        match sensor {
            SensorType::Gyro => self.gyro_filtered,
            SensorType::Accel => self.accel_filtered,
            SensorType::Magn => self.magn_filtered,
        }
    }

    /// Sample count for one sensor
    pub fn count(&self, sensor: SensorType) -> u32 {
        match sensor {
            SensorType::Gyro => self.gyro_count,
            SensorType::Accel => self.accel_count,
            SensorType::Magn => self.magn_count,
        }
    }
}

/// Affine correction for one sensor: `(raw + bias) · matrix`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct SensorCorrection {
    /// Additive bias applied before the matrix
    pub bias: Vector3<f32>,
    /// 3×3 scale/misalignment matrix, applied to the row vector
    pub matrix: Matrix3<f32>,
}

impl Default for SensorCorrection {
    fn default() -> Self {
        Self {
            bias: Vector3::zeros(),
            matrix: Matrix3::identity(),
        }
    }
}

/// Rectifier settings
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct RectifyConfig {
    /// Pass data through unchanged when false
    pub enabled: bool,
    /// Gyroscope correction
    pub gyro: SensorCorrection,
    /// Accelerometer correction
    pub accel: SensorCorrection,
    /// Magnetometer correction
    pub magn: SensorCorrection,
}

impl RectifyConfig {
    /// Correction for one sensor
    pub fn correction(&self, sensor: SensorType) -> &SensorCorrection {
        match sensor {
            SensorType::Gyro => &self.gyro,
            SensorType::Accel => &self.accel,
            SensorType::Magn => &self.magn,
        }
    }

    /// Mutable correction for one sensor
    pub fn correction_mut(&mut self, sensor: SensorType) -> &mut SensorCorrection {
        match sensor {
            SensorType::Gyro => &mut self.gyro,
            SensorType::Accel => &mut self.accel,
            SensorType::Magn => &mut self.magn,
        }
    }
}

impl Default for RectifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gyro: SensorCorrection::default(),
            accel: SensorCorrection::default(),
            magn: SensorCorrection::default(),
        }
    }
}

/// Stability detector settings
///
/// Thresholds are in the sensor's (rectified) device units. A threshold of
/// zero disables that sensor's instability check entirely, which means the
/// detector can report "stable" while the device is moving.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct StabilityConfig {
    /// Run the detector at all
    pub enabled: bool,
    /// Gyro deviation threshold
    pub gyro_threshold: f32,
    /// Track the accelerometer
    pub accel_enabled: bool,
    /// Accelerometer deviation threshold
    pub accel_threshold: f32,
    /// Track the magnetometer
    pub magn_enabled: bool,
    /// Magnetometer deviation threshold
    pub magn_threshold: f32,
    /// Seconds without deviation before `Hold`
    pub hold_time: f32,
    /// Seconds without deviation before `Stable`
    pub stable_time: f32,
    /// Smoothing weight of the running mean used for deviation checks
    pub mean_alpha: f32,
    /// Smoothing weight of the point's filtered vectors
    pub point_alpha: f32,
    /// Points captured before further episodes report no capacity
    pub target_points: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gyro_threshold: 8.0,
            accel_enabled: true,
            accel_threshold: 0.05,
            magn_enabled: true,
            magn_threshold: 2.0,
            hold_time: 0.5,
            stable_time: 2.0,
            mean_alpha: 0.1,
            point_alpha: 0.05,
            target_points: 6,
        }
    }
}

/// Statistics collector settings
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct StatsConfig {
    /// Collect at all
    pub enabled: bool,
    /// Smoothing rate per second; blend factor is `elapsed × alpha`
    pub alpha: f32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.5,
        }
    }
}

/// Fusion core settings
///
/// # Example
/// ```
/// use fusion_calib::FusionConfig;
///
/// let config = FusionConfig {
///     magn_enabled: false,
///     accel_weight: 0.02,
///     ..Default::default()
/// };
/// assert!(config.gyro_enabled);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct FusionConfig {
    /// Integrate gyroscope data
    pub gyro_enabled: bool,
    /// Correct against the accelerometer ("down")
    pub accel_enabled: bool,
    /// Correct against the magnetometer ("north")
    pub magn_enabled: bool,
    /// Gyro device units to rad/s (default Q8.8: 1/256)
    pub gyro_scale: f32,
    /// Gradient step size for accelerometer corrections
    pub accel_weight: f32,
    /// Gradient step size for magnetometer corrections
    pub magn_weight: f32,
    /// Weight accelerometer corrections by magnitude plausibility
    pub accel_fom_enabled: bool,
    /// Expected accelerometer magnitude when still
    pub accel_reference: f32,
    /// Magnitude deviation at which the accelerometer weight reaches zero
    pub accel_threshold: f32,
    /// Weight magnetometer corrections by magnitude plausibility
    pub magn_fom_enabled: bool,
    /// Expected magnetometer magnitude
    pub magn_reference: f32,
    /// Magnitude deviation at which the magnetometer weight reaches zero
    pub magn_threshold: f32,
    /// Weight magnetometer corrections by field/up angle plausibility
    pub magn_angle_fom_enabled: bool,
    /// Expected angle between field and up, radians
    pub magn_angle_reference: f32,
    /// Angle deviation at which the angle weight reaches zero, radians
    pub magn_angle_threshold: f32,
    /// Track smoothed translational acceleration
    pub translation_enabled: bool,
    /// Smoothing weight for translational acceleration
    pub translation_alpha: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            gyro_enabled: true,
            accel_enabled: true,
            magn_enabled: true,
            gyro_scale: 1.0 / 256.0,
            accel_weight: 0.01,
            magn_weight: 0.005,
            accel_fom_enabled: true,
            accel_reference: 1.0,
            accel_threshold: 0.25,
            magn_fom_enabled: true,
            magn_reference: 50.0,
            magn_threshold: 20.0,
            magn_angle_fom_enabled: false,
            magn_angle_reference: 150.0 * core::f32::consts::PI / 180.0,
            magn_angle_threshold: 20.0 * core::f32::consts::PI / 180.0,
            translation_enabled: false,
            translation_alpha: 0.1,
        }
    }
}

/// Calibration engine settings
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct CalibrationConfig {
    /// Rotation performed between the two `2pnt_gyro` points, radians
    pub gyro_reference_rotation: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            gyro_reference_rotation: core::f32::consts::PI,
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct EngineConfig {
    /// Queued datums before the oldest is evicted; 0 dispatches synchronously
    pub queue_depth: usize,
    /// Consumer sleep while the queue is empty, microseconds
    pub idle_sleep_us: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            idle_sleep_us: 500,
        }
    }
}

/// Every per-instance config struct
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct InstanceConfig {
    /// Rectifier
    pub rectify: RectifyConfig,
    /// Stability detector
    pub stability: StabilityConfig,
    /// Statistics collector
    pub stats: StatsConfig,
    /// Fusion core
    pub fusion: FusionConfig,
    /// Calibration engine
    pub calibration: CalibrationConfig,
}

/// Subsystem tag for config load/save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Subsystem {
    /// Rectifier
    Rectify,
    /// Stability detector
    Stability,
    /// Statistics collector
    Stats,
    /// Fusion core
    Fusion,
    /// Calibration engine
    Calibration,
}

/// One subsystem's config, tagged by subsystem
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SubsystemConfig {
    /// Rectifier config
    Rectify(RectifyConfig),
    /// Stability detector config
    Stability(StabilityConfig),
    /// Statistics collector config
    Stats(StatsConfig),
    /// Fusion core config
    Fusion(FusionConfig),
    /// Calibration engine config
    Calibration(CalibrationConfig),
}

impl SubsystemConfig {
    /// Tag of the carried config
    pub fn subsystem(&self) -> Subsystem {
        match self {
            SubsystemConfig::Rectify(_) => Subsystem::Rectify,
            SubsystemConfig::Stability(_) => Subsystem::Stability,
            SubsystemConfig::Stats(_) => Subsystem::Stats,
            SubsystemConfig::Fusion(_) => Subsystem::Fusion,
            SubsystemConfig::Calibration(_) => Subsystem::Calibration,
        }
    }
}

impl InstanceConfig {
    /// Copy one subsystem's config out
    pub fn get(&self, subsystem: Subsystem) -> SubsystemConfig {
        match subsystem {
            Subsystem::Rectify => SubsystemConfig::Rectify(self.rectify),
            Subsystem::Stability => SubsystemConfig::Stability(self.stability),
            Subsystem::Stats => SubsystemConfig::Stats(self.stats),
            Subsystem::Fusion => SubsystemConfig::Fusion(self.fusion),
            Subsystem::Calibration => SubsystemConfig::Calibration(self.calibration),
        }
    }

    /// Replace one subsystem's config
    pub fn set(&mut self, config: SubsystemConfig) {
        match config {
            SubsystemConfig::Rectify(c) => self.rectify = c,
            SubsystemConfig::Stability(c) => self.stability = c,
            SubsystemConfig::Stats(c) => self.stats = c,
            SubsystemConfig::Fusion(c) => self.fusion = c,
            SubsystemConfig::Calibration(c) => self.calibration = c,
        }
    }
}

impl SubsystemConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let unit = |alpha: f32| alpha > 0.0 && alpha <= 1.0;
        match self {
            SubsystemConfig::Rectify(c) => {
                let finite = [&c.gyro, &c.accel, &c.magn]
                    .iter()
                    .all(|k| k.bias.iter().chain(k.matrix.iter()).all(|v| v.is_finite()));
                if !finite {
                    return Err(Error::BadConfig("rectify correction is not finite"));
                }
            }
            SubsystemConfig::Stability(c) => {
                if c.gyro_threshold < 0.0 || c.accel_threshold < 0.0 || c.magn_threshold < 0.0 {
                    return Err(Error::BadConfig("stability threshold is negative"));
                }
                if c.hold_time < 0.0 || c.stable_time < c.hold_time {
                    return Err(Error::BadConfig("stable_time must not be shorter than hold_time"));
                }
                if !unit(c.mean_alpha) || !unit(c.point_alpha) {
                    return Err(Error::BadConfig("stability alpha outside (0, 1]"));
                }
            }
            SubsystemConfig::Stats(c) => {
                if !(c.alpha >= 0.0 && c.alpha.is_finite()) {
                    return Err(Error::BadConfig("stats alpha is negative"));
                }
            }
            SubsystemConfig::Fusion(c) => {
                if !(c.gyro_scale > 0.0) {
                    return Err(Error::BadConfig("gyro_scale must be positive"));
                }
                if c.accel_weight < 0.0 || c.magn_weight < 0.0 {
                    return Err(Error::BadConfig("fusion weight is negative"));
                }
                if !(0.0..=1.0).contains(&c.translation_alpha) {
                    return Err(Error::BadConfig("translation_alpha outside [0, 1]"));
                }
            }
            SubsystemConfig::Calibration(c) => {
                if !(c.gyro_reference_rotation > 0.0) {
                    return Err(Error::BadConfig("gyro_reference_rotation must be positive"));
                }
            }
        }
        Ok(())
    }
}

impl InstanceConfig {
    /// Validate every subsystem's config
    pub fn validate(&self) -> Result<()> {
        [
            Subsystem::Rectify,
            Subsystem::Stability,
            Subsystem::Stats,
            Subsystem::Fusion,
            Subsystem::Calibration,
        ]
        .iter()
        .try_for_each(|&subsystem| self.get(subsystem).validate())
    }
}

/// Subsystems an engine instance runs per datum
///
/// The fusion core always runs. Presets cover the usual profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct Pipeline {
    /// Correct samples before anything else sees them
    pub rectify: bool,
    /// Detect stillness and harvest calibration points
    pub stability: bool,
    /// Collect running statistics
    pub stats: bool,
    /// Feed harvested points to the calibrator
    pub calibration: bool,
}

impl Pipeline {
    /// Fusion only
    pub const CORE_ONLY: Pipeline = Pipeline {
        rectify: false,
        stability: false,
        stats: false,
        calibration: false,
    };
    /// Rectified fusion
    pub const RECTIFIED: Pipeline = Pipeline {
        rectify: true,
        ..Pipeline::CORE_ONLY
    };
    /// Rectified fusion with point harvesting and calibration
    pub const POINTS: Pipeline = Pipeline {
        stability: true,
        calibration: true,
        ..Pipeline::RECTIFIED
    };
    /// Rectified fusion with statistics; stillness gates the gyro bias metric
    pub const STATS: Pipeline = Pipeline {
        stability: true,
        stats: true,
        ..Pipeline::RECTIFIED
    };
    /// Everything
    pub const FULL: Pipeline = Pipeline {
        rectify: true,
        stability: true,
        stats: true,
        calibration: true,
    };
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::FULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_wrap() {
        assert!((ticks_to_seconds(0, 100_000) - 1.0).abs() < 1e-6);
        let seconds = ticks_to_seconds(u32::MAX - 9, 10);
        assert!((seconds - 20.0 * TICK_SECONDS).abs() < 1e-9);
    }

    #[test]
    fn test_subsystem_config_round_trip() {
        let mut config = InstanceConfig::default();
        let fusion = FusionConfig {
            magn_enabled: false,
            ..Default::default()
        };
        config.set(SubsystemConfig::Fusion(fusion));
        assert_eq!(config.get(Subsystem::Fusion), SubsystemConfig::Fusion(fusion));
        assert_eq!(config.get(Subsystem::Stats).subsystem(), Subsystem::Stats);
    }

    #[test]
    fn test_fom_weight_combines_magn_factors() {
        let fom = Fom::Magn {
            magnitude: 50.0,
            weight: 0.5,
            angle: 2.6,
            angle_weight: 0.5,
            delta: 0.0,
        };
        assert_eq!(fom.sensor(), SensorType::Magn);
        assert!((fom.weight() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert_eq!(InstanceConfig::default().validate(), Ok(()));

        let stability = StabilityConfig {
            hold_time: 3.0,
            stable_time: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            SubsystemConfig::Stability(stability).validate(),
            Err(Error::BadConfig(_))
        ));

        let fusion = FusionConfig {
            gyro_scale: 0.0,
            ..Default::default()
        };
        assert!(SubsystemConfig::Fusion(fusion).validate().is_err());

        let mut rectify = RectifyConfig::default();
        rectify.magn.bias.x = f32::NAN;
        assert!(SubsystemConfig::Rectify(rectify).validate().is_err());
    }

    #[test]
    fn test_pipeline_presets() {
        assert_eq!(Pipeline::default(), Pipeline::FULL);
        assert!(Pipeline::POINTS.calibration && !Pipeline::POINTS.stats);
        assert!(Pipeline::STATS.stats && !Pipeline::STATS.calibration);
        assert!(!Pipeline::CORE_ONLY.rectify);
    }
}

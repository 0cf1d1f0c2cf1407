//! Point-based calibration
//!
//! A [`Calibrator`] collects stability points and reduces them into bias
//! (and, for `2pnt_gyro`, scale) corrections. Every change lands on a staged
//! copy of the rectifier and fusion configs taken at [`Calibrator::start`];
//! the live configs are only replaced by what [`Calibrator::save`] hands back.
//!
//! # Example
//! ```
//! use nalgebra::Vector3;
//! use fusion_calib::calibration::{CalibrationMode, Calibrator};
//! use fusion_calib::{CalibrationConfig, FusionConfig, PointEntry, RectifyConfig, Status};
//!
//! let mut calibrator = Calibrator::new(CalibrationConfig::default());
//! calibrator.start(CalibrationMode::OnePointGyro, RectifyConfig::default(), FusionConfig::default());
//!
//! let mut point = PointEntry::open(0);
//! point.gyro_filtered = Vector3::new(10.0, 20.0, 30.0);
//! assert_eq!(calibrator.submit_point(&point), Ok(Status::CalibrationReady));
//!
//! let (rectify, _fusion) = calibrator.save().unwrap();
//! assert_eq!(rectify.gyro.bias, Vector3::new(-10.0, -20.0, -30.0));
//! ```

use heapless::Vec;
use log::{info, warn};
use nalgebra::Vector3;

use crate::error::{Error, Result, Status};
use crate::rectify::correct;
use crate::types::{CalibrationConfig, FusionConfig, PointEntry, RectifyConfig, SensorType};

/// Largest point count any mode needs
pub const MAX_CALIBRATION_POINTS: usize = 6;

/// Smallest drift integral (radians) the `2pnt_gyro` scale is derived from
const MIN_ROTATION: f32 = 1.0e-3;

/// Calibration procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CalibrationMode {
    /// Gyro bias from one still point
    OnePointGyro,
    /// Gyro bias from two still points, scale from the rotation between them
    TwoPointGyro,
    /// Gyro bias plus horizontal magnetometer bias from four headings on a level surface
    FourPointMagn,
    /// Gyro and accelerometer bias from six orientations
    SixPointFull,
}

impl CalibrationMode {
    /// Points the mode consumes
    pub const fn points(self) -> usize {
        match self {
            CalibrationMode::OnePointGyro => 1,
            CalibrationMode::TwoPointGyro => 2,
            CalibrationMode::FourPointMagn => 4,
            CalibrationMode::SixPointFull => 6,
        }
    }
}

impl TryFrom<u8> for CalibrationMode {
    type Error = Error;

    /// Modes are coded by their point count
    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(CalibrationMode::OnePointGyro),
            2 => Ok(CalibrationMode::TwoPointGyro),
            4 => Ok(CalibrationMode::FourPointMagn),
            6 => Ok(CalibrationMode::SixPointFull),
            other => Err(Error::BadMode(other)),
        }
    }
}

/// What a reduction computed; handed to the verifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationResult {
    /// Mode that produced the result
    pub mode: CalibrationMode,
    /// Points reduced
    pub points: usize,
    /// Staged gyro bias
    pub gyro_bias: Vector3<f32>,
    /// Staged accelerometer bias, `6pnt_full` only
    pub accel_bias: Option<Vector3<f32>>,
    /// Staged magnetometer bias, `4pnt_magn` only
    pub magn_bias: Option<Vector3<f32>>,
    /// Axis and factor applied to the gyro matrix diagonal, `2pnt_gyro` only
    pub gyro_scale: Option<(usize, f32)>,
    /// Staged accelerometer reference magnitude
    pub accel_reference: Option<f32>,
    /// Staged magnetometer reference magnitude
    pub magn_reference: Option<f32>,
    /// Mean distance of the points' gyro vectors from their mean
    pub fom: f32,
}

/// Where a calibration session stands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationStatus {
    /// No session
    Idle,
    /// Waiting for points
    Collecting {
        /// Active mode
        mode: CalibrationMode,
        /// Points received
        have: usize,
        /// Points required
        need: usize,
    },
    /// Reduced and accepted; waiting for save
    Ready(CalibrationResult),
    /// Reduced and refused by the verifier
    Rejected(CalibrationResult),
}

/// Accept/reject decision on a reduced calibration
pub type Verifier = Box<dyn Fn(&CalibrationResult) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Collecting,
    Ready,
    Rejected,
}

#[derive(Debug)]
struct Session {
    mode: CalibrationMode,
    phase: Phase,
    points: Vec<PointEntry, MAX_CALIBRATION_POINTS>,
    rectify: RectifyConfig,
    fusion: FusionConfig,
}

/// Per-instance calibration engine
pub struct Calibrator {
    config: CalibrationConfig,
    session: Option<Session>,
    result: Option<CalibrationResult>,
    verifier: Option<Verifier>,
}

impl core::fmt::Debug for Calibrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Calibrator")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("result", &self.result)
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

impl Calibrator {
    /// Idle calibrator with no verifier
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            session: None,
            result: None,
            verifier: None,
        }
    }

    /// Current config
    pub fn config(&self) -> CalibrationConfig {
        self.config
    }

    /// Replace the config; a running session keeps its snapshots
    pub fn set_config(&mut self, config: CalibrationConfig) {
        self.config = config;
    }

    /// Begin a session from snapshots of the live configs
    ///
    /// Any session in progress is discarded.
    pub fn start(&mut self, mode: CalibrationMode, rectify: RectifyConfig, fusion: FusionConfig) {
        info!("calibration {:?} started, {} point(s) needed", mode, mode.points());
        self.session = Some(Session {
            mode,
            phase: Phase::Collecting,
            points: Vec::new(),
            rectify,
            fusion,
        });
    }

    /// Drop the session; nothing staged survives
    pub fn abort(&mut self) {
        if let Some(session) = self.session.take() {
            info!("calibration {:?} aborted", session.mode);
        }
    }

    /// Register the verifier; the default accepts everything
    pub fn set_verifier(&mut self, verifier: Option<Verifier>) {
        self.verifier = verifier;
    }

    /// Session progress
    pub fn status(&self) -> CalibrationStatus {
        match (&self.session, self.result) {
            (None, _) => CalibrationStatus::Idle,
            (Some(session), Some(result)) if session.phase == Phase::Ready => {
                CalibrationStatus::Ready(result)
            }
            (Some(session), Some(result)) if session.phase == Phase::Rejected => {
                CalibrationStatus::Rejected(result)
            }
            (Some(session), _) => CalibrationStatus::Collecting {
                mode: session.mode,
                have: session.points.len(),
                need: session.mode.points(),
            },
        }
    }

    /// Most recent reduction, saved or not
    pub fn result(&self) -> Option<CalibrationResult> {
        self.result
    }

    /// Add one stability point
    ///
    /// Returns [`Status::PointCaptured`] while more points are needed and
    /// [`Status::CalibrationReady`] once the reduction ran and was accepted.
    /// Points past the mode's count report [`Status::NoCapacity`].
    pub fn submit_point(&mut self, point: &PointEntry) -> Result<Status> {
        let session = self.session.as_mut().ok_or(Error::NotCalibrating)?;
        if session.phase != Phase::Collecting {
            return Ok(Status::NoCapacity);
        }
        if session.points.push(*point).is_err() {
            return Ok(Status::NoCapacity);
        }
        if session.points.len() < session.mode.points() {
            return Ok(Status::PointCaptured);
        }

        let result = session.reduce(&self.config);
        self.result = Some(result);
        info!(
            "calibration {:?} reduced: gyro bias {:?}, fom {}",
            result.mode,
            result.gyro_bias.as_slice(),
            result.fom
        );

        let accepted = self.verifier.as_ref().is_none_or(|verify| verify(&result));
        if accepted {
            session.phase = Phase::Ready;
            Ok(Status::CalibrationReady)
        } else {
            warn!("calibration {:?} rejected, fom {}", result.mode, result.fom);
            session.phase = Phase::Rejected;
            Err(Error::CalibrationRejected { fom: result.fom })
        }
    }

    /// Hand back the staged configs and end the session
    ///
    /// The caller installs them as the live configs. Fails without ending
    /// the session while points are still missing.
    pub fn save(&mut self) -> Result<(RectifyConfig, FusionConfig)> {
        let session = self.session.as_ref().ok_or(Error::NotCalibrating)?;
        match session.phase {
            Phase::Collecting => Err(Error::CalibrationIncomplete {
                have: session.points.len(),
                need: session.mode.points(),
            }),
            Phase::Rejected => Err(Error::CalibrationRejected {
                fom: self.result.map_or(f32::NAN, |r| r.fom),
            }),
            Phase::Ready => {
                let staged = (session.rectify, session.fusion);
                info!("calibration {:?} committed", session.mode);
                self.session = None;
                Ok(staged)
            }
        }
    }
}

impl Session {
    /// Run the mode's reducer over the collected points, updating the staged configs
    fn reduce(&mut self, config: &CalibrationConfig) -> CalibrationResult {
        let points = self.points.as_slice();
        let gyro_mean = mean(points.iter().map(|p| p.gyro_filtered));
        let fom = spread(points.iter().map(|p| p.gyro_filtered), gyro_mean);

        let mut result = CalibrationResult {
            mode: self.mode,
            points: points.len(),
            gyro_bias: Vector3::zeros(),
            accel_bias: None,
            magn_bias: None,
            gyro_scale: None,
            accel_reference: None,
            magn_reference: None,
            fom,
        };

        self.rectify.gyro.bias -= gyro_mean;
        result.gyro_bias = self.rectify.gyro.bias;

        match self.mode {
            CalibrationMode::OnePointGyro => {}
            CalibrationMode::TwoPointGyro => {
                let scale = points
                    .last()
                    .and_then(|last| gyro_scale(last, gyro_mean, self.fusion.gyro_scale, config));
                if let Some((axis, factor)) = scale {
                    self.rectify.gyro.matrix[(axis, axis)] *= factor;
                }
                result.gyro_scale = scale;
            }
            CalibrationMode::FourPointMagn => {
                if sampled(points, SensorType::Magn).next().is_none() {
                    warn!("4pnt magn: no point sampled the magnetometer while stable");
                    return result;
                }
                let magn_mean = mean(sampled(points, SensorType::Magn));
                // Level surface: z is not observable from heading changes
                let delta = Vector3::new(-magn_mean.x, -magn_mean.y, 0.0);
                self.rectify.magn.bias += delta;
                result.magn_bias = Some(self.rectify.magn.bias);

                let matrix = self.rectify.magn.matrix;
                let shift = correct(delta, Vector3::zeros(), &matrix);
                let magnitude = mean_norm(sampled(points, SensorType::Magn).map(|m| m + shift));
                if magnitude > 0.0 {
                    self.fusion.magn_reference = magnitude;
                    result.magn_reference = Some(magnitude);
                }
            }
            CalibrationMode::SixPointFull => {
                if sampled(points, SensorType::Accel).next().is_none() {
                    warn!("6pnt full: no point sampled the accelerometer while stable");
                    return result;
                }
                let accel_mean = mean(sampled(points, SensorType::Accel));
                self.rectify.accel.bias -= accel_mean;
                result.accel_bias = Some(self.rectify.accel.bias);

                let matrix = self.rectify.accel.matrix;
                let shift = correct(-accel_mean, Vector3::zeros(), &matrix);
                let magnitude = mean_norm(sampled(points, SensorType::Accel).map(|a| a + shift));
                if magnitude > 0.0 {
                    self.fusion.accel_reference = magnitude;
                    result.accel_reference = Some(magnitude);
                }
            }
        }

        result
    }
}

/// Axis and factor that make the second point's drift integral match the
/// configured reference rotation
fn gyro_scale(
    point: &PointEntry,
    gyro_mean: Vector3<f32>,
    units: f32,
    config: &CalibrationConfig,
) -> Option<(usize, f32)> {
    // Remove the bias that was integrated along with the rotation
    let integral = point.gyro_accumulated - gyro_mean * point.motion_time;
    let axis = integral.iamax();
    let measured = integral[axis].abs() * units;
    if measured < MIN_ROTATION || config.gyro_reference_rotation <= 0.0 {
        warn!("2pnt gyro rotation too small to scale ({} rad)", measured);
        return None;
    }
    Some((axis, config.gyro_reference_rotation / measured))
}

/// Filtered vectors of the points that sampled `sensor` while stable
fn sampled(points: &[PointEntry], sensor: SensorType) -> impl Iterator<Item = Vector3<f32>> + '_ {
    points
        .iter()
        .filter(move |p| p.count(sensor) > 0)
        .map(move |p| p.filtered(sensor))
}

fn mean(values: impl Iterator<Item = Vector3<f32>>) -> Vector3<f32> {
    let (sum, count) = values.fold((Vector3::zeros(), 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 {
        sum
    } else {
        sum / count as f32
    }
}

fn mean_norm(values: impl Iterator<Item = Vector3<f32>>) -> f32 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v.norm(), n + 1));
    if count == 0 { 0.0 } else { sum / count as f32 }
}

fn spread(values: impl Iterator<Item = Vector3<f32>>, center: Vector3<f32>) -> f32 {
    mean_norm(values.map(|v| v - center))
}

//! Orientation fusion core
//!
//! Holds one orientation quaternion per instance behind its own lock. Gyro
//! samples are integrated; accelerometer and magnetometer samples pull the
//! estimate toward "down" and "north" with one weighted gradient-descent
//! step each. Producers for different sensors may call in concurrently.

use std::sync::Mutex;

use log::debug;
use nalgebra::{Quaternion, Vector3};

use crate::error::Status;
use crate::lock;
use crate::math::{
    FORWARD, UP, angle_between, estimate_accel_step, estimate_magn_step, fom_weight,
    integrate_gyro, normalize4, quat_from_up, quat_from_up_forward, rotate_forward,
    rotate_reverse, to_euler,
};
use crate::types::{
    Datum, Fom, FusionConfig, FusionState, SensorType, Tick, Triple, ZeroingPolicy,
    ticks_to_seconds,
};

/// Quality weight treated as zero
const MIN_WEIGHT: f32 = 1.0e-3;
/// Vector magnitude treated as no signal
const MIN_MAGNITUDE: f32 = 1.0e-6;
/// Gyro gaps longer than this (seconds) are not integrated
const MAX_GYRO_GAP: f32 = 1.0;

/// Orientation snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Sensor-to-reference orientation
    pub quaternion: Quaternion<f32>,
    /// Orientation relative to the captured reference: `q ⊗ conj(ref)`
    pub relative: Quaternion<f32>,
    /// `(roll, pitch, yaw)` of `relative`, radians
    pub euler: Vector3<f32>,
    /// Smoothed translational acceleration in the reference frame, when enabled
    pub translation: Option<Vector3<f32>>,
    /// Lifecycle state
    pub state: FusionState,
    /// Every enabled reference axis has been observed
    pub ready: bool,
}

impl Estimate {
    /// Heading (yaw) of the reference-relative orientation, radians
    pub fn heading(&self) -> f32 {
        self.euler.z
    }
}

/// Outcome of one fusion step
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FusionOutcome {
    /// What happened to the datum
    pub status: Status,
    /// Figure of merit, when one could be computed
    pub fom: Option<Fom>,
}

impl FusionOutcome {
    fn status(status: Status) -> Self {
        Self { status, fom: None }
    }
}

/// Lock-protected state of one fusion instance
#[derive(Debug, Clone, Copy)]
struct Inner {
    config: FusionConfig,
    state: FusionState,
    last_zeroing: Option<ZeroingPolicy>,
    quaternion: Quaternion<f32>,
    reference: Quaternion<f32>,
    accel_resolved: bool,
    magn_resolved: bool,
    last_gyro_tick: Option<Tick>,
    translation: Vector3<f32>,
}

/// Per-instance orientation filter
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_calib::{Datum, FusionConfig, FusionCore, Status, ZeroingPolicy};
///
/// let core = FusionCore::new(FusionConfig {
///     magn_enabled: false,
///     ..Default::default()
/// });
///
/// let outcome = core.update(Datum::accel(0, Vector3::new(0.0, 0.0, 1.0)));
/// assert_eq!(outcome.status, Status::Zeroed(ZeroingPolicy::AccelOnly));
/// assert!(core.estimate().ready);
/// ```
#[derive(Debug)]
pub struct FusionCore {
    inner: Mutex<Inner>,
}

impl FusionCore {
    /// Create an uninitialized core
    pub fn new(config: FusionConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::new(config)),
        }
    }

    /// Current config
    pub fn config(&self) -> FusionConfig {
        lock(&self.inner).config
    }

    /// Replace the config
    ///
    /// Enabling a reference axis that was never observed sends the next
    /// datum of that sensor through zeroing again.
    pub fn set_config(&self, config: FusionConfig) {
        let mut inner = lock(&self.inner);
        inner.config = config;
        inner.settle();
    }

    /// Process one datum
    pub fn update(&self, datum: Datum) -> FusionOutcome {
        lock(&self.inner).update(datum)
    }

    /// Process a synchronized triple
    ///
    /// When both reference axes are still unresolved the pair is used for a
    /// synchronized build; otherwise each member goes through [`update`]
    /// in gyro, accel, magn order. Outcomes are returned in the same order.
    ///
    /// [`update`]: FusionCore::update
    pub fn update_triple(&self, triple: Triple) -> [FusionOutcome; 3] {
        lock(&self.inner).update_triple(triple)
    }

    /// Copy of the current orientation and derived values
    pub fn estimate(&self) -> Estimate {
        lock(&self.inner).estimate()
    }

    /// Current orientation quaternion
    pub fn quaternion(&self) -> Quaternion<f32> {
        lock(&self.inner).quaternion
    }

    /// Lifecycle state
    pub fn state(&self) -> FusionState {
        lock(&self.inner).state
    }

    /// Most recent zeroing policy, if any ran
    pub fn last_zeroing(&self) -> Option<ZeroingPolicy> {
        lock(&self.inner).last_zeroing
    }

    /// Capture the current orientation as the reference
    pub fn set_reference(&self) {
        let mut inner = lock(&self.inner);
        inner.reference = inner.quaternion;
    }

    /// Reset the reference to identity
    pub fn clear_reference(&self) {
        lock(&self.inner).reference = Quaternion::identity();
    }

    /// Forget the orientation and return to `Uninitialized`; config is kept
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        *inner = Inner::new(inner.config);
    }
}

impl Default for FusionCore {
    fn default() -> Self {
        Self::new(FusionConfig::default())
    }
}

impl Inner {
    fn new(config: FusionConfig) -> Self {
        Self {
            config,
            state: FusionState::Uninitialized,
            last_zeroing: None,
            quaternion: Quaternion::identity(),
            reference: Quaternion::identity(),
            accel_resolved: false,
            magn_resolved: false,
            last_gyro_tick: None,
            translation: Vector3::zeros(),
        }
    }

    /// Every enabled reference axis has been observed
    fn resolved(&self) -> bool {
        (!self.config.accel_enabled || self.accel_resolved)
            && (!self.config.magn_enabled || self.magn_resolved)
    }

    /// Move a zeroed state on to normal operation once nothing is pending
    fn promote(&mut self) {
        if self.state.is_initialized() && self.state != FusionState::NormalOp && self.resolved() {
            self.state = FusionState::NormalOp;
        }
    }

    /// Re-derive the state after a config change
    fn settle(&mut self) {
        if self.state == FusionState::NormalOp && !self.resolved() {
            self.state = if self.accel_resolved {
                FusionState::ZeroedAccel
            } else {
                FusionState::ZeroedSave
            };
        }
    }

    fn update(&mut self, datum: Datum) -> FusionOutcome {
        let gyro_only = !self.config.accel_enabled && !self.config.magn_enabled;
        if gyro_only && self.state == FusionState::Uninitialized {
            let zeroed = self.zero(ZeroingPolicy::GyroOnly, Quaternion::identity());
            let outcome = self.dispatch(datum);
            return FusionOutcome {
                status: zeroed.status.worst(outcome.status),
                fom: outcome.fom,
            };
        }
        self.dispatch(datum)
    }

    fn dispatch(&mut self, datum: Datum) -> FusionOutcome {
        match datum.sensor {
            SensorType::Gyro => self.update_gyro(datum),
            SensorType::Accel => self.update_accel(datum.value),
            SensorType::Magn => self.update_magn(datum.value),
        }
    }

    fn update_triple(&mut self, triple: Triple) -> [FusionOutcome; 3] {
        let synchronized = self.config.accel_enabled
            && self.config.magn_enabled
            && !self.accel_resolved
            && !self.magn_resolved
            && triple.accel.norm() > MIN_MAGNITUDE
            && triple.magn.norm() > MIN_MAGNITUDE;

        if synchronized {
            self.accel_resolved = true;
            self.magn_resolved = true;
            let q = quat_from_up_forward(triple.accel, triple.magn);
            let zeroed = self.zero(ZeroingPolicy::Synchronized, q);
            let gyro = if self.config.gyro_enabled {
                // Integration starts from the next triple
                self.last_gyro_tick = Some(triple.tick);
                FusionOutcome::status(Status::Ok)
            } else {
                FusionOutcome::status(Status::Disabled)
            };
            return [gyro, zeroed, zeroed];
        }

        triple.datums().map(|datum| self.update(datum))
    }

    fn update_gyro(&mut self, datum: Datum) -> FusionOutcome {
        if !self.config.gyro_enabled {
            return FusionOutcome::status(Status::Disabled);
        }

        let previous = self.last_gyro_tick.replace(datum.tick);
        if !self.state.is_initialized() {
            return FusionOutcome::status(Status::Ok);
        }
        self.promote();

        let Some(previous) = previous else {
            return FusionOutcome::status(Status::Ok);
        };
        let dt = ticks_to_seconds(previous, datum.tick);
        if dt <= 0.0 || dt > MAX_GYRO_GAP {
            return FusionOutcome::status(Status::Ok);
        }

        let omega = datum.value * self.config.gyro_scale;
        self.quaternion = normalize4(integrate_gyro(self.quaternion, omega, dt));

        let magnitude = omega.norm();
        FusionOutcome {
            status: Status::Ok,
            fom: Some(Fom::Gyro {
                magnitude,
                delta: magnitude * dt,
            }),
        }
    }

    fn update_accel(&mut self, accel: Vector3<f32>) -> FusionOutcome {
        if !self.config.accel_enabled {
            return FusionOutcome::status(Status::Disabled);
        }
        let magnitude = accel.norm();
        if magnitude < MIN_MAGNITUDE {
            return FusionOutcome::status(Status::ZeroWeight);
        }
        if !self.accel_resolved {
            return self.zero_accel(accel);
        }
        self.promote();

        if self.config.translation_enabled {
            self.update_translation(accel);
        }

        let weight = if self.config.accel_fom_enabled {
            fom_weight(magnitude, self.config.accel_reference, self.config.accel_threshold)
        } else {
            1.0
        };
        if weight < MIN_WEIGHT {
            return FusionOutcome {
                status: Status::ZeroWeight,
                fom: Some(Fom::Accel {
                    magnitude,
                    weight,
                    delta: 0.0,
                }),
            };
        }

        let (quaternion, delta) = estimate_accel_step(
            self.quaternion,
            accel / magnitude,
            weight * self.config.accel_weight,
        );
        self.quaternion = quaternion;

        FusionOutcome {
            status: Status::Ok,
            fom: Some(Fom::Accel {
                magnitude,
                weight,
                delta,
            }),
        }
    }

    fn update_magn(&mut self, magn: Vector3<f32>) -> FusionOutcome {
        if !self.config.magn_enabled {
            return FusionOutcome::status(Status::Disabled);
        }
        let magnitude = magn.norm();
        if magnitude < MIN_MAGNITUDE {
            return FusionOutcome::status(Status::ZeroWeight);
        }
        if !self.magn_resolved {
            return self.zero_magn(magn);
        }
        self.promote();

        let config = &self.config;
        let weight = if config.magn_fom_enabled {
            fom_weight(magnitude, config.magn_reference, config.magn_threshold)
        } else {
            1.0
        };

        // Local interference bends the field away from its usual dip
        let angle = angle_between(magn, rotate_reverse(self.quaternion, UP));
        let angle_weight = if config.magn_angle_fom_enabled {
            fom_weight(angle, config.magn_angle_reference, config.magn_angle_threshold)
        } else {
            1.0
        };

        let applied = weight * angle_weight;
        if applied < MIN_WEIGHT {
            return FusionOutcome {
                status: Status::ZeroWeight,
                fom: Some(Fom::Magn {
                    magnitude,
                    weight,
                    angle,
                    angle_weight,
                    delta: 0.0,
                }),
            };
        }

        let step = applied * config.magn_weight;
        let (quaternion, delta) = estimate_magn_step(self.quaternion, magn / magnitude, step);
        self.quaternion = quaternion;

        FusionOutcome {
            status: Status::Ok,
            fom: Some(Fom::Magn {
                magnitude,
                weight,
                angle,
                angle_weight,
                delta,
            }),
        }
    }

    fn zero_accel(&mut self, accel: Vector3<f32>) -> FusionOutcome {
        self.accel_resolved = true;
        if self.config.magn_enabled && self.magn_resolved {
            // Keep the heading the magnetometer (and gyro since) established
            let forward = rotate_reverse(self.quaternion, FORWARD);
            let q = quat_from_up_forward(accel, forward);
            self.zero(ZeroingPolicy::Revisit, q)
        } else {
            self.zero(ZeroingPolicy::AccelOnly, quat_from_up(accel))
        }
    }

    fn zero_magn(&mut self, magn: Vector3<f32>) -> FusionOutcome {
        self.magn_resolved = true;
        if self.config.accel_enabled && self.accel_resolved {
            let up = rotate_reverse(self.quaternion, UP);
            let q = quat_from_up_forward(up, magn);
            self.zero(ZeroingPolicy::Revisit, q)
        } else {
            self.zero(ZeroingPolicy::MagnOnly, quat_from_up_forward(UP, magn))
        }
    }

    fn zero(&mut self, policy: ZeroingPolicy, quaternion: Quaternion<f32>) -> FusionOutcome {
        self.quaternion = quaternion;
        self.last_zeroing = Some(policy);
        self.translation = Vector3::zeros();
        self.state = match policy {
            ZeroingPolicy::GyroOnly => FusionState::ZeroedGyro,
            ZeroingPolicy::AccelOnly => FusionState::ZeroedAccel,
            ZeroingPolicy::MagnOnly if self.config.accel_enabled => FusionState::ZeroedSave,
            ZeroingPolicy::MagnOnly => FusionState::ZeroedMagn,
            ZeroingPolicy::Synchronized | ZeroingPolicy::Revisit => FusionState::ZeroedBoth,
        };
        debug!("fusion zeroed by {:?} -> {:?}", policy, self.state);
        FusionOutcome::status(Status::Zeroed(policy))
    }

    /// Low-pass the non-gravitational part of the accelerometer, reference frame
    fn update_translation(&mut self, accel: Vector3<f32>) {
        let residual = rotate_forward(self.quaternion, accel) - UP * self.config.accel_reference;
        self.translation += (residual - self.translation) * self.config.translation_alpha;
    }

    fn estimate(&self) -> Estimate {
        let relative = normalize4(self.quaternion * self.reference.conjugate());
        Estimate {
            quaternion: self.quaternion,
            relative,
            euler: to_euler(relative),
            translation: self.config.translation_enabled.then_some(self.translation),
            state: self.state,
            ready: self.state.is_initialized() && self.resolved(),
        }
    }
}

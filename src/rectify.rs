//! Sensor rectification: bias and linear-transform correction of raw samples

use nalgebra::{Matrix3, Vector3};

use crate::error::Status;
use crate::types::{Datum, RectifyConfig};

/// Applies the affine correction `(raw + bias) · matrix`
///
/// `raw + bias` is treated as a row vector, so the matrix columns map to the
/// corrected axes.
///
/// # Example
/// ```
/// use nalgebra::{Matrix3, Vector3};
/// use fusion_calib::rectify::correct;
///
/// let raw = Vector3::new(1.0, 2.0, 3.0);
/// let bias = Vector3::new(-0.1, -0.2, -0.3);
///
/// let corrected = correct(raw, bias, &Matrix3::identity());
/// assert!((corrected - Vector3::new(0.9, 1.8, 2.7)).norm() < 1e-6);
/// ```
pub fn correct(raw: Vector3<f32>, bias: Vector3<f32>, matrix: &Matrix3<f32>) -> Vector3<f32> {
    ((raw + bias).transpose() * matrix).transpose()
}

/// Per-instance rectifier
///
/// Holds no state beyond its config; gyro, accelerometer and magnetometer
/// are corrected independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rectifier {
    config: RectifyConfig,
}

impl Rectifier {
    /// Create a rectifier with the given config
    pub fn new(config: RectifyConfig) -> Self {
        Self { config }
    }

    /// Current config
    pub fn config(&self) -> RectifyConfig {
        self.config
    }

    /// Replace the config (external reload or calibration commit)
    pub fn set_config(&mut self, config: RectifyConfig) {
        self.config = config;
    }

    /// Correct one datum
    ///
    /// A disabled rectifier returns the datum unchanged with
    /// [`Status::Disabled`].
    pub fn correct(&self, datum: Datum) -> (Datum, Status) {
        if !self.config.enabled {
            return (datum, Status::Disabled);
        }

        let correction = self.config.correction(datum.sensor);
        let value = correct(datum.value, correction.bias, &correction.matrix);
        (Datum { value, ..datum }, Status::Ok)
    }
}

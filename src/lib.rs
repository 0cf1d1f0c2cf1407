//! [![github]](https://github.com/wboayue/fusion-calib)&ensp;[![crates-io]](https://crates.io/crates/fusion-calib)&ensp;[![license]](https://opensource.org/licenses/MIT)
//!
//! [github]: https://img.shields.io/badge/github-8da0cb?style=for-the-badge&labelColor=555555&logo=github
//! [crates-io]: https://img.shields.io/badge/crates.io-fc8d62?style=for-the-badge&labelColor=555555&logo=rust
//! [license]: https://img.shields.io/badge/License-MIT-blue.svg?style=for-the-badge&labelColor=555555
//!
//! Fusion Calib - orientation fusion and stationary-point calibration for IMUs
//!
//! Each engine instance turns a stream of timestamped gyroscope,
//! accelerometer and magnetometer samples into an orientation quaternion.
//! Samples are rectified (bias and linear correction), watched for
//! stillness, fused with a weighted gradient-descent filter and tracked
//! statistically. Still episodes become calibration points that can be
//! reduced into new bias corrections and committed on demand.
//!
//! # Features
//!
//! - Gradient-descent fusion with figure-of-merit weighting of every correction
//! - Automatic zeroing from whichever reference sensor reports first
//! - Stability detection harvesting calibration points
//! - 1, 2, 4 and 6 point calibration with staged commit
//! - Bounded, non-blocking ingestion queue with a background consumer
//! - Optional `serde` support for every config struct
//!
//! # Quick Start
//!
//! ```rust
//! use nalgebra::Vector3;
//! use fusion_calib::{Datum, Engine, EngineConfig, InstanceConfig, Pipeline, Triple};
//!
//! // Synchronous dispatch: no consumer thread
//! let mut engine = Engine::new(EngineConfig { queue_depth: 0, ..Default::default() }).unwrap();
//! let imu = engine.add_instance(InstanceConfig::default(), Pipeline::FULL).unwrap();
//!
//! // Ticks are 10 µs; gyro in Q8.8 rad/s, accel in g, magnetometer in µT
//! let gyro = Vector3::new(0.0, 0.0, 0.0);
//! let accel = Vector3::new(0.0, 0.0, 1.0);
//! let magn = Vector3::new(20.0, 0.0, -40.0);
//! engine.submit_triple(imu, Triple::new(0, gyro, accel, magn)).unwrap();
//!
//! let estimate = engine.get_estimate(imu).unwrap();
//! assert!(estimate.ready);
//! let (roll, pitch, yaw) = (estimate.euler.x, estimate.euler.y, estimate.euler.z);
//! assert!(roll.abs() < 1e-3 && pitch.abs() < 1e-3 && yaw.abs() < 1e-3);
//! ```
//!
//! For more documentation and examples, see: <https://github.com/wboayue/fusion-calib>

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod calibration;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod math;
pub mod rectify;
pub mod slab;
pub mod stability;
pub mod stats;
mod types;

// Re-export the common surface
pub use calibration::{CalibrationMode, CalibrationResult, CalibrationStatus, Calibrator, Verifier};
pub use engine::{Engine, Points, QUEUE_CAPACITY};
pub use error::{Error, Result, Status};
pub use fusion::{Estimate, FusionCore, FusionOutcome};
pub use math::{DEG_TO_RAD, RAD_TO_DEG};
pub use rectify::Rectifier;
pub use slab::{Handle, MAX_INSTANCES};
pub use stability::{Detection, POINT_CAPACITY, PointCallback, StabilityDetector};
pub use stats::{Metric, StatsCollector, StatsSnapshot};
pub use types::*;

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

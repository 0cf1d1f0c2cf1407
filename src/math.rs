//! Stateless vector and quaternion primitives for the fusion pipeline
//!
//! Quaternions are `(w, x, y, z)` with `q` rotating sensor-frame vectors into
//! the reference frame: `v_ref = q ⊗ v_sensor ⊗ q*`. The reference frame has
//! x forward (magnetic north), z up and y = z × x.

use nalgebra::{Matrix3, Matrix3x4, Quaternion, Vector3, Vector4};

/// Mathematical constants
pub const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;
pub const RAD_TO_DEG: f32 = 180.0 / core::f32::consts::PI;

/// Squared norm below which normalization is skipped
pub const NORM_EPSILON: f32 = 1.0e-12;

/// Reference-frame up axis
pub const UP: Vector3<f32> = Vector3::new(0.0, 0.0, 1.0);

/// Reference-frame forward axis
pub const FORWARD: Vector3<f32> = Vector3::new(1.0, 0.0, 0.0);

/// Normalize a vector, leaving near-zero input unchanged
pub fn normalize(v: Vector3<f32>) -> Vector3<f32> {
    let norm_squared = v.norm_squared();
    if norm_squared < NORM_EPSILON {
        return v;
    }
    v / norm_squared.sqrt()
}

/// Normalize a quaternion, leaving near-zero input unchanged
pub fn normalize4(q: Quaternion<f32>) -> Quaternion<f32> {
    let norm_squared = q.norm_squared();
    if norm_squared < NORM_EPSILON {
        return q;
    }
    q / norm_squared.sqrt()
}

/// Hamilton product `a ⊗ b`
pub fn multiply(a: Quaternion<f32>, b: Quaternion<f32>) -> Quaternion<f32> {
    a * b
}

/// Conjugate `q*`
pub fn conjugate(q: Quaternion<f32>) -> Quaternion<f32> {
    q.conjugate()
}

/// Rotate a sensor-frame vector into the reference frame: `q ⊗ v ⊗ q*`
pub fn rotate_forward(q: Quaternion<f32>, v: Vector3<f32>) -> Vector3<f32> {
    let p = Quaternion::from_imag(v);
    (q * p * q.conjugate()).imag()
}

/// Rotate a reference-frame vector into the sensor frame: `q* ⊗ v ⊗ q`
pub fn rotate_reverse(q: Quaternion<f32>, v: Vector3<f32>) -> Vector3<f32> {
    let p = Quaternion::from_imag(v);
    (q.conjugate() * p * q).imag()
}

/// Euler angles `(roll, pitch, yaw)` in radians, aerospace ZYX order
///
/// Pitch is clamped to ±π/2 when `|sin(pitch)| >= 1` (gimbal lock).
pub fn to_euler(q: Quaternion<f32>) -> Vector3<f32> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));

    let sin_pitch = 2.0 * (w * y - z * x);
    let pitch = if sin_pitch.abs() >= 1.0 {
        core::f32::consts::FRAC_PI_2.copysign(sin_pitch)
    } else {
        sin_pitch.asin()
    };

    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

    Vector3::new(roll, pitch, yaw)
}

/// Quaternion from Euler angles in radians, aerospace ZYX order
pub fn from_euler(roll: f32, pitch: f32, yaw: f32) -> Quaternion<f32> {
    let (sr, cr) = (roll * 0.5).sin_cos();
    let (sp, cp) = (pitch * 0.5).sin_cos();
    let (sy, cy) = (yaw * 0.5).sin_cos();

    Quaternion::new(
        cr * cp * cy + sr * sp * sy,
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
    )
}

/// Quaternion from a sensor-to-reference rotation matrix
///
/// Branches on the largest of `{trace, m00, m11, m22}` so the square root
/// argument stays positive. The result has a non-negative scalar part.
pub fn quat_from_matrix(m: &Matrix3<f32>) -> Quaternion<f32> {
    let (m00, m11, m22) = (m[(0, 0)], m[(1, 1)], m[(2, 2)]);
    let trace = m00 + m11 + m22;

    let q = if trace >= m00 && trace >= m11 && trace >= m22 {
        let s = (trace + 1.0).sqrt() * 2.0;
        Quaternion::new(
            0.25 * s,
            (m[(2, 1)] - m[(1, 2)]) / s,
            (m[(0, 2)] - m[(2, 0)]) / s,
            (m[(1, 0)] - m[(0, 1)]) / s,
        )
    } else if m00 >= m11 && m00 >= m22 {
        let s = (1.0 + m00 - m11 - m22).sqrt() * 2.0;
        Quaternion::new(
            (m[(2, 1)] - m[(1, 2)]) / s,
            0.25 * s,
            (m[(0, 1)] + m[(1, 0)]) / s,
            (m[(0, 2)] + m[(2, 0)]) / s,
        )
    } else if m11 >= m22 {
        let s = (1.0 + m11 - m00 - m22).sqrt() * 2.0;
        Quaternion::new(
            (m[(0, 2)] - m[(2, 0)]) / s,
            (m[(0, 1)] + m[(1, 0)]) / s,
            0.25 * s,
            (m[(1, 2)] + m[(2, 1)]) / s,
        )
    } else {
        let s = (1.0 + m22 - m00 - m11).sqrt() * 2.0;
        Quaternion::new(
            (m[(1, 0)] - m[(0, 1)]) / s,
            (m[(0, 2)] + m[(2, 0)]) / s,
            (m[(1, 2)] + m[(2, 1)]) / s,
            0.25 * s,
        )
    };

    let q = normalize4(q);
    if q.w < 0.0 { -q } else { q }
}

/// Shortest-arc orientation mapping the measured up vector onto reference up
pub fn quat_from_up(up: Vector3<f32>) -> Quaternion<f32> {
    let u = normalize(up);
    let d = u.dot(&UP);

    // Antiparallel: any horizontal axis works, pick x
    if 1.0 + d < 1.0e-6 {
        return Quaternion::new(0.0, 1.0, 0.0, 0.0);
    }

    let axis = u.cross(&UP);
    normalize4(Quaternion::new(1.0 + d, axis.x, axis.y, axis.z))
}

/// Orientation from sensor-frame up and forward observations
///
/// Forward is orthonormalized against up (Gram–Schmidt) and the third axis
/// is `up × forward`. A forward parallel to up carries no heading, so the
/// shortest-arc tilt is returned instead.
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_calib::math::quat_from_up_forward;
///
/// let q = quat_from_up_forward(Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 0.0));
/// assert!((q.w - 1.0).abs() < 1e-6);
/// ```
pub fn quat_from_up_forward(up: Vector3<f32>, forward: Vector3<f32>) -> Quaternion<f32> {
    let u = normalize(up);
    let projected = forward - u * forward.dot(&u);
    if projected.norm_squared() < 1.0e-8 || u.norm_squared() < NORM_EPSILON {
        return quat_from_up(up);
    }
    let f = normalize(projected);
    let r = u.cross(&f);

    let m = Matrix3::from_rows(&[f.transpose(), r.transpose(), u.transpose()]);
    quat_from_matrix(&m)
}

/// One gradient-descent step of `q` toward the measured gravity direction
///
/// `accel` must be normalized. The residual is the predicted sensor-frame up
/// minus the measurement; the analytic Jacobian gives the gradient, which is
/// normalized, scaled by `weight` and subtracted from `q`. Returns the new
/// orientation and the raw gradient's scalar component (near zero once
/// converged).
pub fn estimate_accel_step(q: Quaternion<f32>, accel: Vector3<f32>, weight: f32) -> (Quaternion<f32>, f32) {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let f = Vector3::new(
        2.0 * (x * z - w * y) - accel.x,
        2.0 * (w * x + y * z) - accel.y,
        2.0 * (0.5 - x * x - y * y) - accel.z,
    );

    #[rustfmt::skip]
    let jacobian = Matrix3x4::new(
        -2.0 * y,  2.0 * z, -2.0 * w, 2.0 * x,
         2.0 * x,  2.0 * w,  2.0 * z, 2.0 * y,
         0.0,     -4.0 * x, -4.0 * y, 0.0,
    );

    descend(q, jacobian.transpose() * f, weight)
}

/// One gradient-descent step of `q` toward the measured magnetic direction
///
/// `magn` must be normalized. The Earth field reference is rebuilt from the
/// current estimate as `[bx, 0, bz]`: the horizontal component is folded
/// onto forward, so only heading and dip are constrained.
pub fn estimate_magn_step(q: Quaternion<f32>, magn: Vector3<f32>, weight: f32) -> (Quaternion<f32>, f32) {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let h = rotate_forward(q, magn);
    let bx = (h.x * h.x + h.y * h.y).sqrt();
    let bz = h.z;

    let f = Vector3::new(
        2.0 * bx * (0.5 - y * y - z * z) + 2.0 * bz * (x * z - w * y) - magn.x,
        2.0 * bx * (x * y - w * z) + 2.0 * bz * (w * x + y * z) - magn.y,
        2.0 * bx * (w * y + x * z) + 2.0 * bz * (0.5 - x * x - y * y) - magn.z,
    );

    #[rustfmt::skip]
    let jacobian = Matrix3x4::new(
        -2.0 * bz * y,
        2.0 * bz * z,
        -4.0 * bx * y - 2.0 * bz * w,
        -4.0 * bx * z + 2.0 * bz * x,

        -2.0 * bx * z + 2.0 * bz * x,
        2.0 * bx * y + 2.0 * bz * w,
        2.0 * bx * x + 2.0 * bz * z,
        -2.0 * bx * w + 2.0 * bz * y,

        2.0 * bx * y,
        2.0 * bx * z - 4.0 * bz * x,
        2.0 * bx * w - 4.0 * bz * y,
        2.0 * bx * x,
    );

    descend(q, jacobian.transpose() * f, weight)
}

/// Apply a normalized, weighted gradient (ordered w, x, y, z) to `q`
fn descend(q: Quaternion<f32>, gradient: Vector4<f32>, weight: f32) -> (Quaternion<f32>, f32) {
    let delta = gradient[0];
    let norm_squared = gradient.norm_squared();
    if norm_squared < NORM_EPSILON {
        return (q, delta);
    }

    let step = gradient * (weight / norm_squared.sqrt());
    let corrected = Quaternion::new(q.w - step[0], q.i - step[1], q.j - step[2], q.k - step[3]);
    (normalize4(corrected), delta)
}

/// First-order gyro integration: `q + 0.5·dt·(q ⊗ [0, ω])`
///
/// `omega` is in rad/s. The result is not renormalized.
pub fn integrate_gyro(q: Quaternion<f32>, omega: Vector3<f32>, dt: f32) -> Quaternion<f32> {
    let rate = q * Quaternion::from_imag(omega);
    q + rate * (0.5 * dt)
}

/// Linear quality weight: 1 at `reference`, 0 at `reference ± threshold`
///
/// A non-positive threshold disables weighting (always 1).
pub fn fom_weight(value: f32, reference: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return 1.0;
    }
    (1.0 - (value - reference).abs() / threshold).clamp(0.0, 1.0)
}

/// Angle between two vectors in radians; zero if either is degenerate
pub fn angle_between(a: Vector3<f32>, b: Vector3<f32>) -> f32 {
    let denominator = (a.norm_squared() * b.norm_squared()).sqrt();
    if denominator < NORM_EPSILON {
        return 0.0;
    }
    (a.dot(&b) / denominator).clamp(-1.0, 1.0).acos()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-5;

    fn assert_quat_close(a: Quaternion<f32>, b: Quaternion<f32>, tolerance: f32) {
        // q and -q are the same rotation
        let same = (a.coords - b.coords).norm();
        let flipped = (a.coords + b.coords).norm();
        assert!(same.min(flipped) < tolerance, "{:?} != {:?}", a, b);
    }

    #[test]
    fn test_normalize_unit_norm() {
        let q = normalize4(Quaternion::new(1.0, 2.0, 3.0, 4.0));
        assert!((q.norm() - 1.0).abs() < EPSILON);

        let v = normalize(Vector3::new(3.0, 4.0, 0.0));
        assert!((v.norm() - 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_normalize_near_zero_unchanged() {
        let tiny = Quaternion::new(1.0e-8, 0.0, 0.0, 0.0);
        assert_eq!(normalize4(tiny), tiny);
        assert_eq!(normalize(Vector3::zeros()), Vector3::zeros());
    }

    #[test]
    fn test_rotate_forward_reverse_inverse() {
        let q = from_euler(0.3, -0.2, 1.1);
        let v = Vector3::new(0.5, -1.0, 2.0);
        let back = rotate_reverse(q, rotate_forward(q, v));
        assert!((back - v).norm() < EPSILON);
    }

    #[test]
    fn test_multiply_by_conjugate_is_identity() {
        let q = from_euler(0.4, 0.1, -0.7);
        let identity = multiply(q, conjugate(q));
        assert_quat_close(identity, Quaternion::identity(), EPSILON);
    }

    #[test]
    fn test_euler_round_trip() {
        let euler = Vector3::new(30.0, 45.0, 60.0) * DEG_TO_RAD;
        let recovered = to_euler(from_euler(euler.x, euler.y, euler.z));
        assert!((euler - recovered).norm() < 1e-5);
    }

    #[test]
    fn test_euler_gimbal_lock_clamps_pitch() {
        let q = from_euler(0.0, core::f32::consts::FRAC_PI_2, 0.0);
        // Push sin(pitch) just past one
        let q = Quaternion::new(q.w * 1.0001, q.i, q.j * 1.0001, q.k);
        let euler = to_euler(q);
        assert!((euler.y - core::f32::consts::FRAC_PI_2).abs() < 1e-3);
        assert!(!euler.y.is_nan());
    }

    #[test]
    fn test_quat_from_matrix_branches() {
        // Each orientation makes a different diagonal element dominate
        let cases = [
            from_euler(0.1, 0.2, 0.3),
            from_euler(core::f32::consts::PI * 0.95, 0.0, 0.0),
            from_euler(0.0, 0.0, core::f32::consts::PI * 0.95),
            Quaternion::new(0.05, 0.05, 0.99, 0.1),
        ];
        for q in cases {
            let q = normalize4(q);
            let m = nalgebra::UnitQuaternion::from_quaternion(q).to_rotation_matrix().into_inner();
            assert_quat_close(quat_from_matrix(&m), q, 1e-4);
        }
    }

    #[test]
    fn test_quat_from_up_forward_maps_axes() {
        let q_true = from_euler(0.2, -0.4, 0.9);
        let up = rotate_reverse(q_true, UP);
        let forward = rotate_reverse(q_true, FORWARD + UP * 0.7);

        let q = quat_from_up_forward(up * 9.81, forward * 40.0);
        assert_quat_close(q, q_true, 1e-4);
    }

    #[test]
    fn test_quat_from_up_forward_parallel_falls_back() {
        let up = Vector3::new(0.0, 0.0, 1.0);
        let q = quat_from_up_forward(up, up * 2.0);
        assert_quat_close(q, Quaternion::identity(), EPSILON);
    }

    #[test]
    fn test_quat_from_up() {
        let up = Vector3::new(0.0, 1.0, 0.0);
        let q = quat_from_up(up);
        assert!((rotate_forward(q, up) - UP).norm() < EPSILON);

        let flipped = quat_from_up(-UP);
        assert!((rotate_forward(flipped, -UP) - UP).norm() < EPSILON);
    }

    #[test]
    fn test_accel_step_converges() {
        let tilt = 3.0 * DEG_TO_RAD;
        let accel = Vector3::new(0.0, tilt.sin(), tilt.cos());
        let mut q = Quaternion::identity();

        for _ in 0..100 {
            q = estimate_accel_step(q, accel, 1.0e-3).0;
        }

        let predicted = rotate_reverse(q, UP);
        assert!((predicted - accel).norm() < 5.0e-3, "residual {}", (predicted - accel).norm());
        assert!((q.norm() - 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_accel_step_at_fixed_point_is_stationary() {
        let q = from_euler(0.3, 0.1, 0.0);
        let accel = rotate_reverse(q, UP);
        let (next, delta) = estimate_accel_step(q, accel, 1.0e-4);
        assert_quat_close(next, q, 2.0e-4);
        assert!(delta.abs() < 1e-5);
    }

    #[test]
    fn test_magn_step_converges_heading() {
        let heading = 10.0 * DEG_TO_RAD;
        let q_true = from_euler(0.0, 0.0, heading);
        let field = Vector3::new(0.5, 0.0, -0.8).normalize();
        let magn = rotate_reverse(q_true, field);

        let mut q = Quaternion::identity();
        for _ in 0..300 {
            q = estimate_magn_step(q, magn, 1.0e-3).0;
        }

        // Fixed point: the field seen through q has no y component
        let h = rotate_forward(q, magn);
        assert!(h.y.abs() < 5.0e-3, "h = {:?}", h);
        assert!(h.x > 0.0);
    }

    #[test]
    fn test_integrate_gyro_raw_chain() {
        // 67 Q8.8 rad/s units at 0.1 s for 60 steps, never renormalized
        let omega = Vector3::new(67.0 / 256.0, 0.0, 0.0);
        let mut q = Quaternion::identity();
        for _ in 0..60 {
            q = integrate_gyro(q, omega, 0.1);
        }
        assert!((q.w - 0.7108).abs() < 1e-3);
        assert!((q.i - 0.7108).abs() < 1e-3);
        assert!(q.j.abs() < EPSILON && q.k.abs() < EPSILON);
    }

    #[test]
    fn test_fom_weight_linear() {
        assert_eq!(fom_weight(1.0, 1.0, 0.5), 1.0);
        assert_eq!(fom_weight(1.5, 1.0, 0.5), 0.0);
        assert_eq!(fom_weight(2.0, 1.0, 0.5), 0.0);
        assert!((fom_weight(1.25, 1.0, 0.5) - 0.5).abs() < EPSILON);
        assert!((fom_weight(0.75, 1.0, 0.5) - 0.5).abs() < EPSILON);
        assert_eq!(fom_weight(7.0, 1.0, 0.0), 1.0);
    }

    #[test]
    fn test_angle_between() {
        let angle = angle_between(Vector3::x(), Vector3::y());
        assert!((angle - core::f32::consts::FRAC_PI_2).abs() < EPSILON);
        assert_eq!(angle_between(Vector3::zeros(), Vector3::y()), 0.0);
    }
}

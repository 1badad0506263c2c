//! Linear algebra type system for pose registration
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the pose/twist filter and the wire formats.

use nalgebra::{
    Isometry3, Quaternion, SMatrix, SVector, Translation3, UnitQuaternion, Vector3,
};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 13; // quat(4) + translation(3) + omega(3) + v(3)
pub const POSE_DIM: usize = 7; // quat(4) + translation(3)

// State block offsets
pub const IDX_QUAT: usize = 0;
pub const IDX_TRANS: usize = 4;
pub const IDX_OMEGA: usize = 7;
pub const IDX_VEL: usize = 10;

// ===== Filter Types =====
pub type StateVec13 = SVector<f64, STATE_DIM>;
pub type StateMat13 = SMatrix<f64, STATE_DIM, STATE_DIM>;

// Pose measurement types
pub type PoseVec7 = SVector<f64, POSE_DIM>;
pub type PoseNoise7 = SMatrix<f64, POSE_DIM, POSE_DIM>;
pub type KalmanGainPose = SMatrix<f64, STATE_DIM, POSE_DIM>; // 13×7
pub type JacobianPose = SMatrix<f64, POSE_DIM, STATE_DIM>; // 7×13

pub type Pose = Isometry3<f64>;

/// Pose laid out as `[qx, qy, qz, qw, x, y, z]`.
pub type QuTr = [f64; 7];

/// Orientation norm tolerance used by the filter invariants.
pub const QUAT_NORM_TOL: f64 = 1e-9;

pub fn pose_to_qutr(pose: &Pose) -> QuTr {
    let q = pose.rotation.coords;
    let t = pose.translation.vector;
    [q[0], q[1], q[2], q[3], t[0], t[1], t[2]]
}

/// Build a pose from the `[qx, qy, qz, qw, x, y, z]` layout.
///
/// Returns `None` when any element is non-finite or the quaternion part is
/// too close to zero to normalize.
pub fn pose_from_qutr(e: &QuTr) -> Option<Pose> {
    if e.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let q = Quaternion::new(e[3], e[0], e[1], e[2]);
    if q.norm() < 1e-9 {
        return None;
    }
    Some(Isometry3::from_parts(
        Translation3::new(e[4], e[5], e[6]),
        UnitQuaternion::from_quaternion(q),
    ))
}

pub fn is_finite_pose(pose: &Pose) -> bool {
    pose.rotation.coords.iter().all(|v| v.is_finite())
        && pose.translation.vector.iter().all(|v| v.is_finite())
}

/// Skew-symmetric cross-product matrix.
pub fn skew(v: &Vector3<f64>) -> SMatrix<f64, 3, 3> {
    SMatrix::<f64, 3, 3>::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Force exact symmetry, `P = (P + Pᵀ) / 2`.
pub fn symmetrize(p: &mut StateMat13) {
    *p = (*p + p.transpose()) * 0.5;
}

/// Frobenius norm of `P - Pᵀ`.
pub fn asymmetry(p: &StateMat13) -> f64 {
    (p - p.transpose()).norm()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_qutr_layout() {
        let pose = Isometry3::from_parts(
            Translation3::new(1.0, 2.0, 3.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2),
        );
        let e = pose_to_qutr(&pose);
        assert_abs_diff_eq!(e[2], (0.5f64).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(e[3], (0.5f64).sqrt(), epsilon = 1e-12);
        assert_eq!(&e[4..], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_pose_from_qutr_normalizes() {
        let pose = pose_from_qutr(&[0.0, 0.0, 0.0, 2.0, 0.5, 0.0, 0.0]).unwrap();
        assert_abs_diff_eq!(pose.rotation.coords.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_from_qutr_rejects_garbage() {
        assert!(pose_from_qutr(&[0.0; 7]).is_none());
        assert!(pose_from_qutr(&[0.0, 0.0, 0.0, 1.0, f64::NAN, 0.0, 0.0]).is_none());
    }
}

/// Pose/twist filter for one tracked rigid body (camera, fixed marker, hand)
///
/// State Vector (13D):
/// [0-3]:   Quaternion (qx, qy, qz, qw) orientation in the body frame
/// [4-6]:   Translation (x, y, z) in the body frame (meters)
/// [7-9]:   Angular velocity (wx, wy, wz), body frame (rad/s)
/// [10-12]: Linear velocity (vx, vy, vz), body frame (m/s)
///
/// Prediction integrates a constant twist. Correction is windowed-delta:
/// the innovation of each observation goes into a sliding window and the
/// window mean is blended into the state with a Kalman gain over the 7 pose
/// components.
use nalgebra::{Isometry3, Matrix3, Quaternion, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::innovation_window::InnovationWindow;
use crate::types::linalg::*;

// ─── Noise models ────────────────────────────────────────────────────────────

/// Process noise as variances accumulated per second.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessNoise {
    pub orientation: f64,
    pub translation: f64,
    pub angular_velocity: f64,
    pub linear_velocity: f64,
}

impl Default for ProcessNoise {
    fn default() -> Self {
        Self {
            orientation: 1e-6,
            translation: 1e-6,
            angular_velocity: 1e-6,
            linear_velocity: 1e-6,
        }
    }
}

impl ProcessNoise {
    pub fn matrix(&self) -> StateMat13 {
        let mut v = StateMat13::zeros();
        v.fixed_view_mut::<4, 4>(IDX_QUAT, IDX_QUAT).fill_diagonal(self.orientation);
        v.fixed_view_mut::<3, 3>(IDX_TRANS, IDX_TRANS).fill_diagonal(self.translation);
        v.fixed_view_mut::<3, 3>(IDX_OMEGA, IDX_OMEGA).fill_diagonal(self.angular_velocity);
        v.fixed_view_mut::<3, 3>(IDX_VEL, IDX_VEL).fill_diagonal(self.linear_velocity);
        v
    }
}

/// Pose measurement noise (variances of quaternion components and meters²).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeasurementNoise {
    pub orientation: f64,
    pub translation: f64,
}

impl Default for MeasurementNoise {
    fn default() -> Self {
        Self { orientation: 0.05, translation: 0.05 }
    }
}

impl MeasurementNoise {
    pub fn matrix(&self) -> PoseNoise7 {
        let mut w = PoseNoise7::zeros();
        w.fixed_view_mut::<4, 4>(IDX_QUAT, IDX_QUAT).fill_diagonal(self.orientation);
        w.fixed_view_mut::<3, 3>(IDX_TRANS, IDX_TRANS).fill_diagonal(self.translation);
        w
    }
}

// ─── Correction outcome ──────────────────────────────────────────────────────

/// Result of a correct call. Anything but `Applied` leaves the state
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionStatus {
    /// State, covariance and window updated.
    Applied,
    /// Nothing to fuse (`n_obs == 0`).
    NoObservations,
    /// Innovation covariance could not be inverted.
    Singular,
    /// Observation set carries no usable information (zero total weight,
    /// orientations cancelling out, collapsed quaternion).
    Degenerate,
    /// NaN/Inf in the observation or in the computed update.
    NonFinite,
}

impl CorrectionStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, CorrectionStatus::Applied)
    }
}

/// One reference/observation pair for a batch camera correction.
///
/// `reference` is the body-frame pose of the marker (from kinematics or a
/// fixed-marker estimate), `observed` is the same marker seen from the
/// camera. Together they imply `reference * observed⁻¹` as camera pose.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseCorrespondence {
    pub reference: Pose,
    pub observed: Pose,
    pub weight: f64,
}

impl PoseCorrespondence {
    pub fn implied_pose(&self) -> Pose {
        self.reference * self.observed.inverse()
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct PoseTwistState {
    pose: Pose,
    angular_velocity: Vector3<f64>,
    linear_velocity: Vector3<f64>,
    covariance: StateMat13,
    window: InnovationWindow,
}

impl PoseTwistState {
    /// Identity pose, zero twist, `P = scale * I`.
    pub fn new(window_capacity: usize, covariance_scale: f64) -> Self {
        Self {
            pose: Pose::identity(),
            angular_velocity: Vector3::zeros(),
            linear_velocity: Vector3::zeros(),
            covariance: StateMat13::identity() * covariance_scale,
            window: InnovationWindow::new(window_capacity),
        }
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn angular_velocity(&self) -> &Vector3<f64> {
        &self.angular_velocity
    }

    pub fn linear_velocity(&self) -> &Vector3<f64> {
        &self.linear_velocity
    }

    pub fn covariance(&self) -> &StateMat13 {
        &self.covariance
    }

    pub fn window(&self) -> &InnovationWindow {
        &self.window
    }

    pub fn covariance_trace(&self) -> f64 {
        self.covariance.trace()
    }

    /// Overwrite the pose with an externally known value (forward kinematics).
    pub fn set_pose(&mut self, pose: Pose) {
        if !is_finite_pose(&pose) {
            return;
        }
        let shift_rot = pose.rotation * self.pose.rotation.inverse();
        let shift_trans = pose.translation.vector - self.pose.translation.vector;
        self.window.rebase(&shift_rot, &shift_trans);
        self.pose = pose;
    }

    /// Set the twist directly (simulation and tests).
    pub fn set_twist(&mut self, angular: Vector3<f64>, linear: Vector3<f64>) {
        self.angular_velocity = angular;
        self.linear_velocity = linear;
    }

    /// Constant-twist prediction over `dt` seconds.
    ///
    /// `process` holds variances per second. `dt <= 0` (or non-finite) is a
    /// no-op.
    pub fn predict(&mut self, dt: f64, process: &StateMat13) {
        if !dt.is_finite() || dt <= 0.0 {
            return;
        }

        let q_old = self.pose.rotation;
        let step_rot = UnitQuaternion::from_scaled_axis(self.angular_velocity * dt);
        let step_trans = self.linear_velocity * dt;

        // Quaternion integration: q_new = exp(w dt) * q
        let mut rotation = step_rot * q_old;
        rotation.renormalize();
        let translation = self.pose.translation.vector + step_trans;

        // ===== Transition Jacobian =====
        // dq/dw from q_dot = 0.5 [0, w] * q, coords (x, y, z, w)
        let c = q_old.coords;
        let v = Vector3::new(c[0], c[1], c[2]);
        let half_dt = 0.5 * dt;
        let mut f = StateMat13::identity();
        let dq_dw = (Matrix3::identity() * c[3] - skew(&v)) * half_dt;
        f.fixed_view_mut::<3, 3>(IDX_QUAT, IDX_OMEGA).copy_from(&dq_dw);
        f.fixed_view_mut::<1, 3>(IDX_QUAT + 3, IDX_OMEGA)
            .copy_from(&(v.transpose() * -half_dt));
        // Translation depends on linear velocity
        f.fixed_view_mut::<3, 3>(IDX_TRANS, IDX_VEL).fill_diagonal(dt);

        let mut covariance = f * self.covariance * f.transpose() + process * dt;
        symmetrize(&mut covariance);

        if !covariance.iter().all(|x| x.is_finite()) || !translation.iter().all(|x| x.is_finite()) {
            // Keep the prior; non-finite twist is never produced by correct()
            return;
        }

        self.pose = Isometry3::from_parts(Translation3::from(translation), rotation);
        self.covariance = covariance;
        self.window.rebase(&step_rot, &step_trans);
    }

    /// Fuse a single pose observation (expressed in this entity's reference
    /// frame) with a windowed-delta update.
    pub fn correct1(&mut self, observed: &Pose, noise: &PoseNoise7) -> CorrectionStatus {
        if !is_finite_pose(observed) {
            return CorrectionStatus::NonFinite;
        }

        let q = self.pose.rotation;
        let delta_theta = (observed.rotation * q.inverse()).scaled_axis();
        let delta_x = observed.translation.vector - self.pose.translation.vector;

        let mut window = self.window.clone();
        window.push(delta_theta, delta_x);
        let Some((mean_theta, mean_x)) = window.mean() else {
            return CorrectionStatus::NoObservations;
        };

        self.apply_mean_innovation(window, mean_theta, mean_x, noise)
    }

    /// Fuse several simultaneous correspondences at once.
    ///
    /// Every pair implies a pose for this entity; the implied poses are
    /// averaged (weights from the correspondences, orientations by a
    /// sign-aligned quaternion mean) and the average goes through the same
    /// windowed update as [`correct1`](Self::correct1). An empty set is a
    /// no-op.
    pub fn correct2(
        &mut self,
        correspondences: &[PoseCorrespondence],
        noise: &PoseNoise7,
    ) -> CorrectionStatus {
        if correspondences.is_empty() {
            return CorrectionStatus::NoObservations;
        }

        let implied: Vec<(Pose, f64)> = correspondences
            .iter()
            .map(|c| (c.implied_pose(), c.weight))
            .collect();

        // Hemisphere reference from the set itself: implied poses near a
        // half-turn from the estimate would otherwise be split by sign
        let anchor = implied
            .iter()
            .filter(|(_, w)| w.is_finite())
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, _)| p.rotation)
            .unwrap_or(self.pose.rotation);

        match weighted_mean_pose(&implied, &anchor) {
            Ok(mean) => self.correct1(&mean, noise),
            Err(status) => status,
        }
    }

    fn apply_mean_innovation(
        &mut self,
        mut window: InnovationWindow,
        mean_theta: Vector3<f64>,
        mean_x: Vector3<f64>,
        noise: &PoseNoise7,
    ) -> CorrectionStatus {
        let q = self.pose.rotation;

        // Smoothed observation in quaternion space, same hemisphere as q
        let smoothed = UnitQuaternion::from_scaled_axis(mean_theta) * q;
        let mut zq = smoothed.coords;
        if zq.dot(&q.coords) < 0.0 {
            zq = -zq;
        }

        let mut y = PoseVec7::zeros();
        y.fixed_rows_mut::<4>(IDX_QUAT).copy_from(&(zq - q.coords));
        y.fixed_rows_mut::<3>(IDX_TRANS).copy_from(&mean_x);

        // H = [I7 | 0], so P Hᵀ is the first seven columns of P
        let p = &self.covariance;
        let p_ht: KalmanGainPose = p.fixed_columns::<POSE_DIM>(0).into_owned();
        let s: PoseNoise7 = p.fixed_view::<POSE_DIM, POSE_DIM>(0, 0).into_owned() + noise;
        if !s.iter().all(|x| x.is_finite()) {
            return CorrectionStatus::NonFinite;
        }
        let Some(s_inv) = s.try_inverse() else {
            return CorrectionStatus::Singular;
        };
        let k: KalmanGainPose = p_ht * s_inv;
        let dx = k * y;

        let mut h = JacobianPose::zeros();
        h.fixed_view_mut::<POSE_DIM, POSE_DIM>(0, 0).fill_diagonal(1.0);

        // Joseph form
        let i_kh = StateMat13::identity() - k * h;
        let mut covariance = i_kh * p * i_kh.transpose() + k * noise * k.transpose();
        symmetrize(&mut covariance);

        let raw = Quaternion::from_vector(q.coords + dx.fixed_rows::<4>(IDX_QUAT));
        let raw_norm = raw.norm();
        if !raw_norm.is_finite() {
            return CorrectionStatus::NonFinite;
        }
        if raw_norm < 1e-9 {
            return CorrectionStatus::Degenerate;
        }
        let rotation = UnitQuaternion::from_quaternion(raw);
        let translation = self.pose.translation.vector + dx.fixed_rows::<3>(IDX_TRANS);
        let angular_velocity = self.angular_velocity + dx.fixed_rows::<3>(IDX_OMEGA);
        let linear_velocity = self.linear_velocity + dx.fixed_rows::<3>(IDX_VEL);

        let finite = translation.iter().all(|x| x.is_finite())
            && angular_velocity.iter().all(|x| x.is_finite())
            && linear_velocity.iter().all(|x| x.is_finite())
            && covariance.iter().all(|x| x.is_finite());
        if !finite {
            return CorrectionStatus::NonFinite;
        }

        let shift_rot = rotation * q.inverse();
        let shift_trans = translation - self.pose.translation.vector;
        window.rebase(&shift_rot, &shift_trans);

        self.pose = Isometry3::from_parts(Translation3::from(translation), rotation);
        self.angular_velocity = angular_velocity;
        self.linear_velocity = linear_velocity;
        self.covariance = covariance;
        self.window = window;
        CorrectionStatus::Applied
    }
}

/// Weighted mean of rigid poses.
///
/// Translations are averaged linearly. Orientations are averaged as
/// quaternion 4-vectors after flipping each into the hemisphere of `anchor`,
/// then normalized (chordal mean). `anchor` should be close to every input. Non-positive weights contribute nothing.
pub fn weighted_mean_pose(
    poses: &[(Pose, f64)],
    anchor: &UnitQuaternion<f64>,
) -> Result<Pose, CorrectionStatus> {
    let mut total = 0.0;
    let mut sum_t = Vector3::zeros();
    let mut sum_q = nalgebra::Vector4::zeros();

    for (pose, weight) in poses {
        if !weight.is_finite() || !is_finite_pose(pose) {
            return Err(CorrectionStatus::NonFinite);
        }
        if *weight <= 0.0 {
            continue;
        }
        let mut qc = pose.rotation.coords;
        if qc.dot(&anchor.coords) < 0.0 {
            qc = -qc;
        }
        sum_q += qc * *weight;
        sum_t += pose.translation.vector * *weight;
        total += weight;
    }

    if total <= 0.0 {
        return Err(CorrectionStatus::Degenerate);
    }

    let q = Quaternion::from_vector(sum_q / total);
    if q.norm() < 1e-9 {
        return Err(CorrectionStatus::Degenerate);
    }
    Ok(Isometry3::from_parts(
        Translation3::from(sum_t / total),
        UnitQuaternion::from_quaternion(q),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pose(rot: Vector3<f64>, t: Vector3<f64>) -> Pose {
        Isometry3::from_parts(Translation3::from(t), UnitQuaternion::from_scaled_axis(rot))
    }

    fn noise() -> PoseNoise7 {
        MeasurementNoise { orientation: 1e-3, translation: 1e-3 }.matrix()
    }

    #[test]
    fn test_predict_zero_dt_is_noop() {
        let mut state = PoseTwistState::new(3, 1.0);
        state.set_twist(Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.0, 0.0, 0.0));
        state.correct1(&pose(Vector3::new(0.2, 0.0, 0.0), Vector3::new(1.0, 2.0, 3.0)), &noise());
        let before = state.clone();
        state.predict(0.0, &ProcessNoise::default().matrix());
        assert_eq!(state, before);
    }

    #[test]
    fn test_predict_integrates_twist() {
        let mut state = PoseTwistState::new(1, 1.0);
        state.set_twist(Vector3::new(0.0, 0.0, 0.5), Vector3::new(1.0, -2.0, 0.0));
        state.predict(2.0, &ProcessNoise::default().matrix());

        assert_abs_diff_eq!(state.pose().translation.vector, Vector3::new(2.0, -4.0, 0.0), epsilon = 1e-12);
        assert_abs_diff_eq!(state.pose().rotation.angle(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(state.pose().rotation.coords.norm(), 1.0, epsilon = QUAT_NORM_TOL);
    }

    #[test]
    fn test_predict_grows_uncertainty() {
        let mut state = PoseTwistState::new(1, 0.5);
        let trace_before = state.covariance_trace();
        state.predict(0.1, &ProcessNoise::default().matrix());
        assert!(state.covariance_trace() > trace_before);
        assert!(asymmetry(state.covariance()) < 1e-12);
    }

    #[test]
    fn test_correct1_moves_toward_observation() {
        let mut state = PoseTwistState::new(1, 1.0);
        let target = pose(Vector3::new(0.0, 0.3, 0.0), Vector3::new(0.5, 0.0, 0.2));
        let status = state.correct1(&target, &noise());
        assert_eq!(status, CorrectionStatus::Applied);

        let err = (state.pose().translation.vector - target.translation.vector).norm();
        assert!(err < 0.01, "translation error {}", err);
        assert!(state.pose().rotation.angle_to(&target.rotation) < 0.01);
        assert_abs_diff_eq!(state.pose().rotation.coords.norm(), 1.0, epsilon = QUAT_NORM_TOL);
        assert!(state.covariance_trace() < 13.0);
    }

    #[test]
    fn test_window_holds_last_k_innovations() {
        let k = 3;
        let mut state = PoseTwistState::new(k, 1.0);
        let observations: Vec<Pose> = (0..5)
            .map(|m| pose(Vector3::zeros(), Vector3::new(m as f64 * 0.1, 0.0, 0.0)))
            .collect();

        for (m, obs) in observations.iter().enumerate() {
            state.correct1(obs, &noise());
            assert_eq!(state.window().len(), (m + 1).min(k));
        }

        // Entries are the last k observations relative to the current estimate
        let x_now = state.pose().translation.vector;
        let entries = state.window().entries();
        assert_eq!(entries.len(), k);
        for (entry, obs) in entries.iter().zip(observations[2..].iter()) {
            assert_abs_diff_eq!(entry.1, obs.translation.vector - x_now, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_window_entry_is_pushed_innovation_rebased() {
        // Prior at the origin, so the pushed innovation is the observation
        let mut state = PoseTwistState::new(2, 1.0);
        let obs = pose(Vector3::zeros(), Vector3::new(0.4, -0.2, 0.1));
        state.correct1(&obs, &noise());

        let moved = state.pose().translation.vector;
        assert!(moved.norm() > 0.0);
        let (_, stored) = state.window().entries()[0];
        assert_abs_diff_eq!(stored + moved, obs.translation.vector, epsilon = 1e-9);
    }

    #[test]
    fn test_covariance_symmetric_after_sequence() {
        let mut state = PoseTwistState::new(4, 1.0);
        let process = ProcessNoise::default().matrix();
        for m in 0..40 {
            let t = m as f64 * 0.05;
            state.predict(0.1, &process);
            state.correct1(
                &pose(Vector3::new(0.1 * t.sin(), 0.2, -0.1), Vector3::new(t, 1.0, t.cos())),
                &noise(),
            );
            assert!(asymmetry(state.covariance()) < 1e-9);
            assert_abs_diff_eq!(state.pose().rotation.coords.norm(), 1.0, epsilon = QUAT_NORM_TOL);
        }
    }

    #[test]
    fn test_singular_gain_keeps_prior() {
        // Zero prior and zero measurement noise: S = 0
        let mut state = PoseTwistState::new(2, 0.0);
        let before = state.clone();
        let status = state.correct1(&pose(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)), &PoseNoise7::zeros());
        assert_eq!(status, CorrectionStatus::Singular);
        assert_eq!(state, before);
    }

    #[test]
    fn test_non_finite_observation_rejected() {
        let mut state = PoseTwistState::new(2, 1.0);
        let before = state.clone();
        let bad = Isometry3::from_parts(
            Translation3::new(f64::NAN, 0.0, 0.0),
            UnitQuaternion::identity(),
        );
        assert_eq!(state.correct1(&bad, &noise()), CorrectionStatus::NonFinite);
        assert_eq!(state, before);
    }

    #[test]
    fn test_correct2_empty_is_bit_identical() {
        let mut state = PoseTwistState::new(3, 1.0);
        state.correct1(&pose(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.3, 0.1, 0.0)), &noise());
        let before = state.clone();
        assert_eq!(state.correct2(&[], &noise()), CorrectionStatus::NoObservations);
        assert_eq!(state, before);
    }

    #[test]
    fn test_correct2_zero_weight_is_degenerate() {
        let mut state = PoseTwistState::new(3, 1.0);
        let before = state.clone();
        let pair = PoseCorrespondence {
            reference: pose(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)),
            observed: Pose::identity(),
            weight: 0.0,
        };
        assert_eq!(state.correct2(&[pair], &noise()), CorrectionStatus::Degenerate);
        assert_eq!(state, before);
    }

    #[test]
    fn test_correct2_uses_implied_camera_pose() {
        let camera = pose(Vector3::new(0.0, 0.0, 0.4), Vector3::new(1.0, 0.5, 1.5));
        let markers = [
            pose(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.3, 0.0, 0.2)),
            pose(Vector3::new(0.0, -0.2, 0.0), Vector3::new(0.1, 0.4, 0.6)),
        ];
        let pairs: Vec<PoseCorrespondence> = markers
            .iter()
            .map(|m| PoseCorrespondence { reference: *m, observed: camera.inverse() * m, weight: 1.0 })
            .collect();

        let mut state = PoseTwistState::new(2, 1.0);
        assert!(state.correct2(&pairs, &noise()).is_applied());
        let err = (state.pose().translation.vector - camera.translation.vector).norm();
        assert!(err < 0.01, "translation error {}", err);
        assert!(state.pose().rotation.angle_to(&camera.rotation) < 0.01);
    }

    #[test]
    fn test_weighted_mean_pose() {
        let a = pose(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.0));
        let b = pose(Vector3::zeros(), Vector3::new(4.0, 0.0, 0.0));
        let mean = weighted_mean_pose(&[(a, 3.0), (b, 1.0)], &UnitQuaternion::identity()).unwrap();
        assert_abs_diff_eq!(mean.translation.vector.x, 1.0, epsilon = 1e-12);

        // Sign-flipped copies of the same orientation average to it
        let r = UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.5, 0.0));
        let flipped = UnitQuaternion::new_unchecked(-r.into_inner());
        let mean = weighted_mean_pose(
            &[
                (Isometry3::from_parts(Translation3::identity(), r), 1.0),
                (Isometry3::from_parts(Translation3::identity(), flipped), 1.0),
            ],
            &UnitQuaternion::identity(),
        )
        .unwrap();
        assert!(mean.rotation.angle_to(&r) < 1e-9);
    }
}

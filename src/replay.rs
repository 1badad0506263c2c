//! Offline replay of a recorded session through the fusion cycle
//!
//! dt comes from the logged timestamps (clamped like the live loop), so a
//! replay is deterministic for a given log and configuration.

use serde::{Deserialize, Serialize};

use crate::capture::SessionLog;
use crate::config::RegistrationConfig;
use crate::engine::{clamp_dt, RunSummary};
use crate::error::RegResult;
use crate::fusion::{FusionContext, FusionCycle};
use crate::kinematics::SerialChain;
use crate::types::linalg::{pose_from_qutr, pose_to_qutr, Pose, QuTr};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PoseError {
    pub translation_m: f64,
    pub rotation_rad: f64,
}

impl PoseError {
    pub fn between(estimate: &Pose, truth: &Pose) -> Self {
        Self {
            translation_m: (estimate.translation.vector - truth.translation.vector).norm(),
            rotation_rad: estimate.rotation.angle_to(&truth.rotation),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplayReport {
    pub summary: RunSummary,
    pub duration_s: f64,
    pub cameras: Vec<QuTr>,
    pub fixed_markers: Vec<QuTr>,
    /// Present when the log embeds ground truth
    pub camera_errors: Option<Vec<PoseError>>,
    pub fixed_marker_errors: Option<Vec<PoseError>>,
}

fn errors(estimates: &[Pose], truth: &[QuTr]) -> Option<Vec<PoseError>> {
    if estimates.len() != truth.len() {
        return None;
    }
    estimates
        .iter()
        .zip(truth)
        .map(|(est, t)| pose_from_qutr(t).map(|t| PoseError::between(est, &t)))
        .collect()
}

/// Run `log` through a fresh fusion context. `config` overrides the
/// configuration recorded in the log when given.
pub fn replay_session(log: &SessionLog, config: Option<&RegistrationConfig>) -> RegResult<(ReplayReport, FusionContext)> {
    let config = config.unwrap_or(&log.config);
    let chain = SerialChain::from_config(&config.kinematics)?;
    let mut cycle = FusionCycle::new(config, Box::new(chain))?;
    let mut ctx = FusionContext::from_config(config);

    let mut summary = RunSummary::default();
    let mut last_stamp: Option<i64> = None;
    for sample in &log.samples {
        let dt = match last_stamp {
            Some(prev) => clamp_dt(sample.stamp_ns.saturating_sub(prev) as f64 * 1e-9, config.timing.max_dt),
            None => 0.0,
        };
        last_stamp = Some(sample.stamp_ns);

        let report = cycle.tick(&mut ctx, dt, sample.config.as_ref(), &sample.batches)?;
        for event in &report.events {
            event.log();
        }
        summary.absorb(&report);
        summary.published += 1;
    }

    let cameras: Vec<Pose> = ctx.cameras().iter().map(|s| *s.pose()).collect();
    let fixed_markers: Vec<Pose> = ctx.fixed_markers().iter().map(|s| *s.pose()).collect();
    let report = ReplayReport {
        summary,
        duration_s: log.duration_s(),
        camera_errors: log.truth.as_ref().and_then(|t| errors(&cameras, &t.cameras)),
        fixed_marker_errors: log.truth.as_ref().and_then(|t| errors(&fixed_markers, &t.fixed_markers)),
        cameras: cameras.iter().map(pose_to_qutr).collect(),
        fixed_markers: fixed_markers.iter().map(pose_to_qutr).collect(),
    };
    Ok((report, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimConfig;

    #[test]
    fn test_replay_reports_truth_errors() {
        let config = RegistrationConfig::default();
        let log = SessionLog::from_simulation(&config, &SimConfig::default(), 90).unwrap();
        let (report, _) = replay_session(&log, None).unwrap();

        assert_eq!(report.summary.ticks, 90);
        assert_eq!(report.cameras.len(), 1);
        let errors = report.camera_errors.unwrap();
        assert!(errors[0].translation_m < 0.1, "camera error {:?}", errors[0]);
        assert!(report.fixed_marker_errors.is_some());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let config = RegistrationConfig::default();
        let log = SessionLog::from_simulation(&config, &SimConfig::default(), 20).unwrap();
        let (a, _) = replay_session(&log, None).unwrap();
        let (b, _) = replay_session(&log, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_override_config_without_truth() {
        let config = RegistrationConfig::default();
        let mut log = SessionLog::from_simulation(&config, &SimConfig::default(), 3).unwrap();
        log.truth = None;
        let tuned = RegistrationConfig { window: 2, ..config };
        let (report, ctx) = replay_session(&log, Some(&tuned)).unwrap();
        assert!(report.camera_errors.is_none());
        assert_eq!(ctx.cameras()[0].window().capacity(), 2);
    }

    #[test]
    fn test_corrupt_stamps_are_clamped() {
        let config = RegistrationConfig::default();
        let mut log = SessionLog::from_simulation(&config, &SimConfig::default(), 3).unwrap();
        log.samples[0].stamp_ns = i64::MIN;
        log.samples[1].stamp_ns = i64::MAX;
        log.samples[2].stamp_ns = i64::MIN;

        let (report, ctx) = replay_session(&log, None).unwrap();
        assert_eq!(report.summary.ticks, 3);
        assert!(ctx.cameras()[0].pose().translation.vector.iter().all(|v| v.is_finite()));
    }
}

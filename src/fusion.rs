// fusion.rs — Pure computation layer for pose registration
//
// Everything in this module is independent of:
//   - channels / transport
//   - clocks and the tokio runtime
//   - file I/O
//
// It takes one tick's worth of inputs (latest config sample, latest batch per
// camera, elapsed time) and produces pose estimates and events out. That keeps
// it testable with synthetic data and replayable from recorded sessions.

use log::{debug, trace, warn};

use crate::config::RegistrationConfig;
use crate::correspondence::{Correspondence, CorrespondenceTable, HandSide};
use crate::error::{RegResult, RegistrationError};
use crate::filters::{CorrectionStatus, PoseCorrespondence, PoseTwistState};
use crate::kinematics::ForwardKinematics;
use crate::types::linalg::{pose_from_qutr, pose_to_qutr, Pose, PoseNoise7, StateMat13};
use crate::types::{ConfigSample, MarkerBatch, PoseEstimateSet};

// ─── Entities ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityId {
    Camera(usize),
    FixedMarker(usize),
    Hand(HandSide),
    HandCorrection(HandSide),
}

/// Every tracked state, owned for the lifetime of the loop.
///
/// Created once at startup, mutated only by [`FusionCycle::tick`], dropped
/// at shutdown.
#[derive(Clone, Debug)]
pub struct FusionContext {
    cameras: Vec<PoseTwistState>,
    fixed_markers: Vec<PoseTwistState>,
    left_hand: PoseTwistState,
    right_hand: PoseTwistState,
    left_correction: PoseTwistState,
    right_correction: PoseTwistState,
    /// Absolute kinematic frame poses from the most recent config sample
    frame_poses: Option<Vec<Pose>>,
}

impl FusionContext {
    pub fn new(n_cameras: usize, n_fixed_markers: usize, window: usize, covariance_scale: f64) -> Self {
        let fresh = || PoseTwistState::new(window, covariance_scale);
        Self {
            cameras: (0..n_cameras).map(|_| fresh()).collect(),
            fixed_markers: (0..n_fixed_markers).map(|_| fresh()).collect(),
            left_hand: fresh(),
            right_hand: fresh(),
            left_correction: fresh(),
            right_correction: fresh(),
            frame_poses: None,
        }
    }

    pub fn from_config(config: &RegistrationConfig) -> Self {
        Self::new(
            config.cameras.len(),
            config.fixed_markers.len(),
            config.window,
            config.initial_covariance,
        )
    }

    pub fn cameras(&self) -> &[PoseTwistState] {
        &self.cameras
    }

    pub fn fixed_markers(&self) -> &[PoseTwistState] {
        &self.fixed_markers
    }

    pub fn frame_poses(&self) -> Option<&[Pose]> {
        self.frame_poses.as_deref()
    }

    pub fn entity(&self, id: EntityId) -> Option<&PoseTwistState> {
        match id {
            EntityId::Camera(i) => self.cameras.get(i),
            EntityId::FixedMarker(k) => self.fixed_markers.get(k),
            EntityId::Hand(HandSide::Left) => Some(&self.left_hand),
            EntityId::Hand(HandSide::Right) => Some(&self.right_hand),
            EntityId::HandCorrection(HandSide::Left) => Some(&self.left_correction),
            EntityId::HandCorrection(HandSide::Right) => Some(&self.right_correction),
        }
    }

    /// Mutable access for seeding states (simulation, tests).
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut PoseTwistState> {
        match id {
            EntityId::Camera(i) => self.cameras.get_mut(i),
            EntityId::FixedMarker(k) => self.fixed_markers.get_mut(k),
            EntityId::Hand(HandSide::Left) => Some(&mut self.left_hand),
            EntityId::Hand(HandSide::Right) => Some(&mut self.right_hand),
            EntityId::HandCorrection(HandSide::Left) => Some(&mut self.left_correction),
            EntityId::HandCorrection(HandSide::Right) => Some(&mut self.right_correction),
        }
    }

    fn hand(&self, side: HandSide) -> &PoseTwistState {
        match side {
            HandSide::Left => &self.left_hand,
            HandSide::Right => &self.right_hand,
        }
    }

    fn hand_correction_mut(&mut self, side: HandSide) -> &mut PoseTwistState {
        match side {
            HandSide::Left => &mut self.left_correction,
            HandSide::Right => &mut self.right_correction,
        }
    }

    /// Everything that is filtered. Hands are excluded: they are overwritten
    /// from forward kinematics, never predicted.
    fn filtered_states_mut(&mut self) -> impl Iterator<Item = &mut PoseTwistState> {
        self.cameras
            .iter_mut()
            .chain(self.fixed_markers.iter_mut())
            .chain([&mut self.left_correction, &mut self.right_correction])
    }

    /// Fixed-layout output: left hand, right hand, cameras, fixed markers.
    pub fn publish(&self, stamp_ns: i64, valid_for_ns: u64) -> PoseEstimateSet {
        let mut poses = Vec::with_capacity(2 + self.cameras.len() + self.fixed_markers.len());
        poses.push(pose_to_qutr(self.left_hand.pose()));
        poses.push(pose_to_qutr(self.right_hand.pose()));
        poses.extend(self.cameras.iter().map(|s| pose_to_qutr(s.pose())));
        poses.extend(self.fixed_markers.iter().map(|s| pose_to_qutr(s.pose())));
        PoseEstimateSet { stamp_ns, valid_for_ns, poses }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    ConfigMissing,
    ConfigNonFinite,
    BatchMissing { camera: usize },
    DetectionGated { camera: usize, marker: u32, weight: f64 },
    DetectionNonFinite { camera: usize, marker: u32 },
    DetectionUnresolved { camera: usize, marker: u32 },
    /// Robot-mounted marker seen before any configuration sample arrived
    KinematicsUnavailable { camera: usize, marker: u32 },
    Corrected { entity: EntityId, observations: usize },
    CorrectionSkipped { entity: EntityId, status: CorrectionStatus },
}

impl FusionEvent {
    pub fn log(&self) {
        match self {
            FusionEvent::DetectionGated { camera, marker, weight } => {
                trace!("camera {}: marker {} gated (weight {:.3})", camera, marker, weight)
            }
            FusionEvent::DetectionUnresolved { camera, marker } => {
                trace!("camera {}: marker {} unresolved", camera, marker)
            }
            FusionEvent::Corrected { entity, observations } => {
                trace!("{:?} corrected from {} observation(s)", entity, observations)
            }
            FusionEvent::CorrectionSkipped { entity, status } => {
                warn!("{:?} correction skipped: {:?}", entity, status)
            }
            other => debug!("{:?}", other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TickReport {
    pub events: Vec<FusionEvent>,
    pub corrections_applied: usize,
    pub corrections_skipped: usize,
}

impl TickReport {
    fn record(&mut self, entity: EntityId, observations: usize, status: CorrectionStatus) {
        match status {
            CorrectionStatus::Applied => {
                self.corrections_applied += 1;
                self.events.push(FusionEvent::Corrected { entity, observations });
            }
            CorrectionStatus::NoObservations => {}
            status => {
                self.corrections_skipped += 1;
                self.events.push(FusionEvent::CorrectionSkipped { entity, status });
            }
        }
    }
}

// ─── Cycle ───────────────────────────────────────────────────────────────────

/// Robot-mounted marker seen this tick and tagged with a hand.
struct HandObservation {
    side: HandSide,
    frame_pose: Pose,
    observed: Pose,
}

pub struct FusionCycle {
    kinematics: Box<dyn ForwardKinematics>,
    table: CorrespondenceTable,
    left_frame: usize,
    right_frame: usize,

    config_channel: String,
    camera_channels: Vec<String>,
    n_fixed_markers: usize,

    weight_threshold: f64,
    kinematic_weight: f64,
    fixed_marker_weight: f64,
    refine_hands: bool,

    process: StateMat13,
    noise: PoseNoise7,

    // Per-tick scratch, cleared at every camera update
    correspondences: Vec<PoseCorrespondence>,
    hand_observations: Vec<HandObservation>,
}

impl FusionCycle {
    pub fn new(config: &RegistrationConfig, kinematics: Box<dyn ForwardKinematics>) -> RegResult<Self> {
        config.validate()?;

        let frame = |name: &str| {
            kinematics.frame_index(name).ok_or_else(|| {
                RegistrationError::invalid(format!("hand frame '{}' is not in the kinematic model", name))
            })
        };
        let left_frame = frame(&config.left_hand_frame)?;
        let right_frame = frame(&config.right_hand_frame)?;

        let table = CorrespondenceTable::build(
            &config.correspondences,
            &config.fixed_markers,
            kinematics.as_ref(),
        )?;

        Ok(Self {
            kinematics,
            table,
            left_frame,
            right_frame,
            config_channel: config.channels.config.clone(),
            camera_channels: config.cameras.iter().map(|c| c.channel.clone()).collect(),
            n_fixed_markers: config.fixed_markers.len(),
            weight_threshold: config.weight_threshold,
            kinematic_weight: config.kinematic_weight,
            fixed_marker_weight: config.fixed_marker_weight,
            refine_hands: config.refine_hands,
            process: config.process_noise.matrix(),
            noise: config.measurement_noise.matrix(),
            correspondences: Vec::new(),
            hand_observations: Vec::new(),
        })
    }

    pub fn table(&self) -> &CorrespondenceTable {
        &self.table
    }

    pub fn kinematics(&self) -> &dyn ForwardKinematics {
        self.kinematics.as_ref()
    }

    /// Payload length a config sample must have.
    pub fn expected_config_len(&self) -> usize {
        2 * self.kinematics.config_len()
    }

    /// Fatal size checks, run before any state is touched.
    pub fn validate_inputs(
        &self,
        config: Option<&ConfigSample>,
        batches: &[Option<MarkerBatch>],
    ) -> RegResult<()> {
        if let Some(sample) = config {
            let expected = self.expected_config_len();
            if sample.values.len() != expected {
                return Err(RegistrationError::FrameSize {
                    channel: self.config_channel.clone(),
                    expected,
                    actual: sample.values.len(),
                });
            }
        }
        if batches.len() != self.camera_channels.len() {
            return Err(RegistrationError::invalid(format!(
                "got {} camera batches for {} cameras",
                batches.len(),
                self.camera_channels.len()
            )));
        }
        for (channel, batch) in self.camera_channels.iter().zip(batches) {
            if let Some(batch) = batch {
                if !batch.is_well_formed() {
                    return Err(RegistrationError::MalformedBatch {
                        channel: channel.clone(),
                        declared: batch.count as usize,
                        actual: batch.detections.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run one predict/correct cycle.
    ///
    /// `batches` holds one slot per configured camera; `None` means nothing
    /// new arrived on that channel this tick.
    pub fn tick(
        &mut self,
        ctx: &mut FusionContext,
        dt: f64,
        config: Option<&ConfigSample>,
        batches: &[Option<MarkerBatch>],
    ) -> RegResult<TickReport> {
        self.validate_inputs(config, batches)?;
        if ctx.cameras.len() != self.camera_channels.len() || ctx.fixed_markers.len() != self.n_fixed_markers {
            return Err(RegistrationError::invalid("fusion context does not match the configuration"));
        }

        let mut report = TickReport { events: Vec::new(), corrections_applied: 0, corrections_skipped: 0 };

        // ── Kinematics ──
        match config {
            Some(sample) => self.update_kinematics(ctx, sample, &mut report),
            None => report.events.push(FusionEvent::ConfigMissing),
        }

        // ── Predict ──
        for state in ctx.filtered_states_mut() {
            state.predict(dt, &self.process);
        }

        // ── Cameras ──
        for (camera, batch) in batches.iter().enumerate() {
            match batch {
                Some(batch) => self.update_camera(ctx, camera, batch, &mut report),
                None => report.events.push(FusionEvent::BatchMissing { camera }),
            }
        }

        Ok(report)
    }

    fn update_kinematics(&self, ctx: &mut FusionContext, sample: &ConfigSample, report: &mut TickReport) {
        let q = &sample.values[..self.kinematics.config_len()];
        if !q.iter().all(|v| v.is_finite()) {
            report.events.push(FusionEvent::ConfigNonFinite);
            return;
        }
        let poses = self.kinematics.absolute_poses(q);
        // Forward kinematics is ground truth for the hands, not filtered
        ctx.left_hand.set_pose(poses[self.left_frame]);
        ctx.right_hand.set_pose(poses[self.right_frame]);
        ctx.frame_poses = Some(poses);
    }

    fn update_camera(
        &mut self,
        ctx: &mut FusionContext,
        camera: usize,
        batch: &MarkerBatch,
        report: &mut TickReport,
    ) {
        self.correspondences.clear();
        self.hand_observations.clear();

        for det in &batch.detections {
            // NaN weights fail this comparison and are gated too
            if !(det.weight >= self.weight_threshold) {
                report.events.push(FusionEvent::DetectionGated { camera, marker: det.id, weight: det.weight });
                continue;
            }
            let Some(observed) = pose_from_qutr(&det.pose) else {
                report.events.push(FusionEvent::DetectionNonFinite { camera, marker: det.id });
                continue;
            };

            match self.table.resolve(det.id) {
                Correspondence::KinematicFrame { frame, hand } => {
                    let Some(frame_pose) = ctx.frame_poses.as_ref().and_then(|p| p.get(frame)).copied() else {
                        report.events.push(FusionEvent::KinematicsUnavailable { camera, marker: det.id });
                        continue;
                    };
                    self.correspondences.push(PoseCorrespondence {
                        reference: frame_pose,
                        observed,
                        weight: det.weight * self.kinematic_weight,
                    });
                    if let Some(side) = hand {
                        self.hand_observations.push(HandObservation { side, frame_pose, observed });
                    }
                }
                Correspondence::FixedMarker(slot) => {
                    // Marker pose in the body frame through the current extrinsic
                    let body_obs = ctx.cameras[camera].pose() * observed;
                    let status = ctx.fixed_markers[slot].correct1(&body_obs, &self.noise);
                    report.record(EntityId::FixedMarker(slot), 1, status);

                    self.correspondences.push(PoseCorrespondence {
                        reference: *ctx.fixed_markers[slot].pose(),
                        observed,
                        weight: det.weight * self.fixed_marker_weight,
                    });
                }
                Correspondence::Unresolved => {
                    report.events.push(FusionEvent::DetectionUnresolved { camera, marker: det.id });
                }
            }
        }

        let status = ctx.cameras[camera].correct2(&self.correspondences, &self.noise);
        report.record(EntityId::Camera(camera), self.correspondences.len(), status);

        if self.refine_hands {
            for obs in &self.hand_observations {
                // Residual of the chain at the hand: bEh⁻¹ · (bEc · cEm) · bEm_fk⁻¹ · bEh
                let hand = *ctx.hand(obs.side).pose();
                let seen = ctx.cameras[camera].pose() * obs.observed;
                let residual = hand.inverse() * seen * obs.frame_pose.inverse() * hand;
                let status = ctx.hand_correction_mut(obs.side).correct1(&residual, &self.noise);
                report.record(EntityId::HandCorrection(obs.side), 1, status);
            }
        }
    }
}

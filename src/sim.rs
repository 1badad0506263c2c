//! Simulated rig
//!
//! Ground-truth scene for running the loop without hardware: camera
//! extrinsics and fixed-marker poses are known, the arms follow sinusoidal
//! joint trajectories, and every camera sees every marker with bounded
//! zero-mean noise. Seeded for reproducible runs.

use std::f64::consts::{PI, TAU};
use std::time::Duration;

use log::{debug, info, warn};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Instant};

use crate::bus::{Publisher, ShutdownFlag};
use crate::config::RegistrationConfig;
use crate::correspondence::CorrespondenceTable;
use crate::error::{RegResult, RegistrationError};
use crate::kinematics::{ForwardKinematics, SerialChain};
use crate::types::linalg::{pose_from_qutr, pose_to_qutr, Pose, QuTr};
use crate::types::{ConfigSample, MarkerBatch, MarkerDetection};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    /// 0 draws the seed from entropy
    pub seed: u64,
    pub rate_hz: f64,
    /// Half-width of the uniform translation noise (m)
    pub translation_noise: f64,
    /// Half-width of the uniform rotation noise per axis (rad)
    pub rotation_noise: f64,
    /// Probability that a single detection is lost
    pub dropout: f64,
    pub detection_weight: f64,
    pub joint_amplitude: f64,
    pub joint_frequency: f64,
    /// Truth extrinsics; missing entries use a default placement
    pub camera_poses: Vec<QuTr>,
    pub fixed_marker_poses: Vec<QuTr>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            rate_hz: 30.0,
            translation_noise: 0.002,
            rotation_noise: 0.002,
            dropout: 0.0,
            detection_weight: 1.0,
            joint_amplitude: 0.4,
            joint_frequency: 0.1,
            camera_poses: Vec::new(),
            fixed_marker_poses: Vec::new(),
        }
    }
}

/// Camera `i` in front of the robot, looking back at it and slightly down.
pub fn default_camera_pose(i: usize) -> Pose {
    let y = 0.4 * i as f64 - 0.2;
    Isometry3::from_parts(
        Translation3::new(1.6, y, 1.1),
        UnitQuaternion::from_euler_angles(0.05 * i as f64, 0.35, PI - 0.2 - 0.15 * i as f64),
    )
}

/// Fixed marker `k` lying on the table between robot and cameras.
pub fn default_fixed_marker_pose(k: usize) -> Pose {
    Isometry3::from_parts(
        Translation3::new(0.9, 0.3 - 0.3 * k as f64, 0.05),
        UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3 * k as f64),
    )
}

// ─── Noise ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct BoundedNoise {
    rng: SmallRng,
}

impl BoundedNoise {
    fn new(seed: u64) -> Self {
        let rng = if seed == 0 {
            SmallRng::from_entropy()
        } else {
            SmallRng::seed_from_u64(seed)
        };
        Self { rng }
    }

    /// Uniform in `[-bound, bound]`
    fn uniform(&mut self, bound: f64) -> f64 {
        if bound <= 0.0 {
            return 0.0;
        }
        Uniform::new_inclusive(-bound, bound).sample(&mut self.rng)
    }

    fn vector(&mut self, bound: f64) -> Vector3<f64> {
        Vector3::new(self.uniform(bound), self.uniform(bound), self.uniform(bound))
    }

    fn chance(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }
}

// ─── Rig ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SimFrame {
    pub config: ConfigSample,
    pub batches: Vec<MarkerBatch>,
}

pub struct SimulatedRig {
    sim: SimConfig,
    chain: SerialChain,
    kinematic_markers: Vec<(u32, usize)>,
    fixed_marker_ids: Vec<u32>,
    cameras: Vec<Pose>,
    fixed_markers: Vec<Pose>,
    noise: BoundedNoise,
    time: f64,
    ticks: u64,
}

impl SimulatedRig {
    pub fn new(config: &RegistrationConfig, sim: &SimConfig) -> RegResult<Self> {
        if !(sim.rate_hz > 0.0) {
            return Err(RegistrationError::invalid("simulation rate must be > 0"));
        }
        let chain = SerialChain::from_config(&config.kinematics)?;
        let table = CorrespondenceTable::build(&config.correspondences, &config.fixed_markers, &chain)?;

        let truth = |given: &[QuTr], n: usize, fallback: fn(usize) -> Pose| -> RegResult<Vec<Pose>> {
            (0..n)
                .map(|i| match given.get(i) {
                    Some(e) => pose_from_qutr(e)
                        .ok_or_else(|| RegistrationError::invalid(format!("invalid truth pose {}", i))),
                    None => Ok(fallback(i)),
                })
                .collect()
        };
        let cameras = truth(&sim.camera_poses, config.cameras.len(), default_camera_pose)?;
        let fixed_markers = truth(&sim.fixed_marker_poses, config.fixed_markers.len(), default_fixed_marker_pose)?;

        Ok(Self {
            sim: sim.clone(),
            kinematic_markers: table.kinematic_markers(),
            fixed_marker_ids: config.fixed_markers.clone(),
            chain,
            cameras,
            fixed_markers,
            noise: BoundedNoise::new(sim.seed),
            time: 0.0,
            ticks: 0,
        })
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sim.rate_hz)
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn truth_camera(&self, i: usize) -> Option<&Pose> {
        self.cameras.get(i)
    }

    pub fn truth_fixed_marker(&self, k: usize) -> Option<&Pose> {
        self.fixed_markers.get(k)
    }

    pub fn truth_cameras(&self) -> &[Pose] {
        &self.cameras
    }

    pub fn truth_fixed_markers(&self) -> &[Pose] {
        &self.fixed_markers
    }

    /// Joint positions and velocities at time `t`.
    pub fn joint_state(&self, t: f64) -> (Vec<f64>, Vec<f64>) {
        let w = TAU * self.sim.joint_frequency;
        let a = self.sim.joint_amplitude;
        (0..self.chain.config_len())
            .map(|j| {
                let phase = w * t + 0.7 * j as f64;
                (a * phase.sin(), a * w * phase.cos())
            })
            .unzip()
    }

    pub fn config_sample(&self, t: f64, stamp_ns: i64) -> ConfigSample {
        let (mut values, velocities) = self.joint_state(t);
        values.extend(velocities);
        ConfigSample { stamp_ns, values }
    }

    fn perturb(&mut self, pose: &Pose) -> Pose {
        let dt = self.noise.vector(self.sim.translation_noise);
        let dr = UnitQuaternion::from_scaled_axis(self.noise.vector(self.sim.rotation_noise));
        Isometry3::from_parts(
            Translation3::from(pose.translation.vector + dt),
            dr * pose.rotation,
        )
    }

    /// What every camera sees at time `t`.
    pub fn batches(&mut self, t: f64, stamp_ns: i64) -> Vec<MarkerBatch> {
        let (q, _) = self.joint_state(t);
        let frames = self.chain.absolute_poses(&q);

        let mut visible: Vec<(u32, Pose)> = self
            .kinematic_markers
            .iter()
            .map(|&(id, frame)| (id, frames[frame]))
            .collect();
        visible.extend(self.fixed_marker_ids.iter().copied().zip(self.fixed_markers.iter().copied()));

        let mut batches = Vec::with_capacity(self.cameras.len());
        for i in 0..self.cameras.len() {
            let camera_inv = self.cameras[i].inverse();
            let mut detections = Vec::with_capacity(visible.len());
            for (id, body) in &visible {
                if self.noise.chance(self.sim.dropout) {
                    continue;
                }
                let seen = self.perturb(&(camera_inv * body));
                detections.push(MarkerDetection {
                    id: *id,
                    weight: self.sim.detection_weight,
                    pose: pose_to_qutr(&seen),
                });
            }
            batches.push(MarkerBatch::new(stamp_ns, detections));
        }
        batches
    }

    /// Advance by one period and return the new inputs.
    pub fn step(&mut self) -> SimFrame {
        self.ticks += 1;
        self.time = self.ticks as f64 / self.sim.rate_hz;
        let stamp_ns = (self.time * 1e9) as i64;
        SimFrame {
            config: self.config_sample(self.time, stamp_ns),
            batches: self.batches(self.time, stamp_ns),
        }
    }
}

/// Producer task: publish simulated inputs at the configured rate until
/// shutdown or `duration`, then drop the publishers.
pub async fn run_simulation(
    mut rig: SimulatedRig,
    config_tx: Publisher<ConfigSample>,
    camera_tx: Vec<Publisher<MarkerBatch>>,
    shutdown: ShutdownFlag,
    duration: Option<Duration>,
) {
    let mut ticker = interval(rig.period());
    let start = Instant::now();
    let mut frames = 0u64;

    info!("Simulation running at {:.1} Hz for {} camera(s)", 1.0 / rig.period().as_secs_f64(), camera_tx.len());

    loop {
        ticker.tick().await;
        if shutdown.is_requested() || duration.is_some_and(|d| start.elapsed() >= d) {
            break;
        }

        let frame = rig.step();
        if let Err(e) = config_tx.put(frame.config) {
            warn!("[sim] {}", e);
            break;
        }
        for (tx, batch) in camera_tx.iter().zip(frame.batches) {
            if let Err(e) = tx.put(batch) {
                warn!("[sim] {}", e);
                break;
            }
        }

        frames += 1;
        if frames % 300 == 0 {
            debug!("[sim] {} frames", frames);
        }
    }

    info!("Simulation stopped after {} frames", frames);
}

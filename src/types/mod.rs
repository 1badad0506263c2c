pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Joint configuration sample as delivered on the config channel.
///
/// Payload layout is `[positions; velocities]`, so a well-formed sample for a
/// chain with `n` joints carries `2 * n` values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfigSample {
    pub stamp_ns: i64,
    pub values: Vec<f64>,
}

/// One marker seen by a camera, pose expressed in the camera frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MarkerDetection {
    pub id: u32,
    pub weight: f64,
    pub pose: QuTr,
}

/// Detections published by one camera for one frame.
///
/// `count` is the size announced in the header; a batch whose body does not
/// match it is malformed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MarkerBatch {
    pub stamp_ns: i64,
    pub count: u32,
    pub detections: Vec<MarkerDetection>,
}

impl MarkerBatch {
    pub fn new(stamp_ns: i64, detections: Vec<MarkerDetection>) -> Self {
        Self { stamp_ns, count: detections.len() as u32, detections }
    }

    pub fn is_well_formed(&self) -> bool {
        self.count as usize == self.detections.len()
    }
}

/// Fused pose set published once per tick.
///
/// Layout: left hand, right hand, one per camera, one per fixed marker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PoseEstimateSet {
    pub stamp_ns: i64,
    pub valid_for_ns: u64,
    pub poses: Vec<QuTr>,
}

impl PoseEstimateSet {
    pub fn left_hand(&self) -> Option<&QuTr> {
        self.poses.first()
    }

    pub fn right_hand(&self) -> Option<&QuTr> {
        self.poses.get(1)
    }

    pub fn camera(&self, i: usize) -> Option<&QuTr> {
        self.poses.get(2 + i)
    }

    pub fn fixed_marker(&self, n_cameras: usize, k: usize) -> Option<&QuTr> {
        self.poses.get(2 + n_cameras + k)
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

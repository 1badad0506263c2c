//! Registration configuration
//!
//! Loaded from JSON. `Default` describes the dual-arm demo rig used by the
//! simulator: one camera, one fixed marker, two markers per wrist.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::correspondence::{CorrespondenceEntry, HandSide};
use crate::error::{RegResult, RegistrationError};
use crate::filters::{MeasurementNoise, ProcessNoise};
use crate::kinematics::KinematicModelConfig;

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub name: String,
    /// Channel carrying this camera's marker batches
    pub channel: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelNames {
    pub config: String,
    pub output: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self { config: "pir-config".into(), output: "pir-reg2".into() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Max wait per input channel per tick
    pub receive_timeout_ms: u64,
    /// Upper clamp on the measured tick interval
    pub max_dt: f64,
    /// Validity annotation on every published pose set
    pub output_valid_ns: u64,
    /// Channel considered silent after this long without a frame
    pub silence_threshold_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 100,
            max_dt: 1.0,
            output_valid_ns: 200_000_000,
            silence_threshold_ms: 2_000,
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistrationConfig {
    // ── Filter ──
    pub window: usize,
    pub weight_threshold: f64,
    pub initial_covariance: f64,
    pub process_noise: ProcessNoise,
    pub measurement_noise: MeasurementNoise,

    // ── Batch weighting of the two correspondence sources ──
    pub kinematic_weight: f64,
    pub fixed_marker_weight: f64,

    // ── Hand correction entities ──
    pub refine_hands: bool,

    // ── Wiring ──
    pub cameras: Vec<CameraConfig>,
    pub fixed_markers: Vec<u32>,
    pub correspondences: Vec<CorrespondenceEntry>,
    pub kinematics: KinematicModelConfig,
    pub left_hand_frame: String,
    pub right_hand_frame: String,

    pub channels: ChannelNames,
    pub timing: TimingConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        let marker = |marker: u32, frame: &str, hand: HandSide| CorrespondenceEntry {
            marker,
            frame: frame.to_string(),
            hand: Some(hand),
        };
        Self {
            window: 4,
            weight_threshold: 0.5,
            initial_covariance: 1.0,
            process_noise: ProcessNoise::default(),
            measurement_noise: MeasurementNoise::default(),
            kinematic_weight: 1.0,
            fixed_marker_weight: 1.0,
            refine_hands: true,
            cameras: vec![CameraConfig { name: "cam0".into(), channel: "pir-marker".into() }],
            fixed_markers: vec![20],
            correspondences: vec![
                marker(2, "left_marker_a", HandSide::Left),
                marker(1, "left_marker_b", HandSide::Left),
                marker(8, "right_marker_a", HandSide::Right),
                marker(3, "right_marker_b", HandSide::Right),
            ],
            kinematics: KinematicModelConfig::dual_arm_demo(),
            left_hand_frame: "left_wrist".into(),
            right_hand_frame: "right_wrist".into(),
            channels: ChannelNames::default(),
            timing: TimingConfig::default(),
        }
    }
}

fn non_negative(name: &str, v: f64) -> RegResult<()> {
    if !v.is_finite() || v < 0.0 {
        return Err(RegistrationError::invalid(format!("{} must be a finite value >= 0, got {}", name, v)));
    }
    Ok(())
}

fn positive(name: &str, v: f64) -> RegResult<()> {
    if !v.is_finite() || v <= 0.0 {
        return Err(RegistrationError::invalid(format!("{} must be a finite value > 0, got {}", name, v)));
    }
    Ok(())
}

impl RegistrationConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> RegResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: RegistrationConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> RegResult<()> {
        fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Parameter checks that do not need the kinematic model built.
    ///
    /// Frame names and marker uniqueness are checked when the correspondence
    /// table is built.
    pub fn validate(&self) -> RegResult<()> {
        if self.window == 0 {
            return Err(RegistrationError::invalid("Must have positive sample count (window > 0)"));
        }
        non_negative("weight_threshold", self.weight_threshold)?;
        positive("initial_covariance", self.initial_covariance)?;

        let p = &self.process_noise;
        non_negative("process_noise.orientation", p.orientation)?;
        non_negative("process_noise.translation", p.translation)?;
        non_negative("process_noise.angular_velocity", p.angular_velocity)?;
        non_negative("process_noise.linear_velocity", p.linear_velocity)?;

        positive("measurement_noise.orientation", self.measurement_noise.orientation)?;
        positive("measurement_noise.translation", self.measurement_noise.translation)?;

        non_negative("kinematic_weight", self.kinematic_weight)?;
        non_negative("fixed_marker_weight", self.fixed_marker_weight)?;

        for (i, cam) in self.cameras.iter().enumerate() {
            if cam.channel.is_empty() {
                return Err(RegistrationError::invalid(format!("camera {} has no channel", i)));
            }
            if self.cameras[..i].iter().any(|c| c.channel == cam.channel) {
                return Err(RegistrationError::invalid(format!(
                    "channel '{}' is used by more than one camera",
                    cam.channel
                )));
            }
        }

        positive("timing.max_dt", self.timing.max_dt)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        RegistrationConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = RegistrationConfig { window: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(RegistrationError::InvalidParameter(_))));
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let config = RegistrationConfig { weight_threshold: -1.0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_camera_channel_rejected() {
        let mut config = RegistrationConfig::default();
        config.cameras.push(config.cameras[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: RegistrationConfig =
            serde_json::from_str(r#"{ "window": 7, "fixed_markers": [30, 31] }"#).unwrap();
        assert_eq!(config.window, 7);
        assert_eq!(config.fixed_markers, vec![30, 31]);
        assert_eq!(config.left_hand_frame, "left_wrist");
        config.validate().unwrap();
    }
}

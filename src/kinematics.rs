//! Forward kinematics
//!
//! The fusion core only needs absolute (body-frame) poses of named frames for
//! a joint configuration. [`ForwardKinematics`] is that seam; [`SerialChain`]
//! is a data-driven tree of fixed offsets and single-axis joints that covers
//! the usual dual-arm rigs.

use std::collections::HashMap;

use nalgebra::{Isometry3, Translation3, Unit, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{RegResult, RegistrationError};
use crate::types::linalg::{pose_from_qutr, Pose, QuTr};

pub trait ForwardKinematics: Send {
    /// Number of joint positions consumed by [`absolute_poses`](Self::absolute_poses).
    fn config_len(&self) -> usize;

    fn frame_count(&self) -> usize;

    fn frame_index(&self, name: &str) -> Option<usize>;

    /// Body-frame pose of every frame, indexed like the model.
    fn absolute_poses(&self, q: &[f64]) -> Vec<Pose>;
}

// ─── Model description ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JointKind {
    Revolute,
    Prismatic,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JointSpec {
    /// Index into the joint position vector
    pub index: usize,
    pub axis: [f64; 3],
    pub kind: JointKind,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FrameSpec {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// Fixed transform from the parent, `[qx, qy, qz, qw, x, y, z]`
    pub offset: QuTr,
    #[serde(default)]
    pub joint: Option<JointSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KinematicModelConfig {
    pub config_len: usize,
    pub frames: Vec<FrameSpec>,
}

fn fixed(name: &str, parent: Option<&str>, t: [f64; 3]) -> FrameSpec {
    FrameSpec {
        name: name.to_string(),
        parent: parent.map(str::to_string),
        offset: [0.0, 0.0, 0.0, 1.0, t[0], t[1], t[2]],
        joint: None,
    }
}

fn revolute(name: &str, parent: &str, t: [f64; 3], index: usize, axis: [f64; 3]) -> FrameSpec {
    FrameSpec {
        joint: Some(JointSpec { index, axis, kind: JointKind::Revolute }),
        ..fixed(name, Some(parent), t)
    }
}

impl KinematicModelConfig {
    /// Two 4-joint arms on a fixed torso, each wrist carrying two markers.
    pub fn dual_arm_demo() -> Self {
        let mut frames = vec![fixed("torso", None, [0.0, 0.0, 0.0])];
        for (side, y, base) in [("left", 0.25, 0usize), ("right", -0.25, 4usize)] {
            let f = |s: &str| format!("{}_{}", side, s);
            frames.push(revolute(&f("shoulder"), "torso", [0.0, y, 0.5], base, [0.0, 0.0, 1.0]));
            frames.push(revolute(&f("upper_arm"), &f("shoulder"), [0.0, 0.0, 0.1], base + 1, [0.0, 1.0, 0.0]));
            frames.push(revolute(&f("forearm"), &f("upper_arm"), [0.3, 0.0, 0.0], base + 2, [0.0, 1.0, 0.0]));
            frames.push(revolute(&f("wrist"), &f("forearm"), [0.25, 0.0, 0.0], base + 3, [1.0, 0.0, 0.0]));
            frames.push(fixed(&f("marker_a"), Some(&f("wrist")), [0.05, 0.03, 0.0]));
            frames.push(fixed(&f("marker_b"), Some(&f("wrist")), [0.05, -0.03, 0.02]));
        }
        Self { config_len: 8, frames }
    }
}

// ─── Serial chain ────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct ChainFrame {
    parent: Option<usize>,
    offset: Pose,
    joint: Option<(usize, Unit<Vector3<f64>>, JointKind)>,
}

#[derive(Clone, Debug)]
pub struct SerialChain {
    frames: Vec<ChainFrame>,
    names: HashMap<String, usize>,
    config_len: usize,
}

impl SerialChain {
    /// Build and validate a chain. Parents must be listed before children.
    pub fn from_config(config: &KinematicModelConfig) -> RegResult<Self> {
        let mut names = HashMap::new();
        let mut frames = Vec::with_capacity(config.frames.len());

        for (i, spec) in config.frames.iter().enumerate() {
            if names.contains_key(&spec.name) {
                return Err(RegistrationError::invalid(format!("duplicate frame '{}'", spec.name)));
            }
            let parent = match &spec.parent {
                None => None,
                Some(p) => Some(*names.get(p).ok_or_else(|| {
                    RegistrationError::invalid(format!(
                        "frame '{}' references parent '{}' that is not defined before it",
                        spec.name, p
                    ))
                })?),
            };
            let offset = pose_from_qutr(&spec.offset).ok_or_else(|| {
                RegistrationError::invalid(format!("frame '{}' has an invalid offset", spec.name))
            })?;
            let joint = match &spec.joint {
                None => None,
                Some(j) => {
                    if j.index >= config.config_len {
                        return Err(RegistrationError::invalid(format!(
                            "frame '{}' uses joint {} but the configuration has {} joints",
                            spec.name, j.index, config.config_len
                        )));
                    }
                    let axis = Vector3::from(j.axis);
                    if !axis.iter().all(|v| v.is_finite()) || axis.norm() < 1e-9 {
                        return Err(RegistrationError::invalid(format!(
                            "frame '{}' has a degenerate joint axis",
                            spec.name
                        )));
                    }
                    Some((j.index, Unit::new_normalize(axis), j.kind))
                }
            };
            names.insert(spec.name.clone(), i);
            frames.push(ChainFrame { parent, offset, joint });
        }

        Ok(Self { frames, names, config_len: config.config_len })
    }

    /// Pose of each frame relative to its parent.
    pub fn relative_poses(&self, q: &[f64]) -> Vec<Pose> {
        self.frames
            .iter()
            .map(|frame| match frame.joint {
                None => frame.offset,
                Some((index, axis, kind)) => {
                    let value = q.get(index).copied().unwrap_or(0.0);
                    let motion = match kind {
                        JointKind::Revolute => Isometry3::from_parts(
                            Translation3::identity(),
                            UnitQuaternion::from_axis_angle(&axis, value),
                        ),
                        JointKind::Prismatic => Isometry3::from_parts(
                            Translation3::from(axis.into_inner() * value),
                            UnitQuaternion::identity(),
                        ),
                    };
                    frame.offset * motion
                }
            })
            .collect()
    }

    /// Chain relative poses into body-frame poses.
    pub fn compose_absolute(&self, relative: &[Pose]) -> Vec<Pose> {
        let mut absolute: Vec<Pose> = Vec::with_capacity(relative.len());
        for (frame, rel) in self.frames.iter().zip(relative) {
            let abs = match frame.parent {
                Some(p) => absolute[p] * rel,
                None => *rel,
            };
            absolute.push(abs);
        }
        absolute
    }
}

impl ForwardKinematics for SerialChain {
    fn config_len(&self) -> usize {
        self.config_len
    }

    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame_index(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    fn absolute_poses(&self, q: &[f64]) -> Vec<Pose> {
        self.compose_absolute(&self.relative_poses(q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    fn planar_two_link() -> KinematicModelConfig {
        KinematicModelConfig {
            config_len: 2,
            frames: vec![
                revolute("link1", "base", [0.0, 0.0, 0.0], 0, [0.0, 0.0, 1.0]),
                revolute("link2", "link1", [1.0, 0.0, 0.0], 1, [0.0, 0.0, 1.0]),
                fixed("tip", Some("link2"), [1.0, 0.0, 0.0]),
            ],
        }
    }

    fn with_base(mut cfg: KinematicModelConfig) -> KinematicModelConfig {
        cfg.frames.insert(0, fixed("base", None, [0.0, 0.0, 0.0]));
        cfg
    }

    #[test]
    fn test_planar_two_link_tip() {
        let chain = SerialChain::from_config(&with_base(planar_two_link())).unwrap();
        let tip = chain.frame_index("tip").unwrap();

        let poses = chain.absolute_poses(&[0.0, 0.0]);
        assert_abs_diff_eq!(poses[tip].translation.vector, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);

        let poses = chain.absolute_poses(&[FRAC_PI_2, -FRAC_PI_2]);
        assert_abs_diff_eq!(poses[tip].translation.vector, Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
        assert_abs_diff_eq!(poses[tip].rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_prismatic_joint() {
        let cfg = KinematicModelConfig {
            config_len: 1,
            frames: vec![FrameSpec {
                name: "slide".into(),
                parent: None,
                offset: [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
                joint: Some(JointSpec { index: 0, axis: [0.0, 2.0, 0.0], kind: JointKind::Prismatic }),
            }],
        };
        let chain = SerialChain::from_config(&cfg).unwrap();
        let poses = chain.absolute_poses(&[0.5]);
        assert_abs_diff_eq!(poses[0].translation.vector, Vector3::new(0.0, 0.5, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_parent_must_precede_child() {
        // "base" missing: link1 references an undefined parent
        let err = SerialChain::from_config(&planar_two_link()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidParameter(_)));
    }

    #[test]
    fn test_joint_index_out_of_range() {
        let mut cfg = with_base(planar_two_link());
        cfg.config_len = 1;
        assert!(SerialChain::from_config(&cfg).is_err());
    }

    #[test]
    fn test_dual_arm_demo_builds() {
        let chain = SerialChain::from_config(&KinematicModelConfig::dual_arm_demo()).unwrap();
        assert_eq!(chain.config_len(), 8);
        assert!(chain.frame_index("left_wrist").is_some());
        assert!(chain.frame_index("right_marker_b").is_some());

        let poses = chain.absolute_poses(&[0.0; 8]);
        let left = poses[chain.frame_index("left_wrist").unwrap()];
        assert_abs_diff_eq!(left.translation.vector, Vector3::new(0.55, 0.25, 0.6), epsilon = 1e-12);
    }
}

//! Marker id → reference resolution
//!
//! A marker seen by a camera is either rigidly mounted on the robot (its
//! body-frame pose comes from forward kinematics), fixed somewhere in the
//! environment (its pose is itself being estimated), or unknown. The mapping
//! is a loaded table, never learned.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{RegResult, RegistrationError};
use crate::kinematics::ForwardKinematics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandSide {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Correspondence {
    /// Marker mounted on kinematic frame `frame`, optionally on a hand
    KinematicFrame { frame: usize, hand: Option<HandSide> },
    /// Fixed environment marker, slot index into the fixed-marker states
    FixedMarker(usize),
    Unresolved,
}

/// One row of the wiring table as it appears in the configuration file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CorrespondenceEntry {
    pub marker: u32,
    pub frame: String,
    #[serde(default)]
    pub hand: Option<HandSide>,
}

#[derive(Clone, Debug, Default)]
pub struct CorrespondenceTable {
    map: HashMap<u32, Correspondence>,
}

impl CorrespondenceTable {
    /// Build the table, resolving frame names against the kinematic model.
    ///
    /// Fixed-marker slots follow the order of `fixed_markers`. A marker id
    /// may appear only once across both lists.
    pub fn build(
        entries: &[CorrespondenceEntry],
        fixed_markers: &[u32],
        kinematics: &dyn ForwardKinematics,
    ) -> RegResult<Self> {
        let mut table = CorrespondenceTable::default();

        for entry in entries {
            let frame = kinematics.frame_index(&entry.frame).ok_or_else(|| {
                RegistrationError::invalid(format!(
                    "marker {} maps to unknown frame '{}'",
                    entry.marker, entry.frame
                ))
            })?;
            table.insert(entry.marker, Correspondence::KinematicFrame { frame, hand: entry.hand })?;
        }

        for (slot, &marker) in fixed_markers.iter().enumerate() {
            table.insert(marker, Correspondence::FixedMarker(slot))?;
        }

        Ok(table)
    }

    fn insert(&mut self, marker: u32, outcome: Correspondence) -> RegResult<()> {
        if self.map.insert(marker, outcome).is_some() {
            return Err(RegistrationError::invalid(format!(
                "marker {} appears more than once in the correspondence table",
                marker
            )));
        }
        Ok(())
    }

    pub fn resolve(&self, marker: u32) -> Correspondence {
        self.map.get(&marker).copied().unwrap_or(Correspondence::Unresolved)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// `(marker, frame)` pairs for robot-mounted markers, sorted by marker id.
    pub fn kinematic_markers(&self) -> Vec<(u32, usize)> {
        let mut out: Vec<(u32, usize)> = self
            .map
            .iter()
            .filter_map(|(&m, c)| match c {
                Correspondence::KinematicFrame { frame, .. } => Some((m, *frame)),
                _ => None,
            })
            .collect();
        out.sort_unstable();
        out
    }
}

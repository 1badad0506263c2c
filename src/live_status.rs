use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fusion::FusionContext;
use crate::health_monitor::HealthMonitor;
use crate::types::linalg::{pose_to_qutr, QuTr};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChannelStatus {
    pub name: String,
    pub healthy: bool,
    pub frames: u64,
    pub silences: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EntityStatus {
    pub pose: QuTr,
    pub covariance_trace: f64,
    pub window_fill: usize,
}

/// Snapshot written periodically by the loop for external dashboards
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub ticks: u64,
    pub corrections_applied: u64,
    pub corrections_skipped: u64,
    pub channels: Vec<ChannelStatus>,
    pub cameras: Vec<EntityStatus>,
    pub fixed_markers: Vec<EntityStatus>,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            ticks: 0,
            corrections_applied: 0,
            corrections_skipped: 0,
            channels: Vec::new(),
            cameras: Vec::new(),
            fixed_markers: Vec::new(),
        }
    }

    /// Fill entity and channel sections from the running loop.
    pub fn capture(&mut self, ctx: &FusionContext, health: &HealthMonitor) {
        let entity = |s: &crate::filters::PoseTwistState| EntityStatus {
            pose: pose_to_qutr(s.pose()),
            covariance_trace: s.covariance_trace(),
            window_fill: s.window().len(),
        };
        self.cameras = ctx.cameras().iter().map(entity).collect();
        self.fixed_markers = ctx.fixed_markers().iter().map(entity).collect();
        self.channels = health
            .channels()
            .iter()
            .map(|ch| ChannelStatus {
                name: ch.name.clone(),
                healthy: !ch.is_silent(),
                frames: ch.frames(),
                silences: ch.silences(),
            })
            .collect();
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

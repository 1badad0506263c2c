use std::time::{Duration, Instant};

use log::{info, warn};

/// Silence tracking for one input channel
#[derive(Clone, Debug)]
pub struct ChannelHealth {
    pub name: String,
    pub silence_threshold: Duration,
    last_update: Instant,
    frames: u64,
    silent: bool,
    closed: bool,
    silences: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthTransition {
    WentSilent,
    Recovered,
}

impl ChannelHealth {
    pub fn new(name: &str, silence_threshold: Duration) -> Self {
        Self::new_at(name, silence_threshold, Instant::now())
    }

    pub fn new_at(name: &str, silence_threshold: Duration, now: Instant) -> Self {
        ChannelHealth {
            name: name.to_string(),
            silence_threshold,
            last_update: now,
            frames: 0,
            silent: false,
            closed: false,
            silences: 0,
        }
    }

    /// Record a frame arrival. Returns `Recovered` if the channel was silent.
    pub fn update_at(&mut self, now: Instant) -> Option<HealthTransition> {
        self.last_update = now;
        self.frames += 1;
        if self.silent {
            self.silent = false;
            return Some(HealthTransition::Recovered);
        }
        None
    }

    /// Re-evaluate silence. Returns `WentSilent` on the first check past the threshold.
    pub fn check_at(&mut self, now: Instant) -> Option<HealthTransition> {
        if !self.silent && self.time_since_last_update_at(now) > self.silence_threshold {
            self.silent = true;
            self.silences += 1;
            return Some(HealthTransition::WentSilent);
        }
        None
    }

    /// The publisher is gone for good. The channel stays silent from here on.
    pub fn close(&mut self) -> Option<HealthTransition> {
        if self.closed {
            return None;
        }
        self.closed = true;
        if self.silent {
            return None;
        }
        self.silent = true;
        self.silences += 1;
        Some(HealthTransition::WentSilent)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn time_since_last_update_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_update)
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn silences(&self) -> u32 {
        self.silences
    }
}

/// Health of every input channel the loop reads
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    channels: Vec<ChannelHealth>,
}

impl HealthMonitor {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, silence_threshold: Duration) -> Self {
        let now = Instant::now();
        HealthMonitor {
            channels: names
                .into_iter()
                .map(|n| ChannelHealth::new_at(n, silence_threshold, now))
                .collect(),
        }
    }

    pub fn channels(&self) -> &[ChannelHealth] {
        &self.channels
    }

    /// Note a frame on channel `index` and log a recovery.
    pub fn record_frame(&mut self, index: usize, now: Instant) {
        if let Some(ch) = self.channels.get_mut(index) {
            if ch.update_at(now) == Some(HealthTransition::Recovered) {
                info!("[HEALTH] {} recovered after {} frame(s)", ch.name, ch.frames);
            }
        }
    }

    /// Mark channel `index` closed and log it.
    pub fn mark_closed(&mut self, index: usize) {
        if let Some(ch) = self.channels.get_mut(index) {
            if ch.is_closed() {
                return;
            }
            ch.close();
            warn!("[HEALTH] {} CLOSED after {} frame(s)", ch.name, ch.frames);
        }
    }

    /// Check every channel and log the ones that just went silent.
    pub fn check(&mut self, now: Instant) {
        for ch in &mut self.channels {
            if ch.check_at(now) == Some(HealthTransition::WentSilent) {
                warn!(
                    "[HEALTH] {} SILENT for {:.1}s",
                    ch.name,
                    ch.time_since_last_update_at(now).as_secs_f64()
                );
            }
        }
    }

    /// One-line status for periodic logging
    pub fn format_status(&self) -> String {
        let parts: Vec<String> = self
            .channels
            .iter()
            .map(|ch| {
                if ch.closed {
                    format!("{} ✗ ({} frames)", ch.name, ch.frames)
                } else if ch.silent {
                    format!("{} ⚠ ({} frames)", ch.name, ch.frames)
                } else {
                    format!("{} ✓ ({} frames)", ch.name, ch.frames)
                }
            })
            .collect();
        format!("Health: {}", parts.join(" | "))
    }
}

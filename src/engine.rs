//! Registration loop
//!
//! Owns the fusion context for the lifetime of the process: receive the
//! latest inputs, measure elapsed time, run one fusion tick, publish.
//! Runs on a plain thread (the binary hands it to `spawn_blocking`).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::bus::{Publisher, ShutdownFlag, Subscriber};
use crate::config::RegistrationConfig;
use crate::error::{RegResult, RegistrationError};
use crate::fusion::{FusionContext, FusionCycle, FusionEvent, TickReport};
use crate::health_monitor::HealthMonitor;
use crate::kinematics::ForwardKinematics;
use crate::live_status::{current_timestamp, LiveStatus};
use crate::types::{now_ns, ConfigSample, MarkerBatch, PoseEstimateSet};

pub struct EngineChannels {
    pub config: Subscriber<ConfigSample>,
    /// One subscriber per configured camera, in configuration order
    pub cameras: Vec<Subscriber<MarkerBatch>>,
    pub output: Publisher<PoseEstimateSet>,
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Stop after this many ticks
    pub max_ticks: Option<u64>,
    pub status_path: Option<PathBuf>,
    pub status_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { max_ticks: None, status_path: None, status_interval: Duration::from_secs(2) }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub published: u64,
    pub corrections_applied: u64,
    pub corrections_skipped: u64,
    pub gated: u64,
    pub unresolved: u64,
    pub missing_batches: u64,
}

impl RunSummary {
    pub fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.corrections_applied += report.corrections_applied as u64;
        self.corrections_skipped += report.corrections_skipped as u64;
        for event in &report.events {
            match event {
                FusionEvent::DetectionGated { .. } => self.gated += 1,
                FusionEvent::DetectionUnresolved { .. } => self.unresolved += 1,
                FusionEvent::BatchMissing { .. } => self.missing_batches += 1,
                _ => {}
            }
        }
    }
}

/// Measured tick interval made safe for `predict`: non-finite or negative
/// becomes zero, long stalls are capped at `max_dt`.
pub fn clamp_dt(measured: f64, max_dt: f64) -> f64 {
    if !measured.is_finite() || measured < 0.0 {
        return 0.0;
    }
    measured.min(max_dt)
}

/// `Ok(None)` on timeout, `Err(None)` once the channel is closed, fatal
/// errors passed through.
fn receive<T>(sub: &Subscriber<T>, timeout: Duration) -> Result<Option<T>, Option<RegistrationError>> {
    match sub.recv_latest(timeout) {
        Ok(frame) => Ok(frame),
        Err(RegistrationError::ChannelClosed(_)) => Err(None),
        Err(e) => Err(Some(e)),
    }
}

/// Run until shutdown is requested, every input channel has closed, or
/// `max_ticks` is reached. Returns the summary and the final state.
///
/// A closed camera counts as a batch that never arrives again. A closed
/// config channel leaves the last kinematics in place.
pub fn run(
    config: &RegistrationConfig,
    kinematics: Box<dyn ForwardKinematics>,
    channels: EngineChannels,
    shutdown: &ShutdownFlag,
    options: &EngineOptions,
) -> RegResult<(RunSummary, FusionContext)> {
    if channels.cameras.len() != config.cameras.len() {
        return Err(RegistrationError::invalid(format!(
            "{} camera channels wired for {} configured cameras",
            channels.cameras.len(),
            config.cameras.len()
        )));
    }

    let mut cycle = FusionCycle::new(config, kinematics)?;
    let mut ctx = FusionContext::from_config(config);
    info!(
        "Registration loop starting: {} camera(s), {} fixed marker(s), {} correspondences, window {}",
        config.cameras.len(),
        config.fixed_markers.len(),
        cycle.table().len(),
        config.window
    );

    let timeout = Duration::from_millis(config.timing.receive_timeout_ms);
    let names = std::iter::once(channels.config.name()).chain(channels.cameras.iter().map(|c| c.name()));
    let mut health = HealthMonitor::new(names, Duration::from_millis(config.timing.silence_threshold_ms));

    let start = Instant::now();
    let mut last_tick = start;
    let mut last_status = start;
    let mut summary = RunSummary::default();
    let mut batches: Vec<Option<MarkerBatch>> = vec![None; channels.cameras.len()];

    let mut config_open = true;
    let mut cameras_open = vec![true; channels.cameras.len()];

    while !shutdown.is_requested() {
        if options.max_ticks.is_some_and(|max| summary.ticks >= max) {
            debug!("tick limit reached");
            break;
        }

        // ── Receive ──
        let mut received = false;
        let sample = if config_open {
            match receive(&channels.config, timeout) {
                Ok(sample) => sample,
                Err(None) => {
                    config_open = false;
                    health.mark_closed(0);
                    None
                }
                Err(Some(e)) => return Err(e),
            }
        } else {
            None
        };
        if sample.is_some() {
            received = true;
            health.record_frame(0, Instant::now());
        }
        for (i, sub) in channels.cameras.iter().enumerate() {
            batches[i] = None;
            if !cameras_open[i] {
                continue;
            }
            match receive(sub, timeout) {
                Ok(batch) => batches[i] = batch,
                Err(None) => {
                    cameras_open[i] = false;
                    health.mark_closed(i + 1);
                }
                Err(Some(e)) => return Err(e),
            }
            if batches[i].is_some() {
                received = true;
                health.record_frame(i + 1, Instant::now());
            }
        }
        if !received && !config_open && !cameras_open.contains(&true) {
            info!("all inputs closed");
            break;
        }

        // ── Fuse ──
        let now = Instant::now();
        let measured = now.duration_since(last_tick).as_secs_f64();
        let dt = clamp_dt(measured, config.timing.max_dt);
        if dt < measured {
            warn!("tick interval {:.3}s clamped to {:.3}s", measured, dt);
        }
        last_tick = now;

        let report = match cycle.tick(&mut ctx, dt, sample.as_ref(), &batches) {
            Ok(report) => report,
            Err(e) => {
                error!("fatal input error: {}", e);
                return Err(e);
            }
        };
        for event in &report.events {
            event.log();
        }
        summary.absorb(&report);

        // ── Publish ──
        channels.output.put(ctx.publish(now_ns(), config.timing.output_valid_ns))?;
        summary.published += 1;

        health.check(now);
        if now.duration_since(last_status) >= options.status_interval {
            info!(
                "[{} ticks] {} applied, {} skipped | {}",
                summary.ticks,
                summary.corrections_applied,
                summary.corrections_skipped,
                health.format_status()
            );
            if let Some(path) = &options.status_path {
                let mut status = LiveStatus::new();
                status.timestamp = current_timestamp();
                status.uptime_seconds = now.duration_since(start).as_secs();
                status.ticks = summary.ticks;
                status.corrections_applied = summary.corrections_applied;
                status.corrections_skipped = summary.corrections_skipped;
                status.capture(&ctx, &health);
                if let Err(e) = status.save(path) {
                    warn!("could not write status to {}: {}", path.display(), e);
                }
            }
            last_status = now;
        }
    }

    info!(
        "Registration loop stopped after {} ticks ({} corrections applied, {} skipped); releasing {} tracked states",
        summary.ticks,
        summary.corrections_applied,
        summary.corrections_skipped,
        ctx.cameras().len() + ctx.fixed_markers().len() + 4
    );
    Ok((summary, ctx))
}

//! Session capture and correspondence export
//!
//! A session log is the raw input stream of the loop (one entry per tick:
//! the config sample and the batch per camera that arrived) plus the
//! configuration it was recorded with. Logs are JSON, gzip-compressed when
//! the file name ends in `.gz`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::bus::{Publisher, ShutdownFlag};
use crate::config::RegistrationConfig;
use crate::correspondence::{Correspondence, CorrespondenceTable};
use crate::error::{RegResult, RegistrationError};
use crate::kinematics::{ForwardKinematics, SerialChain};
use crate::sim::{SimConfig, SimulatedRig};
use crate::types::linalg::{pose_to_qutr, QuTr};
use crate::types::{ConfigSample, MarkerBatch};

/// Known scene, embedded when the session comes from the simulator
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionTruth {
    pub cameras: Vec<QuTr>,
    pub fixed_markers: Vec<QuTr>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CaptureSample {
    pub stamp_ns: i64,
    pub config: Option<ConfigSample>,
    /// One slot per configured camera
    pub batches: Vec<Option<MarkerBatch>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionLog {
    pub created: String,
    pub config: RegistrationConfig,
    #[serde(default)]
    pub truth: Option<SessionTruth>,
    pub samples: Vec<CaptureSample>,
}

fn is_gz(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

impl SessionLog {
    pub fn new(config: RegistrationConfig) -> Self {
        Self {
            created: Utc::now().to_rfc3339(),
            config,
            truth: None,
            samples: Vec::new(),
        }
    }

    /// Record `ticks` frames from a seeded simulated rig, truth included.
    pub fn from_simulation(config: &RegistrationConfig, sim: &SimConfig, ticks: usize) -> RegResult<Self> {
        let mut rig = SimulatedRig::new(config, sim)?;
        let mut log = SessionLog::new(config.clone());
        log.truth = Some(SessionTruth {
            cameras: rig.truth_cameras().iter().map(pose_to_qutr).collect(),
            fixed_markers: rig.truth_fixed_markers().iter().map(pose_to_qutr).collect(),
        });
        for _ in 0..ticks {
            let frame = rig.step();
            log.samples.push(CaptureSample {
                stamp_ns: frame.config.stamp_ns,
                config: Some(frame.config),
                batches: frame.batches.into_iter().map(Some).collect(),
            });
        }
        Ok(log)
    }

    pub fn duration_s(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(a), Some(b)) => b.stamp_ns.saturating_sub(a.stamp_ns) as f64 * 1e-9,
            _ => 0.0,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> RegResult<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        if is_gz(path) {
            let mut encoder = GzEncoder::new(file, Compression::default());
            serde_json::to_writer(&mut encoder, self)?;
            encoder.finish()?;
        } else {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
        }
        info!("Saved {} samples to {}", self.samples.len(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> RegResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let log: SessionLog = if is_gz(path) {
            serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?
        } else {
            serde_json::from_reader(BufReader::new(file))?
        };
        let cameras = log.config.cameras.len();
        if let Some(bad) = log.samples.iter().position(|s| s.batches.len() != cameras) {
            return Err(RegistrationError::invalid(format!(
                "sample {} has {} camera slots, expected {}",
                bad,
                log.samples[bad].batches.len(),
                cameras
            )));
        }
        Ok(log)
    }
}

/// Producer task: publish a recorded session with its original pacing.
pub async fn run_playback(
    log: SessionLog,
    config_tx: Publisher<ConfigSample>,
    camera_tx: Vec<Publisher<MarkerBatch>>,
    shutdown: ShutdownFlag,
) {
    if camera_tx.len() != log.config.cameras.len() {
        warn!(
            "[playback] session has {} camera(s), publishing to {}",
            log.config.cameras.len(),
            camera_tx.len()
        );
    }
    let total = log.samples.len();
    let mut sent = 0usize;
    let mut last_stamp: Option<i64> = None;

    for sample in log.samples {
        if shutdown.is_requested() {
            break;
        }
        if let Some(prev) = last_stamp {
            let gap = sample.stamp_ns.saturating_sub(prev).max(0) as u64;
            tokio::time::sleep(Duration::from_nanos(gap)).await;
        }
        last_stamp = Some(sample.stamp_ns);

        if let Some(cs) = sample.config {
            if let Err(e) = config_tx.put(cs) {
                warn!("[playback] {}", e);
                break;
            }
        }
        for (tx, batch) in camera_tx.iter().zip(sample.batches) {
            if let Some(batch) = batch {
                if let Err(e) = tx.put(batch) {
                    warn!("[playback] {}", e);
                }
            }
        }
        sent += 1;
    }

    info!("Playback finished: {}/{} samples", sent, total);
}

// ─── Correspondence export ───────────────────────────────────────────────────

/// Row-aligned pose pairs for offline hand-eye calibration
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CorrespondenceExport {
    /// Marker pose in the camera frame, as detected
    pub observed: Vec<QuTr>,
    /// Pose of the frame the marker is mounted on, from forward kinematics
    pub kinematic: Vec<QuTr>,
}

impl CorrespondenceExport {
    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    /// Write `<prefix>_camera.txt` and `<prefix>_kinematics.txt` into `dir`.
    pub fn write(&self, dir: impl AsRef<Path>, prefix: &str) -> RegResult<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let camera = dir.join(format!("{}_camera.txt", prefix));
        let kinematics = dir.join(format!("{}_kinematics.txt", prefix));
        write_matrix(&camera, &self.observed)?;
        write_matrix(&kinematics, &self.kinematic)?;
        Ok((camera, kinematics))
    }
}

/// One pose per line, seven whitespace-separated columns.
pub fn write_matrix(path: &Path, rows: &[QuTr]) -> RegResult<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| format!("{:.9}", v)).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_matrix(path: &Path) -> RegResult<Vec<QuTr>> {
    let text = fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let values: Vec<f64> = line
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| RegistrationError::invalid(format!("{}:{}: {}", path.display(), n + 1, e)))?;
        let row: QuTr = values.try_into().map_err(|v: Vec<f64>| {
            RegistrationError::invalid(format!("{}:{}: expected 7 columns, got {}", path.display(), n + 1, v.len()))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Pair every robot-mounted marker seen by `camera` (above the weight
/// threshold) with its forward-kinematics frame pose. The most recent
/// config sample is carried forward across ticks without one.
pub fn collect_correspondences(log: &SessionLog, camera: usize) -> RegResult<CorrespondenceExport> {
    let config = &log.config;
    if camera >= config.cameras.len() {
        return Err(RegistrationError::invalid(format!(
            "camera {} not in session ({} cameras)",
            camera,
            config.cameras.len()
        )));
    }
    let chain = SerialChain::from_config(&config.kinematics)?;
    let table = CorrespondenceTable::build(&config.correspondences, &config.fixed_markers, &chain)?;
    let expected = 2 * chain.config_len();

    let mut export = CorrespondenceExport::default();
    let mut frames = None;
    for sample in &log.samples {
        if let Some(cs) = &sample.config {
            if cs.values.len() != expected {
                return Err(RegistrationError::FrameSize {
                    channel: config.channels.config.clone(),
                    expected,
                    actual: cs.values.len(),
                });
            }
            frames = Some(chain.absolute_poses(&cs.values[..chain.config_len()]));
        }
        let (Some(frames), Some(Some(batch))) = (&frames, sample.batches.get(camera)) else {
            continue;
        };
        for det in &batch.detections {
            if !(det.weight >= config.weight_threshold) {
                continue;
            }
            if let Correspondence::KinematicFrame { frame, .. } = table.resolve(det.id) {
                export.observed.push(det.pose);
                export.kinematic.push(pose_to_qutr(&frames[frame]));
            }
        }
    }
    Ok(export)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}_{}", std::process::id(), name))
    }

    fn small_log() -> SessionLog {
        SessionLog::from_simulation(&RegistrationConfig::default(), &SimConfig::default(), 5).unwrap()
    }

    #[test]
    fn test_save_load_plain_and_gz() {
        let log = small_log();
        for name in ["session.json", "session.json.gz"] {
            let path = temp_path(name);
            log.save(&path).unwrap();
            let back = SessionLog::load(&path).unwrap();
            assert_eq!(back.samples.len(), 5);
            assert_eq!(back.config, log.config);
            assert!(back.truth.is_some());
            let _ = fs::remove_file(&path);
        }
    }

    #[test]
    fn test_duration_from_stamps() {
        let log = small_log();
        assert!((log.duration_s() - 4.0 / 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_export_counts_kinematic_markers_only() {
        let log = small_log();
        let export = collect_correspondences(&log, 0).unwrap();
        // four robot markers per tick, the fixed marker is left out
        assert_eq!(export.len(), 20);
        assert_eq!(export.kinematic.len(), export.observed.len());
    }

    #[test]
    fn test_export_respects_threshold() {
        let mut log = small_log();
        for sample in &mut log.samples {
            for det in sample.batches[0].iter_mut().flat_map(|b| b.detections.iter_mut()) {
                det.weight = 0.1;
            }
        }
        assert!(collect_correspondences(&log, 0).unwrap().is_empty());
    }

    #[test]
    fn test_matrix_files() {
        let export = collect_correspondences(&small_log(), 0).unwrap();
        let dir = temp_path("export");
        let (camera, kinematics) = export.write(&dir, "cal").unwrap();
        let rows = read_matrix(&camera).unwrap();
        assert_eq!(rows.len(), export.len());
        assert!((rows[0][4] - export.observed[0][4]).abs() < 1e-8);
        assert_eq!(read_matrix(&kinematics).unwrap().len(), export.len());
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_playback_delivers_latest_sample() {
        let log = small_log();
        let last = log.samples.last().unwrap().clone();
        let (config_tx, config_rx) = crate::bus::channel("pir-config", 8);
        let (camera_tx, camera_rx) = crate::bus::channel("pir-marker", 8);
        run_playback(log, config_tx, vec![camera_tx], ShutdownFlag::new()).await;

        assert_eq!(config_rx.try_latest().unwrap(), last.config);
        assert_eq!(camera_rx.try_latest().unwrap(), last.batches[0]);
    }

    #[tokio::test]
    async fn test_playback_tolerates_backwards_stamps() {
        let mut log = small_log();
        log.samples.truncate(2);
        log.samples[0].stamp_ns = i64::MAX;
        log.samples[1].stamp_ns = i64::MIN;
        assert!(log.duration_s() <= 0.0);

        let last = log.samples[1].clone();
        let (config_tx, config_rx) = crate::bus::channel("pir-config", 8);
        let (camera_tx, _camera_rx) = crate::bus::channel("pir-marker", 8);
        run_playback(log, config_tx, vec![camera_tx], ShutdownFlag::new()).await;
        assert_eq!(config_rx.try_latest().unwrap(), last.config);
    }

    #[test]
    fn test_unknown_camera_rejected() {
        assert!(collect_correspondences(&small_log(), 3).is_err());
    }
}

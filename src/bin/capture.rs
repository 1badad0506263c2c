use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use pose_registration_rs::capture::{collect_correspondences, SessionLog};
use pose_registration_rs::sim::SimConfig;
use pose_registration_rs::RegistrationConfig;

#[derive(Parser, Debug)]
#[command(name = "capture")]
#[command(about = "Record registration sessions and export calibration correspondences", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a session from the simulated rig
    Record {
        /// Registration config (JSON); built-in defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of ticks to record
        #[arg(long, default_value = "300")]
        ticks: usize,

        #[arg(long, default_value = "7")]
        seed: u64,

        /// Uniform noise half-width applied to translations (m) and rotations (rad)
        #[arg(long, default_value = "0.002")]
        noise: f64,

        /// Probability that a detection is dropped
        #[arg(long, default_value = "0.0")]
        dropout: f64,

        /// Output directory
        #[arg(long, default_value = "registration_sessions")]
        output_dir: PathBuf,

        /// Write uncompressed JSON instead of .json.gz
        #[arg(long)]
        plain: bool,
    },

    /// Export camera/kinematics pose matrices from a recorded session
    Export {
        /// Session log to read
        #[arg(long)]
        log: PathBuf,

        /// Camera index within the session
        #[arg(long, default_value = "0")]
        camera: usize,

        #[arg(long, default_value = "correspondences")]
        output_dir: PathBuf,

        /// File name prefix for the two matrices
        #[arg(long, default_value = "cal")]
        prefix: String,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Record { config, ticks, seed, noise, dropout, output_dir, plain } => {
            let config = match config {
                Some(path) => RegistrationConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => RegistrationConfig::default(),
            };
            let sim = SimConfig {
                seed,
                translation_noise: noise,
                rotation_noise: noise,
                dropout,
                ..Default::default()
            };
            let log = SessionLog::from_simulation(&config, &sim, ticks)?;

            std::fs::create_dir_all(&output_dir)?;
            let ext = if plain { "json" } else { "json.gz" };
            let path = output_dir.join(format!("session_{}.{}", Utc::now().format("%Y%m%d_%H%M%S"), ext));
            log.save(&path)?;
            println!("Recorded {} samples ({:.1}s) to {}", log.samples.len(), log.duration_s(), path.display());
        }
        Command::Export { log, camera, output_dir, prefix } => {
            let session = SessionLog::load(&log).with_context(|| format!("loading session {}", log.display()))?;
            let export = collect_correspondences(&session, camera)?;
            if export.is_empty() {
                anyhow::bail!("No robot-mounted marker detections above threshold for camera {}", camera);
            }
            let (camera_path, kinematics_path) = export.write(&output_dir, &prefix)?;
            println!("Exported {} correspondences", export.len());
            println!("  {}", camera_path.display());
            println!("  {}", kinematics_path.display());
        }
    }

    Ok(())
}

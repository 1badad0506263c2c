use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};

use pose_registration_rs::bus::{self, ShutdownFlag, Subscriber, DEFAULT_CAPACITY};
use pose_registration_rs::capture::{self, SessionLog};
use pose_registration_rs::engine::{self, EngineChannels, EngineOptions};
use pose_registration_rs::kinematics::SerialChain;
use pose_registration_rs::sim::{self, SimConfig, SimulatedRig};
use pose_registration_rs::types::linalg::pose_to_qutr;
use pose_registration_rs::{PoseEstimateSet, RegistrationConfig, RegistrationError};

#[derive(Parser, Debug)]
#[command(name = "pose_registration")]
#[command(about = "Online camera and fixed-marker registration against robot kinematics", long_about = None)]
struct Args {
    /// Registration config (JSON); built-in dual-arm defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the innovation window length
    #[arg(short = 'k', long)]
    window: Option<usize>,

    /// Drive the loop from the built-in simulated rig
    #[arg(long, conflicts_with = "playback")]
    simulate: bool,

    /// Simulation RNG seed (0 = entropy)
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Publish a recorded session log with its original timing
    #[arg(long)]
    playback: Option<PathBuf>,

    /// Print every published pose set as a JSON line
    #[arg(long)]
    emit_json: bool,

    /// Periodic status snapshot file
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Duration in seconds (0 = continuous)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RegistrationConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RegistrationConfig::default(),
    };
    if let Some(k) = args.window {
        config.window = k;
    }
    config.validate()?;

    if let Some(path) = &args.write_config {
        config.save(path)?;
        println!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    println!("[{}] Pose registration starting", ts_now());
    println!("  Cameras: {}", config.cameras.len());
    println!("  Fixed markers: {:?}", config.fixed_markers);
    println!("  Window: {}", config.window);
    println!("  Duration: {} seconds (0=continuous)", args.duration);

    let shutdown = ShutdownFlag::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping");
                shutdown.request();
            }
        });
    }

    // Channel wiring
    let (config_tx, config_rx) = bus::channel(&config.channels.config, DEFAULT_CAPACITY);
    let (camera_tx, camera_rx): (Vec<_>, Vec<_>) = config
        .cameras
        .iter()
        .map(|c| bus::channel(&c.channel, DEFAULT_CAPACITY))
        .unzip();
    let (output_tx, output_rx) = bus::channel::<PoseEstimateSet>(&config.channels.output, DEFAULT_CAPACITY);

    // Input producer
    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let producer = if args.simulate {
        let sim = SimConfig { seed: args.seed, ..Default::default() };
        let rig = SimulatedRig::new(&config, &sim)?;
        tokio::spawn(sim::run_simulation(rig, config_tx, camera_tx, shutdown.clone(), duration))
    } else if let Some(path) = &args.playback {
        let log = SessionLog::load(path).with_context(|| format!("loading session {}", path.display()))?;
        println!("  Playback: {} samples, {:.1}s", log.samples.len(), log.duration_s());
        tokio::spawn(capture::run_playback(log, config_tx, camera_tx, shutdown.clone()))
    } else {
        bail!("No input source: pass --simulate or --playback <session.json[.gz]>");
    };

    let echo = args.emit_json.then(|| std::thread::spawn(move || echo_output(output_rx)));

    // Registration loop on a blocking thread
    let kinematics = Box::new(SerialChain::from_config(&config.kinematics)?);
    let channels = EngineChannels { config: config_rx, cameras: camera_rx, output: output_tx };
    let options = EngineOptions { status_path: args.status_file.clone(), ..Default::default() };
    let engine_config = config.clone();
    let engine_shutdown = shutdown.clone();
    let result = tokio::task::spawn_blocking(move || {
        engine::run(&engine_config, kinematics, channels, &engine_shutdown, &options)
    })
    .await?;

    shutdown.request();
    if let Err(e) = producer.await {
        warn!("input producer ended abnormally: {}", e);
    }
    if let Some(handle) = echo {
        let _ = handle.join();
    }

    let (summary, ctx) = result?;

    println!("\n=== Final Estimates ===");
    println!("Ticks: {}", summary.ticks);
    println!(
        "Corrections: {} applied, {} skipped ({} gated, {} unresolved)",
        summary.corrections_applied, summary.corrections_skipped, summary.gated, summary.unresolved
    );
    for (cam, state) in config.cameras.iter().zip(ctx.cameras()) {
        println!(
            "Camera {}: {:?} (trace P {:.3e})",
            cam.name,
            pose_to_qutr(state.pose()),
            state.covariance_trace()
        );
    }
    for (id, state) in config.fixed_markers.iter().zip(ctx.fixed_markers()) {
        println!(
            "Fixed marker {}: {:?} (trace P {:.3e})",
            id,
            pose_to_qutr(state.pose()),
            state.covariance_trace()
        );
    }

    Ok(())
}

/// Print pose sets until the loop drops its output publisher.
fn echo_output(output: Subscriber<PoseEstimateSet>) {
    loop {
        match output.recv_latest(Duration::from_millis(200)) {
            Ok(Some(set)) => match serde_json::to_string(&set) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("could not encode output: {}", e),
            },
            Ok(None) => continue,
            Err(RegistrationError::ChannelClosed(_)) => break,
            Err(e) => {
                warn!("output echo stopped: {}", e);
                break;
            }
        }
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

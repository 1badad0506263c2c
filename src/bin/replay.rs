use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::json;

use pose_registration_rs::capture::SessionLog;
use pose_registration_rs::replay::replay_session;
use pose_registration_rs::RegistrationConfig;

#[derive(Parser, Debug)]
struct Args {
    /// Path to session_*.json[.gz] log
    #[arg(long, conflicts_with = "golden_dir")]
    log: Option<PathBuf>,

    /// Directory of golden logs to batch replay (processes session_*.json[.gz])
    #[arg(long)]
    golden_dir: Option<PathBuf>,

    /// Registration config overriding the one recorded in the log
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the innovation window length
    #[arg(short = 'k', long)]
    window: Option<usize>,

    /// Override the detection weight threshold
    #[arg(long)]
    weight_threshold: Option<f64>,
}

fn effective_config(log: &SessionLog, args: &Args) -> anyhow::Result<Option<RegistrationConfig>> {
    let mut config = match args.config.as_ref() {
        Some(path) => RegistrationConfig::load(path)?,
        None if args.window.is_some() || args.weight_threshold.is_some() => log.config.clone(),
        None => return Ok(None),
    };
    if let Some(k) = args.window {
        config.window = k;
    }
    if let Some(t) = args.weight_threshold {
        config.weight_threshold = t;
    }
    config.validate()?;
    Ok(Some(config))
}

fn run_once(path: &Path, args: &Args) -> anyhow::Result<serde_json::Value> {
    let log = SessionLog::load(path)?;
    let config = effective_config(&log, args)?;
    let (report, ctx) = replay_session(&log, config.as_ref())?;

    let traces: Vec<f64> = ctx.cameras().iter().map(|s| s.covariance_trace()).collect();
    let worst_camera = report
        .camera_errors
        .as_ref()
        .map(|errs| errs.iter().map(|e| e.translation_m).fold(0.0_f64, f64::max));

    Ok(json!({
        "log": path.display().to_string(),
        "samples": log.samples.len(),
        "duration_s": report.duration_s,
        "window": config.as_ref().unwrap_or(&log.config).window,
        "summary": report.summary,
        "cameras": report.cameras,
        "fixed_markers": report.fixed_markers,
        "camera_covariance_traces": traces,
        "camera_errors": report.camera_errors,
        "fixed_marker_errors": report.fixed_marker_errors,
        "worst_camera_translation_m": worst_camera,
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let mut results = Vec::new();

    if let Some(dir) = args.golden_dir.as_ref() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with("session_") && (name.ends_with(".json") || name.ends_with(".json.gz")) {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            match run_once(&path, &args) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &args)?);
    } else {
        anyhow::bail!("Provide --log or --golden-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

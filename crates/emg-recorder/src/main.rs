//! EMG recorder: line-oriented control over the acquisition engine

use anyhow::{Context, Result};
use clap::Parser;
use emg_recorder::{Engine, EngineConfig};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
struct RecorderArgs {
    /// JSON configuration file; defaults are used for anything it omits
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Directory recordings are written to
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Device host name or IP address
    #[arg(long = "host")]
    host: Option<String>,

    /// Output the smoothed envelope instead of the rectified signal
    #[arg(short = 'e', long = "envelope")]
    envelope: bool,
}

fn print_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value).context("failed to encode response")?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = RecorderArgs::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(output) = args.output {
        config.recording.output_dir = output;
    }
    if let Some(host) = args.host {
        config.device.host = host;
    }
    if args.envelope {
        config.processing.envelope = true;
    }

    let engine = Engine::new(config).context("invalid engine configuration")?;
    info!(
        device = %engine.config().device.command_endpoint(),
        output = %engine.config().recording.output_dir.display(),
        "Recorder ready; commands: start, stop, preview, status, quit"
    );

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read command")?;
        match line.trim() {
            "" => continue,
            "start" => print_json(&mut stdout, &engine.start_recording())?,
            "stop" => print_json(&mut stdout, &engine.stop_recording())?,
            "preview" => print_json(&mut stdout, &engine.query_live_preview())?,
            "status" => print_json(&mut stdout, &engine.status())?,
            "quit" | "exit" => break,
            other => {
                let reply = serde_json::json!({
                    "success": false,
                    "message": format!("Unknown command: {}", other),
                });
                print_json(&mut stdout, &reply)?;
            }
        }
    }

    engine.shutdown();
    info!("Recorder shut down");
    Ok(())
}

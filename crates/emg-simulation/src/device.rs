//! TCP device simulator speaking the acquisition wire protocol
//!
//! The simulator listens on two localhost ports. The command port accepts
//! `\r\n`-terminated text commands (`RATE <n>`, `RATE?`, `START`, `STOP`).
//! The EMG port streams binary frames while the device is started. It runs
//! on its own tokio runtime thread so blocking clients can drive it.

use crate::emg_simulator::{EmgGenerator, GeneratorConfig};
use anyhow::{Context, Result};
use emg_core::{DeviceProfile, RateProfile, DEFAULT_CHANNEL_COUNT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Behaviour of the simulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Text answered to `RATE?`; decides the frame geometry
    pub rate_reply: String,
    /// Interleaved channels per frame
    pub channel_count: usize,
    /// Write each frame in two halves to exercise reassembly
    pub split_writes: bool,
    /// Close the data connection after this many frames
    pub max_frames: Option<u64>,
    /// Override the real-time frame period
    pub frame_interval: Option<Duration>,
    /// Signal synthesis settings
    pub generator: GeneratorConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            rate_reply: "2000".to_string(),
            channel_count: DEFAULT_CHANNEL_COUNT,
            split_writes: false,
            max_frames: None,
            frame_interval: None,
            generator: GeneratorConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Device that reports the alternate rate
    pub fn alternate_rate() -> Self {
        Self {
            rate_reply: "1925.926".to_string(),
            ..Self::default()
        }
    }

    fn profile(&self) -> Result<DeviceProfile> {
        DeviceProfile::new(self.channel_count, RateProfile::from_reply(&self.rate_reply))
            .map_err(|e| anyhow::anyhow!("invalid simulator profile: {}", e))
    }

    fn frame_period(&self, profile: &DeviceProfile) -> Duration {
        self.frame_interval.unwrap_or_else(|| {
            Duration::from_secs_f64(profile.samples_per_frame() as f64 / profile.sampling_rate())
        })
    }
}

/// A running simulated device
pub struct DeviceSimulator {
    command_addr: SocketAddr,
    emg_addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    frames_sent: Arc<Mutex<u64>>,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSimulator {
    /// Bind both listeners on ephemeral ports and start serving
    pub fn spawn(config: SimulatorConfig) -> Result<Self> {
        let profile = config.profile()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("failed to build simulator runtime")?;

        let (command_listener, emg_listener) = runtime.block_on(async {
            let command = TcpListener::bind("127.0.0.1:0").await?;
            let emg = TcpListener::bind("127.0.0.1:0").await?;
            Ok::<_, std::io::Error>((command, emg))
        }).context("failed to bind simulator listeners")?;

        let command_addr = command_listener.local_addr()?;
        let emg_addr = emg_listener.local_addr()?;

        let commands = Arc::new(Mutex::new(Vec::new()));
        let frames_sent = Arc::new(Mutex::new(0u64));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (streaming_tx, streaming_rx) = watch::channel(false);

        let generator = EmgGenerator::new(config.generator.clone())?;
        let served_commands = Arc::clone(&commands);
        let served_frames = Arc::clone(&frames_sent);
        let rate_reply = config.rate_reply.clone();

        let thread = std::thread::Builder::new()
            .name("device-simulator".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut shutdown = shutdown_rx;
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = serve_commands(command_listener, rate_reply, served_commands, streaming_tx) => {}
                        _ = serve_emg(emg_listener, config, profile, generator, streaming_rx, served_frames) => {}
                    }
                });
                runtime.shutdown_timeout(Duration::from_millis(500));
            })
            .context("failed to spawn simulator thread")?;

        info!(%command_addr, %emg_addr, "Device simulator listening");

        Ok(DeviceSimulator {
            command_addr,
            emg_addr,
            commands,
            frames_sent,
            shutdown_tx,
            thread: Some(thread),
        })
    }

    pub fn command_addr(&self) -> SocketAddr {
        self.command_addr
    }

    pub fn emg_addr(&self) -> SocketAddr {
        self.emg_addr
    }

    /// Commands received so far, without terminators
    pub fn commands(&self) -> Vec<String> {
        match self.commands.lock() {
            Ok(commands) => commands.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Frames written to the data connection so far
    pub fn frames_sent(&self) -> u64 {
        match self.frames_sent.lock() {
            Ok(count) => *count,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Stop serving and join the runtime thread
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Device simulator thread panicked");
            }
        }
    }
}

impl Drop for DeviceSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_commands(
    listener: TcpListener,
    rate_reply: String,
    commands: Arc<Mutex<Vec<String>>>,
    streaming: watch::Sender<bool>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Command accept failed");
                return;
            }
        };
        debug!(%peer, "Command client connected");

        if let Err(e) = handle_command_client(socket, &rate_reply, &commands, &streaming).await {
            debug!(error = %e, "Command client closed");
        }
        // A dropped control connection leaves the device idle
        let _ = streaming.send(false);
    }
}

async fn handle_command_client(
    socket: TcpStream,
    rate_reply: &str,
    commands: &Mutex<Vec<String>>,
    streaming: &watch::Sender<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let command = line.trim().to_string();
        if command.is_empty() {
            continue;
        }
        debug!(%command, "Device received command");

        match commands.lock() {
            Ok(mut list) => list.push(command.clone()),
            Err(poisoned) => poisoned.into_inner().push(command.clone()),
        }

        match command.as_str() {
            "RATE?" => {
                writer.write_all(format!("{}\r\n", rate_reply).as_bytes()).await?;
            }
            "START" => {
                let _ = streaming.send(true);
            }
            "STOP" => {
                let _ = streaming.send(false);
            }
            other if other.starts_with("RATE ") => {}
            other => warn!(command = other, "Unknown device command"),
        }
    }

    Ok(())
}

async fn serve_emg(
    listener: TcpListener,
    config: SimulatorConfig,
    profile: DeviceProfile,
    mut generator: EmgGenerator,
    mut streaming: watch::Receiver<bool>,
    frames_sent: Arc<Mutex<u64>>,
) {
    // The device serves one data client; a new connection replaces the old
    let mut client: Option<TcpStream> = None;
    let mut sent = 0u64;
    let mut ticker = tokio::time::interval(config.frame_period(&profile));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let is_streaming = *streaming.borrow();

        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "EMG accept failed");
                        return;
                    }
                };
                if let Some(mut previous) = client.replace(socket) {
                    debug!(frames = sent, "Replacing EMG client");
                    let _ = previous.shutdown().await;
                }
                debug!(%peer, "EMG client connected");
                sent = 0;
                ticker.reset();
            }
            changed = streaming.changed(), if !is_streaming => {
                if changed.is_err() {
                    return;
                }
            }
            _ = ticker.tick(), if is_streaming && client.is_some() => {
                let Some(socket) = client.as_mut() else { continue };
                let frame = generator.next_frame(&profile);
                if let Err(e) = write_frame(socket, &frame, config.split_writes).await {
                    debug!(error = %e, "EMG client went away");
                    client = None;
                    continue;
                }

                sent += 1;
                match frames_sent.lock() {
                    Ok(mut count) => *count += 1,
                    Err(poisoned) => *poisoned.into_inner() += 1,
                }

                if config.max_frames.map_or(false, |max| sent >= max) {
                    info!(frames = sent, instants = generator.instants(), "Simulated device dropping data connection");
                    if let Some(mut socket) = client.take() {
                        let _ = socket.shutdown().await;
                    }
                }
            }
        }
    }
}

async fn write_frame(socket: &mut TcpStream, frame: &[u8], split: bool) -> std::io::Result<()> {
    if split {
        let (head, tail) = frame.split_at(frame.len() / 2);
        socket.write_all(head).await?;
        tokio::task::yield_now().await;
        socket.write_all(tail).await
    } else {
        socket.write_all(frame).await
    }
}

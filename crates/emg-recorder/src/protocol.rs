//! Device protocol client
//!
//! Two TCP connections: a text command channel (`\r\n` terminated) and a
//! binary EMG data channel. The client owns both sockets and the ingestion
//! thread reading the data channel.

use crate::config::DeviceConfig;
use crate::ingest::{join_bounded, run_ingestion, FrameProcessor, StreamEnd, StreamMonitor};
use crate::queue::OutputChannel;
use emg_core::{protocol_error, DeviceProfile, EmgError, EmgResult, ProcessedChunk, RateProfile};
use std::io::{ErrorKind, Read, Write};
use socket2::SockRef;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest `RATE?` reply read in one go
const REPLY_BUFFER_BYTES: usize = 1024;

pub struct ProtocolClient {
    config: DeviceConfig,
    command: Option<TcpStream>,
    emg: Option<TcpStream>,
    profile: DeviceProfile,
    started: bool,
    cancel: Arc<AtomicBool>,
    ingestion: Option<JoinHandle<StreamEnd>>,
    join_timeout: Duration,
}

impl ProtocolClient {
    pub fn new(config: DeviceConfig, join_timeout: Duration) -> EmgResult<Self> {
        let profile = DeviceProfile::new(config.channel_count, RateProfile::Standard)?;
        Ok(ProtocolClient {
            config,
            command: None,
            emg: None,
            profile,
            started: false,
            cancel: Arc::new(AtomicBool::new(false)),
            ingestion: None,
            join_timeout,
        })
    }

    /// Frame geometry currently in effect
    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    pub fn is_connected(&self) -> bool {
        self.command.is_some() && self.emg.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Open the command and EMG sockets
    ///
    /// If the second leg fails the first is closed before returning.
    pub fn connect(&mut self) -> EmgResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let timeout = self.config.connect_timeout();
        let command = open("command", &self.config.command_endpoint(), timeout)?;
        let emg = match open("emg", &self.config.emg_endpoint(), timeout) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = command.shutdown(Shutdown::Both);
                return Err(e);
            }
        };

        let receive_buffer = set_receive_buffer(&emg, self.config.receive_buffer_bytes);
        info!(
            command = %self.config.command_endpoint(),
            emg = %self.config.emg_endpoint(),
            receive_buffer,
            "Connected to device"
        );
        self.command = Some(command);
        self.emg = Some(emg);
        Ok(())
    }

    fn command_stream(&mut self) -> EmgResult<&mut TcpStream> {
        self.command
            .as_mut()
            .ok_or_else(|| EmgError::protocol("command channel is not connected"))
    }

    /// Send one command and wait for the device to settle
    pub fn send_command(&mut self, command: &str) -> EmgResult<()> {
        let settle = self.config.command_settle();
        let stream = self.command_stream()?;
        let line = format!("{}\r\n", command);
        stream
            .write_all(line.as_bytes())
            .and_then(|_| stream.flush())
            .map_err(|e| protocol_error!("failed to send {}: {}", command, e))?;
        debug!(command, "Sent device command");
        std::thread::sleep(settle);
        Ok(())
    }

    /// Flush whatever stale bytes are sitting in the command socket
    fn drain_command(&mut self) -> EmgResult<usize> {
        let timeout = self.config.drain_timeout();
        let stream = self.command_stream()?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| protocol_error!("failed to set drain timeout: {}", e))?;

        let mut buf = [0u8; REPLY_BUFFER_BYTES];
        let mut drained = 0;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Err(EmgError::protocol("device closed the command channel")),
                Ok(n) => drained += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) => return Err(protocol_error!("failed to drain command channel: {}", e)),
            }
        }

        if drained > 0 {
            debug!(bytes = drained, "Discarded stale command-channel bytes");
        }
        Ok(drained)
    }

    fn read_reply(&mut self) -> EmgResult<String> {
        let timeout = self.config.reply_timeout();
        let stream = self.command_stream()?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| protocol_error!("failed to set reply timeout: {}", e))?;

        let mut buf = [0u8; REPLY_BUFFER_BYTES];
        let n = match stream.read(&mut buf) {
            Ok(0) => return Err(EmgError::protocol("device closed the command channel")),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(EmgError::protocol("no reply to rate query"));
            }
            Err(e) => return Err(protocol_error!("failed to read rate reply: {}", e)),
        };

        let reply = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        if reply.is_empty() {
            return Err(EmgError::protocol("empty reply to rate query"));
        }
        Ok(reply)
    }

    /// Request `requested_hz` and adopt whatever rate the device reports
    ///
    /// Afterwards both sockets block without a read timeout.
    pub fn negotiate_rate(&mut self, requested_hz: u32) -> EmgResult<RateProfile> {
        self.drain_command()?;
        self.send_command(&format!("RATE {}", requested_hz))?;
        self.send_command("RATE?")?;
        let reply = self.read_reply()?;

        if reply.parse::<f64>().is_err() {
            warn!(%reply, "Rate reply is not numeric, assuming the standard profile");
        }
        let rate = RateProfile::from_reply(&reply);
        self.profile = DeviceProfile::new(self.config.channel_count, rate)?;

        for stream in [self.command.as_ref(), self.emg.as_ref()].into_iter().flatten() {
            stream
                .set_read_timeout(None)
                .map_err(|e| protocol_error!("failed to clear read timeout: {}", e))?;
        }

        if (rate.sampling_rate() - f64::from(requested_hz)).abs() > f64::EPSILON {
            info!(requested_hz, actual_hz = rate.sampling_rate(), frame_bytes = rate.frame_bytes(), "Device selected a different rate");
        } else {
            info!(actual_hz = rate.sampling_rate(), frame_bytes = rate.frame_bytes(), "Sampling rate negotiated");
        }
        Ok(rate)
    }

    /// Send `START` and spawn the ingestion thread on the data socket
    ///
    /// `processor` must already match the negotiated profile.
    pub fn start(
        &mut self,
        processor: FrameProcessor,
        output: OutputChannel<ProcessedChunk>,
        monitor: Arc<StreamMonitor>,
    ) -> EmgResult<()> {
        if self.started {
            return Ok(());
        }
        if processor.profile().frame_bytes() != self.profile.frame_bytes() {
            return Err(EmgError::FrameSize {
                expected: self.profile.frame_bytes(),
                actual: processor.profile().frame_bytes(),
            });
        }

        let reader = self
            .emg
            .as_ref()
            .ok_or_else(|| EmgError::protocol("data channel is not connected"))?
            .try_clone()
            .map_err(|e| protocol_error!("failed to clone data socket: {}", e))?;

        self.send_command("START")?;
        self.started = true;
        self.cancel.store(false, Ordering::Release);

        let cancel = Arc::clone(&self.cancel);
        let handle = std::thread::Builder::new()
            .name("emg-ingestion".to_string())
            .spawn(move || run_ingestion(reader, processor, output, &cancel, &monitor))
            .map_err(|e| protocol_error!("failed to spawn ingestion thread: {}", e))?;
        self.ingestion = Some(handle);

        info!(frame_bytes = self.profile.frame_bytes(), "Device streaming started");
        Ok(())
    }

    /// Stop streaming and close both sockets; a no-op when idle
    ///
    /// Returns how the ingestion loop ended, if it was running and exited
    /// within the join timeout.
    pub fn stop(&mut self) -> Option<StreamEnd> {
        if self.command.is_none() && self.emg.is_none() && self.ingestion.is_none() {
            return None;
        }

        self.cancel.store(true, Ordering::Release);

        if self.started {
            if let Err(e) = self.send_command("STOP") {
                warn!(error = %e, "Failed to send STOP");
            }
        }

        for stream in [self.command.take(), self.emg.take()].into_iter().flatten() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.started = false;

        let end = self
            .ingestion
            .take()
            .and_then(|handle| join_bounded(handle, self.join_timeout, "emg-ingestion"));
        info!(end = ?end, "Device connection closed");
        end
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open(leg: &'static str, endpoint: &str, timeout: Duration) -> EmgResult<TcpStream> {
    let to_error = |reason: String| EmgError::Connection {
        leg,
        endpoint: endpoint.to_string(),
        reason,
    };

    let addrs = endpoint
        .to_socket_addrs()
        .map_err(|e| to_error(format!("cannot resolve: {}", e)))?;

    let mut last_error = String::from("no addresses resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(to_error(last_error))
}

/// Apply `bytes` as the receive buffer of `stream`; 0 leaves the OS default
///
/// Failures are logged. Returns the size the OS reports afterwards.
fn set_receive_buffer(stream: &TcpStream, bytes: usize) -> Option<usize> {
    let socket = SockRef::from(stream);
    if bytes > 0 {
        if let Err(e) = socket.set_recv_buffer_size(bytes) {
            warn!(requested = bytes, error = %e, "Failed to set data socket receive buffer");
        }
    }
    match socket.recv_buffer_size() {
        Ok(size) => Some(size),
        Err(e) => {
            warn!(error = %e, "Failed to read data socket receive buffer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use emg_core::Channel;
    use emg_processing::ProcessingConfig;
    use emg_simulation::{DeviceSimulator, SimulatorConfig};

    fn device_for(sim: &DeviceSimulator) -> DeviceConfig {
        DeviceConfig {
            host: "127.0.0.1".to_string(),
            command_port: sim.command_addr().port(),
            emg_port: sim.emg_addr().port(),
            drain_timeout_ms: 20,
            command_settle_ms: 5,
            reply_timeout_ms: 2000,
            ..DeviceConfig::default()
        }
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn wait_for(sim: &DeviceSimulator, command: &str) -> bool {
        for _ in 0..200 {
            if sim.commands().iter().any(|c| c == command) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_standard_rate_negotiation() {
        let sim = DeviceSimulator::spawn(SimulatorConfig::default()).unwrap();
        let mut client = ProtocolClient::new(device_for(&sim), Duration::from_secs(1)).unwrap();

        client.connect().unwrap();
        let rate = client.negotiate_rate(2000).unwrap();

        assert_eq!(rate, RateProfile::Standard);
        assert_eq!(client.profile().frame_bytes(), 1728);
        assert_eq!(client.profile().samples_per_frame(), 27);
        assert!(wait_for(&sim, "RATE?"));
        assert_eq!(sim.commands()[..2], ["RATE 2000".to_string(), "RATE?".to_string()]);
    }

    #[test]
    fn test_alternate_rate_negotiation() {
        let sim = DeviceSimulator::spawn(SimulatorConfig::alternate_rate()).unwrap();
        let mut client = ProtocolClient::new(device_for(&sim), Duration::from_secs(1)).unwrap();

        client.connect().unwrap();
        let rate = client.negotiate_rate(2000).unwrap();

        assert_eq!(rate, RateProfile::Alternate);
        assert_eq!(client.profile().frame_bytes(), 1664);
        assert_eq!(client.profile().samples_per_frame(), 26);
    }

    #[test]
    fn test_connect_applies_receive_buffer() {
        let sim = DeviceSimulator::spawn(SimulatorConfig::default()).unwrap();
        let config = device_for(&sim);
        let requested = config.receive_buffer_bytes;
        let mut client = ProtocolClient::new(config, Duration::from_secs(1)).unwrap();

        client.connect().unwrap();
        let emg = client.emg.as_ref().unwrap();
        let applied = SockRef::from(emg).recv_buffer_size().unwrap();
        assert!(applied >= requested, "receive buffer {} < {}", applied, requested);
        assert_eq!(set_receive_buffer(emg, 0), Some(applied));
    }

    #[test]
    fn test_connect_failure_is_connection_error() {
        let config = DeviceConfig {
            host: "127.0.0.1".to_string(),
            command_port: unused_port(),
            emg_port: unused_port(),
            connect_timeout_ms: 500,
            ..DeviceConfig::default()
        };
        let mut client = ProtocolClient::new(config, Duration::from_secs(1)).unwrap();

        match client.connect() {
            Err(EmgError::Connection { leg, .. }) => assert_eq!(leg, "command"),
            other => panic!("expected connection error, got {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[test]
    fn test_partial_connect_closes_first_leg() {
        let sim = DeviceSimulator::spawn(SimulatorConfig::default()).unwrap();
        let config = DeviceConfig {
            emg_port: unused_port(),
            connect_timeout_ms: 500,
            ..device_for(&sim)
        };
        let mut client = ProtocolClient::new(config, Duration::from_secs(1)).unwrap();

        match client.connect() {
            Err(EmgError::Connection { leg, .. }) => assert_eq!(leg, "emg"),
            other => panic!("expected connection error, got {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut idle = ProtocolClient::new(DeviceConfig::default(), Duration::from_secs(1)).unwrap();
        assert_eq!(idle.stop(), None);
        assert_eq!(idle.stop(), None);

        let sim = DeviceSimulator::spawn(SimulatorConfig::default()).unwrap();
        let mut client = ProtocolClient::new(device_for(&sim), Duration::from_secs(1)).unwrap();
        client.connect().unwrap();
        client.negotiate_rate(2000).unwrap();
        client.stop();
        assert!(!client.is_connected());
        assert_eq!(client.stop(), None);
    }

    #[test]
    fn test_start_streams_and_stop_ends_loop() {
        let sim = DeviceSimulator::spawn(SimulatorConfig {
            frame_interval: Some(Duration::from_millis(1)),
            split_writes: true,
            ..SimulatorConfig::alternate_rate()
        })
        .unwrap();
        let mut client = ProtocolClient::new(device_for(&sim), Duration::from_secs(2)).unwrap();
        client.connect().unwrap();
        client.negotiate_rate(2000).unwrap();

        let processor = FrameProcessor::new(
            client.profile(),
            ProcessingConfig::default(),
            EngineConfig::default().channels(),
        )
        .unwrap();
        let output = OutputChannel::new(1000);
        let monitor = Arc::new(StreamMonitor::new());
        client.start(processor, output.clone(), Arc::clone(&monitor)).unwrap();
        assert!(client.is_started());

        let chunk = output.blocking_pop(Duration::from_secs(5)).unwrap();
        assert_eq!(chunk.len(), 75);
        assert_eq!(chunk.label, Channel::default_montage()[chunk.channel].label);

        let end = client.stop();
        assert_eq!(end, Some(StreamEnd::Stopped));
        assert!(wait_for(&sim, "STOP"));
        assert!(monitor.stats().frames_received > 0);
        assert!(output.is_closed());
    }

    #[test]
    fn test_start_rejects_mismatched_processor() {
        let sim = DeviceSimulator::spawn(SimulatorConfig::alternate_rate()).unwrap();
        let mut client = ProtocolClient::new(device_for(&sim), Duration::from_secs(1)).unwrap();
        client.connect().unwrap();
        client.negotiate_rate(2000).unwrap();

        let stale = FrameProcessor::new(
            DeviceProfile::default(),
            ProcessingConfig::default(),
            Channel::default_montage(),
        )
        .unwrap();
        let result = client.start(stale, OutputChannel::new(10), Arc::new(StreamMonitor::new()));
        assert!(matches!(result, Err(EmgError::FrameSize { expected: 1664, actual: 1728 })));
        assert!(!client.is_started());
    }
}

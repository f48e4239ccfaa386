//! Engine configuration

use anyhow::{Context, Result};
use emg_core::{
    Channel, DeviceProfile, EmgError, EmgResult, RateProfile, DEFAULT_CHANNEL_COUNT,
    DEFAULT_MUSCLE_LABELS,
};
use emg_processing::{FilterPipeline, ProcessingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection and command-channel settings for the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub command_port: u16,
    pub emg_port: u16,
    /// Bound on each TCP connect
    pub connect_timeout_ms: u64,
    /// Read timeout while flushing stale command-channel bytes
    pub drain_timeout_ms: u64,
    /// Pause after each command before the device accepts the next
    pub command_settle_ms: u64,
    /// Bound on waiting for the `RATE?` reply
    pub reply_timeout_ms: u64,
    pub requested_rate_hz: u32,
    /// Socket receive buffer size hint
    pub receive_buffer_bytes: usize,
    pub channel_count: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            command_port: 50040,
            emg_port: 50041,
            connect_timeout_ms: 10_000,
            drain_timeout_ms: 100,
            command_settle_ms: 100,
            reply_timeout_ms: 5_000,
            requested_rate_hz: 2000,
            receive_buffer_bytes: 65_536,
            channel_count: DEFAULT_CHANNEL_COUNT,
        }
    }
}

impl DeviceConfig {
    pub fn command_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.command_port)
    }

    pub fn emg_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.emg_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Where finished recordings are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    /// Directory under `output_dir` for metadata sidecars
    pub metadata_subdir: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./recordings"),
            metadata_subdir: "metadata".to_string(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    pub processing: ProcessingConfig,
    /// Output queue capacity in chunks
    pub queue_capacity: usize,
    /// Chunks kept per channel for live preview
    pub preview_chunks: usize,
    /// Consumer wait on an empty queue before re-checking state
    pub consumer_poll_ms: u64,
    /// Bound on joining worker threads
    pub join_timeout_ms: u64,
    /// Pause between leaving Active and tearing down the stream
    pub stop_grace_ms: u64,
    pub recording: RecordingConfig,
    /// Per-channel labels; missing entries become `Ch<index>`
    pub labels: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            processing: ProcessingConfig::default(),
            queue_capacity: 1000,
            preview_chunks: 10,
            consumer_poll_ms: 1000,
            join_timeout_ms: 2000,
            stop_grace_ms: 200,
            recording: RecordingConfig::default(),
            labels: DEFAULT_MUSCLE_LABELS.iter().map(|l| l.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; absent fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn channels(&self) -> Vec<Channel> {
        Channel::from_labels(self.device.channel_count, &self.labels)
    }

    pub fn consumer_poll(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Reject settings that would fail later, before anything connects
    ///
    /// The filter cascade is checked at both supported rates since
    /// negotiation may select either.
    pub fn validate(&self) -> EmgResult<()> {
        if self.device.host.trim().is_empty() {
            return Err(EmgError::config("device host must not be empty"));
        }
        if self.device.requested_rate_hz == 0 {
            return Err(EmgError::config("requested rate must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(EmgError::config("queue capacity must be at least 1"));
        }
        if self.preview_chunks == 0 {
            return Err(EmgError::config("preview must keep at least 1 chunk"));
        }
        if self.consumer_poll_ms == 0 {
            return Err(EmgError::config("consumer poll interval must be positive"));
        }

        for rate in [RateProfile::Standard, RateProfile::Alternate] {
            DeviceProfile::new(self.device.channel_count, rate)?;
            FilterPipeline::new(self.processing.clone(), rate.sampling_rate())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emg_processing::FilterConfig;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.device.command_endpoint(), "localhost:50040");
        assert_eq!(config.device.emg_endpoint(), "localhost:50041");
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.preview_chunks, 10);
        assert_eq!(config.channels()[0].label, "L-TIBI");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_labels_fall_back() {
        let config = EngineConfig {
            labels: vec!["A".to_string()],
            ..EngineConfig::default()
        };
        let channels = config.channels();
        assert_eq!(channels.len(), 16);
        assert_eq!(channels[0].label, "A");
        assert_eq!(channels[1].label, "Ch1");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "device": {{ "host": "10.0.0.5" }}, "queue_capacity": 64 }}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.device.host, "10.0.0.5");
        assert_eq!(config.device.emg_port, 50041);
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn test_load_reports_path() {
        let err = EngineConfig::load(Path::new("/nonexistent/engine.json")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/engine.json"));
    }

    #[test]
    fn test_validate_short_window() {
        let mut config = EngineConfig::default();
        config.processing.accumulation_window = 20;
        assert!(matches!(
            config.validate(),
            Err(EmgError::FilterPrecondition { .. })
        ));
    }

    #[test]
    fn test_validate_cutoff_above_nyquist() {
        let mut config = EngineConfig::default();
        config.processing.bandpass = FilterConfig::bandpass(20.0, 1200.0, 4);
        assert!(matches!(
            config.validate(),
            Err(EmgError::InvalidFilterDesign { .. })
        ));
    }

    #[test]
    fn test_validate_channel_geometry() {
        let mut config = EngineConfig::default();
        config.device.channel_count = 5;
        assert!(matches!(config.validate(), Err(EmgError::InvalidConfig { .. })));
    }
}

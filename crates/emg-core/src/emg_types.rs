//! EMG-specific device, channel and chunk types

use serde::{Deserialize, Serialize};
use crate::error::{EmgError, EmgResult};

/// Muscle labels of the default 16-sensor montage
pub const DEFAULT_MUSCLE_LABELS: [&str; 16] = [
    "L-TIBI", "L-GAST", "L-RECT-DIST", "L-RECT-PROX", "L-VAST-LATE",
    "R-TIBI", "R-GAST", "R-RECT-DIST", "R-RECT-PROX", "R-VAST-LATE",
    "L-SEMI", "R-SEMI", "NC", "NC", "L-BICEP-FEMO", "R-BICEP-FEMO",
];

/// Number of EMG sensors on the device
pub const DEFAULT_CHANNEL_COUNT: usize = 16;

/// Size of one sample on the wire (little-endian f32)
pub const BYTES_PER_SAMPLE: usize = 4;

/// Placeholder label for a channel that has no configured label
pub fn default_label(index: usize) -> String {
    format!("Ch{}", index)
}

/// One acquisition channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Zero-based position in the frame interleaving
    pub index: usize,
    /// Muscle or electrode label
    pub label: String,
}

impl Channel {
    /// Create a channel, falling back to `Ch<index>` for a missing or blank label
    pub fn new(index: usize, label: Option<&str>) -> Self {
        let label = match label {
            Some(l) if !l.trim().is_empty() => l.to_string(),
            _ => default_label(index),
        };
        Channel { index, label }
    }

    /// Build `count` channels from an optional label list
    pub fn from_labels(count: usize, labels: &[String]) -> Vec<Channel> {
        (0..count)
            .map(|i| Channel::new(i, labels.get(i).map(String::as_str)))
            .collect()
    }

    /// The default 16-channel montage
    pub fn default_montage() -> Vec<Channel> {
        DEFAULT_MUSCLE_LABELS
            .iter()
            .enumerate()
            .map(|(i, l)| Channel::new(i, Some(l)))
            .collect()
    }
}

/// Sampling-rate profiles the device can stream at
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RateProfile {
    /// 2000 Hz, 1728-byte frames
    Standard,
    /// ~1925.926 Hz, 1664-byte frames
    Alternate,
}

impl RateProfile {
    /// Substring of the `RATE?` reply that identifies the alternate profile
    pub const ALTERNATE_MARKER: &'static str = "1925";

    /// Pick the profile matching a textual `RATE?` reply
    pub fn from_reply(reply: &str) -> Self {
        if reply.contains(Self::ALTERNATE_MARKER) {
            RateProfile::Alternate
        } else {
            RateProfile::Standard
        }
    }

    /// Sampling rate in Hz
    pub fn sampling_rate(&self) -> f64 {
        match self {
            RateProfile::Standard => 2000.0,
            RateProfile::Alternate => 1925.926,
        }
    }

    /// Bytes per data frame
    pub fn frame_bytes(&self) -> usize {
        match self {
            RateProfile::Standard => 1728,
            RateProfile::Alternate => 1664,
        }
    }

    /// f32 values per data frame
    pub fn floats_per_frame(&self) -> usize {
        self.frame_bytes() / BYTES_PER_SAMPLE
    }
}

impl Default for RateProfile {
    fn default() -> Self {
        RateProfile::Standard
    }
}

/// Frame geometry for a channel count and rate profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Interleaved channels per sample instant
    pub channel_count: usize,
    /// Negotiated rate profile
    pub rate: RateProfile,
}

impl DeviceProfile {
    /// Create a profile, checking the frame divides evenly across channels
    pub fn new(channel_count: usize, rate: RateProfile) -> EmgResult<Self> {
        if channel_count == 0 {
            return Err(EmgError::config("channel count must be at least 1"));
        }
        if rate.floats_per_frame() % channel_count != 0 {
            return Err(EmgError::config(format!(
                "{} floats per frame do not split across {} channels",
                rate.floats_per_frame(),
                channel_count
            )));
        }
        Ok(DeviceProfile { channel_count, rate })
    }

    /// Bytes per data frame
    pub fn frame_bytes(&self) -> usize {
        self.rate.frame_bytes()
    }

    /// Sample instants per frame
    pub fn samples_per_frame(&self) -> usize {
        self.rate.floats_per_frame() / self.channel_count
    }

    /// Sampling rate in Hz
    pub fn sampling_rate(&self) -> f64 {
        self.rate.sampling_rate()
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            channel_count: DEFAULT_CHANNEL_COUNT,
            rate: RateProfile::Standard,
        }
    }
}

/// Filtered output of one drained accumulation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedChunk {
    /// Channel index
    pub channel: usize,
    /// Channel label at the time of processing
    pub label: String,
    /// Filtered samples, one window long
    pub samples: Vec<f64>,
}

impl ProcessedChunk {
    pub fn new(channel: &Channel, samples: Vec<f64>) -> Self {
        ProcessedChunk {
            channel: channel.index,
            label: channel.label.clone(),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl std::fmt::Display for RateProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3} Hz ({} byte frames)", self.sampling_rate(), self.frame_bytes())
    }
}

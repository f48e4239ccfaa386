//! Configuration for the per-channel processing path

use crate::filters::FilterConfig;
use emg_core::{EmgError, EmgResult};
use serde::{Deserialize, Serialize};

/// Default accumulation window in samples per channel
pub const DEFAULT_ACCUMULATION_WINDOW: usize = 75;

/// Filter cascade and accumulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Samples gathered per channel before one filtering pass
    pub accumulation_window: usize,
    /// Apply the envelope lowpass after rectification
    pub envelope: bool,
    /// DC offset / drift removal
    pub highpass: FilterConfig,
    /// Powerline interference removal
    pub notch: FilterConfig,
    /// EMG band restriction
    pub bandpass: FilterConfig,
    /// Envelope smoothing
    pub lowpass: FilterConfig,
}

impl ProcessingConfig {
    /// Standard surface EMG cascade for a 60 Hz mains environment
    pub fn emg_default() -> Self {
        ProcessingConfig {
            accumulation_window: DEFAULT_ACCUMULATION_WINDOW,
            envelope: false,
            highpass: FilterConfig::highpass(0.5, 2),
            notch: FilterConfig::notch(60.0, 30.0),
            bandpass: FilterConfig::bandpass(20.0, 450.0, 4),
            lowpass: FilterConfig::lowpass(10.0, 2),
        }
    }

    /// Same cascade with envelope extraction enabled
    pub fn emg_envelope() -> Self {
        ProcessingConfig {
            envelope: true,
            ..Self::emg_default()
        }
    }

    /// Stages in application order
    pub fn stages(&self) -> [&FilterConfig; 4] {
        [&self.highpass, &self.notch, &self.bandpass, &self.lowpass]
    }

    /// Basic sanity checks that do not depend on the sampling rate
    pub fn validate(&self) -> EmgResult<()> {
        if self.accumulation_window == 0 {
            return Err(EmgError::config("accumulation window must be at least 1 sample"));
        }
        Ok(())
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self::emg_default()
    }
}

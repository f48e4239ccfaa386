//! Core window processor trait

use emg_core::EmgResult;

/// Transforms one accumulated window of a single channel
pub trait SignalProcessor: Send {
    /// Process a window and return a window of the same length
    fn process(&self, window: &[f64]) -> EmgResult<Vec<f64>>;

    /// Recompute internal state for a new sampling rate
    fn reconfigure(&mut self, sampling_rate: f64) -> EmgResult<()>;

    /// Get processor name/identifier
    fn name(&self) -> &str;

    /// Sampling rate the processor is currently designed for
    fn sampling_rate(&self) -> f64;
}

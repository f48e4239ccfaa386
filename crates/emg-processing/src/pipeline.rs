//! Fixed EMG filter cascade applied to one accumulation window
//!
//! Stage order: highpass, notch, bandpass, full-wave rectification and,
//! when envelope mode is on, a smoothing lowpass. Every IIR stage runs
//! forward-backward, so each needs the window to be longer than its edge
//! padding. That relationship is checked whenever coefficients are built.

use crate::config::ProcessingConfig;
use crate::filters::FilterCoefficients;
use crate::processor::SignalProcessor;
use emg_core::{EmgError, EmgResult};
use serde::{Deserialize, Serialize};

/// Coefficients of the four IIR stages for one sampling rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeCoefficients {
    pub highpass: FilterCoefficients,
    pub notch: FilterCoefficients,
    pub bandpass: FilterCoefficients,
    pub lowpass: FilterCoefficients,
}

impl CascadeCoefficients {
    /// Design all stages for `sampling_rate`
    pub fn design(config: &ProcessingConfig, sampling_rate: f64) -> EmgResult<Self> {
        Ok(CascadeCoefficients {
            highpass: config.highpass.design(sampling_rate)?,
            notch: config.notch.design(sampling_rate)?,
            bandpass: config.bandpass.design(sampling_rate)?,
            lowpass: config.lowpass.design(sampling_rate)?,
        })
    }

    fn stages(&self) -> [&FilterCoefficients; 4] {
        [&self.highpass, &self.notch, &self.bandpass, &self.lowpass]
    }
}

/// Per-channel filter pipeline
#[derive(Debug, Clone)]
pub struct FilterPipeline {
    config: ProcessingConfig,
    sampling_rate: f64,
    coefficients: CascadeCoefficients,
}

impl FilterPipeline {
    /// Design the cascade and validate the accumulation window against it
    pub fn new(config: ProcessingConfig, sampling_rate: f64) -> EmgResult<Self> {
        config.validate()?;
        let coefficients = CascadeCoefficients::design(&config, sampling_rate)?;
        check_window(&config, &coefficients)?;

        Ok(FilterPipeline {
            config,
            sampling_rate,
            coefficients,
        })
    }

    /// Current coefficients
    pub fn coefficients(&self) -> &CascadeCoefficients {
        &self.coefficients
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    /// Whether the envelope lowpass is applied
    pub fn envelope(&self) -> bool {
        self.config.envelope
    }

    /// Smallest window every stage accepts
    pub fn min_window(&self) -> usize {
        min_window(&self.coefficients)
    }
}

/// Window must exceed the largest forward-backward edge padding
fn min_window(coefficients: &CascadeCoefficients) -> usize {
    coefficients
        .stages()
        .iter()
        .map(|c| c.padlen() + 1)
        .max()
        .unwrap_or(1)
}

fn check_window(config: &ProcessingConfig, coefficients: &CascadeCoefficients) -> EmgResult<()> {
    let window = config.accumulation_window;
    for (stage, coeffs) in config.stages().iter().zip(coefficients.stages()) {
        if window <= coeffs.padlen() {
            return Err(EmgError::FilterPrecondition {
                stage: stage.stage_name(),
                window,
                required: coeffs.padlen(),
            });
        }
    }
    Ok(())
}

impl SignalProcessor for FilterPipeline {
    fn process(&self, window: &[f64]) -> EmgResult<Vec<f64>> {
        let mut samples = self.coefficients.highpass.filtfilt(window)?;
        samples = self.coefficients.notch.filtfilt(&samples)?;
        samples = self.coefficients.bandpass.filtfilt(&samples)?;

        for sample in samples.iter_mut() {
            *sample = sample.abs();
        }

        if self.config.envelope {
            samples = self.coefficients.lowpass.filtfilt(&samples)?;
        }

        Ok(samples)
    }

    fn reconfigure(&mut self, sampling_rate: f64) -> EmgResult<()> {
        let coefficients = CascadeCoefficients::design(&self.config, sampling_rate)?;
        check_window(&self.config, &coefficients)?;
        self.coefficients = coefficients;
        self.sampling_rate = sampling_rate;
        Ok(())
    }

    fn name(&self) -> &str {
        "EMG Filter Pipeline"
    }

    fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterConfig;
    use emg_core::RateProfile;
    use std::f64::consts::PI;

    fn emg_like_window(len: usize, fs: f64) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let t = i as f64 / fs;
                0.8 + 0.3 * (2.0 * PI * 90.0 * t).sin() + 0.2 * (2.0 * PI * 60.0 * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_output_length_and_rectification() {
        let pipeline = FilterPipeline::new(ProcessingConfig::default(), 2000.0).unwrap();
        let window = emg_like_window(75, 2000.0);

        let output = pipeline.process(&window).unwrap();
        assert_eq!(output.len(), window.len());
        assert!(output.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_envelope_mode() {
        let pipeline = FilterPipeline::new(ProcessingConfig::emg_envelope(), 2000.0).unwrap();
        assert!(pipeline.envelope());
        let output = pipeline.process(&emg_like_window(300, 2000.0)).unwrap();
        assert_eq!(output.len(), 300);
        assert!(output.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_default_window_satisfies_all_stages() {
        for profile in [RateProfile::Standard, RateProfile::Alternate] {
            let pipeline = FilterPipeline::new(ProcessingConfig::default(), profile.sampling_rate()).unwrap();
            assert_eq!(pipeline.min_window(), 28);
            assert!(ProcessingConfig::default().accumulation_window >= pipeline.min_window());
        }
    }

    #[test]
    fn test_short_window_fails_fast() {
        let config = ProcessingConfig {
            accumulation_window: 27,
            ..ProcessingConfig::default()
        };
        match FilterPipeline::new(config, 2000.0) {
            Err(EmgError::FilterPrecondition { stage, window, required }) => {
                assert_eq!(stage, "bandpass");
                assert_eq!(window, 27);
                assert_eq!(required, 27);
            }
            other => panic!("expected precondition failure, got {:?}", other),
        }
    }

    #[test]
    fn test_higher_order_violates_default_window() {
        let config = ProcessingConfig {
            bandpass: FilterConfig::bandpass(20.0, 450.0, 12),
            ..ProcessingConfig::default()
        };
        assert!(matches!(
            FilterPipeline::new(config, 2000.0),
            Err(EmgError::FilterPrecondition { .. })
        ));
    }

    #[test]
    fn test_reconfigure_recomputes_coefficients() {
        let mut pipeline = FilterPipeline::new(ProcessingConfig::default(), 2000.0).unwrap();
        let before = pipeline.coefficients().clone();

        let alternate = RateProfile::Alternate.sampling_rate();
        pipeline.reconfigure(alternate).unwrap();

        assert_eq!(pipeline.sampling_rate(), alternate);
        assert_eq!(
            pipeline.coefficients(),
            &CascadeCoefficients::design(&ProcessingConfig::default(), alternate).unwrap()
        );
        assert_ne!(pipeline.coefficients().highpass, before.highpass);
        assert_ne!(pipeline.coefficients().notch, before.notch);
        assert_ne!(pipeline.coefficients().bandpass, before.bandpass);
        assert_ne!(pipeline.coefficients().lowpass, before.lowpass);
    }
}

//! Synthetic EMG generator producing device-format frames

use crate::signal_patterns::SignalPattern;
use anyhow::{anyhow, Result};
use emg_core::DeviceProfile;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Configuration for EMG synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Activation envelope shared by every channel
    pub pattern: SignalPattern,
    /// Gaussian noise standard deviation (0.0 = no noise)
    pub gaussian_std: f32,
    /// Power line interference (50/60Hz)
    pub powerline_freq: Option<f32>,
    /// DC offset added to every sample, exercised by the highpass stage
    pub dc_offset: f32,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            pattern: SignalPattern::default(),
            gaussian_std: 0.05,
            powerline_freq: Some(60.0),
            dc_offset: 0.1,
            seed: None,
        }
    }
}

/// Generates interleaved little-endian f32 frames
pub struct EmgGenerator {
    config: GeneratorConfig,
    rng: rand::rngs::StdRng,
    noise: Option<Normal<f32>>,
    instant: u64,
}

impl EmgGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let rng = match config.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };

        let noise = if config.gaussian_std > 0.0 {
            Some(
                Normal::new(0.0, config.gaussian_std)
                    .map_err(|e| anyhow!("failed to create normal distribution: {}", e))?,
            )
        } else {
            None
        };

        Ok(EmgGenerator {
            config,
            rng,
            noise,
            instant: 0,
        })
    }

    /// Sample instants generated so far
    pub fn instants(&self) -> u64 {
        self.instant
    }

    /// Produce the next frame for `profile`
    pub fn next_frame(&mut self, profile: &DeviceProfile) -> Vec<u8> {
        let instants = profile.samples_per_frame();
        let channels = profile.channel_count;
        let dt = 1.0 / profile.sampling_rate() as f32;
        let mut frame = Vec::with_capacity(profile.frame_bytes());

        for _ in 0..instants {
            let time = self.instant as f32 * dt;
            for channel in 0..channels {
                let value = self.sample(time, channel);
                frame.extend_from_slice(&value.to_le_bytes());
            }
            self.instant += 1;
        }

        frame
    }

    fn sample(&mut self, time: f32, channel: usize) -> f32 {
        let activation = self.config.pattern.activation_at_time(time);

        // Each channel fires at a slightly different dominant frequency
        let base_frequency = 80.0 + channel as f32 * 10.0;
        let amplitude = activation * 2.0;

        let mut value = amplitude * (2.0 * PI * base_frequency * time).sin();
        value += amplitude * 0.3 * (2.0 * PI * base_frequency * 2.0 * time).sin();
        value += activation * self.rng.gen_range(-0.2..0.2);

        if let Some(noise) = &self.noise {
            value += noise.sample(&mut self.rng);
        }
        if let Some(freq) = self.config.powerline_freq {
            value += 0.05 * (2.0 * PI * freq * time).sin();
        }

        (value + self.config.dc_offset).clamp(-5.0, 5.0)
    }
}

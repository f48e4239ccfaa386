//! Muscle activation envelopes driving the synthetic signal

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Activation level over time, in 0..=1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SignalPattern {
    /// Constant activation level
    Constant { level: f32 },
    /// Periodic contraction
    Sinusoidal {
        frequency: f32,
        amplitude: f32,
        baseline: f32,
    },
    /// On/off contraction cycles
    Burst {
        on_duration: f32,
        off_duration: f32,
        amplitude: f32,
    },
    /// Steady activation with physiological tremor
    Realistic {
        base_activation: f32,
        tremor_frequency: f32,
        tremor_amplitude: f32,
    },
}

impl SignalPattern {
    /// Activation level at `time` seconds
    pub fn activation_at_time(&self, time: f32) -> f32 {
        let level = match self {
            SignalPattern::Constant { level } => *level,

            SignalPattern::Sinusoidal { frequency, amplitude, baseline } => {
                baseline + amplitude * (2.0 * PI * frequency * time).sin()
            }

            SignalPattern::Burst { on_duration, off_duration, amplitude } => {
                let cycle = on_duration + off_duration;
                if cycle <= 0.0 || time % cycle < *on_duration {
                    *amplitude
                } else {
                    0.0
                }
            }

            SignalPattern::Realistic { base_activation, tremor_frequency, tremor_amplitude } => {
                base_activation + tremor_amplitude * (2.0 * PI * tremor_frequency * time).sin()
            }
        };

        level.clamp(0.0, 1.0)
    }
}

impl Default for SignalPattern {
    fn default() -> Self {
        SignalPattern::Realistic {
            base_activation: 0.4,
            tremor_frequency: 8.0,
            tremor_amplitude: 0.05,
        }
    }
}

//! EMG-Simulation: a stand-in for the acquisition hardware
//!
//! Synthetic EMG generation and a TCP device speaking the command/data
//! wire protocol, for tests and demos.

pub mod device;
pub mod emg_simulator;
pub mod signal_patterns;

pub use device::{DeviceSimulator, SimulatorConfig};
pub use emg_simulator::{EmgGenerator, GeneratorConfig};
pub use signal_patterns::SignalPattern;

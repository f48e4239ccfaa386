//! EMG-Core: shared types for the acquisition engine
//!
//! Device profiles, channel identity and the processed chunk record passed
//! from the processing path to recording and preview.

pub mod emg_types;
pub mod error;

pub use emg_types::*;
pub use error::{EmgError, EmgResult};

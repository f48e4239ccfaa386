//! EMG-Processing: per-channel signal path for the acquisition engine
//!
//! Frame demultiplexing, window accumulation and the zero-phase filter cascade.

pub mod config;
pub mod demux;
pub mod filters;
pub mod pipeline;
pub mod processor;

pub use config::{ProcessingConfig, DEFAULT_ACCUMULATION_WINDOW};
pub use demux::{DrainedWindow, FrameDemuxer};
pub use filters::{FilterCoefficients, FilterConfig, FilterType};
pub use pipeline::{CascadeCoefficients, FilterPipeline};
pub use processor::SignalProcessor;

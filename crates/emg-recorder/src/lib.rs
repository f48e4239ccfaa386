//! EMG-Recorder: acquisition engine for a networked EMG device
//!
//! Connects to the device, streams and filters every channel, and records
//! sessions to disk while serving a live preview.

pub mod config;
pub mod engine;
pub mod ingest;
pub mod persist;
pub mod preview;
pub mod protocol;
pub mod queue;
pub mod session;

pub use config::{DeviceConfig, EngineConfig, RecordingConfig};
pub use engine::{ControlResponse, Engine, EngineStatus};
pub use ingest::{FrameProcessor, StreamEnd, StreamMonitor, StreamState, StreamStats};
pub use persist::{FileStore, RecordingSink};
pub use preview::{LivePreview, LivePreviewCache};
pub use protocol::ProtocolClient;
pub use queue::{OutputChannel, PopError, PushOutcome};
pub use session::{
    RecordingSession, SavedRecording, SessionState, SessionWarning, StopOutcome,
};

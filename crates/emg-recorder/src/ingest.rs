//! Data ingestion: frame reassembly, processing and stream status

use crate::queue::{OutputChannel, PushOutcome};
use emg_core::{Channel, DeviceProfile, EmgResult, ProcessedChunk};
use emg_processing::{FilterPipeline, FrameDemuxer, ProcessingConfig, SignalProcessor};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Why the ingestion loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEnd {
    /// The device closed the data connection
    Disconnected,
    /// A read failed for another reason
    Failed(String),
    /// Cancellation was requested
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Idle,
    Streaming,
    Ended(StreamEnd),
}

/// Counters and state shared between the ingestion thread and observers
#[derive(Debug)]
pub struct StreamMonitor {
    state: Mutex<StreamState>,
    frames_received: AtomicU64,
    framing_errors: AtomicU64,
    chunks_emitted: AtomicU64,
}

/// Point-in-time copy of a [`StreamMonitor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    pub state: StreamState,
    pub frames_received: u64,
    pub framing_errors: u64,
    pub chunks_emitted: u64,
}

impl Default for StreamMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMonitor {
    pub fn new() -> Self {
        StreamMonitor {
            state: Mutex::new(StreamState::Idle),
            frames_received: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            chunks_emitted: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn has_ended(&self) -> bool {
        matches!(self.state(), StreamState::Ended(_))
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            state: self.state(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
        }
    }
}

/// Demultiplexer, filter pipeline and channel identities for one stream
#[derive(Debug, Clone)]
pub struct FrameProcessor {
    demuxer: FrameDemuxer,
    pipeline: FilterPipeline,
    channels: Vec<Channel>,
}

impl FrameProcessor {
    pub fn new(profile: DeviceProfile, config: ProcessingConfig, channels: Vec<Channel>) -> EmgResult<Self> {
        let window = config.accumulation_window;
        let pipeline = FilterPipeline::new(config, profile.sampling_rate())?;
        let demuxer = FrameDemuxer::new(profile, window)?;
        Ok(FrameProcessor {
            demuxer,
            pipeline,
            channels,
        })
    }

    pub fn profile(&self) -> &DeviceProfile {
        self.demuxer.profile()
    }

    pub fn pipeline(&self) -> &FilterPipeline {
        &self.pipeline
    }

    pub fn framing_errors(&self) -> u64 {
        self.demuxer.framing_errors()
    }

    /// Adopt a negotiated profile, redesigning filters when the rate moved
    ///
    /// Partially filled windows are discarded either way.
    pub fn reconfigure(&mut self, profile: DeviceProfile) -> EmgResult<()> {
        if profile.rate != self.demuxer.profile().rate {
            self.pipeline.reconfigure(profile.sampling_rate())?;
            info!(rate = %profile.rate, "Filter coefficients recomputed");
        }
        if profile != *self.demuxer.profile() {
            self.demuxer.set_profile(profile);
        } else {
            self.demuxer.clear();
        }
        Ok(())
    }

    /// Demultiplex one frame and filter every window it completes
    pub fn process_frame(&mut self, frame: &[u8]) -> EmgResult<Vec<ProcessedChunk>> {
        let windows = self.demuxer.push_frame(frame)?;
        let mut chunks = Vec::with_capacity(windows.len());
        for window in windows {
            let samples = self.pipeline.process(&window.samples)?;
            let chunk = match self.channels.get(window.channel) {
                Some(channel) => ProcessedChunk::new(channel, samples),
                None => ProcessedChunk::new(&Channel::new(window.channel, None), samples),
            };
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Read frames until the stream ends or cancellation is requested
///
/// Each read reassembles exactly one frame. The output channel is closed
/// on exit so consumers observe the end of the stream.
pub fn run_ingestion<R: Read>(
    mut stream: R,
    mut processor: FrameProcessor,
    output: OutputChannel<ProcessedChunk>,
    cancel: &AtomicBool,
    monitor: &StreamMonitor,
) -> StreamEnd {
    let mut frame = vec![0u8; processor.profile().frame_bytes()];
    monitor.set_state(StreamState::Streaming);
    info!(frame_bytes = frame.len(), "Data ingestion started");

    let end = 'frames: loop {
        if cancel.load(Ordering::Acquire) {
            break StreamEnd::Stopped;
        }

        if let Err(e) = stream.read_exact(&mut frame) {
            if cancel.load(Ordering::Acquire) {
                break StreamEnd::Stopped;
            }
            if e.kind() == ErrorKind::UnexpectedEof {
                break StreamEnd::Disconnected;
            }
            break StreamEnd::Failed(e.to_string());
        }
        monitor.frames_received.fetch_add(1, Ordering::Relaxed);

        match processor.process_frame(&frame) {
            Ok(chunks) => {
                for chunk in chunks {
                    if output.try_push(chunk) == PushOutcome::Closed {
                        debug!("Output channel closed, ending ingestion");
                        break 'frames StreamEnd::Stopped;
                    }
                    monitor.chunks_emitted.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                monitor.framing_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Discarding frame");
            }
        }
    };

    output.close();
    match &end {
        StreamEnd::Stopped => info!("Data ingestion stopped"),
        other => warn!(reason = ?other, "Data stream ended"),
    }
    monitor.set_state(StreamState::Ended(end.clone()));
    end
}

/// Join `handle`, giving up after `timeout`
///
/// A thread still running at the deadline is detached and logged as leaked.
pub fn join_bounded<T>(handle: JoinHandle<T>, timeout: Duration, name: &str) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, timeout_ms = timeout.as_millis() as u64, "Thread did not exit in time, leaking it");
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(thread = name, "Thread panicked");
            None
        }
    }
}

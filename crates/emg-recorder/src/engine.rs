//! Acquisition engine: the control surface over client, session and preview
//!
//! Three execution contexts run while recording. The ingestion thread owns
//! the data socket and the processing path. The consumer thread moves
//! chunks from the output queue into the session and the preview cache.
//! Callers drive start, stop and preview queries from any thread.

use crate::config::EngineConfig;
use crate::ingest::{join_bounded, FrameProcessor, StreamMonitor, StreamStats};
use crate::persist::{FileStore, RecordingSink};
use crate::preview::{LivePreview, LivePreviewCache};
use crate::protocol::ProtocolClient;
use crate::queue::{OutputChannel, PopError};
use crate::session::{RecordingSession, SessionState, SessionWarning, StopOutcome};
use emg_core::{protocol_error, Channel, DeviceProfile, EmgError, EmgResult, ProcessedChunk, RateProfile};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Reply to a start or stop request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Self {
        ControlResponse { success: true, message: message.into() }
    }

    fn failed(message: impl Into<String>) -> Self {
        ControlResponse { success: false, message: message.into() }
    }

    fn from_stop(result: EmgResult<StopOutcome>) -> Self {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return ControlResponse::failed(e.to_string()),
        };

        let mut response = match &outcome {
            StopOutcome::NoData { .. } => {
                ControlResponse::failed("Recording stopped, but no data was captured.")
            }
            StopOutcome::Saved(saved) => ControlResponse::ok(format!(
                "Recording saved successfully ({} samples).",
                saved.samples_per_channel
            )),
        };
        for warning in outcome.warnings() {
            response.message.push_str(&format!(" Warning: {}.", warning));
        }
        response
    }
}

/// Engine state for monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub recording: bool,
    pub session: SessionState,
    /// Present while a stream is attached
    pub stream: Option<StreamStats>,
    pub sampling_rate: Option<f64>,
    pub dropped_chunks: u64,
    pub next_trial: u32,
}

/// Threads and channels of one running stream
struct Acquisition {
    client: ProtocolClient,
    queue: OutputChannel<ProcessedChunk>,
    monitor: Arc<StreamMonitor>,
    consumer: JoinHandle<u64>,
    consuming: Arc<AtomicBool>,
    rate: RateProfile,
}

impl Acquisition {
    /// Stop the device and both threads; returns the evicted chunk count
    fn teardown(mut self, join_timeout: Duration) -> u64 {
        self.consuming.store(false, Ordering::Release);
        let end = self.client.stop();
        self.queue.close();

        if let Some(consumed) = join_bounded(self.consumer, join_timeout, "emg-consumer") {
            info!(consumed, stream_end = ?end, "Acquisition torn down");
        }
        match self.queue.overflow() {
            Some(EmgError::QueueOverflow { dropped }) => {
                warn!(dropped, "Chunks were dropped during the recording");
                dropped
            }
            _ => 0,
        }
    }
}

struct Control {
    processor: FrameProcessor,
    acquisition: Option<Acquisition>,
    /// Evictions of the last torn-down acquisition, kept until the next start
    last_dropped: u64,
}

pub struct Engine {
    config: EngineConfig,
    channels: Vec<Channel>,
    session: Arc<RecordingSession>,
    preview: Arc<LivePreviewCache>,
    sink: Box<dyn RecordingSink>,
    control: Mutex<Control>,
}

impl Engine {
    /// Validate `config` and write recordings under its output directory
    pub fn new(config: EngineConfig) -> EmgResult<Self> {
        let sink = Box::new(FileStore::new(&config.recording));
        Self::with_sink(config, sink)
    }

    pub fn with_sink(config: EngineConfig, sink: Box<dyn RecordingSink>) -> EmgResult<Self> {
        config.validate()?;

        let channels = config.channels();
        let profile = DeviceProfile::new(config.device.channel_count, RateProfile::Standard)?;
        let processor = FrameProcessor::new(profile, config.processing.clone(), channels.clone())?;

        info!(
            channels = channels.len(),
            window = config.processing.accumulation_window,
            envelope = config.processing.envelope,
            "Engine configured"
        );

        Ok(Engine {
            session: Arc::new(RecordingSession::new(channels.clone())),
            preview: Arc::new(LivePreviewCache::new(channels.len(), config.preview_chunks)),
            channels,
            sink,
            control: Mutex::new(Control {
                processor,
                acquisition: None,
                last_dropped: 0,
            }),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a recording, reporting the outcome as a response
    pub fn start_recording(&self) -> ControlResponse {
        match self.start() {
            Ok(rate) => ControlResponse::ok(format!("Recording started at {:.3} Hz.", rate.sampling_rate())),
            Err(e) => {
                if !e.is_state_error() {
                    warn!(error = %e, "Failed to start recording");
                }
                ControlResponse::failed(e.to_string())
            }
        }
    }

    /// Stop the recording and save it, reporting the outcome as a response
    pub fn stop_recording(&self) -> ControlResponse {
        ControlResponse::from_stop(self.stop())
    }

    /// Recent processed data per channel; empty while not recording
    pub fn query_live_preview(&self) -> LivePreview {
        if !self.session.is_recording() {
            return LivePreview::empty(self.channels.len());
        }
        self.preview.snapshot()
    }

    /// Connect, negotiate, configure the processing path and begin recording
    pub fn start(&self) -> EmgResult<RateProfile> {
        let mut control = self.control();
        match self.session.state() {
            SessionState::Active => return Err(EmgError::AlreadyActive),
            SessionState::Finalizing => return Err(EmgError::Finalizing),
            SessionState::Idle => {}
        }

        // A stream that ended on its own may still be attached
        if let Some(stale) = control.acquisition.take() {
            stale.teardown(self.config.join_timeout());
        }

        self.preview.clear();
        control.last_dropped = 0;
        let control = &mut *control;
        let acquisition = self.session.start_with(|| {
            let acquisition = self.launch(&mut control.processor)?;
            Ok((acquisition.rate.sampling_rate(), acquisition))
        })?;

        let rate = acquisition.rate;
        control.acquisition = Some(acquisition);
        Ok(rate)
    }

    fn launch(&self, processor: &mut FrameProcessor) -> EmgResult<Acquisition> {
        let device = &self.config.device;
        let mut client = ProtocolClient::new(device.clone(), self.config.join_timeout())?;

        // Any early return drops the client, closing whatever it opened
        client.connect()?;
        let rate = client.negotiate_rate(device.requested_rate_hz)?;
        processor.reconfigure(client.profile())?;

        let queue = OutputChannel::new(self.config.queue_capacity);
        let monitor = Arc::new(StreamMonitor::new());
        client.start(processor.clone(), queue.clone(), Arc::clone(&monitor))?;

        let consuming = Arc::new(AtomicBool::new(true));
        let consumer = {
            let queue = queue.clone();
            let session = Arc::clone(&self.session);
            let preview = Arc::clone(&self.preview);
            let consuming = Arc::clone(&consuming);
            let poll = self.config.consumer_poll();
            std::thread::Builder::new()
                .name("emg-consumer".to_string())
                .spawn(move || run_consumer(&queue, &session, &preview, &consuming, poll))
        };
        let consumer = match consumer {
            Ok(handle) => handle,
            Err(e) => {
                client.stop();
                return Err(protocol_error!("failed to spawn consumer thread: {}", e));
            }
        };

        Ok(Acquisition {
            client,
            queue,
            monitor,
            consumer,
            consuming,
            rate,
        })
    }

    /// Stop streaming and finalize the session
    pub fn stop(&self) -> EmgResult<StopOutcome> {
        let mut control = self.control();
        self.session.begin_stop()?;
        info!("Stopping recording");

        std::thread::sleep(self.config.stop_grace());
        let dropped = match control.acquisition.take() {
            Some(acquisition) => acquisition.teardown(self.config.join_timeout()),
            None => 0,
        };

        control.last_dropped = dropped;

        let mut outcome = self.session.finalize(self.sink.as_ref());
        match &mut outcome {
            Ok(outcome) if dropped > 0 => {
                outcome.push_warning(SessionWarning::DroppedChunks { count: dropped });
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to save recording"),
        }
        outcome
    }

    pub fn status(&self) -> EngineStatus {
        let control = self.control();
        let attached = control.acquisition.as_ref();
        EngineStatus {
            recording: self.session.is_recording(),
            session: self.session.state(),
            stream: attached.map(|a| a.monitor.stats()),
            sampling_rate: attached.map(|a| a.rate.sampling_rate()),
            dropped_chunks: attached.map_or(control.last_dropped, |a| a.queue.dropped()),
            next_trial: self.session.trial_number(),
        }
    }

    /// Finalize an active recording and release the device
    pub fn shutdown(&self) {
        if self.session.state() == SessionState::Active {
            match self.stop() {
                Ok(outcome) => info!(?outcome, "Recording finalized on shutdown"),
                Err(e) => warn!(error = %e, "Could not finalize recording on shutdown"),
            }
        }
        if let Some(acquisition) = self.control().acquisition.take() {
            acquisition.teardown(self.config.join_timeout());
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Move chunks from the queue into the session and preview until told to stop
///
/// Returns the number of chunks recorded.
fn run_consumer(
    queue: &OutputChannel<ProcessedChunk>,
    session: &RecordingSession,
    preview: &LivePreviewCache,
    consuming: &AtomicBool,
    poll: Duration,
) -> u64 {
    let mut recorded = 0u64;
    while consuming.load(Ordering::Acquire) {
        match queue.blocking_pop(poll) {
            Ok(chunk) => {
                if session.append(&chunk) {
                    preview.push(&chunk);
                    recorded += 1;
                }
            }
            Err(PopError::Timeout) => continue,
            Err(PopError::Closed) => break,
        }
    }
    recorded
}

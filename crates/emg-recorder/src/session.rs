//! Recording session state and buffer alignment
//!
//! A session moves `Idle -> Active -> Finalizing -> Idle`. Every buffer
//! mutation and state change happens under one lock, so a stop can never
//! observe a half-appended chunk. Finalizing aligns the channel buffers to
//! the shortest one, prepends a timestamp row and hands the matrix to a
//! [`RecordingSink`].

use crate::persist::RecordingSink;
use chrono::{DateTime, Local};
use emg_core::{Channel, EmgError, EmgResult, ProcessedChunk};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Byte layout of the binary recording
pub const MATRIX_LAYOUT: &str = "row-major f64 LE, row 0 = timestamps";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Active,
    Finalizing,
}

/// Recoverable condition attached to a saved recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionWarning {
    /// A channel fell short of the others and was zero-filled at the tail
    PaddedChannel {
        channel: usize,
        label: String,
        padded_samples: usize,
    },
    /// The binary was saved but its metadata sidecar was not
    MetadataWriteFailed { path: PathBuf, reason: String },
    /// Chunks were evicted from the output queue during the session
    DroppedChunks { count: u64 },
}

impl fmt::Display for SessionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionWarning::PaddedChannel { channel, label, padded_samples } => {
                write!(f, "channel {} ({}) padded with {} zero samples", channel, label, padded_samples)
            }
            SessionWarning::MetadataWriteFailed { path, reason } => {
                write!(f, "could not save metadata {}: {}", path.display(), reason)
            }
            SessionWarning::DroppedChunks { count } => {
                write!(f, "{} chunks dropped by the output queue", count)
            }
        }
    }
}

/// Dense `rows x columns` matrix stored row-major
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingMatrix {
    rows: usize,
    columns: usize,
    data: Vec<f64>,
}

impl RecordingMatrix {
    fn from_rows(rows: Vec<Vec<f64>>, columns: usize) -> Self {
        let row_count = rows.len();
        let mut data = Vec::with_capacity(row_count * columns);
        for row in rows {
            data.extend(row);
        }
        RecordingMatrix {
            rows: row_count,
            columns,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.columns..(index + 1) * self.columns]
    }

    /// Serialize as little-endian f64 in row-major order
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Sidecar describing a binary recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    /// 1-based channel numbers
    pub emg_ch_number: Vec<usize>,
    pub fs: f64,
    pub total_analog_in_ch: usize,
    pub musc_labels: Vec<String>,
    pub session_date: String,
    pub session_time: String,
    pub trial_number: u32,
    pub session_id: Uuid,
    pub samples_per_channel: usize,
    pub layout: String,
}

/// An aligned recording ready to persist
#[derive(Debug, Clone)]
pub struct FinalizedRecording {
    pub session_start: DateTime<Local>,
    pub trial_number: u32,
    pub matrix: RecordingMatrix,
    pub metadata: RecordingMetadata,
}

impl FinalizedRecording {
    fn stamp(&self) -> String {
        self.session_start.format("%Y%m%d_%H%M%S").to_string()
    }

    pub fn data_file_name(&self) -> String {
        format!("{}_Trl{:04}.bin", self.stamp(), self.trial_number)
    }

    pub fn metadata_file_name(&self) -> String {
        format!("{}_METADATATrl{:04}.json", self.stamp(), self.trial_number)
    }
}

/// What a sink wrote
#[derive(Debug, Clone, PartialEq)]
pub struct PersistReport {
    pub data_path: PathBuf,
    /// None when the sidecar failed; a matching warning is included
    pub metadata_path: Option<PathBuf>,
    pub warnings: Vec<SessionWarning>,
}

/// A recording that reached disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRecording {
    pub session_id: Uuid,
    pub trial_number: u32,
    pub samples_per_channel: usize,
    pub data_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
    pub warnings: Vec<SessionWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// No channel produced a full window
    NoData { warnings: Vec<SessionWarning> },
    Saved(SavedRecording),
}

impl StopOutcome {
    pub fn no_data() -> Self {
        StopOutcome::NoData { warnings: Vec::new() }
    }

    pub fn warnings(&self) -> &[SessionWarning] {
        match self {
            StopOutcome::NoData { warnings } => warnings,
            StopOutcome::Saved(saved) => &saved.warnings,
        }
    }

    pub fn push_warning(&mut self, warning: SessionWarning) {
        match self {
            StopOutcome::NoData { warnings } => warnings.push(warning),
            StopOutcome::Saved(saved) => saved.warnings.push(warning),
        }
    }
}

struct SessionInner {
    state: SessionState,
    channels: Vec<Channel>,
    buffers: Vec<Vec<f64>>,
    first_sample_time: Option<DateTime<Local>>,
    /// Fixed at the first start in the process and reused across trials
    session_start: Option<DateTime<Local>>,
    trial_number: u32,
    session_id: Option<Uuid>,
    sampling_rate: f64,
}

impl SessionInner {
    fn reset_buffers(&mut self) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.first_sample_time = None;
    }
}

/// Thread-safe recording session
pub struct RecordingSession {
    inner: Mutex<SessionInner>,
    // Mirrors `state == Active` for lock-free readers
    active: AtomicBool,
}

impl RecordingSession {
    pub fn new(channels: Vec<Channel>) -> Self {
        let buffers = vec![Vec::new(); channels.len()];
        RecordingSession {
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                channels,
                buffers,
                first_sample_time: None,
                session_start: None,
                trial_number: 1,
                session_id: None,
                sampling_rate: 0.0,
            }),
            active: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        self.active.store(state == SessionState::Active, Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// True while Active; never blocks
    pub fn is_recording(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Trial number the next saved recording will carry
    pub fn trial_number(&self) -> u32 {
        self.lock().trial_number
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.lock().session_id
    }

    /// Samples buffered per channel
    pub fn buffered_lengths(&self) -> Vec<usize> {
        self.lock().buffers.iter().map(Vec::len).collect()
    }

    /// Begin a session once `confirm` reports that streaming has started
    ///
    /// `confirm` returns the negotiated sampling rate together with a value
    /// handed back to the caller. If it fails, the session stays Idle with
    /// empty buffers.
    pub fn start_with<T, F>(&self, confirm: F) -> EmgResult<T>
    where
        F: FnOnce() -> EmgResult<(f64, T)>,
    {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Active => return Err(EmgError::AlreadyActive),
            SessionState::Finalizing => return Err(EmgError::Finalizing),
            SessionState::Idle => {}
        }

        inner.reset_buffers();
        if inner.session_start.is_none() {
            inner.session_start = Some(Local::now());
        }

        match confirm() {
            Ok((sampling_rate, value)) => {
                let id = Uuid::new_v4();
                inner.sampling_rate = sampling_rate;
                inner.session_id = Some(id);
                self.set_state(&mut inner, SessionState::Active);
                info!(session_id = %id, trial = inner.trial_number, sampling_rate, "Recording session started");
                Ok(value)
            }
            Err(e) => {
                inner.reset_buffers();
                inner.session_id = None;
                self.set_state(&mut inner, SessionState::Idle);
                warn!(error = %e, "Recording session did not start");
                Err(e)
            }
        }
    }

    /// Append a chunk to its channel buffer; returns false unless Active
    pub fn append(&self, chunk: &ProcessedChunk) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Active {
            return false;
        }
        if chunk.channel >= inner.buffers.len() {
            warn!(channel = chunk.channel, "Chunk for unknown channel ignored");
            return false;
        }
        if chunk.samples.is_empty() {
            return true;
        }

        if inner.first_sample_time.is_none() {
            let now = Local::now();
            debug!(first_sample_time = %now, "First sample of session");
            inner.first_sample_time = Some(now);
        }
        inner.buffers[chunk.channel].extend_from_slice(&chunk.samples);
        true
    }

    /// Leave Active so no further chunks are appended
    pub fn begin_stop(&self) -> EmgResult<()> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Idle => Err(EmgError::NotActive),
            SessionState::Finalizing => Err(EmgError::Finalizing),
            SessionState::Active => {
                self.set_state(&mut inner, SessionState::Finalizing);
                Ok(())
            }
        }
    }

    /// Align, persist and reset the session
    ///
    /// Accepts an Active session directly. The session is Idle with empty
    /// buffers afterwards whatever the outcome.
    pub fn finalize(&self, sink: &dyn RecordingSink) -> EmgResult<StopOutcome> {
        let mut inner = self.lock();
        if inner.state == SessionState::Idle {
            return Err(EmgError::NotActive);
        }
        self.set_state(&mut inner, SessionState::Finalizing);

        let result = Self::align_and_persist(&mut inner, sink);

        inner.reset_buffers();
        inner.session_id = None;
        if let Ok(StopOutcome::Saved(saved)) = &result {
            inner.trial_number += 1;
            info!(
                session_id = %saved.session_id,
                trial = saved.trial_number,
                samples = saved.samples_per_channel,
                path = %saved.data_path.display(),
                "Recording saved"
            );
        }
        self.set_state(&mut inner, SessionState::Idle);
        result
    }

    /// `begin_stop` followed by `finalize`
    pub fn stop(&self, sink: &dyn RecordingSink) -> EmgResult<StopOutcome> {
        self.begin_stop()?;
        self.finalize(sink)
    }

    fn align_and_persist(inner: &mut SessionInner, sink: &dyn RecordingSink) -> EmgResult<StopOutcome> {
        let min_len = inner.buffers.iter().map(Vec::len).min().unwrap_or(0);
        if min_len == 0 {
            info!("Recording stopped with no data captured");
            return Ok(StopOutcome::no_data());
        }

        let mut rows = Vec::with_capacity(inner.buffers.len() + 1);
        rows.push(timestamps(inner.first_sample_time, inner.sampling_rate, min_len));
        let (aligned, mut warnings) = align_channels(&inner.channels, &mut inner.buffers, min_len);
        rows.extend(aligned);

        let session_start = inner.session_start.unwrap_or_else(Local::now);
        let session_id = inner.session_id.unwrap_or_else(Uuid::new_v4);
        let recording = FinalizedRecording {
            session_start,
            trial_number: inner.trial_number,
            matrix: RecordingMatrix::from_rows(rows, min_len),
            metadata: RecordingMetadata {
                emg_ch_number: (1..=inner.channels.len()).collect(),
                fs: inner.sampling_rate,
                total_analog_in_ch: inner.channels.len(),
                musc_labels: inner.channels.iter().map(|c| c.label.clone()).collect(),
                session_date: session_start.format("%Y-%m-%d").to_string(),
                session_time: session_start.format("%H:%M:%S").to_string(),
                trial_number: inner.trial_number,
                session_id,
                samples_per_channel: min_len,
                layout: MATRIX_LAYOUT.to_string(),
            },
        };

        let report = sink.persist(&recording)?;
        warnings.extend(report.warnings);

        Ok(StopOutcome::Saved(SavedRecording {
            session_id,
            trial_number: inner.trial_number,
            samples_per_channel: min_len,
            data_path: report.data_path,
            metadata_path: report.metadata_path,
            warnings,
        }))
    }
}

/// Trim or zero-pad every buffer to `len`, emptying the buffers
fn align_channels(
    channels: &[Channel],
    buffers: &mut [Vec<f64>],
    len: usize,
) -> (Vec<Vec<f64>>, Vec<SessionWarning>) {
    let mut warnings = Vec::new();
    let mut rows = Vec::with_capacity(buffers.len());

    for (channel, buffer) in channels.iter().zip(buffers.iter_mut()) {
        let mut samples = std::mem::take(buffer);
        if samples.len() < len {
            let padded_samples = len - samples.len();
            warn!(channel = channel.index, label = %channel.label, padded_samples, "Padding short channel");
            warnings.push(SessionWarning::PaddedChannel {
                channel: channel.index,
                label: channel.label.clone(),
                padded_samples,
            });
        }
        samples.resize(len, 0.0);
        rows.push(samples);
    }

    (rows, warnings)
}

/// Seconds since the Unix epoch for each sample, anchored at the first sample
fn timestamps(first: Option<DateTime<Local>>, sampling_rate: f64, len: usize) -> Vec<f64> {
    let anchor = match first {
        Some(t) => t.timestamp() as f64 + f64::from(t.timestamp_subsec_nanos()) * 1e-9,
        None => return vec![0.0; len],
    };
    if !(sampling_rate > 0.0) {
        return vec![anchor; len];
    }
    (0..len).map(|i| anchor + i as f64 / sampling_rate).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Sink that keeps the last recording in memory
    #[derive(Default)]
    struct MemorySink {
        last: StdMutex<Option<FinalizedRecording>>,
        fail_data: bool,
        fail_metadata: bool,
    }

    impl RecordingSink for MemorySink {
        fn persist(&self, recording: &FinalizedRecording) -> EmgResult<PersistReport> {
            if self.fail_data {
                return Err(EmgError::Persistence {
                    path: recording.data_file_name(),
                    reason: "disk full".to_string(),
                });
            }
            *self.last.lock().unwrap() = Some(recording.clone());

            let mut warnings = Vec::new();
            let metadata_path = if self.fail_metadata {
                warnings.push(SessionWarning::MetadataWriteFailed {
                    path: PathBuf::from(recording.metadata_file_name()),
                    reason: "read-only".to_string(),
                });
                None
            } else {
                Some(PathBuf::from(recording.metadata_file_name()))
            };

            Ok(PersistReport {
                data_path: PathBuf::from(recording.data_file_name()),
                metadata_path,
                warnings,
            })
        }
    }

    fn channels(n: usize) -> Vec<Channel> {
        (0..n).map(|i| Channel::new(i, None)).collect()
    }

    fn started(n: usize) -> RecordingSession {
        let session = RecordingSession::new(channels(n));
        session.start_with(|| Ok((2000.0, ()))).unwrap();
        session
    }

    fn append_range(session: &RecordingSession, channel: usize, len: usize) {
        let samples: Vec<f64> = (0..len).map(|i| (channel * 1000 + i) as f64).collect();
        assert!(session.append(&ProcessedChunk::new(&Channel::new(channel, None), samples)));
    }

    fn saved(outcome: StopOutcome) -> SavedRecording {
        match outcome {
            StopOutcome::Saved(saved) => saved,
            StopOutcome::NoData { .. } => panic!("expected a saved recording"),
        }
    }

    #[test]
    fn test_stop_without_data() {
        let session = started(4);
        let sink = MemorySink::default();

        assert_eq!(session.stop(&sink).unwrap(), StopOutcome::no_data());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.buffered_lengths().iter().all(|&l| l == 0));
        assert!(sink.last.lock().unwrap().is_none());
        assert_eq!(session.trial_number(), 1);
    }

    #[test]
    fn test_one_empty_channel_means_no_data() {
        let session = started(2);
        append_range(&session, 0, 75);
        assert_eq!(session.stop(&MemorySink::default()).unwrap(), StopOutcome::no_data());
        assert_eq!(session.buffered_lengths(), vec![0, 0]);
    }

    #[test]
    fn test_alignment_trims_tail() {
        let session = started(4);
        for (channel, len) in [100, 100, 97, 100].into_iter().enumerate() {
            append_range(&session, channel, len);
        }
        let sink = MemorySink::default();

        let saved = saved(session.stop(&sink).unwrap());
        assert_eq!(saved.samples_per_channel, 97);
        assert!(saved.warnings.is_empty());

        let recording = sink.last.lock().unwrap().clone().unwrap();
        let matrix = &recording.matrix;
        assert_eq!(matrix.rows(), 5);
        assert_eq!(matrix.columns(), 97);

        let short: Vec<f64> = (0..97).map(|i| (2000 + i) as f64).collect();
        assert_eq!(matrix.row(3), short.as_slice());
        let trimmed: Vec<f64> = (0..97).map(|i| i as f64).collect();
        assert_eq!(matrix.row(1), trimmed.as_slice());
        assert_eq!(matrix.to_le_bytes().len(), 5 * 97 * 8);
    }

    #[test]
    fn test_timestamp_row() {
        let session = started(1);
        append_range(&session, 0, 4);
        let sink = MemorySink::default();
        session.stop(&sink).unwrap();

        let recording = sink.last.lock().unwrap().clone().unwrap();
        let ts = recording.matrix.row(0);
        assert!(ts[0] > 1.0e9);
        for pair in ts.windows(2) {
            assert!((pair[1] - pair[0] - 1.0 / 2000.0).abs() < 1e-6);
        }
        assert_eq!(recording.metadata.fs, 2000.0);
        assert_eq!(recording.metadata.layout, MATRIX_LAYOUT);
    }

    #[test]
    fn test_align_pads_and_reports_short_channel() {
        let chans = channels(3);
        let mut buffers = vec![vec![1.0; 100], vec![2.0; 97], vec![3.0; 120]];

        let (rows, warnings) = align_channels(&chans, &mut buffers, 100);
        assert!(rows.iter().all(|r| r.len() == 100));
        assert_eq!(&rows[1][..97], vec![2.0; 97].as_slice());
        assert_eq!(&rows[1][97..], &[0.0, 0.0, 0.0]);
        assert_eq!(rows[2], vec![3.0; 100]);
        assert_eq!(warnings, vec![SessionWarning::PaddedChannel {
            channel: 1,
            label: "Ch1".to_string(),
            padded_samples: 3,
        }]);
        assert!(buffers.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_already_active_keeps_buffers() {
        let session = started(2);
        append_range(&session, 0, 10);

        let result = session.start_with(|| Ok((2000.0, ())));
        assert_eq!(result, Err(EmgError::AlreadyActive));
        assert_eq!(session.buffered_lengths(), vec![10, 0]);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_stop_while_idle() {
        let session = RecordingSession::new(channels(2));
        assert_eq!(session.stop(&MemorySink::default()), Err(EmgError::NotActive));
        assert_eq!(session.begin_stop(), Err(EmgError::NotActive));
    }

    #[test]
    fn test_failed_confirmation_reverts_to_idle() {
        let session = RecordingSession::new(channels(2));
        let result: EmgResult<()> = session.start_with(|| Err(EmgError::protocol("no reply")));

        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_recording());
        assert!(session.session_id().is_none());
        assert!(!session.append(&ProcessedChunk::new(&Channel::new(0, None), vec![1.0])));
    }

    #[test]
    fn test_no_stale_samples_across_sessions() {
        let sink = MemorySink::default();
        let session = started(2);
        append_range(&session, 0, 50);
        append_range(&session, 1, 50);
        saved(session.stop(&sink).unwrap());

        session.start_with(|| Ok((2000.0, ()))).unwrap();
        assert_eq!(session.buffered_lengths(), vec![0, 0]);
        append_range(&session, 0, 20);
        append_range(&session, 1, 20);
        assert_eq!(saved(session.stop(&sink).unwrap()).samples_per_channel, 20);
    }

    #[test]
    fn test_trial_increments_only_on_save() {
        let sink = MemorySink::default();
        let session = started(1);
        assert_eq!(session.stop(&sink).unwrap(), StopOutcome::no_data());
        assert_eq!(session.trial_number(), 1);

        session.start_with(|| Ok((2000.0, ()))).unwrap();
        append_range(&session, 0, 10);
        assert_eq!(saved(session.stop(&sink).unwrap()).trial_number, 1);
        assert_eq!(session.trial_number(), 2);

        session.start_with(|| Ok((2000.0, ()))).unwrap();
        append_range(&session, 0, 10);
        let first_saved = sink.last.lock().unwrap().clone().unwrap();
        assert_eq!(saved(session.stop(&sink).unwrap()).trial_number, 2);

        // Session date is reused across trials
        let second_saved = sink.last.lock().unwrap().clone().unwrap();
        assert_eq!(first_saved.session_start, second_saved.session_start);
        assert_eq!(second_saved.data_file_name(), format!(
            "{}_Trl0002.bin",
            second_saved.session_start.format("%Y%m%d_%H%M%S")
        ));
    }

    #[test]
    fn test_binary_failure_is_fatal_and_resets() {
        let sink = MemorySink {
            fail_data: true,
            ..MemorySink::default()
        };
        let session = started(1);
        append_range(&session, 0, 10);

        assert!(matches!(session.stop(&sink), Err(EmgError::Persistence { .. })));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.buffered_lengths(), vec![0]);
        assert_eq!(session.trial_number(), 1);
    }

    #[test]
    fn test_metadata_failure_is_warning() {
        let sink = MemorySink {
            fail_metadata: true,
            ..MemorySink::default()
        };
        let session = started(1);
        append_range(&session, 0, 10);

        let saved = saved(session.stop(&sink).unwrap());
        assert!(saved.metadata_path.is_none());
        assert!(matches!(
            saved.warnings.as_slice(),
            [SessionWarning::MetadataWriteFailed { .. }]
        ));
        assert_eq!(session.trial_number(), 2);
    }

    #[test]
    fn test_begin_stop_blocks_appends_and_starts() {
        let session = started(1);
        session.begin_stop().unwrap();

        assert!(!session.append(&ProcessedChunk::new(&Channel::new(0, None), vec![1.0])));
        assert_eq!(session.start_with(|| Ok((2000.0, ()))), Err(EmgError::Finalizing));
        assert_eq!(session.begin_stop(), Err(EmgError::Finalizing));
        assert_eq!(session.finalize(&MemorySink::default()).unwrap(), StopOutcome::no_data());
        assert_eq!(session.state(), SessionState::Idle);
    }
}

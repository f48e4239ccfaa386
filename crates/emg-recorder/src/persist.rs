//! Writing finished recordings to disk

use crate::config::RecordingConfig;
use crate::session::{FinalizedRecording, PersistReport, SessionWarning};
use emg_core::{EmgError, EmgResult};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Destination for finalized recordings
pub trait RecordingSink: Send + Sync {
    /// Write the recording and its metadata
    ///
    /// Failing to store the binary matrix is an error. A metadata failure is
    /// reported as a warning in the returned report.
    fn persist(&self, recording: &FinalizedRecording) -> EmgResult<PersistReport>;
}

/// Binary matrix plus JSON sidecar under an output directory
#[derive(Debug, Clone)]
pub struct FileStore {
    output_dir: PathBuf,
    metadata_dir: PathBuf,
}

impl FileStore {
    pub fn new(config: &RecordingConfig) -> Self {
        FileStore {
            output_dir: config.output_dir.clone(),
            metadata_dir: config.output_dir.join(&config.metadata_subdir),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    fn write_data(&self, recording: &FinalizedRecording) -> EmgResult<PathBuf> {
        let path = self.output_dir.join(recording.data_file_name());
        let to_error = |e: std::io::Error| EmgError::Persistence {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        fs::create_dir_all(&self.output_dir).map_err(to_error)?;
        let file = fs::File::create(&path).map_err(to_error)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&recording.matrix.to_le_bytes()).map_err(to_error)?;
        writer.flush().map_err(to_error)?;

        Ok(path)
    }

    fn write_metadata(&self, recording: &FinalizedRecording) -> Result<PathBuf, (PathBuf, String)> {
        let path = self.metadata_dir.join(recording.metadata_file_name());
        let json = serde_json::to_vec_pretty(&recording.metadata)
            .map_err(|e| (path.clone(), e.to_string()))?;

        fs::create_dir_all(&self.metadata_dir).map_err(|e| (path.clone(), e.to_string()))?;
        fs::write(&path, json).map_err(|e| (path.clone(), e.to_string()))?;
        Ok(path)
    }
}

impl RecordingSink for FileStore {
    fn persist(&self, recording: &FinalizedRecording) -> EmgResult<PersistReport> {
        let data_path = self.write_data(recording)?;
        info!(path = %data_path.display(), bytes = recording.matrix.rows() * recording.matrix.columns() * 8, "Binary data saved");

        let mut warnings = Vec::new();
        let metadata_path = match self.write_metadata(recording) {
            Ok(path) => {
                info!(path = %path.display(), "Metadata saved");
                Some(path)
            }
            Err((path, reason)) => {
                warn!(path = %path.display(), %reason, "Could not save metadata");
                warnings.push(SessionWarning::MetadataWriteFailed { path, reason });
                None
            }
        };

        Ok(PersistReport {
            data_path,
            metadata_path,
            warnings,
        })
    }
}

//! Error handling for the EMG acquisition engine
//!
//! One error type shared by every crate in the workspace. Variants map onto
//! the failure classes of the engine: connecting, talking to the device,
//! filter configuration, session misuse and persistence.

use core::fmt;

/// Result type alias for engine operations
pub type EmgResult<T> = Result<T, EmgError>;

/// Error type for all acquisition, processing and recording operations
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EmgError {
    /// A socket could not be connected or configured
    Connection {
        /// Which leg failed (`command` or `emg`)
        leg: &'static str,
        /// Address that was dialled
        endpoint: String,
        /// Underlying failure
        reason: String,
    },

    /// Malformed or unexpected traffic on the command channel
    Protocol {
        /// Description of the protocol issue
        reason: String,
    },

    /// A data frame did not have the negotiated byte length
    FrameSize {
        /// Negotiated frame size in bytes
        expected: usize,
        /// Received frame size in bytes
        actual: usize,
    },

    /// Accumulation window too short for zero-phase filtering
    FilterPrecondition {
        /// Filter stage whose padding requirement is violated
        stage: &'static str,
        /// Configured window length in samples
        window: usize,
        /// Window must be strictly longer than this
        required: usize,
    },

    /// A filter cannot be designed with the requested parameters
    InvalidFilterDesign {
        /// Description of the design issue
        reason: String,
    },

    /// A recording session is already running
    AlreadyActive,

    /// No recording session is running
    NotActive,

    /// A stopped session is still being finalized
    Finalizing,

    /// The primary recording artifact could not be written
    Persistence {
        /// Target path
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// Chunks were evicted from the output queue
    QueueOverflow {
        /// Number of evicted chunks
        dropped: u64,
    },

    /// Configuration rejected at validation time
    InvalidConfig {
        /// Description of the configuration error
        reason: String,
    },
}

impl EmgError {
    /// Helper for protocol errors
    pub fn protocol(reason: impl Into<String>) -> Self {
        EmgError::Protocol { reason: reason.into() }
    }

    /// Helper for configuration errors
    pub fn config(reason: impl Into<String>) -> Self {
        EmgError::InvalidConfig { reason: reason.into() }
    }

    /// True for session state misuse
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            EmgError::AlreadyActive | EmgError::NotActive | EmgError::Finalizing
        )
    }
}

impl fmt::Display for EmgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmgError::Connection { leg, endpoint, reason } => {
                write!(f, "Connection error on {} socket ({}): {}", leg, endpoint, reason)
            }
            EmgError::Protocol { reason } => {
                write!(f, "Protocol error: {}", reason)
            }
            EmgError::FrameSize { expected, actual } => {
                write!(f, "Frame size mismatch: expected {} bytes, got {} bytes",
                       expected, actual)
            }
            EmgError::FilterPrecondition { stage, window, required } => {
                write!(f, "Accumulation window of {} samples is too short for {} filter: \
                           need more than {} samples",
                       window, stage, required)
            }
            EmgError::InvalidFilterDesign { reason } => {
                write!(f, "Invalid filter design: {}", reason)
            }
            EmgError::AlreadyActive => write!(f, "Recording already in progress"),
            EmgError::NotActive => write!(f, "No recording in progress"),
            EmgError::Finalizing => write!(f, "Previous recording is still being saved"),
            EmgError::Persistence { path, reason } => {
                write!(f, "Error saving {}: {}", path, reason)
            }
            EmgError::QueueOverflow { dropped } => {
                write!(f, "Output queue overflow: {} chunks dropped", dropped)
            }
            EmgError::InvalidConfig { reason } => {
                write!(f, "Invalid configuration: {}", reason)
            }
        }
    }
}

impl std::error::Error for EmgError {}

/// Convenience macro for creating protocol errors
#[macro_export]
macro_rules! protocol_error {
    ($($arg:tt)*) => {
        $crate::error::EmgError::Protocol {
            reason: format!($($arg)*)
        }
    };
}

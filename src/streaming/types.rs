// Common types for the streaming module

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur in the frame-intensity pipeline
///
/// None of these are fatal to the hosting process. Source failures reset the
/// pipeline to silence, malformed records are replaced by a sentinel frame and
/// sink failures are skipped.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Source error: {0}")]
    SourceError(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Malformed frame: expected 4 bytes, got {len}")]
    MalformedFrame { len: usize },

    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipeline already running")]
    AlreadyRunning,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether the error ends the frame stream (as opposed to being recoverable locally)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamError::MalformedFrame { .. })
    }
}

/// Current state of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum PipelineState {
    /// Constructed, never started
    Idle,

    /// Source open and ingest running
    Running { started_at: f64 },

    /// Stopped by request
    Stopped,

    /// The source failed; downstream consumers see silence
    Failed { message: String },
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Counters describing a pipeline session; zeroed by each `start`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub frames_coalesced: u64,
    pub bursts: u64,
    pub ticks: u64,
    pub serial_writes: u64,
    pub uptime_seconds: Option<f64>,
}

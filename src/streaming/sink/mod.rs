// Consumers of the normalized intensity
//
// The poller calls both sinks from its tick without awaiting, so
// implementations must return immediately: anything slow (serial I/O,
// terminal redraws) is either cheap enough or handed to a background task.

mod display;
mod serial;

use crate::streaming::types::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use display::{render_level_bar, LatestValueDisplay, LevelBarDisplay};
pub use serial::{available_ports, DisconnectedSerial, SerialPortSink, DEFAULT_BAUD_RATE};

/// Receives the intensity on every poller tick, already clamped to [0, 1]
pub trait DisplaySink: Send + Sync {
    fn show(&self, intensity: f32);
}

/// Receives the 0..=255 level on ticks where it reports itself connected
pub trait SerialSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Queue one level for writing. Must not block.
    fn send_level(&self, level: u8) -> StreamResult<()>;

    /// Drop the connection; later `is_connected` calls return false
    fn disconnect(&self);
}

/// How a level is written to the serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerialEncoding {
    /// Decimal text terminated by a newline, e.g. `"127\n"`
    #[default]
    Line,
    /// One raw byte
    Byte,
}

impl SerialEncoding {
    pub fn encode(&self, level: u8) -> Vec<u8> {
        match self {
            SerialEncoding::Line => format!("{}\n", level).into_bytes(),
            SerialEncoding::Byte => vec![level],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SerialEncoding::Line => "line",
            SerialEncoding::Byte => "byte",
        }
    }
}

impl fmt::Display for SerialEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerialEncoding {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "line" | "text" => Ok(SerialEncoding::Line),
            "byte" | "raw" => Ok(SerialEncoding::Byte),
            other => Err(StreamError::InvalidConfig(format!(
                "Unknown serial encoding '{}' (expected 'line' or 'byte')",
                other
            ))),
        }
    }
}

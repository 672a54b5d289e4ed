// Pluggable frame source system
//
// This module defines the `FrameSource` trait so the ingest loop stays
// agnostic to where frames come from. New sources can be added by:
// 1. Implementing the FrameSource trait
// 2. Adding a variant to FrameSourceConfig
// 3. Registering in the factory function
//
// Current implementations:
// - WavFile: looping WAV playback, optionally paced in real time
// - WebSocket: live stream of 4-byte binary frame records
// - Microphone: push-style audio events normalized into the pull interface
// - Robot: robot realtime-API event stream feeding a Microphone source

mod file;
mod microphone;
mod robot;
mod websocket;

use crate::streaming::frame::Frame;
use crate::streaming::types::StreamResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub use file::WavFileSource;
pub use microphone::{AudioDataEvent, AudioTrack, MicrophoneFeed, MicrophoneSource};
pub use robot::{RobotEventSource, DEFAULT_ROBOT_PORT};
pub use websocket::WebSocketFrameSource;

/// Configuration for the different frame source types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrameSourceConfig {
    /// WAV file playback
    #[serde(rename = "wav")]
    WavFile {
        path: PathBuf,
        /// Wrap back to the first frame at the end of the file
        #[serde(default = "default_true")]
        loop_playback: bool,
        /// Release frames in real time, one chunk every `chunk_ms`
        #[serde(default)]
        chunk_ms: Option<u64>,
    },

    /// WebSocket stream of 4-byte frame records
    #[serde(rename = "websocket")]
    WebSocket { url: String },

    /// Robot realtime-API audio events
    #[serde(rename = "robot")]
    Robot {
        /// Host name or IP of the robot
        host: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        track: AudioTrack,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
}

fn default_true() -> bool {
    true
}

/// Metadata about a frame source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMetadata {
    /// Short source kind ("wav", "websocket", ...)
    pub kind: String,

    /// Native sample rate in Hz, when the source knows it
    pub sample_rate: Option<u32>,

    /// Source-specific properties (path, url, frame count, ...)
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl SourceMetadata {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            sample_rate: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn with_property(mut self, key: &str, value: impl ToString) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

/// Trait for all frame sources
///
/// A source produces a lazy, potentially infinite sequence of frames.
/// `next_frame` suspends until a frame is available; finite sources end with
/// `StreamError::EndOfStream`, transport failures surface as
/// `StreamError::SourceError`.
///
/// # Extension Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use intensity_relay::streaming::{Frame, FrameSource, SourceMetadata, StreamResult};
///
/// pub struct ConstantSource(Frame);
///
/// #[async_trait]
/// impl FrameSource for ConstantSource {
///     async fn open(&mut self) -> StreamResult<()> { Ok(()) }
///     async fn next_frame(&mut self) -> StreamResult<Frame> { Ok(self.0) }
///     async fn close(&mut self) -> StreamResult<()> { Ok(()) }
///     fn is_open(&self) -> bool { true }
///     fn metadata(&self) -> SourceMetadata { SourceMetadata::new("constant") }
/// }
/// ```
#[async_trait]
pub trait FrameSource: Send {
    /// Establish the underlying resource; `SourceUnavailable` on failure
    async fn open(&mut self) -> StreamResult<()>;

    /// Wait for the next frame
    async fn next_frame(&mut self) -> StreamResult<Frame>;

    /// Release the resource. Idempotent.
    async fn close(&mut self) -> StreamResult<()>;

    fn is_open(&self) -> bool;

    fn metadata(&self) -> SourceMetadata;
}

#[async_trait]
impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    async fn open(&mut self) -> StreamResult<()> {
        (**self).open().await
    }

    async fn next_frame(&mut self) -> StreamResult<Frame> {
        (**self).next_frame().await
    }

    async fn close(&mut self) -> StreamResult<()> {
        (**self).close().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn metadata(&self) -> SourceMetadata {
        (**self).metadata()
    }
}

/// Factory function to create a FrameSource from configuration
pub fn create_source(config: FrameSourceConfig) -> StreamResult<Box<dyn FrameSource>> {
    match config {
        FrameSourceConfig::WavFile {
            path,
            loop_playback,
            chunk_ms,
        } => Ok(Box::new(
            WavFileSource::new(path, loop_playback).with_pacing(chunk_ms),
        )),

        FrameSourceConfig::WebSocket { url } => Ok(Box::new(WebSocketFrameSource::new(url))),

        FrameSourceConfig::Robot {
            host,
            port,
            track,
            sample_rate,
        } => {
            let mut source = RobotEventSource::new(&host, port.unwrap_or(DEFAULT_ROBOT_PORT))
                .with_track(track);
            if let Some(rate) = sample_rate {
                source = source.with_sample_rate(rate);
            }
            Ok(Box::new(source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config: FrameSourceConfig =
            serde_json::from_str(r#"{"type":"websocket","url":"ws://127.0.0.1:8765"}"#).unwrap();
        assert!(matches!(config, FrameSourceConfig::WebSocket { ref url } if url == "ws://127.0.0.1:8765"));

        let config: FrameSourceConfig =
            serde_json::from_str(r#"{"type":"wav","path":"audio_test.wav"}"#).unwrap();
        match config {
            FrameSourceConfig::WavFile {
                loop_playback,
                chunk_ms,
                ..
            } => {
                assert!(loop_playback);
                assert_eq!(chunk_ms, None);
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_factory_builds_closed_sources() {
        let configs = vec![
            FrameSourceConfig::WavFile {
                path: PathBuf::from("missing.wav"),
                loop_playback: false,
                chunk_ms: Some(50),
            },
            FrameSourceConfig::WebSocket {
                url: "ws://127.0.0.1:1".to_string(),
            },
            FrameSourceConfig::Robot {
                host: "127.0.0.1".to_string(),
                port: None,
                track: AudioTrack::Speaker,
                sample_rate: None,
            },
        ];
        let kinds: Vec<String> = configs
            .into_iter()
            .map(|c| {
                let source = create_source(c).unwrap();
                assert!(!source.is_open());
                source.metadata().kind
            })
            .collect();
        assert_eq!(kinds, vec!["wav", "websocket", "robot"]);
    }
}

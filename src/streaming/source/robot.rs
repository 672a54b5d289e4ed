// Robot realtime-API audio source
//
// Connects to the robot's event WebSocket, asks it to start streaming audio
// and forwards every `response.audio.data` event into a MicrophoneSource.
// A listener task owns the socket; it stops on cancellation (sending the
// audio-stop request on its way out) or when the robot drops the connection.

use super::microphone::{AudioDataEvent, AudioTrack, MicrophoneFeed, MicrophoneSource};
use super::{FrameSource, SourceMetadata};
use crate::streaming::frame::Frame;
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Port of the robot realtime-API server
pub const DEFAULT_ROBOT_PORT: u16 = 9000;

const DEFAULT_SAMPLE_RATE: u32 = 16_000;
const EVENTS_PATH: &str = "/v1/events";
const AUDIO_DATA_EVENT: &str = "response.audio.data";
/// Frames buffered between the listener and the ingest loop
const FEED_CAPACITY: usize = 2_048;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

struct Listener {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct RobotEventSource {
    host: String,
    port: u16,
    track: AudioTrack,
    sample_rate: u32,
    inner: Option<MicrophoneSource>,
    listener: Option<Listener>,
}

impl RobotEventSource {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            track: AudioTrack::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            inner: None,
            listener: None,
        }
    }

    pub fn with_track(mut self, track: AudioTrack) -> Self {
        self.track = track;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, EVENTS_PATH)
    }

    fn start_request(&self) -> String {
        json!({
            "type": "request.audio.start",
            "sample_rate": self.sample_rate,
            "microphone": self.track == AudioTrack::Microphone,
            "speaker": self.track == AudioTrack::Speaker,
        })
        .to_string()
    }
}

fn stop_request() -> String {
    json!({ "type": "request.audio.stop" }).to_string()
}

/// Route one event-bus message to the feed
fn handle_event(feed: &MicrophoneFeed, text: &str) -> StreamResult<()> {
    let event: AudioDataEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            log::debug!("Ignoring unparseable robot event: {}", e);
            return Ok(());
        }
    };

    match event.event_type.as_deref() {
        Some(AUDIO_DATA_EVENT) => match feed.push_event(&event) {
            Ok(_) => Ok(()),
            Err(StreamError::MalformedFrame { .. }) => Ok(()),
            Err(e) => Err(e),
        },
        Some(other) => {
            log::debug!("Robot event: {}", other);
            Ok(())
        }
        None => Ok(()),
    }
}

async fn listen(mut ws: WsStream, feed: MicrophoneFeed, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(e) = ws.send(Message::text(stop_request())).await {
                    log::debug!("Failed to send audio stop request: {}", e);
                }
                ws.close(None).await.ok();
                log::info!("Robot event listener cancelled");
                break;
            }

            msg = ws.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                    Some(Ok(Message::Close(reason))) => {
                        log::info!("Robot closed the event stream: {:?}", reason);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::error!("Robot event stream error: {}", e);
                        break;
                    }
                    None => break,
                };

                if let Err(e) = handle_event(&feed, &text) {
                    log::info!("Robot audio consumer gone ({}), stopping listener", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl FrameSource for RobotEventSource {
    async fn open(&mut self) -> StreamResult<()> {
        if self.inner.is_some() {
            return Ok(());
        }

        let url = self.url();
        log::info!("Connecting to robot event stream: {}", url);

        let (mut ws, _) = connect_async(url.as_str()).await.map_err(|e| {
            StreamError::SourceUnavailable(format!("Robot at {} unreachable: {}", url, e))
        })?;

        ws.send(Message::text(self.start_request()))
            .await
            .map_err(|e| {
                StreamError::SourceUnavailable(format!("Audio start request failed: {}", e))
            })?;

        let (mut source, feed) = MicrophoneSource::new(FEED_CAPACITY, self.track);
        source = source.with_sample_rate(self.sample_rate);
        source.open().await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen(ws, feed, cancel.clone()));

        log::info!(
            "Robot audio streaming started ({:?} track @ {} Hz)",
            self.track,
            self.sample_rate
        );
        self.inner = Some(source);
        self.listener = Some(Listener { handle, cancel });
        Ok(())
    }

    async fn next_frame(&mut self) -> StreamResult<Frame> {
        let source = self
            .inner
            .as_mut()
            .ok_or_else(|| StreamError::SourceError("Robot source is not open".to_string()))?;

        match source.next_frame().await {
            Err(StreamError::EndOfStream) => Err(StreamError::SourceError(
                "Robot event stream closed".to_string(),
            )),
            other => other,
        }
    }

    async fn close(&mut self) -> StreamResult<()> {
        if let Some(listener) = self.listener.take() {
            listener.cancel.cancel();
            match timeout(SHUTDOWN_TIMEOUT, listener.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Robot listener task failed: {}", e),
                Err(_) => log::warn!("Robot listener did not stop in time"),
            }
        }
        if let Some(mut source) = self.inner.take() {
            source.close().await?;
            log::info!("Robot audio streaming stopped");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata::new("robot")
            .with_sample_rate(self.sample_rate)
            .with_property("url", self.url())
            .with_property("track", format!("{:?}", self.track).to_lowercase())
    }
}

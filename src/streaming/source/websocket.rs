// WebSocket frame source
//
// Connects to a WebSocket server that pushes one frame per message. Expected
// message payload: 4 bytes, two little-endian i16 (left, right). Payloads of
// any other length are replaced by (0, 0) and the stream continues.

use super::{FrameSource, SourceMetadata};
use crate::streaming::frame::Frame;
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketFrameSource {
    url: String,
    stream: Option<WsStream>,
    frames_received: u64,
    malformed_frames: u64,
}

impl WebSocketFrameSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
            frames_received: 0,
            malformed_frames: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    fn decode_payload(&mut self, payload: &[u8]) -> Frame {
        self.frames_received += 1;
        match Frame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.malformed_frames += 1;
                log::debug!("{} from {}, substituting silence", e, self.url);
                Frame::SILENCE
            }
        }
    }
}

#[async_trait]
impl FrameSource for WebSocketFrameSource {
    async fn open(&mut self) -> StreamResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        log::info!("Connecting to WebSocket: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            StreamError::SourceUnavailable(format!("WebSocket connection to {} failed: {}", self.url, e))
        })?;

        log::info!("WebSocket connected successfully");
        self.stream = Some(ws_stream);
        Ok(())
    }

    async fn next_frame(&mut self) -> StreamResult<Frame> {
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| StreamError::SourceError("WebSocket is not connected".to_string()))?;

            let payload = match stream.next().await {
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Handled automatically by the library
                    continue;
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(reason))) => {
                    log::info!("WebSocket closed by server: {:?}", reason);
                    self.stream = None;
                    return Err(StreamError::SourceError(
                        "WebSocket closed by server".to_string(),
                    ));
                }
                Some(Err(e)) => {
                    log::error!("WebSocket error: {}", e);
                    self.stream = None;
                    return Err(StreamError::SourceError(format!("WebSocket error: {}", e)));
                }
                None => {
                    self.stream = None;
                    return Err(StreamError::SourceError(
                        "WebSocket stream ended".to_string(),
                    ));
                }
            };

            return Ok(self.decode_payload(&payload));
        }
    }

    async fn close(&mut self) -> StreamResult<()> {
        if let Some(mut stream) = self.stream.take() {
            log::info!("Stopping WebSocket stream");
            // The peer may already be gone
            if let Err(e) = stream.close(None).await {
                log::debug!("WebSocket close handshake failed: {}", e);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata::new("websocket")
            .with_property("url", &self.url)
            .with_property("frames_received", self.frames_received)
            .with_property("malformed_frames", self.malformed_frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Serve one client with the given messages, then close
    async fn serve_once(messages: Vec<Message>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for m in messages {
                ws.send(m).await.unwrap();
            }
            ws.close(None).await.ok();
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_decodes_records_and_recovers_malformed() {
        let url = serve_once(vec![
            Message::binary(Frame::new(1000, -1000).to_bytes().to_vec()),
            Message::binary(vec![1u8, 2, 3]),
            Message::binary(Frame::new(-5, 7).to_bytes().to_vec()),
        ])
        .await;

        let mut source = WebSocketFrameSource::new(url);
        source.open().await.unwrap();
        assert!(source.is_open());

        assert_eq!(source.next_frame().await.unwrap(), Frame::new(1000, -1000));
        assert_eq!(source.next_frame().await.unwrap(), Frame::SILENCE);
        assert_eq!(source.next_frame().await.unwrap(), Frame::new(-5, 7));
        assert_eq!(source.malformed_frames(), 1);

        // Server closes after the last message
        let err = source.next_frame().await.unwrap_err();
        assert!(matches!(err, StreamError::SourceError(_)));
        assert!(!source.is_open());

        source.close().await.unwrap();
        source.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut source = WebSocketFrameSource::new(format!("ws://127.0.0.1:{}", port));
        let err = source.open().await.unwrap_err();
        assert!(matches!(err, StreamError::SourceUnavailable(_)));
    }
}

// Test tone WebSocket server
//
// Streams a sine tone to every connected client as 4-byte stereo frame
// records, one record per binary message, the format `WebSocketFrameSource`
// consumes. Frames are sent in small batches paced against the wall clock so
// the long-run rate matches the sample rate.

use crate::streaming::frame::Frame;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8765";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneConfig {
    pub frequency_hz: f64,
    pub amplitude: i16,
    pub sample_rate: u32,
    /// Send period; each period carries `sample_rate * batch_ms / 1000` frames
    pub batch_ms: u64,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 30000,
            sample_rate: 16_000,
            batch_ms: 10,
        }
    }
}

impl ToneConfig {
    fn frames_per_batch(&self) -> usize {
        ((self.sample_rate as u64 * self.batch_ms) / 1000).max(1) as usize
    }
}

/// Endless sine generator, identical on both channels
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    config: ToneConfig,
    index: u64,
}

impl ToneGenerator {
    pub fn new(config: ToneConfig) -> Self {
        Self { config, index: 0 }
    }
}

impl Iterator for ToneGenerator {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let t = self.index as f64 / self.config.sample_rate.max(1) as f64;
        self.index += 1;
        let sample = (self.config.amplitude as f64 * (TAU * self.config.frequency_hz * t).sin())
            .round() as i16;
        Some(Frame::mono(sample))
    }
}

pub struct ToneServer {
    listener: TcpListener,
    config: ToneConfig,
}

impl ToneServer {
    pub async fn bind(addr: &str, config: ToneConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn url(&self) -> io::Result<String> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    /// Accept clients until cancelled; each client gets its own tone task
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        log::info!(
            "Tone server listening on ws://{} ({} Hz @ {} Hz, amplitude {})",
            self.local_addr()?,
            self.config.frequency_hz,
            self.config.sample_rate,
            self.config.amplitude
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    log::info!("Tone server shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::info!("Tone client connected: {}", peer);
                            tokio::spawn(stream_tone(stream, self.config, cancel.child_token()));
                        }
                        Err(e) => log::warn!("Failed to accept tone client: {}", e),
                    }
                }
            }
        }
    }
}

async fn stream_tone(stream: TcpStream, config: ToneConfig, cancel: CancellationToken) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let mut tone = ToneGenerator::new(config);
    let batch = config.frames_per_batch();
    let mut ticker = interval(Duration::from_millis(config.batch_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                ws.close(None).await.ok();
                break;
            }

            _ = ticker.tick() => {
                let mut result = Ok(());
                for frame in tone.by_ref().take(batch) {
                    result = ws.feed(Message::binary(frame.to_bytes().to_vec())).await;
                    if result.is_err() {
                        break;
                    }
                }
                if let Err(e) = result.and(ws.flush().await) {
                    log::info!("Tone client disconnected: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_generator_shape() {
        let config = ToneConfig::default();
        let frames: Vec<Frame> = ToneGenerator::new(config).take(16_000).collect();

        assert_eq!(frames[0], Frame::SILENCE);
        assert!(frames.iter().all(|f| f.left == f.right));
        let peak = frames.iter().map(|f| f.left.unsigned_abs()).max().unwrap();
        assert!(peak <= 30000 && peak > 29_900);
        assert_eq!(config.frames_per_batch(), 160);
    }

    #[tokio::test]
    async fn test_clients_receive_frame_records() {
        let server = ToneServer::bind("127.0.0.1:0", ToneConfig::default())
            .await
            .unwrap();
        let url = server.url().unwrap();
        let cancel = CancellationToken::new();
        let serve = tokio::spawn(server.serve(cancel.clone()));

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let mut nonzero = 0;
        for _ in 0..200 {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    assert_eq!(data.len(), 4);
                    if !Frame::decode(&data).unwrap().is_silent() {
                        nonzero += 1;
                    }
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert!(nonzero > 150);

        cancel.cancel();
        serve.await.unwrap().unwrap();
    }
}

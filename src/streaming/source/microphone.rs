// Event-driven microphone source
//
// Audio arrives push-style: an event handler receives chunks of base64
// encoded 16-bit little-endian stereo PCM. A `MicrophoneFeed` decodes and
// demuxes each chunk into frames and pushes them into a bounded ring;
// `MicrophoneSource` pulls from that ring, giving push-style producers the
// same `FrameSource` interface as the file and WebSocket sources.
//
// When the ring is full the oldest queued frame is evicted (and counted), so
// the last frame of every chunk always reaches the ingest loop and a feed
// never blocks the event handler that calls it.

use super::{FrameSource, SourceMetadata};
use crate::streaming::frame::{demux_stereo, Frame};
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Which audio track of an audio-data event to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioTrack {
    /// What the robot says
    #[default]
    Speaker,
    /// What the robot hears
    Microphone,
}

/// An audio-data event as delivered by the robot event bus
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AudioDataEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,

    /// Base64 PCM of the speaker track
    #[serde(default)]
    pub speaker: Option<String>,

    /// Base64 PCM of the microphone track
    #[serde(default)]
    pub microphone: Option<String>,
}

impl AudioDataEvent {
    pub fn payload(&self, track: AudioTrack) -> Option<&str> {
        match track {
            AudioTrack::Speaker => self.speaker.as_deref(),
            AudioTrack::Microphone => self.microphone.as_deref(),
        }
    }
}

#[derive(Default)]
struct FeedCounters {
    chunks: AtomicU64,
    frames_pushed: AtomicU64,
    frames_dropped: AtomicU64,
    undecodable_chunks: AtomicU64,
}

/// State shared by the source and all of its feed handles
struct FeedShared {
    queue: ArrayQueue<Frame>,
    /// Wakes the single consumer; a permit is stored if it is not waiting yet
    notify: Notify,
    live_feeds: AtomicUsize,
    closed: AtomicBool,
    counters: FeedCounters,
}

impl FeedShared {
    /// Register another feed handle unless every handle is already gone
    fn attach(&self) -> bool {
        self.live_feeds
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }
}

/// Push handle for a [`MicrophoneSource`]
///
/// Cheap to clone. The source ends once every feed handle is dropped.
pub struct MicrophoneFeed {
    shared: Arc<FeedShared>,
    track: AudioTrack,
}

impl Clone for MicrophoneFeed {
    fn clone(&self) -> Self {
        self.shared.live_feeds.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
            track: self.track,
        }
    }
}

impl Drop for MicrophoneFeed {
    fn drop(&mut self) {
        if self.shared.live_feeds.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.notify.notify_one();
        }
    }
}

impl MicrophoneFeed {
    pub fn track(&self) -> AudioTrack {
        self.track
    }

    /// Handle one audio-data event; returns the number of frames queued
    pub fn push_event(&self, event: &AudioDataEvent) -> StreamResult<usize> {
        match event.payload(self.track) {
            Some(payload) => self.push_base64(payload),
            None => {
                log::debug!("Audio event without {:?} payload", self.track);
                Ok(0)
            }
        }
    }

    /// Decode a base64 PCM chunk and queue its frames
    pub fn push_base64(&self, payload: &str) -> StreamResult<usize> {
        let pcm = BASE64.decode(payload.trim()).map_err(|e| {
            self.shared
                .counters
                .undecodable_chunks
                .fetch_add(1, Ordering::Relaxed);
            log::warn!("Failed to decode audio chunk: {}", e);
            StreamError::MalformedFrame { len: payload.len() }
        })?;
        self.push_pcm(&pcm)
    }

    /// Queue the frames of a raw interleaved stereo PCM chunk, evicting the
    /// oldest queued frames when the ring is full
    pub fn push_pcm(&self, pcm: &[u8]) -> StreamResult<usize> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(StreamError::ChannelClosed);
        }
        shared.counters.chunks.fetch_add(1, Ordering::Relaxed);

        let mut pushed = 0;
        let mut evicted = 0;
        for frame in demux_stereo(pcm) {
            if shared.queue.force_push(frame).is_some() {
                evicted += 1;
            }
            pushed += 1;
        }

        if evicted > 0 {
            shared
                .counters
                .frames_dropped
                .fetch_add(evicted, Ordering::Relaxed);
            log::trace!("Microphone ring full, evicted {} stale frames", evicted);
        }
        shared
            .counters
            .frames_pushed
            .fetch_add(pushed as u64, Ordering::Relaxed);
        if pushed > 0 {
            shared.notify.notify_one();
        }
        Ok(pushed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.counters.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn frames_pushed(&self) -> u64 {
        self.shared.counters.frames_pushed.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

pub struct MicrophoneSource {
    shared: Arc<FeedShared>,
    track: AudioTrack,
    sample_rate: Option<u32>,
    is_open: bool,
}

impl MicrophoneSource {
    /// Create a source and its first feed handle. `capacity` bounds the frames
    /// waiting between the event handler and the ingest loop.
    pub fn new(capacity: usize, track: AudioTrack) -> (Self, MicrophoneFeed) {
        let shared = Arc::new(FeedShared {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            live_feeds: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            counters: FeedCounters::default(),
        });
        let source = Self {
            shared: Arc::clone(&shared),
            track,
            sample_rate: None,
            is_open: false,
        };
        let feed = MicrophoneFeed { shared, track };
        (source, feed)
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Another feed handle, if any handle is still alive
    pub fn feed(&self) -> Option<MicrophoneFeed> {
        self.shared.attach().then(|| MicrophoneFeed {
            shared: Arc::clone(&self.shared),
            track: self.track,
        })
    }

    fn has_feeds(&self) -> bool {
        self.shared.live_feeds.load(Ordering::Acquire) > 0
    }
}

#[async_trait]
impl FrameSource for MicrophoneSource {
    async fn open(&mut self) -> StreamResult<()> {
        if self.is_open {
            return Ok(());
        }
        if !self.has_feeds() && self.shared.queue.is_empty() {
            return Err(StreamError::SourceUnavailable(
                "No microphone feed attached".to_string(),
            ));
        }
        self.shared.closed.store(false, Ordering::Release);
        self.is_open = true;
        Ok(())
    }

    async fn next_frame(&mut self) -> StreamResult<Frame> {
        if !self.is_open {
            return Err(StreamError::SourceError(
                "Microphone source is not open".to_string(),
            ));
        }
        loop {
            if let Some(frame) = self.shared.queue.pop() {
                return Ok(frame);
            }
            if !self.has_feeds() {
                log::info!("All microphone feeds dropped");
                return Err(StreamError::EndOfStream);
            }
            self.shared.notify.notified().await;
        }
    }

    async fn close(&mut self) -> StreamResult<()> {
        if !self.is_open {
            return Ok(());
        }
        log::info!("Stopping microphone stream");
        self.shared.closed.store(true, Ordering::Release);
        self.is_open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn metadata(&self) -> SourceMetadata {
        let counters = &self.shared.counters;
        let mut metadata = SourceMetadata::new("microphone")
            .with_property("track", format!("{:?}", self.track).to_lowercase())
            .with_property("chunks", counters.chunks.load(Ordering::Relaxed))
            .with_property(
                "frames_dropped",
                counters.frames_dropped.load(Ordering::Relaxed),
            );
        if let Some(rate) = self.sample_rate {
            metadata = metadata.with_sample_rate(rate);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::ingest::IngestLoop;
    use crate::streaming::slot::FreshestSlot;
    use tokio_util::sync::CancellationToken;

    fn encode(frames: &[Frame]) -> String {
        let pcm: Vec<u8> = frames.iter().flat_map(|f| f.to_bytes()).collect();
        BASE64.encode(pcm)
    }

    #[tokio::test]
    async fn test_event_frames_come_out_in_order() {
        let (mut source, feed) = MicrophoneSource::new(16, AudioTrack::Speaker);
        source.open().await.unwrap();

        let event = AudioDataEvent {
            event_type: Some("response.audio.data".to_string()),
            speaker: Some(encode(&[Frame::new(1, 2), Frame::new(3, 4)])),
            microphone: None,
        };
        assert_eq!(feed.push_event(&event).unwrap(), 2);

        assert_eq!(source.next_frame().await.unwrap(), Frame::new(1, 2));
        assert_eq!(source.next_frame().await.unwrap(), Frame::new(3, 4));
    }

    #[tokio::test]
    async fn test_event_json_shape() {
        let json = format!(
            r#"{{"type":"response.audio.data","speaker":"{}"}}"#,
            encode(&[Frame::new(-7, 7)])
        );
        let event: AudioDataEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.event_type.as_deref(), Some("response.audio.data"));
        assert!(event.payload(AudioTrack::Microphone).is_none());

        let (mut source, feed) = MicrophoneSource::new(4, AudioTrack::Speaker);
        source.open().await.unwrap();
        feed.push_event(&event).unwrap();
        assert_eq!(source.next_frame().await.unwrap(), Frame::new(-7, 7));
    }

    #[tokio::test]
    async fn test_full_ring_evicts_oldest_frames() {
        let (mut source, feed) = MicrophoneSource::new(2, AudioTrack::Speaker);
        source.open().await.unwrap();
        let pushed = feed
            .push_base64(&encode(&[Frame::mono(1), Frame::mono(2), Frame::mono(3)]))
            .unwrap();
        assert_eq!(pushed, 3);
        assert_eq!(feed.frames_dropped(), 1);
        assert_eq!(feed.frames_pushed(), 3);

        assert_eq!(source.next_frame().await.unwrap(), Frame::mono(2));
        assert_eq!(source.next_frame().await.unwrap(), Frame::mono(3));
    }

    #[tokio::test]
    async fn test_burst_under_backpressure_delivers_freshest_to_slot() {
        let (mut source, feed) = MicrophoneSource::new(2, AudioTrack::Speaker);
        source.open().await.unwrap();
        for i in 1..=3 {
            feed.push_pcm(&Frame::mono(i).to_bytes()).unwrap();
        }

        let slot = Arc::new(FreshestSlot::new());
        let ingest = IngestLoop::new(Arc::clone(&slot), 8);
        let cancel = CancellationToken::new();
        let tasks = ingest.spawn(source, cancel.clone());

        for _ in 0..100 {
            if slot.read() == Some(Frame::mono(3)) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(slot.read(), Some(Frame::mono(3)));
        assert_eq!(feed.frames_dropped(), 1);

        cancel.cancel();
        tasks.drain.await.unwrap();
        tasks.pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_push() {
        let (mut source, feed) = MicrophoneSource::new(4, AudioTrack::Speaker);
        source.open().await.unwrap();

        let pending = tokio::spawn(async move { source.next_frame().await });
        tokio::task::yield_now().await;
        feed.push_pcm(&Frame::mono(42).to_bytes()).unwrap();

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::mono(42));
    }

    #[tokio::test]
    async fn test_bad_base64_is_local_error() {
        let (_source, feed) = MicrophoneSource::new(2, AudioTrack::Speaker);
        let err = feed.push_base64("not base64 !!").unwrap_err();
        assert!(matches!(err, StreamError::MalformedFrame { .. }));
        // The feed keeps working
        assert_eq!(feed.push_pcm(&Frame::mono(9).to_bytes()).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropping_feeds_ends_stream() {
        let (mut source, feed) = MicrophoneSource::new(4, AudioTrack::Microphone);
        source.open().await.unwrap();
        let second = source.feed().unwrap();
        feed.push_pcm(&Frame::mono(3).to_bytes()).unwrap();
        drop(feed);
        drop(second);

        assert_eq!(source.next_frame().await.unwrap(), Frame::mono(3));
        assert!(matches!(
            source.next_frame().await,
            Err(StreamError::EndOfStream)
        ));
        assert!(source.feed().is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_further_pushes() {
        let (mut source, feed) = MicrophoneSource::new(4, AudioTrack::Speaker);
        source.open().await.unwrap();
        source.close().await.unwrap();
        source.close().await.unwrap();
        assert!(matches!(
            feed.push_pcm(&Frame::mono(1).to_bytes()),
            Err(StreamError::ChannelClosed)
        ));
    }
}

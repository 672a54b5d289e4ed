// Ingest loop - moves frames from a source into the freshest slot
//
// Two tasks cooperate:
// - pump: awaits `next_frame()` and forwards each result into a bounded queue,
//   closing the source on every exit path
// - drain: waits for the first queued item, then drains the queue without
//   waiting, keeps only the last frame and writes it into the slot
//
// Bursts therefore cost one slot write, and a slow poller never sees more
// than the newest frame.

use crate::streaming::frame::Frame;
use crate::streaming::slot::FreshestSlot;
use crate::streaming::source::FrameSource;
use crate::streaming::types::{StreamError, StreamResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drain task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IngestState {
    /// Waiting for the first item of the next burst
    #[default]
    Idle,
    /// Emptying the queue
    Draining,
}

/// Why the drain task exited
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Cancelled,
    /// The pump went away without reporting an error
    ChannelClosed,
    /// Finite source ran out; the slot was reset to silence
    SourceEnded,
    /// Transport failure; the slot was reset to silence
    SourceFailed(String),
}

#[derive(Debug, Default)]
pub struct IngestStats {
    frames_received: AtomicU64,
    frames_coalesced: AtomicU64,
    bursts: AtomicU64,
}

impl IngestStats {
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Frames that were overwritten inside a burst before reaching the slot
    pub fn frames_coalesced(&self) -> u64 {
        self.frames_coalesced.load(Ordering::Relaxed)
    }

    pub fn bursts(&self) -> u64 {
        self.bursts.load(Ordering::Relaxed)
    }

    /// Zero every counter, for a new session
    pub fn reset(&self) {
        self.frames_received.store(0, Ordering::Relaxed);
        self.frames_coalesced.store(0, Ordering::Relaxed);
        self.bursts.store(0, Ordering::Relaxed);
    }

    fn record_burst(&self, frames: u64) {
        self.bursts.fetch_add(1, Ordering::Relaxed);
        self.frames_received.fetch_add(frames, Ordering::Relaxed);
        self.frames_coalesced
            .fetch_add(frames.saturating_sub(1), Ordering::Relaxed);
    }
}

/// Handles of a running ingest session
pub struct IngestTasks<S> {
    /// Resolves to the (closed) source once the pump exits
    pub pump: JoinHandle<S>,
    pub drain: JoinHandle<IngestOutcome>,
}

pub struct IngestLoop {
    slot: Arc<FreshestSlot<Frame>>,
    queue_capacity: usize,
    state: Arc<RwLock<IngestState>>,
    stats: Arc<IngestStats>,
}

impl IngestLoop {
    pub fn new(slot: Arc<FreshestSlot<Frame>>, queue_capacity: usize) -> Self {
        Self {
            slot,
            queue_capacity: queue_capacity.max(1),
            state: Arc::new(RwLock::new(IngestState::Idle)),
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn state(&self) -> IngestState {
        *self.state.read()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the pump and drain tasks for an already opened source
    pub fn spawn<S>(&self, source: S, cancel: CancellationToken) -> IngestTasks<S>
    where
        S: FrameSource + 'static,
    {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let pump = Self::spawn_pump(source, tx, cancel.clone());

        let drain = {
            let slot = Arc::clone(&self.slot);
            let state = Arc::clone(&self.state);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move { drain_loop(rx, slot, state, stats, cancel).await })
        };

        IngestTasks { pump, drain }
    }

    /// Spawn the task that forwards `next_frame()` results into `tx`
    ///
    /// Stops after forwarding a terminal error, when the receiver is gone, or
    /// on cancellation. The source is closed before the task returns it.
    pub fn spawn_pump<S>(
        mut source: S,
        tx: mpsc::Sender<StreamResult<Frame>>,
        cancel: CancellationToken,
    ) -> JoinHandle<S>
    where
        S: FrameSource + 'static,
    {
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        log::info!("Frame pump cancelled");
                        break;
                    }

                    item = source.next_frame() => item,
                };

                let terminal = match &item {
                    Ok(_) => false,
                    Err(e) if !e.is_terminal() => {
                        log::debug!("Recoverable source error: {}", e);
                        continue;
                    }
                    Err(_) => true,
                };

                let sent = tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        log::info!("Frame pump cancelled");
                        break;
                    }

                    sent = tx.send(item) => sent,
                };

                if sent.is_err() {
                    log::debug!("Ingest queue closed, stopping pump");
                    break;
                }
                if terminal {
                    break;
                }
            }

            if let Err(e) = source.close().await {
                log::warn!("Failed to close frame source: {}", e);
            }
            source
        })
    }

    /// Run the drain side on the current task until it exits
    pub async fn run(
        &self,
        rx: mpsc::Receiver<StreamResult<Frame>>,
        cancel: CancellationToken,
    ) -> IngestOutcome {
        drain_loop(
            rx,
            Arc::clone(&self.slot),
            Arc::clone(&self.state),
            Arc::clone(&self.stats),
            cancel,
        )
        .await
    }
}

async fn drain_loop(
    mut rx: mpsc::Receiver<StreamResult<Frame>>,
    slot: Arc<FreshestSlot<Frame>>,
    state: Arc<RwLock<IngestState>>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) -> IngestOutcome {
    let outcome = loop {
        *state.write() = IngestState::Idle;

        let first = tokio::select! {
            biased;

            _ = cancel.cancelled() => break IngestOutcome::Cancelled,

            item = rx.recv() => item,
        };

        let Some(first) = first else {
            break IngestOutcome::ChannelClosed;
        };

        *state.write() = IngestState::Draining;

        let mut latest = None;
        let mut count = 0u64;
        let mut failure = None;
        let mut next = Some(first);

        while let Some(item) = next.take() {
            match item {
                Ok(frame) => {
                    latest = Some(frame);
                    count += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            next = rx.try_recv().ok();
        }

        if let Some(frame) = latest {
            slot.write(frame);
            stats.record_burst(count);
        }

        if let Some(e) = failure {
            slot.reset_to(Frame::SILENCE);
            break match e {
                StreamError::EndOfStream => {
                    log::info!("Frame source ended, output reset to silence");
                    IngestOutcome::SourceEnded
                }
                e => {
                    log::error!("Frame source failed, output reset to silence: {}", e);
                    IngestOutcome::SourceFailed(e.to_string())
                }
            };
        }

        tokio::task::yield_now().await;
    };

    *state.write() = IngestState::Idle;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::{SourceMetadata, WavFileSource};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    /// Replays a script, then waits forever
    struct ScriptedSource {
        script: VecDeque<StreamResult<Frame>>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(script: Vec<StreamResult<Frame>>) -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    script: script.into(),
                    closed: Arc::clone(&closed),
                },
                closed,
            )
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn open(&mut self) -> StreamResult<()> {
            Ok(())
        }

        async fn next_frame(&mut self) -> StreamResult<Frame> {
            match self.script.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> StreamResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn metadata(&self) -> SourceMetadata {
            SourceMetadata::new("scripted")
        }
    }

    #[tokio::test]
    async fn test_burst_keeps_only_last_frame() {
        let slot = Arc::new(FreshestSlot::new());
        let ingest = IngestLoop::new(Arc::clone(&slot), 64);
        let (tx, rx) = mpsc::channel(64);
        for i in 1..=10 {
            tx.send(Ok(Frame::mono(i))).await.unwrap();
        }
        drop(tx);

        let outcome = ingest.run(rx, CancellationToken::new()).await;

        assert_eq!(outcome, IngestOutcome::ChannelClosed);
        assert_eq!(slot.read(), Some(Frame::mono(10)));
        // One slot write for the whole burst
        assert_eq!(slot.sequence(), 1);

        let stats = ingest.stats();
        assert_eq!(stats.frames_received(), 10);
        assert_eq!(stats.frames_coalesced(), 9);
        assert_eq!(stats.bursts(), 1);
        assert_eq!(ingest.state(), IngestState::Idle);
    }

    #[tokio::test]
    async fn test_source_error_resets_to_silence() {
        let slot = Arc::new(FreshestSlot::new());
        let ingest = IngestLoop::new(Arc::clone(&slot), 8);
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Frame::new(20000, -20000))).await.unwrap();
        tx.send(Err(StreamError::SourceError("reset by peer".into())))
            .await
            .unwrap();

        let outcome = ingest.run(rx, CancellationToken::new()).await;

        assert!(matches!(outcome, IngestOutcome::SourceFailed(ref m) if m.contains("reset by peer")));
        assert_eq!(slot.read(), Some(Frame::SILENCE));
    }

    #[tokio::test]
    async fn test_cancellation_leaves_slot_untouched() {
        let slot = Arc::new(FreshestSlot::new());
        slot.write(Frame::mono(1234));
        let ingest = IngestLoop::new(Arc::clone(&slot), 8);
        let (_tx, rx) = mpsc::channel::<StreamResult<Frame>>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ingest.run(rx, cancel).await;

        assert_eq!(outcome, IngestOutcome::Cancelled);
        assert_eq!(slot.read(), Some(Frame::mono(1234)));
        assert_eq!(slot.sequence(), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_source_and_silences() {
        let slot = Arc::new(FreshestSlot::new());
        let ingest = IngestLoop::new(Arc::clone(&slot), 8);
        let mut source =
            WavFileSource::from_frames(vec![Frame::mono(300), Frame::mono(400)], 8000, false);
        source.open().await.unwrap();

        let tasks = ingest.spawn(source, CancellationToken::new());
        assert_eq!(tasks.drain.await.unwrap(), IngestOutcome::SourceEnded);
        let source = tasks.pump.await.unwrap();

        assert!(!source.is_open());
        assert_eq!(slot.read(), Some(Frame::SILENCE));
        assert_eq!(ingest.stats().frames_received(), 2);
    }

    #[tokio::test]
    async fn test_cancel_closes_idle_source() {
        let slot = Arc::new(FreshestSlot::new());
        let ingest = IngestLoop::new(Arc::clone(&slot), 8);
        let (source, closed) = ScriptedSource::new(vec![
            Ok(Frame::mono(7)),
            Err(StreamError::MalformedFrame { len: 3 }),
            Ok(Frame::mono(8)),
        ]);
        let cancel = CancellationToken::new();
        let tasks = ingest.spawn(source, cancel.clone());

        // Wait until the script has been consumed
        for _ in 0..100 {
            if slot.read() == Some(Frame::mono(8)) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(slot.read(), Some(Frame::mono(8)));

        cancel.cancel();
        assert_eq!(tasks.drain.await.unwrap(), IngestOutcome::Cancelled);
        tasks.pump.await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(slot.read(), Some(Frame::mono(8)));
    }
}

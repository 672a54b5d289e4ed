// Pipeline controller - owns one frame-intensity session
//
// The controller manages:
// - Source lifecycle (open on start, closed by the pump on every exit path)
// - The freshest slot shared by the ingest tasks and the poller
// - Poller start/stop, independently of the source when needed
// - State tracking and event emission to the embedding application
// - Task cancellation via CancellationToken for graceful shutdown

use crate::config::PipelineConfig;
use crate::streaming::{
    frame::Frame,
    ingest::{IngestLoop, IngestOutcome},
    poller::{Poller, PollerState, TickReport},
    reducer::IntensityReducer,
    sink::{DisconnectedSerial, DisplaySink, LatestValueDisplay, SerialSink},
    slot::FreshestSlot,
    source::FrameSource,
    types::{PipelineState, PipelineStats, StreamError, StreamResult},
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type EventCallback = Arc<RwLock<Option<Box<dyn Fn(PipelineEvent) + Send + Sync>>>>;

/// Events emitted by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        pipeline_id: String,
        state: PipelineState,
    },
    /// The source failed or ended; consumers now see silence
    SourceFailed {
        pipeline_id: String,
        error: String,
    },
    /// A serial write failed and the serial sink was dropped
    SerialDisconnected {
        pipeline_id: String,
        error: String,
    },
}

pub struct IntensityPipeline {
    pub id: String,
    config: PipelineConfig,

    // Components
    source: Option<Box<dyn FrameSource>>,
    slot: Arc<FreshestSlot<Frame>>,
    ingest: IngestLoop,
    poller: Poller,

    // Running session
    pump: Option<JoinHandle<Box<dyn FrameSource>>>,
    watcher: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,

    // State
    state: Arc<RwLock<PipelineState>>,
    start_time: Option<Instant>,

    event_callback: EventCallback,
}

impl IntensityPipeline {
    /// Build a stopped pipeline around `source`
    ///
    /// Until sinks are attached the intensity goes to a `LatestValueDisplay`
    /// and the serial side is disconnected.
    pub fn new(config: PipelineConfig, source: Box<dyn FrameSource>) -> StreamResult<Self> {
        config.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        let slot = Arc::new(FreshestSlot::new());
        let ingest = IngestLoop::new(Arc::clone(&slot), config.queue_capacity);
        let event_callback: EventCallback = Arc::new(RwLock::new(None));

        let poller = build_poller(
            &id,
            &config,
            Arc::clone(&slot),
            Arc::new(LatestValueDisplay::new()),
            Arc::new(DisconnectedSerial),
            Arc::clone(&event_callback),
        );

        Ok(Self {
            id,
            config,
            source: Some(source),
            slot,
            ingest,
            poller,
            pump: None,
            watcher: None,
            cancel_token: CancellationToken::new(),
            state: Arc::new(RwLock::new(PipelineState::Idle)),
            start_time: None,
            event_callback,
        })
    }

    /// Replace the display consumer. Must be called before `start`.
    pub fn with_display(mut self, display: Arc<dyn DisplaySink>) -> Self {
        self.poller.stop();
        self.poller = build_poller(
            &self.id,
            &self.config,
            Arc::clone(&self.slot),
            display,
            Arc::new(DisconnectedSerial),
            Arc::clone(&self.event_callback),
        );
        self
    }

    /// Replace the serial consumer; takes effect on the next tick
    pub fn set_serial_sink(&self, serial: Arc<dyn SerialSink>) {
        self.poller.set_serial_sink(serial);
    }

    /// Set event callback function
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(PipelineEvent) + Send + Sync + 'static,
    {
        *self.event_callback.write() = Some(Box::new(callback));
    }

    fn set_state(&self, state: PipelineState) {
        set_state(&self.id, &self.state, &self.event_callback, state);
    }

    /// Open the source, start ingesting and start the poller
    pub async fn start(&mut self) -> StreamResult<()> {
        if self.pump.is_some() {
            return Err(StreamError::AlreadyRunning);
        }

        log::info!("Starting intensity pipeline: {}", self.id);

        let mut source = self.source.take().ok_or_else(|| {
            StreamError::SourceUnavailable("Source was lost by a previous session".to_string())
        })?;

        if let Err(e) = source.open().await {
            log::error!("Failed to open source: {}", e);
            self.source = Some(source);
            self.set_state(PipelineState::Failed {
                message: e.to_string(),
            });
            return Err(e);
        }

        let metadata = source.metadata();
        log::info!(
            "Source {} opened (sample rate: {})",
            metadata.kind,
            metadata
                .sample_rate
                .map(|r| format!("{} Hz", r))
                .unwrap_or_else(|| "unknown".to_string())
        );

        // Each session starts from "nothing received yet"
        self.slot.clear();
        self.ingest.stats().reset();
        self.poller.reset_counters();
        self.cancel_token = CancellationToken::new();

        let tasks = self.ingest.spawn(source, self.cancel_token.clone());
        self.pump = Some(tasks.pump);
        self.watcher = Some(self.spawn_watcher(tasks.drain));

        self.poller.start();
        self.start_time = Some(Instant::now());
        self.set_state(PipelineState::Running {
            started_at: chrono::Utc::now().timestamp() as f64,
        });

        log::info!("Intensity pipeline started successfully");
        Ok(())
    }

    /// Report source failures once the drain task exits on its own
    fn spawn_watcher(&self, drain: JoinHandle<IngestOutcome>) -> JoinHandle<()> {
        let id = self.id.clone();
        let state = Arc::clone(&self.state);
        let event_callback = Arc::clone(&self.event_callback);

        tokio::spawn(async move {
            let error = match drain.await {
                Ok(IngestOutcome::Cancelled) | Ok(IngestOutcome::ChannelClosed) => return,
                Ok(IngestOutcome::SourceEnded) => "Source reached end of stream".to_string(),
                Ok(IngestOutcome::SourceFailed(message)) => message,
                Err(e) => format!("Ingest task failed: {}", e),
            };

            if let Some(callback) = event_callback.read().as_ref() {
                callback(PipelineEvent::SourceFailed {
                    pipeline_id: id.clone(),
                    error: error.clone(),
                });
            }
            set_state(&id, &state, &event_callback, PipelineState::Failed { message: error });
        })
    }

    /// Stop ingesting and polling. The source is closed. Idempotent.
    pub async fn stop(&mut self) -> StreamResult<()> {
        let Some(pump) = self.pump.take() else {
            self.poller.stop();
            return Ok(());
        };

        log::info!("Stopping intensity pipeline: {}", self.id);

        // Interrupts the pump and the drain task at their next suspension point
        self.cancel_token.cancel();

        match pump.await {
            Ok(source) => self.source = Some(source),
            Err(e) => log::error!("Frame pump task failed, source dropped: {}", e),
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.await.ok();
        }

        self.poller.stop();
        self.start_time = None;
        self.set_state(PipelineState::Stopped);

        log::info!("Intensity pipeline stopped");
        Ok(())
    }

    pub fn start_polling(&self) {
        self.poller.start();
    }

    pub fn stop_polling(&self) {
        self.poller.stop();
    }

    pub fn polling_state(&self) -> PollerState {
        self.poller.state()
    }

    /// Run one poll cycle now, for hosts that drive their own timer
    pub fn tick(&self) -> TickReport {
        self.poller.tick()
    }

    /// Freshest frame received this session
    pub fn latest_frame(&self) -> Option<Frame> {
        self.slot.read()
    }

    pub fn reducer(&self) -> IntensityReducer {
        IntensityReducer::new(self.config.mode, self.config.clamp_ceiling)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Get the cancellation token for external cancellation support
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.pump.is_some()
    }

    pub fn stats(&self) -> PipelineStats {
        let ingest = self.ingest.stats();
        PipelineStats {
            frames_received: ingest.frames_received(),
            frames_coalesced: ingest.frames_coalesced(),
            bursts: ingest.bursts(),
            ticks: self.poller.ticks(),
            serial_writes: self.poller.serial_writes(),
            uptime_seconds: self.start_time.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

impl Drop for IntensityPipeline {
    fn drop(&mut self) {
        // The pump still closes the source when it observes the cancellation
        self.cancel_token.cancel();
        self.poller.stop();
        log::debug!("IntensityPipeline {} dropped", self.id);
    }
}

fn set_state(
    id: &str,
    state_lock: &RwLock<PipelineState>,
    event_callback: &EventCallback,
    state: PipelineState,
) {
    *state_lock.write() = state.clone();
    if let Some(callback) = event_callback.read().as_ref() {
        callback(PipelineEvent::StateChanged {
            pipeline_id: id.to_string(),
            state,
        });
    }
}

fn build_poller(
    id: &str,
    config: &PipelineConfig,
    slot: Arc<FreshestSlot<Frame>>,
    display: Arc<dyn DisplaySink>,
    serial: Arc<dyn SerialSink>,
    event_callback: EventCallback,
) -> Poller {
    let poller = Poller::new(
        slot,
        IntensityReducer::new(config.mode, config.clamp_ceiling),
        config.cadence(),
        display,
        serial,
    );

    let pipeline_id = id.to_string();
    poller.set_serial_lost_callback(move |error| {
        if let Some(callback) = event_callback.read().as_ref() {
            callback(PipelineEvent::SerialDisconnected {
                pipeline_id: pipeline_id.clone(),
                error: error.to_string(),
            });
        }
    });
    poller
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::WavFileSource;
    use parking_lot::Mutex;
    use tokio::time::{sleep, Duration};

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            cadence_ms: 10,
            ..Default::default()
        }
    }

    /// Poll `cond` for up to a second
    async fn wait_for(cond: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_start_stop_restart() {
        let display = Arc::new(LatestValueDisplay::new());
        let source = WavFileSource::from_frames(vec![Frame::new(16384, -16384)], 8000, true)
            .with_pacing(Some(5));
        let mut pipeline = IntensityPipeline::new(fast_config(), Box::new(source))
            .unwrap()
            .with_display(display.clone());
        assert_eq!(pipeline.state(), PipelineState::Idle);

        pipeline.start().await.unwrap();
        assert!(pipeline.is_running());
        assert!(matches!(pipeline.state(), PipelineState::Running { .. }));
        assert!(matches!(
            pipeline.start().await,
            Err(StreamError::AlreadyRunning)
        ));

        assert!(wait_for(|| display.value().is_some_and(|v| (v - 0.5).abs() < 1e-6)).await);
        assert!(pipeline.stats().frames_received > 0);

        pipeline.stop().await.unwrap();
        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(pipeline.polling_state(), PollerState::Stopped);
        // Stopping leaves the last value in place
        assert_eq!(pipeline.latest_frame(), Some(Frame::new(16384, -16384)));

        // Counters survive stop and cover only the current session
        let first_session = pipeline.stats();
        assert!(first_session.frames_received > 0);
        assert!(first_session.ticks > 0);

        pipeline.start().await.unwrap();
        assert!(pipeline.is_running());
        let second_session = pipeline.stats();
        assert_eq!(second_session.frames_received, 0);
        assert_eq!(second_session.ticks, 0);
        assert_eq!(pipeline.latest_frame(), None);
        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_source_does_not_start() {
        let mut pipeline = IntensityPipeline::new(
            fast_config(),
            Box::new(WavFileSource::new("/no/such/file.wav", true)),
        )
        .unwrap();

        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(err, StreamError::SourceUnavailable(_)));
        assert!(!pipeline.is_running());
        assert!(matches!(pipeline.state(), PipelineState::Failed { .. }));
        assert_eq!(pipeline.polling_state(), PollerState::Stopped);
    }

    #[tokio::test]
    async fn test_source_end_degrades_to_silence() {
        let display = Arc::new(LatestValueDisplay::new());
        let frames = vec![Frame::new(20000, 20000); 10];
        let mut pipeline = IntensityPipeline::new(
            fast_config(),
            Box::new(WavFileSource::from_frames(frames, 8000, false)),
        )
        .unwrap()
        .with_display(display.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        pipeline.set_event_callback(move |event| sink.lock().push(event));

        pipeline.start().await.unwrap();

        assert!(wait_for(|| matches!(pipeline.state(), PipelineState::Failed { .. })).await);
        assert_eq!(pipeline.latest_frame(), Some(Frame::SILENCE));
        assert!(wait_for(|| display.value() == Some(0.0)).await);

        // The poller keeps running on silence until stopped
        assert_eq!(pipeline.polling_state(), PollerState::Running);
        pipeline.stop().await.unwrap();

        let events = events.lock();
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::SourceFailed { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::StateChanged {
                state: PipelineState::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_manual_tick_before_any_frame() {
        let pipeline = IntensityPipeline::new(
            fast_config(),
            Box::new(WavFileSource::from_frames(Vec::new(), 8000, true)),
        )
        .unwrap();
        let report = pipeline.tick();
        assert_eq!(report.intensity, 0.0);
        assert_eq!(report.level, None);
        assert_eq!(pipeline.stats().ticks, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PipelineConfig {
            cadence_ms: 0,
            ..Default::default()
        };
        let result = IntensityPipeline::new(
            config,
            Box::new(WavFileSource::from_frames(Vec::new(), 8000, true)),
        );
        assert!(matches!(result, Err(StreamError::InvalidConfig(_))));
    }
}

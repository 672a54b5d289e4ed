// Fixed-cadence poller
//
// Every `cadence` the poller reads the freshest frame, reduces it to an
// intensity and hands it to the display sink (always) and the serial sink
// (when connected). A tick never awaits. Missed ticks are skipped rather than
// replayed, so a stalled runtime does not cause a catch-up burst of writes.

use crate::streaming::frame::Frame;
use crate::streaming::reducer::{to_serial_level, IntensityReducer};
use crate::streaming::sink::{DisplaySink, SerialSink};
use crate::streaming::slot::FreshestSlot;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PollerState {
    #[default]
    Stopped,
    Running,
}

/// What one tick observed and emitted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    /// Value given to the display sink
    pub intensity: f32,
    /// Level written to the serial sink, if a write was issued
    pub level: Option<u8>,
    /// Frame read from the slot (`None` if nothing was ever written)
    pub frame: Option<Frame>,
}

type SerialLostCallback = Box<dyn Fn(&str) + Send + Sync>;

struct PollerCore {
    slot: Arc<FreshestSlot<Frame>>,
    reducer: IntensityReducer,
    display: Arc<dyn DisplaySink>,
    serial: RwLock<Arc<dyn SerialSink>>,
    ticks: AtomicU64,
    serial_writes: AtomicU64,
    on_serial_lost: RwLock<Option<SerialLostCallback>>,
}

impl PollerCore {
    fn tick(&self) -> TickReport {
        let frame = self.slot.read();
        let intensity = frame
            .map(|f| self.reducer.reduce_frame(f))
            .unwrap_or(0.0);

        self.display.show(intensity);
        self.ticks.fetch_add(1, Ordering::Relaxed);

        // Nothing to report before the first frame arrives
        let level = match frame {
            Some(_) => self.send_serial(intensity),
            None => None,
        };

        TickReport {
            intensity,
            level,
            frame,
        }
    }

    fn send_serial(&self, intensity: f32) -> Option<u8> {
        let serial = Arc::clone(&*self.serial.read());
        if !serial.is_connected() {
            return None;
        }

        let level = to_serial_level(intensity);
        match serial.send_level(level) {
            Ok(()) => {
                self.serial_writes.fetch_add(1, Ordering::Relaxed);
                Some(level)
            }
            Err(e) => {
                log::warn!("Serial write failed, continuing without serial: {}", e);
                serial.disconnect();
                if let Some(callback) = self.on_serial_lost.read().as_ref() {
                    callback(&e.to_string());
                }
                None
            }
        }
    }
}

struct PollerTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct Poller {
    core: Arc<PollerCore>,
    cadence: Duration,
    task: Mutex<Option<PollerTask>>,
}

impl Poller {
    pub fn new(
        slot: Arc<FreshestSlot<Frame>>,
        reducer: IntensityReducer,
        cadence: Duration,
        display: Arc<dyn DisplaySink>,
        serial: Arc<dyn SerialSink>,
    ) -> Self {
        Self {
            core: Arc::new(PollerCore {
                slot,
                reducer,
                display,
                serial: RwLock::new(serial),
                ticks: AtomicU64::new(0),
                serial_writes: AtomicU64::new(0),
                on_serial_lost: RwLock::new(None),
            }),
            cadence,
            task: Mutex::new(None),
        }
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    /// Swap the serial consumer, e.g. after the user picks another port
    pub fn set_serial_sink(&self, serial: Arc<dyn SerialSink>) {
        let previous = std::mem::replace(&mut *self.core.serial.write(), serial);
        previous.disconnect();
    }

    /// Called with the error text when a serial write fails
    pub fn set_serial_lost_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.core.on_serial_lost.write() = Some(Box::new(callback));
    }

    /// Run one poll cycle on the calling thread
    pub fn tick(&self) -> TickReport {
        self.core.tick()
    }

    /// Start ticking every `cadence`. Starting a running poller is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let core = Arc::clone(&self.core);
        let cadence = self.cadence;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        log::debug!("Poller cancelled");
                        break;
                    }

                    _ = ticker.tick() => {
                        core.tick();
                    }
                }
            }
        });

        log::info!("Poller started ({} ms cadence)", cadence.as_millis());
        *task = Some(PollerTask { handle, cancel });
    }

    /// Stop ticking. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
            log::info!("Poller stopped");
        }
    }

    pub fn state(&self) -> PollerState {
        match self.task.lock().as_ref() {
            Some(t) if !t.handle.is_finished() => PollerState::Running,
            _ => PollerState::Stopped,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.core.ticks.load(Ordering::Relaxed)
    }

    pub fn serial_writes(&self) -> u64 {
        self.core.serial_writes.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.core.ticks.store(0, Ordering::Relaxed);
        self.core.serial_writes.store(0, Ordering::Relaxed);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

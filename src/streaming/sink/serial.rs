// Serial sink (Arduino)
//
// `send_level` never touches the port: it publishes the level on a watch
// channel that holds only the newest value. The writer task owns the port and
// writes whatever level is current once the previous write finished, so a
// stalled port skips stale levels instead of replaying them. The first write
// error marks the sink disconnected.

use super::{SerialEncoding, SerialSink};
use crate::streaming::types::{StreamError, StreamResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;

pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Names of the serial ports present on this machine
pub fn available_ports() -> StreamResult<Vec<String>> {
    tokio_serial::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| StreamError::SinkUnavailable(format!("Cannot list serial ports: {}", e)))
}

pub struct SerialPortSink {
    port_name: String,
    encoding: SerialEncoding,
    sender: Mutex<Option<watch::Sender<u8>>>,
    /// Set while a published level has not been picked up by the writer
    pending: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl SerialPortSink {
    /// Open `port` at `baud` and start the writer task. Needs a Tokio runtime.
    pub fn open(port: &str, baud: u32, encoding: SerialEncoding) -> StreamResult<Self> {
        log::info!("Opening serial port: {} at {} baud", port, baud);

        let stream = tokio_serial::new(port, baud)
            .open_native_async()
            .map_err(|e| {
                StreamError::SinkUnavailable(format!("Failed to open port {}: {}", port, e))
            })?;

        log::info!("Serial port {} opened", port);
        Ok(Self::from_writer(port, stream, encoding))
    }

    /// Drive any async writer as if it were a serial port
    pub fn from_writer<W>(name: &str, writer: W, encoding: SerialEncoding) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = watch::channel(0u8);
        let pending = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));
        let writes = Arc::new(AtomicU64::new(0));

        tokio::spawn(write_loop(
            name.to_string(),
            writer,
            encoding,
            rx,
            Arc::clone(&pending),
            Arc::clone(&connected),
            Arc::clone(&writes),
        ));

        Self {
            port_name: name.to_string(),
            encoding,
            sender: Mutex::new(Some(tx)),
            pending,
            connected,
            writes,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn encoding(&self) -> SerialEncoding {
        self.encoding
    }

    /// Levels that reached the port
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Levels superseded by a newer one before the writer got to them
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn write_loop<W>(
    name: String,
    mut writer: W,
    encoding: SerialEncoding,
    mut rx: watch::Receiver<u8>,
    pending: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while rx.changed().await.is_ok() {
        let level = *rx.borrow_and_update();
        pending.store(false, Ordering::Release);
        let bytes = encoding.encode(level);

        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            log::error!("Serial write to {} failed, disconnecting: {}", name, e);
            connected.store(false, Ordering::Relaxed);
            break;
        }
        writes.fetch_add(1, Ordering::Relaxed);
    }

    connected.store(false, Ordering::Relaxed);
    log::info!("Serial writer for {} stopped", name);
}

impl SerialSink for SerialPortSink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn send_level(&self, level: u8) -> StreamResult<()> {
        if !self.is_connected() {
            return Err(StreamError::SinkUnavailable(format!(
                "{} is not connected",
                self.port_name
            )));
        }

        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(StreamError::SinkUnavailable(format!(
                "{} is not connected",
                self.port_name
            )));
        };

        if sender.send(level).is_err() {
            self.connected.store(false, Ordering::Relaxed);
            return Err(StreamError::SinkUnavailable(format!(
                "Writer for {} has stopped",
                self.port_name
            )));
        }
        if self.pending.swap(true, Ordering::AcqRel) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Serial writer busy, level {} replaces an unsent one", level);
        }
        Ok(())
    }

    fn disconnect(&self) {
        // Dropping the sender ends the writer task, which releases the port
        if self.sender.lock().take().is_some() {
            log::info!("Disconnecting serial port {}", self.port_name);
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for SerialPortSink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Stand-in used when no port was selected
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedSerial;

impl SerialSink for DisconnectedSerial {
    fn is_connected(&self) -> bool {
        false
    }

    fn send_level(&self, _level: u8) -> StreamResult<()> {
        Err(StreamError::SinkUnavailable("No serial port selected".to_string()))
    }

    fn disconnect(&self) {}
}

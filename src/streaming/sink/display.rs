// Display sinks

use super::DisplaySink;
use crate::streaming::slot::FreshestSlot;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Keeps the last shown value for an embedding UI to pick up
#[derive(Debug, Default)]
pub struct LatestValueDisplay {
    value: FreshestSlot<f32>,
    updates: AtomicU64,
}

impl LatestValueDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last shown value, `None` before the first tick
    pub fn value(&self) -> Option<f32> {
        self.value.read()
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl DisplaySink for LatestValueDisplay {
    fn show(&self, intensity: f32) {
        self.value.write(intensity);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
}

/// Text level bar redrawn in place, e.g. `[########            ]  0.40`
pub fn render_level_bar(intensity: f32, width: usize) -> String {
    let clamped = if intensity.is_nan() {
        0.0
    } else {
        intensity.clamp(0.0, 1.0)
    };
    let filled = ((clamped * width as f32).round() as usize).min(width);
    format!(
        "[{}{}] {:5.2}",
        "#".repeat(filled),
        " ".repeat(width - filled),
        clamped
    )
}

/// Draws a level bar on a terminal, one carriage-return redraw per tick
pub struct LevelBarDisplay {
    width: usize,
    out: Mutex<Box<dyn Write + Send>>,
}

impl LevelBarDisplay {
    pub fn new(out: Box<dyn Write + Send>, width: usize) -> Self {
        Self {
            width: width.max(1),
            out: Mutex::new(out),
        }
    }

    pub fn stderr(width: usize) -> Self {
        Self::new(Box::new(io::stderr()), width)
    }
}

impl DisplaySink for LevelBarDisplay {
    fn show(&self, intensity: f32) {
        let line = render_level_bar(intensity, self.width);
        let mut out = self.out.lock();
        // A broken terminal must not take the pipeline down
        if write!(out, "\r{}", line).and_then(|_| out.flush()).is_err() {
            log::trace!("Level bar redraw failed");
        }
    }
}

// WAV playback frame source
//
// Loads a WAV file into memory on open and hands out one stereo frame per
// call, useful for:
// - Testing the pipeline without a network peer
// - Replaying recorded sessions to the display and the Arduino
//
// With looping enabled the position wraps back to frame 0 at the end of the
// buffer; otherwise the end of the buffer is `EndOfStream`. Optional pacing
// releases frames in chunks of `sample_rate * chunk_ms / 1000`, one chunk per
// `chunk_ms`, so the file plays back in real time.

use super::{FrameSource, SourceMetadata};
use crate::streaming::frame::Frame;
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::time::{sleep_until, Duration, Instant};

/// Sample rate assumed for in-memory buffers when none is given
const DEFAULT_SAMPLE_RATE: u32 = 44_100;

enum Origin {
    File(PathBuf),
    Memory,
}

struct Pacing {
    chunk_ms: u64,
    chunk_frames: usize,
    period: Duration,
    released: usize,
    next_release: Instant,
}

impl Pacing {
    fn new(chunk_ms: u64, sample_rate: u32) -> Self {
        let chunk_frames = ((sample_rate as u64 * chunk_ms) / 1000).max(1) as usize;
        let period = Duration::from_millis(chunk_ms);
        Self {
            chunk_ms,
            chunk_frames,
            period,
            released: 0,
            next_release: Instant::now() + period,
        }
    }
}

pub struct WavFileSource {
    origin: Origin,
    loop_playback: bool,
    chunk_ms: Option<u64>,
    pacing: Option<Pacing>,
    frames: Vec<Frame>,
    sample_rate: u32,
    position: usize,
    is_open: bool,
}

impl WavFileSource {
    pub fn new(path: impl Into<PathBuf>, loop_playback: bool) -> Self {
        Self {
            origin: Origin::File(path.into()),
            loop_playback,
            chunk_ms: None,
            pacing: None,
            frames: Vec::new(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            position: 0,
            is_open: false,
        }
    }

    /// A source over frames already in memory
    pub fn from_frames(frames: Vec<Frame>, sample_rate: u32, loop_playback: bool) -> Self {
        Self {
            origin: Origin::Memory,
            loop_playback,
            chunk_ms: None,
            pacing: None,
            frames,
            sample_rate,
            position: 0,
            is_open: false,
        }
    }

    /// Release frames in real time, one chunk every `chunk_ms` (None = as fast as consumed)
    pub fn with_pacing(mut self, chunk_ms: Option<u64>) -> Self {
        self.chunk_ms = chunk_ms.filter(|ms| *ms > 0);
        self
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn take_frame(&mut self) -> StreamResult<Frame> {
        if self.frames.is_empty() {
            return Err(StreamError::EndOfStream);
        }
        if self.position >= self.frames.len() {
            if self.loop_playback {
                self.position = 0;
            } else {
                return Err(StreamError::EndOfStream);
            }
        }
        let frame = self.frames[self.position];
        self.position += 1;
        Ok(frame)
    }
}

/// Read a WAV file into stereo 16-bit frames
///
/// Mono files are duplicated onto both channels, files with more than two
/// channels keep the first two. Integer samples of other bit depths are
/// rescaled to 16 bits and float samples are scaled by 32767.
pub fn read_wav_frames(path: &Path) -> Result<(Vec<Frame>, u32), hound::Error> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample == 16 => {
            reader.samples::<i16>().collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample as i32;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| {
                        if bits > 16 {
                            (v >> (bits - 16)) as i16
                        } else {
                            (v << (16 - bits)) as i16
                        }
                    })
                })
                .collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v * 32767.0).clamp(-32768.0, 32767.0) as i16))
            .collect::<Result<_, _>>()?,
    };

    let frames = samples
        .chunks_exact(channels)
        .map(|ch| match ch {
            [mono] => Frame::mono(*mono),
            [left, right, ..] => Frame::new(*left, *right),
            [] => Frame::SILENCE,
        })
        .collect();

    Ok((frames, spec.sample_rate))
}

#[async_trait]
impl FrameSource for WavFileSource {
    async fn open(&mut self) -> StreamResult<()> {
        if self.is_open {
            return Ok(());
        }

        if let Origin::File(path) = &self.origin {
            let path = path.clone();
            let display = path.display().to_string();
            let (frames, sample_rate) =
                tokio::task::spawn_blocking(move || read_wav_frames(&path))
                    .await
                    .map_err(|e| StreamError::SourceUnavailable(format!("WAV loader failed: {}", e)))?
                    .map_err(|e| {
                        StreamError::SourceUnavailable(format!("Cannot read {}: {}", display, e))
                    })?;

            log::info!(
                "Loaded WAV source {} ({} frames @ {} Hz)",
                display,
                frames.len(),
                sample_rate
            );
            self.frames = frames;
            self.sample_rate = sample_rate;
        }

        self.position = 0;
        self.pacing = self
            .chunk_ms
            .map(|chunk_ms| Pacing::new(chunk_ms, self.sample_rate));
        self.is_open = true;
        Ok(())
    }

    async fn next_frame(&mut self) -> StreamResult<Frame> {
        if !self.is_open {
            return Err(StreamError::SourceError("WAV source is not open".to_string()));
        }

        if let Some(pacing) = self.pacing.as_mut() {
            if pacing.released == pacing.chunk_frames {
                sleep_until(pacing.next_release).await;
                pacing.next_release += pacing.period;
                pacing.released = 0;
            }
            pacing.released += 1;
        }

        self.take_frame()
    }

    async fn close(&mut self) -> StreamResult<()> {
        if !self.is_open {
            return Ok(());
        }
        log::info!("Closing WAV source");
        self.is_open = false;
        self.position = 0;
        self.pacing = None;
        if let Origin::File(_) = self.origin {
            self.frames = Vec::new();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }

    fn metadata(&self) -> SourceMetadata {
        let mut metadata = SourceMetadata::new("wav")
            .with_sample_rate(self.sample_rate)
            .with_property("loop_playback", self.loop_playback)
            .with_property("frames", self.frames.len());
        if let Origin::File(path) = &self.origin {
            metadata = metadata.with_property("file_path", path.display());
        }
        if let Some(pacing) = &self.pacing {
            metadata = metadata
                .with_property("chunk_ms", pacing.chunk_ms)
                .with_property("chunk_frames", pacing.chunk_frames);
        }
        metadata
    }
}

// Stereo frame and its binary wire record
//
// Record layout: two little-endian signed 16-bit integers, left then right.

use crate::streaming::types::{StreamError, StreamResult};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size in bytes of one encoded frame record
pub const FRAME_RECORD_LEN: usize = 4;

/// One stereo sample pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Frame {
    pub left: i16,
    pub right: i16,
}

impl Frame {
    /// `(0, 0)`, also used as the sentinel for malformed records
    pub const SILENCE: Frame = Frame { left: 0, right: 0 };

    pub const fn new(left: i16, right: i16) -> Self {
        Self { left, right }
    }

    /// Same sample on both channels
    pub const fn mono(sample: i16) -> Self {
        Self {
            left: sample,
            right: sample,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.left == 0 && self.right == 0
    }

    pub fn to_bytes(self) -> [u8; FRAME_RECORD_LEN] {
        let mut buf = [0u8; FRAME_RECORD_LEN];
        LittleEndian::write_i16(&mut buf[0..2], self.left);
        LittleEndian::write_i16(&mut buf[2..4], self.right);
        buf
    }

    pub fn from_bytes(bytes: [u8; FRAME_RECORD_LEN]) -> Self {
        Self {
            left: LittleEndian::read_i16(&bytes[0..2]),
            right: LittleEndian::read_i16(&bytes[2..4]),
        }
    }

    /// Decode a record, rejecting anything that is not exactly 4 bytes
    pub fn decode(record: &[u8]) -> StreamResult<Self> {
        if record.len() != FRAME_RECORD_LEN {
            return Err(StreamError::MalformedFrame { len: record.len() });
        }
        Ok(Self {
            left: LittleEndian::read_i16(&record[0..2]),
            right: LittleEndian::read_i16(&record[2..4]),
        })
    }

    /// Decode a record, substituting [`Frame::SILENCE`] for malformed input
    pub fn decode_or_silence(record: &[u8]) -> Self {
        match Self::decode(record) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("{}, substituting silence", e);
                Self::SILENCE
            }
        }
    }
}

impl From<(i16, i16)> for Frame {
    fn from((left, right): (i16, i16)) -> Self {
        Self { left, right }
    }
}

impl From<Frame> for (i16, i16) {
    fn from(frame: Frame) -> Self {
        (frame.left, frame.right)
    }
}

/// Split interleaved 16-bit little-endian stereo PCM into frames.
///
/// Trailing bytes that do not make up a whole frame are dropped.
pub fn demux_stereo(pcm: &[u8]) -> Vec<Frame> {
    pcm.chunks_exact(FRAME_RECORD_LEN)
        .map(|chunk| Frame {
            left: LittleEndian::read_i16(&chunk[0..2]),
            right: LittleEndian::read_i16(&chunk[2..4]),
        })
        .collect()
}

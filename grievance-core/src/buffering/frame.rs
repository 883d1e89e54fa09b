//! Fixed-geometry PCM frames and the slicer that cuts them out of a byte stream.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GrievanceError, Result};

/// Frames are always signed 16-bit little-endian PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Output geometry every frame handed to a sink must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameGeometry {
    /// Output sample rate in Hz. Default: 48000.
    pub sample_rate: u32,
    /// Interleaved channel count. Default: 1.
    pub channels: u16,
    /// Pacing interval per frame. Default: 10 ms.
    pub frame_duration_ms: u32,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            frame_duration_ms: 10,
        }
    }
}

impl FrameGeometry {
    pub fn new(sample_rate: u32, channels: u16, frame_duration_ms: u32) -> Self {
        Self {
            sample_rate,
            channels,
            frame_duration_ms,
        }
    }

    /// Samples per channel in one full frame (480 for 10 ms @ 48 kHz).
    pub fn samples_per_channel(&self) -> usize {
        (self.sample_rate as u64 * self.frame_duration_ms as u64 / 1000) as usize
    }

    /// Byte length of one full frame (960 for 10 ms @ 48 kHz mono).
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_channel() * self.channels as usize * BYTES_PER_SAMPLE
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }

    /// Reject geometries that would produce empty frames.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.frame_duration_ms == 0 {
            return Err(GrievanceError::Config(format!(
                "frame geometry must be non-zero: {self:?}"
            )));
        }
        if self.frame_bytes() == 0 {
            return Err(GrievanceError::Config(format!(
                "frame duration {} ms too short for {} Hz",
                self.frame_duration_ms, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// One chunk of interleaved s16le PCM, written to a sink as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_channel: usize,
}

impl PcmFrame {
    /// Wrap `data` as a frame of `geometry`. `samples_per_channel` is derived
    /// from the byte length, so a short tail frame reports its real size.
    pub fn new(data: Vec<u8>, geometry: &FrameGeometry) -> Self {
        let stride = geometry.channels.max(1) as usize * BYTES_PER_SAMPLE;
        Self {
            samples_per_channel: data.len() / stride,
            data,
            sample_rate: geometry.sample_rate,
            channels: geometry.channels,
        }
    }

    /// A full frame of digital silence.
    pub fn silence(geometry: &FrameGeometry) -> Self {
        Self::new(vec![0u8; geometry.frame_bytes()], geometry)
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Real-time duration of the audio this frame carries.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples_per_channel as f64 / self.sample_rate as f64)
    }

    /// Interleaved samples decoded from the little-endian payload.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }
}

/// What to do with the final, shorter-than-configured frame of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailPolicy {
    /// Emit it unpadded; total frame bytes equal total decoded bytes.
    #[default]
    Keep,
    /// Zero-pad it to a full frame.
    Pad,
    /// Discard it.
    Drop,
}

/// Cuts a continuous s16le byte stream into full frames.
///
/// Bytes that do not fill a frame stay buffered until the next `push`, or
/// until `finish` applies the `TailPolicy`.
#[derive(Debug)]
pub struct FrameSlicer {
    geometry: FrameGeometry,
    policy: TailPolicy,
    buf: Vec<u8>,
}

impl FrameSlicer {
    pub fn new(geometry: FrameGeometry, policy: TailPolicy) -> Self {
        Self {
            buf: Vec::with_capacity(geometry.frame_bytes() * 2),
            geometry,
            policy,
        }
    }

    /// Append bytes and move every completed frame into `out`.
    pub fn push(&mut self, bytes: &[u8], out: &mut VecDeque<PcmFrame>) {
        self.buf.extend_from_slice(bytes);
        let frame_bytes = self.geometry.frame_bytes();
        let full = self.buf.len() / frame_bytes;
        if full == 0 {
            return;
        }
        for chunk in self.buf[..full * frame_bytes].chunks_exact(frame_bytes) {
            out.push_back(PcmFrame::new(chunk.to_vec(), &self.geometry));
        }
        self.buf.drain(..full * frame_bytes);
    }

    /// Flush the remainder according to the tail policy.
    pub fn finish(&mut self) -> Option<PcmFrame> {
        if self.buf.is_empty() {
            return None;
        }
        let mut tail = std::mem::take(&mut self.buf);
        match self.policy {
            TailPolicy::Keep => Some(PcmFrame::new(tail, &self.geometry)),
            TailPolicy::Pad => {
                tail.resize(self.geometry.frame_bytes(), 0);
                Some(PcmFrame::new(tail, &self.geometry))
            }
            TailPolicy::Drop => None,
        }
    }

    /// Bytes currently waiting for a full frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

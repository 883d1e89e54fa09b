//! Audio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Cue assets arrive at whatever rate they were authored at (commonly
//! 44.1 kHz MP3s). The output sink wants one fixed rate, 48 kHz by default.
//! `RateConverter` bridges that gap on the decode thread.
//!
//! When source rate == target rate, `RateConverter` is a passthrough and no
//! rubato session is created at all.
//!
//! ## Usage
//!
//! ```ignore
//! let mut rc = RateConverter::new(44_100, 48_000, 1024)?;
//! let mut out = rc.process(&mono_samples);
//! out.extend(rc.flush()); // end of asset
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{GrievanceError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer for partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `source_rate`: Sample rate of the decoded asset (Hz).
    /// - `target_rate`: Sample rate of the output frames (Hz).
    /// - `chunk_size`: Input frame count per rubato call (e.g. `1024`).
    ///
    /// # Errors
    /// Returns `GrievanceError::Resample` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(GrievanceError::Resample(format!(
                "invalid rates: {source_rate} -> {target_rate}"
            )));
        }

        let ratio = target_rate as f64 / source_rate as f64;

        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| GrievanceError::Resample(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(source_rate, target_rate, chunk_size, max_out, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call or for
    /// `flush`.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Drain the partial chunk left over at end of stream.
    ///
    /// rubato zero-pads the partial block; the output is trimmed to the
    /// length the real input maps to at the target rate.
    pub fn flush(&mut self) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return Vec::new();
        };
        if self.input_buf.is_empty() {
            return Vec::new();
        }

        let remaining = self.input_buf.len();
        let expected = (remaining as f64 * self.ratio).round() as usize;
        let wave_in: [&[f32]; 1] = [&self.input_buf[..]];

        let out = match resampler.process_partial_into_buffer(
            Some(&wave_in[..]),
            &mut self.output_buf,
            None,
        ) {
            Ok((_consumed, produced)) => {
                self.output_buf[0][..produced.min(expected)].to_vec()
            }
            Err(e) => {
                error!("resampler flush error: {e}");
                Vec::new()
            }
        };
        self.input_buf.clear();
        out
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(48_000, 48_000, 1024).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let out = rc.process(&samples);
        assert_eq!(out, samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(RateConverter::new(0, 48_000, 1024).is_err());
    }

    #[test]
    fn ratio_16k_to_48k_triples_length() {
        let mut rc = RateConverter::new(16_000, 48_000, 320).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 320]);
        assert!(!out.is_empty(), "expected non-empty output");
        assert!(
            (out.len() as isize - 960).unsigned_abs() <= 10,
            "output len={} expected≈960",
            out.len()
        );
    }

    #[test]
    fn partial_accumulation_returns_empty_until_flush() {
        let mut rc = RateConverter::new(44_100, 48_000, 1024).unwrap();
        let out = rc.process(&vec![0.0f32; 500]);
        assert!(out.is_empty(), "partial chunk produced {} samples", out.len());

        let tail = rc.flush();
        let expected = (500.0 * 48_000.0 / 44_100.0f64).round() as usize;
        assert!(
            (tail.len() as isize - expected as isize).unsigned_abs() <= 2,
            "flush len={} expected≈{}",
            tail.len(),
            expected
        );
        assert!(rc.flush().is_empty(), "second flush must be empty");
    }

    #[test]
    fn multiple_partial_chunks_accumulate() {
        let mut rc = RateConverter::new(44_100, 48_000, 1024).unwrap();
        assert!(rc.process(&vec![0.0f32; 600]).is_empty());
        let out2 = rc.process(&vec![0.0f32; 600]);
        assert!(!out2.is_empty(), "second push should trigger processing");
    }
}

//! `WavFileSink`: records everything the bot says to a 16-bit WAV file.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::OutputSink;
use crate::{
    buffering::{FrameGeometry, PcmFrame},
    error::{GrievanceError, Result},
};

pub struct WavFileSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    geometry: FrameGeometry,
    path: PathBuf,
    frames_written: usize,
}

impl WavFileSink {
    /// Create (or truncate) `path` as a WAV file matching `geometry`.
    pub fn create(path: impl AsRef<Path>, geometry: FrameGeometry) -> Result<Self> {
        geometry.validate()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let spec = hound::WavSpec {
            channels: geometry.channels,
            sample_rate: geometry.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)
            .map_err(|e| GrievanceError::Sink(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "recording cue output to wav");
        Ok(Self {
            writer: Some(writer),
            geometry,
            path: path.to_path_buf(),
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    /// Write the final header. Further writes fail.
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| GrievanceError::Sink(format!("{}: {e}", self.path.display())))?;
        }
        Ok(())
    }
}

impl OutputSink for WavFileSink {
    fn write_frame(&mut self, frame: &PcmFrame) -> Result<()> {
        if frame.sample_rate != self.geometry.sample_rate
            || frame.channels != self.geometry.channels
        {
            return Err(GrievanceError::Sink(format!(
                "frame geometry {} Hz x{} does not match {} Hz x{}",
                frame.sample_rate, frame.channels, self.geometry.sample_rate, self.geometry.channels
            )));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| GrievanceError::Sink("wav sink already finalized".into()))?;
        for sample in frame.samples() {
            writer
                .write_sample(sample)
                .map_err(|e| GrievanceError::Sink(e.to_string()))?;
        }
        self.frames_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| GrievanceError::Sink(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for WavFileSink {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!("wav sink finalize on drop failed: {e}");
        }
    }
}

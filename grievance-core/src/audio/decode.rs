//! `FrameDecoder`: a compressed cue asset in, fixed-geometry PCM frames out.
//!
//! ```text
//! file ─► symphonia probe/decode ─► f32 downmix ─► RateConverter ─► s16le ─► FrameSlicer ─► PcmFrame
//! ```
//!
//! The sequence is lazy (one packet is decoded per refill), finite and not
//! restartable. Open failures are `AssetNotFound` or `Decode`; a failure in
//! the middle of the stream is yielded once as `Err` and ends the sequence.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{FrameGeometry, FrameSlicer, PcmFrame, TailPolicy},
    error::{GrievanceError, Result},
};

/// Input samples per rubato call.
const RESAMPLE_CHUNK: usize = 1024;

/// Streaming decoder for one asset.
pub struct FrameDecoder {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    geometry: FrameGeometry,
    resampler: RateConverter,
    slicer: FrameSlicer,
    ready: VecDeque<PcmFrame>,
    decoded_bytes: usize,
    finished: bool,
}

impl FrameDecoder {
    /// Open `path` and prepare to decode it into frames of `geometry`.
    ///
    /// # Errors
    /// - `GrievanceError::AssetNotFound` if the file does not exist.
    /// - `GrievanceError::Decode` if the container or codec is not supported.
    pub fn open(
        path: impl AsRef<Path>,
        geometry: FrameGeometry,
        tail: TailPolicy,
    ) -> Result<Self> {
        let path = path.as_ref();
        geometry.validate()?;

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GrievanceError::AssetNotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| GrievanceError::Decode(format!("{}: {e}", path.display())))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| {
                GrievanceError::Decode(format!("{}: no decodable audio track", path.display()))
            })?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let source_rate = codec_params.sample_rate.ok_or_else(|| {
            GrievanceError::Decode(format!("{}: unknown sample rate", path.display()))
        })?;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| GrievanceError::Decode(format!("{}: {e}", path.display())))?;

        let resampler = RateConverter::new(source_rate, geometry.sample_rate, RESAMPLE_CHUNK)?;

        debug!(
            path = %path.display(),
            source_rate,
            target_rate = geometry.sample_rate,
            target_channels = geometry.channels,
            "cue asset opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            geometry,
            resampler,
            slicer: FrameSlicer::new(geometry, tail),
            ready: VecDeque::new(),
            decoded_bytes: 0,
            finished: false,
        })
    }

    /// Total PCM bytes produced so far, before slicing and tail handling.
    pub fn decoded_bytes(&self) -> usize {
        self.decoded_bytes
    }

    /// Decode one more packet into `ready`, or finish the stream.
    fn refill(&mut self) -> Result<()> {
        let packet = match self.format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.finish_stream();
                return Ok(());
            }
            Err(SymphoniaError::ResetRequired) => {
                self.finish_stream();
                return Ok(());
            }
            Err(e) => {
                return Err(GrievanceError::Decode(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
        };

        if packet.track_id() != self.track_id {
            return Ok(());
        }

        let decoded = match self.decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(path = %self.path.display(), "skipping corrupt packet: {e}");
                return Ok(());
            }
            Err(e) => {
                return Err(GrievanceError::Decode(format!(
                    "{}: {e}",
                    self.path.display()
                )))
            }
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let mono: Vec<f32> = sample_buf
            .samples()
            .chunks_exact(channels)
            .map(|f| f.iter().sum::<f32>() / channels as f32)
            .collect();

        let resampled = self.resampler.process(&mono);
        self.emit(&resampled);
        Ok(())
    }

    /// Convert mono f32 to interleaved s16le at the target channel count.
    fn emit(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let ch = self.geometry.channels as usize;
        let mut bytes = Vec::with_capacity(samples.len() * ch * 2);
        for s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            for _ in 0..ch {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        self.decoded_bytes += bytes.len();
        self.slicer.push(&bytes, &mut self.ready);
    }

    fn finish_stream(&mut self) {
        let tail = self.resampler.flush();
        self.emit(&tail);
        if let Some(frame) = self.slicer.finish() {
            self.ready.push_back(frame);
        }
        self.finished = true;
        debug!(
            path = %self.path.display(),
            decoded_bytes = self.decoded_bytes,
            "cue asset decoded"
        );
    }
}

impl Iterator for FrameDecoder {
    type Item = Result<PcmFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.refill() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

impl FusedIterator for FrameDecoder {}

/// Decode a whole asset eagerly.
pub fn decode_all(
    path: impl AsRef<Path>,
    geometry: FrameGeometry,
    tail: TailPolicy,
) -> Result<Vec<PcmFrame>> {
    FrameDecoder::open(path, geometry, tail)?.collect()
}

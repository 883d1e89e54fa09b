//! Audio output: cue decoding, resampling and the sinks frames are written to.
//!
//! # Sink contract
//!
//! A sink receives `PcmFrame`s of one fixed geometry, one call per pacing
//! interval. Pacing is the playback scheduler's job; sinks only move bytes.
//! The scheduler guarantees a single writer at a time, so sinks do not need
//! to handle interleaved writes.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `CpalSink` therefore opens and drops its stream on a dedicated
//! thread and only the ring buffer producer crosses into the async runtime.

pub mod decode;
pub mod resample;
pub mod wav;

pub use decode::{decode_all, FrameDecoder};
pub use wav::WavFileSink;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{buffering::PcmFrame, error::Result};

#[cfg(feature = "audio-cpal")]
pub use device::CpalSink;

/// Destination for paced playback frames.
pub trait OutputSink: Send + 'static {
    /// Write one frame. Called at most once per frame interval.
    fn write_frame(&mut self, frame: &PcmFrame) -> Result<()>;

    /// Push any buffered output through. Called when a cue finishes.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to any `OutputSink`.
///
/// Uses `parking_lot::Mutex`: the lock is held only for one synchronous frame
/// write and never across an `.await`.
#[derive(Clone)]
pub struct SinkHandle(pub Arc<Mutex<dyn OutputSink>>);

impl SinkHandle {
    pub fn new<S: OutputSink>(sink: S) -> Self {
        Self(Arc::new(Mutex::new(sink)))
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle").finish_non_exhaustive()
    }
}

/// Sink that keeps every frame in memory.
///
/// Clones share one buffer, so a caller can hand one clone to a
/// `SinkHandle` and inspect the frames through another.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<PcmFrame>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all frames written so far.
    pub fn frames(&self) -> Vec<PcmFrame> {
        self.frames.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

impl OutputSink for MemorySink {
    fn write_frame(&mut self, frame: &PcmFrame) -> Result<()> {
        self.frames.lock().push(frame.clone());
        Ok(())
    }
}

#[cfg(feature = "audio-cpal")]
mod device {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::thread::JoinHandle;
    use std::time::Duration;

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        BufferSize, SampleRate, Stream, StreamConfig,
    };
    use ringbuf::traits::{Consumer, Producer};
    use tracing::{error, info, warn};

    use super::OutputSink;
    use crate::{
        buffering::{create_playback_ring, FrameGeometry, PcmFrame, PlaybackConsumer, PlaybackProducer},
        error::{GrievanceError, Result},
    };

    /// Plays frames on the default output device through an SPSC ring.
    pub struct CpalSink {
        producer: PlaybackProducer,
        geometry: FrameGeometry,
        /// Cleared on drop so the stream thread releases the device.
        running: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl CpalSink {
        /// Open the default output device at `geometry`.
        ///
        /// Blocks until the device is confirmed open (or fails).
        ///
        /// # Errors
        /// `GrievanceError::AudioDevice` when no output device exists or the
        /// device rejects the requested rate/channel count.
        pub fn open_default(geometry: FrameGeometry) -> Result<Self> {
            geometry.validate()?;
            let (producer, consumer) = create_playback_ring();
            let running = Arc::new(AtomicBool::new(true));
            let running_thread = Arc::clone(&running);

            // Sync oneshot: stream thread reports open success/failure.
            let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

            let thread = std::thread::Builder::new()
                .name("grievance-output".into())
                .spawn(move || {
                    let stream = match build_stream(geometry, consumer) {
                        Ok(s) => {
                            let _ = open_tx.send(Ok(()));
                            s
                        }
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                    while running_thread.load(Ordering::Acquire) {
                        std::thread::park_timeout(Duration::from_millis(100));
                    }
                    // Stream drops here, releasing the device on this thread.
                    drop(stream);
                })?;

            match open_rx.recv() {
                Ok(Ok(())) => Ok(Self {
                    producer,
                    geometry,
                    running,
                    thread: Some(thread),
                }),
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(e)
                }
                Err(_) => Err(GrievanceError::AudioDevice(
                    "output thread died before opening the device".into(),
                )),
            }
        }
    }

    fn build_stream(geometry: FrameGeometry, mut consumer: PlaybackConsumer) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| GrievanceError::AudioDevice("no default output device".into()))?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate = geometry.sample_rate,
            channels = geometry.channels,
            "opening output device"
        );

        let config = StreamConfig {
            channels: geometry.channels,
            sample_rate: SampleRate(geometry.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    let read = consumer.pop_slice(data);
                    for s in &mut data[read..] {
                        *s = 0;
                    }
                },
                |err| error!("audio output stream error: {err}"),
                None,
            )
            .map_err(|e| GrievanceError::AudioDevice(e.to_string()))?;

        stream
            .play()
            .map_err(|e| GrievanceError::AudioDevice(e.to_string()))?;
        Ok(stream)
    }

    impl OutputSink for CpalSink {
        fn write_frame(&mut self, frame: &PcmFrame) -> Result<()> {
            if frame.sample_rate != self.geometry.sample_rate
                || frame.channels != self.geometry.channels
            {
                return Err(GrievanceError::Sink(format!(
                    "frame geometry {} Hz x{} does not match device {} Hz x{}",
                    frame.sample_rate,
                    frame.channels,
                    self.geometry.sample_rate,
                    self.geometry.channels
                )));
            }
            let samples: Vec<i16> = frame.samples().collect();
            let written = self.producer.push_slice(&samples);
            if written < samples.len() {
                warn!("playback ring full: dropped {} samples", samples.len() - written);
            }
            Ok(())
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.running.store(false, Ordering::Release);
            if let Some(thread) = self.thread.take() {
                thread.thread().unpark();
                let _ = thread.join();
            }
        }
    }
}

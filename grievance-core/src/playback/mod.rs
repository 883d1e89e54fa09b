//! `PlaybackScheduler`: cue registry plus the single active playback task.
//!
//! ## Task lifecycle
//!
//! ```text
//! play(id)
//!   ├─► cancel flag of previous task set, previous JoinHandle awaited
//!   ├─► playing = true
//!   └─► tokio::spawn(run_playback)
//!         loop: tick ─► next frame ─► sink.write_frame
//!         exit: finished | cancelled | failed ─► sink.flush ─► playing = false
//!         (the flag is also cleared if the sink panics)
//! ```
//!
//! Frames come either from an in-memory cache (`preload`) or from a
//! `FrameDecoder` running on the blocking pool that feeds a bounded channel,
//! so decoding runs ahead of playback by at most `DECODE_AHEAD` frames.
//!
//! Cancellation is cooperative: the flag is checked after every pacing tick,
//! so a cancelled task may finish the frame in flight but never starts
//! another one. Because `play` awaits the previous task before spawning the
//! next, at most one task ever writes to the sink.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{decode_all, FrameDecoder, SinkHandle},
    buffering::{FrameGeometry, PcmFrame, TailPolicy},
    error::{GrievanceError, Result},
};

/// Frames a streaming decoder may buffer ahead of the pacing loop.
const DECODE_AHEAD: usize = 32;

/// Where a cue's audio comes from.
#[derive(Debug, Clone)]
pub enum CueSource {
    /// Decoded on every play.
    Asset(PathBuf),
    /// Decoded once by `preload` and replayed from memory.
    Frames(Arc<[PcmFrame]>),
}

struct PlaybackTask {
    cue_id: String,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Plays named cues to one sink, one at a time, at real-time pace.
pub struct PlaybackScheduler {
    geometry: FrameGeometry,
    tail: TailPolicy,
    cues: HashMap<String, CueSource>,
    sink: SinkHandle,
    active: Option<PlaybackTask>,
    /// `true` from `play` until the task writing frames has exited.
    playing: Arc<AtomicBool>,
}

impl PlaybackScheduler {
    pub fn new(geometry: FrameGeometry, tail: TailPolicy, sink: SinkHandle) -> Self {
        Self {
            geometry,
            tail,
            cues: HashMap::new(),
            sink,
            active: None,
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Register (or replace) a cue backed by an audio file.
    pub fn register_asset(&mut self, cue_id: impl Into<String>, path: impl Into<PathBuf>) {
        self.cues.insert(cue_id.into(), CueSource::Asset(path.into()));
    }

    /// Register (or replace) a cue from frames that are already decoded.
    pub fn register_frames(&mut self, cue_id: impl Into<String>, frames: Vec<PcmFrame>) {
        self.cues
            .insert(cue_id.into(), CueSource::Frames(frames.into()));
    }

    pub fn is_registered(&self, cue_id: &str) -> bool {
        self.cues.contains_key(cue_id)
    }

    pub fn is_cached(&self, cue_id: &str) -> bool {
        matches!(self.cues.get(cue_id), Some(CueSource::Frames(_)))
    }

    /// Decode a cue once and keep its frames in memory. Returns the frame
    /// count. A cue that is already cached is left as is.
    ///
    /// # Errors
    /// `UnknownCue` for an unregistered id; `AssetNotFound` / `Decode` if the
    /// asset cannot be decoded. The cue stays registered as a file either way.
    pub async fn preload(&mut self, cue_id: &str) -> Result<usize> {
        let path = match self.cues.get(cue_id) {
            Some(CueSource::Frames(frames)) => return Ok(frames.len()),
            Some(CueSource::Asset(path)) => path.clone(),
            None => return Err(GrievanceError::UnknownCue(cue_id.to_string())),
        };

        let geometry = self.geometry;
        let tail = self.tail;
        let started = std::time::Instant::now();
        let frames = tokio::task::spawn_blocking(move || decode_all(path, geometry, tail))
            .await
            .map_err(|e| GrievanceError::Other(anyhow::anyhow!("preload task failed: {e}")))??;

        let count = frames.len();
        info!(
            cue = cue_id,
            frames = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cue preloaded"
        );
        self.cues
            .insert(cue_id.to_string(), CueSource::Frames(frames.into()));
        Ok(count)
    }

    /// Start playing `cue_id`, replacing whatever is playing now.
    ///
    /// Returns once the new task is spawned, not when it finishes. Asset and
    /// decode failures happen inside the task: they are logged and leave the
    /// scheduler idle.
    ///
    /// # Errors
    /// `UnknownCue` if no cue with that id is registered. Nothing is
    /// cancelled in that case.
    pub async fn play(&mut self, cue_id: &str) -> Result<()> {
        let source = self
            .cues
            .get(cue_id)
            .cloned()
            .ok_or_else(|| GrievanceError::UnknownCue(cue_id.to_string()))?;

        self.cancel_active().await;

        let feed = match source {
            CueSource::Frames(frames) => FrameFeed::Cached { frames, next: 0 },
            CueSource::Asset(path) => {
                FrameFeed::Streamed(spawn_decoder(path, self.geometry, self.tail))
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        self.playing.store(true, Ordering::Release);
        let handle = tokio::spawn(run_playback(
            cue_id.to_string(),
            feed,
            self.sink.clone(),
            self.geometry.frame_duration(),
            Arc::clone(&cancel),
            Arc::clone(&self.playing),
        ));
        debug!(cue = cue_id, "playback task spawned");

        self.active = Some(PlaybackTask {
            cue_id: cue_id.to_string(),
            cancel,
            handle,
        });
        Ok(())
    }

    /// `play` followed by `wait_idle`.
    pub async fn play_to_end(&mut self, cue_id: &str) -> Result<()> {
        self.play(cue_id).await?;
        self.wait_idle().await;
        Ok(())
    }

    /// True while a playback task is writing frames.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Cue id of the most recent task, if it has not been reaped yet.
    pub fn current_cue(&self) -> Option<&str> {
        self.active.as_ref().map(|t| t.cue_id.as_str())
    }

    /// Wait for the active task (if any) to finish on its own.
    pub async fn wait_idle(&mut self) {
        if let Some(task) = self.active.take() {
            reap(task).await;
        }
    }

    /// Cancel the active task (if any) and wait for it to exit.
    pub async fn stop(&mut self) {
        self.cancel_active().await;
    }

    async fn cancel_active(&mut self) {
        if let Some(task) = self.active.take() {
            task.cancel.store(true, Ordering::Release);
            reap(task).await;
        }
    }
}

async fn reap(task: PlaybackTask) {
    if let Err(e) = task.handle.await {
        error!(cue = task.cue_id.as_str(), "playback task panicked: {e}");
    }
}

enum FrameFeed {
    Cached { frames: Arc<[PcmFrame]>, next: usize },
    Streamed(mpsc::Receiver<Result<PcmFrame>>),
}

impl FrameFeed {
    async fn next(&mut self) -> Option<Result<PcmFrame>> {
        match self {
            FrameFeed::Cached { frames, next } => {
                let frame = frames.get(*next)?.clone();
                *next += 1;
                Some(Ok(frame))
            }
            FrameFeed::Streamed(rx) => rx.recv().await,
        }
    }
}

/// Run a `FrameDecoder` on the blocking pool. Dropping the receiver stops it
/// at the next frame.
fn spawn_decoder(
    path: PathBuf,
    geometry: FrameGeometry,
    tail: TailPolicy,
) -> mpsc::Receiver<Result<PcmFrame>> {
    let (tx, rx) = mpsc::channel(DECODE_AHEAD);
    tokio::task::spawn_blocking(move || {
        let decoder = match FrameDecoder::open(&path, geometry, tail) {
            Ok(d) => d,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        for item in decoder {
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Clears the scheduler's `playing` flag when the task exits, also when a
/// sink panics mid-frame.
struct PlayingGuard(Arc<AtomicBool>);

impl Drop for PlayingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Outcome {
    Finished,
    Cancelled,
    Failed(GrievanceError),
}

async fn run_playback(
    cue_id: String,
    mut feed: FrameFeed,
    sink: SinkHandle,
    frame_duration: Duration,
    cancel: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
) {
    let _playing = PlayingGuard(playing);
    let started = Instant::now();
    let mut ticker = time::interval(frame_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut written = 0usize;

    // The tick before each write paces the previous frame; the tick that
    // finds the feed empty paces the last one.
    let outcome = loop {
        ticker.tick().await;
        if cancel.load(Ordering::Acquire) {
            break Outcome::Cancelled;
        }
        let frame = match feed.next().await {
            None => break Outcome::Finished,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Outcome::Failed(e),
        };
        if cancel.load(Ordering::Acquire) {
            break Outcome::Cancelled;
        }
        if let Err(e) = sink.0.lock().write_frame(&frame) {
            break Outcome::Failed(e);
        }
        written += 1;
    };
    drop(feed);

    if let Err(e) = sink.0.lock().flush() {
        warn!(cue = cue_id.as_str(), "sink flush failed: {e}");
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Outcome::Finished => {
            debug!(cue = cue_id.as_str(), frames = written, elapsed_ms, "cue finished")
        }
        Outcome::Cancelled => {
            debug!(cue = cue_id.as_str(), frames = written, elapsed_ms, "cue cancelled")
        }
        Outcome::Failed(e) => error!(
            cue = cue_id.as_str(),
            frames = written,
            "cue playback aborted: {e}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::audio::{MemorySink, OutputSink};

    fn marked_frames(marker: u8, count: usize) -> Vec<PcmFrame> {
        let g = FrameGeometry::default();
        (0..count)
            .map(|_| PcmFrame::new(vec![marker; g.frame_bytes()], &g))
            .collect()
    }

    fn scheduler() -> (PlaybackScheduler, MemorySink) {
        let sink = MemorySink::new();
        let scheduler = PlaybackScheduler::new(
            FrameGeometry::default(),
            TailPolicy::Keep,
            SinkHandle::new(sink.clone()),
        );
        (scheduler, sink)
    }

    fn write_wav(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample((i % 200) as i16 * 10).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cached_cue_is_paced_in_real_time() {
        let (mut scheduler, sink) = scheduler();
        scheduler.register_frames("a", marked_frames(1, 5));

        let started = Instant::now();
        scheduler.play("a").await.unwrap();
        assert!(scheduler.is_playing());

        time::sleep(Duration::from_millis(25)).await;
        let midway = sink.len();
        assert!((2..=3).contains(&midway), "wrote {midway} frames in 25 ms");
        assert!(scheduler.is_playing());

        scheduler.wait_idle().await;
        assert!(!scheduler.is_playing());
        assert_eq!(sink.len(), 5);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn play_over_active_cue_never_interleaves() {
        let (mut scheduler, sink) = scheduler();
        scheduler.register_frames("a", marked_frames(0xA, 20));
        scheduler.register_frames("b", marked_frames(0xB, 3));

        scheduler.play("a").await.unwrap();
        time::sleep(Duration::from_millis(35)).await;
        scheduler.play("b").await.unwrap();
        assert_eq!(scheduler.current_cue(), Some("b"));
        scheduler.wait_idle().await;

        let markers: Vec<u8> = sink.frames().iter().map(|f| f.data[0]).collect();
        let first_b = markers.iter().position(|&m| m == 0xB).unwrap();
        assert!(markers[..first_b].iter().all(|&m| m == 0xA));
        assert!(markers[first_b..].iter().all(|&m| m == 0xB));
        assert!(first_b < 20, "a must be cut short");
        assert_eq!(markers.len() - first_b, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_between_frames() {
        let (mut scheduler, sink) = scheduler();
        scheduler.register_frames("a", marked_frames(1, 10));
        scheduler.play("a").await.unwrap();
        time::sleep(Duration::from_millis(15)).await;
        scheduler.stop().await;

        assert!(!scheduler.is_playing());
        let written = sink.len();
        assert!(written < 10);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.len(), written, "no frames after cancellation");
    }

    #[tokio::test]
    async fn unknown_cue_is_rejected_without_side_effects() {
        let (mut scheduler, _sink) = scheduler();
        let err = scheduler.play("missing").await.unwrap_err();
        assert!(matches!(err, GrievanceError::UnknownCue(ref id) if id == "missing"));
        assert!(!scheduler.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_asset_leaves_scheduler_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, sink) = scheduler();
        scheduler.register_asset("gone", dir.path().join("gone.mp3"));
        scheduler.register_frames("ok", marked_frames(7, 2));

        scheduler.play("gone").await.unwrap();
        scheduler.wait_idle().await;
        assert!(!scheduler.is_playing());
        assert!(sink.is_empty());

        scheduler.play_to_end("ok").await.unwrap();
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn uncached_asset_streams_from_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cue.wav");
        write_wav(&path, 1_000);

        let (mut scheduler, sink) = scheduler();
        scheduler.register_asset("cue", &path);
        scheduler.play_to_end("cue").await.unwrap();

        let lens: Vec<usize> = sink.frames().iter().map(PcmFrame::byte_len).collect();
        assert_eq!(lens, vec![960, 960, 80]);
        assert!(!scheduler.is_cached("cue"));
    }

    struct FaultySink;

    impl OutputSink for FaultySink {
        fn write_frame(&mut self, _frame: &PcmFrame) -> Result<()> {
            panic!("output device vanished");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sink_panic_leaves_scheduler_idle() {
        let mut scheduler = PlaybackScheduler::new(
            FrameGeometry::default(),
            TailPolicy::Keep,
            SinkHandle::new(FaultySink),
        );
        scheduler.register_frames("a", marked_frames(1, 3));

        scheduler.play("a").await.unwrap();
        scheduler.wait_idle().await;
        assert!(!scheduler.is_playing());

        // The scheduler keeps accepting cues afterwards.
        scheduler.play("a").await.unwrap();
        scheduler.stop().await;
        assert!(!scheduler.is_playing());
    }

    #[tokio::test]
    async fn preload_caches_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ack.wav");
        write_wav(&path, 1_000);

        let (mut scheduler, sink) = scheduler();
        scheduler.register_asset("ack", &path);
        assert_eq!(scheduler.preload("ack").await.unwrap(), 3);
        assert!(scheduler.is_cached("ack"));

        // The file is no longer needed once cached.
        std::fs::remove_file(&path).unwrap();
        scheduler.play_to_end("ack").await.unwrap();
        assert_eq!(sink.len(), 3);
    }

    #[tokio::test]
    async fn preload_of_missing_asset_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _sink) = scheduler();
        scheduler.register_asset("greeting", dir.path().join("greeting.mp3"));
        let err = scheduler.preload("greeting").await.unwrap_err();
        assert!(matches!(err, GrievanceError::AssetNotFound { .. }));
        assert!(scheduler.is_registered("greeting"));
        assert!(!scheduler.is_cached("greeting"));
    }
}

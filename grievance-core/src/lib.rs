//! # grievance-core
//!
//! Half-duplex voice intake engine: plays prompt cues, listens to the
//! caller's transcribed speech, and decides turn by turn what to say next.
//!
//! ## Architecture
//!
//! ```text
//! speech recognition ─► mpsc<TranscriptEvent> ─► SessionOrchestrator
//!                                                   │        ▲
//!                                     DialogueEngine::process │ is_playing()
//!                                                   ▼        │
//!                                   Action ─► PlaybackScheduler::play
//!                                                   │
//!                              cache | FrameDecoder(spawn_blocking)
//!                                                   │
//!                                    paced PcmFrame ─► OutputSink
//! ```
//!
//! When the conversation closes, the accumulated `GrievanceRecord` is handed
//! to a `GrievanceRepository` on the blocking pool and the session ends after
//! a short grace interval.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod dialogue;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{FrameDecoder, MemorySink, OutputSink, SinkHandle, WavFileSink};
pub use buffering::{FrameGeometry, PcmFrame, TailPolicy};
pub use dialogue::{
    Action, ConversationState, DialogueConfig, DialogueEngine, GrievanceRecord, PhraseTable, Turn,
};
pub use error::{GrievanceError, Result};
pub use ipc::events::{IgnoreReason, SessionEnd, SessionEvent, TranscriptEvent};
pub use playback::{CueSource, PlaybackScheduler};
pub use session::{
    GrievanceAnalysis, GrievanceRepository, MemoryRepository, Priority, RepositoryHandle,
    Sentiment, SessionConfig, SessionOrchestrator, SessionSummary, StoredGrievance,
};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalSink;

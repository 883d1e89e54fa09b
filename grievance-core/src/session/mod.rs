//! `SessionOrchestrator`: one call from greeting to disconnect.
//!
//! ## Flow
//!
//! ```text
//! run(transcripts)
//!   ├─► preload cues, start the greeting_delay timer
//!   ├─► timer fires before the caller speaks ─► play greeting
//!   ├─► for each TranscriptEvent:
//!   │     interim / empty / duplicate / while playing ─► ignored
//!   │     else DialogueEngine::process ─► (state, action)
//!   │          action ─► PlaybackScheduler::play
//!   │          should_disconnect ─► play to end ─► persist (background)
//!   │                               ─► grace delay ─► end
//!   └─► channel closed before closing ─► persist (background) ─► end
//! ```
//!
//! Half-duplex: transcripts that arrive while a cue is playing are dropped,
//! so the engine never hears the bot's own voice.

pub mod persist;

pub use persist::{
    GrievanceAnalysis, GrievanceRepository, MemoryRepository, Priority, RepositoryHandle,
    Sentiment, StoredGrievance,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    audio::SinkHandle,
    buffering::{FrameGeometry, TailPolicy},
    dialogue::{Action, ConversationState, DialogueConfig, DialogueEngine, GrievanceRecord, PhraseTable},
    error::{GrievanceError, Result},
    ipc::events::{IgnoreReason, SessionEnd, SessionEvent, TranscriptEvent},
    playback::PlaybackScheduler,
};

/// Broadcast channel capacity for session events.
const EVENT_CAP: usize = 128;

/// Everything tunable about a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub geometry: FrameGeometry,
    pub tail_policy: TailPolicy,
    /// Cue id ─► audio file. Relative paths resolve against `asset_dir`.
    pub cues: BTreeMap<String, PathBuf>,
    pub asset_dir: PathBuf,
    /// Cues decoded into memory before the greeting.
    pub preload: Vec<String>,
    /// Played once after `greeting_delay_ms`; `None` skips it.
    pub greeting_cue: Option<String>,
    /// Default: 1500.
    pub greeting_delay_ms: u64,
    /// Pause after the final cue before the session ends. Default: 2000.
    pub grace_ms: u64,
    pub dialogue: DialogueConfig,
    /// Built-in phrase table to use when `phrase_table` is unset.
    pub locale: String,
    /// Custom phrase table JSON file.
    pub phrase_table: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let cues = [
            ("greeting", "greeting_new.mp3"),
            ("closing", "closing_new.mp3"),
            ("early_exit", "early_closing.mp3"),
            ("probe_details", "probe_details_short.mp3"),
            ("ack_1", "hmm.mp3"),
            ("ack_2", "i_see.mp3"),
            ("ack_3", "ohh_isit.mp3"),
        ]
        .into_iter()
        .map(|(id, file)| (id.to_string(), PathBuf::from(file)))
        .collect();

        Self {
            geometry: FrameGeometry::default(),
            tail_policy: TailPolicy::default(),
            cues,
            asset_dir: PathBuf::from("audio"),
            preload: ["greeting", "ack_1", "ack_2", "ack_3"]
                .into_iter()
                .map(String::from)
                .collect(),
            greeting_cue: Some("greeting".into()),
            greeting_delay_ms: 1_500,
            grace_ms: 2_000,
            dialogue: DialogueConfig::default(),
            locale: "en".into(),
            phrase_table: None,
        }
    }
}

impl SessionConfig {
    pub fn greeting_delay(&self) -> Duration {
        Duration::from_millis(self.greeting_delay_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Absolute path for a cue's asset.
    pub fn asset_path(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.asset_dir.join(file)
        }
    }

    /// The phrase table file if configured, otherwise the built-in table
    /// for `locale`.
    pub fn phrases(&self) -> Result<PhraseTable> {
        if let Some(path) = &self.phrase_table {
            return PhraseTable::load(path);
        }
        PhraseTable::builtin(&self.locale).ok_or_else(|| {
            GrievanceError::Config(format!("no built-in phrase table for locale '{}'", self.locale))
        })
    }

    /// Check geometry and that every referenced cue is mapped to a file.
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        let fixed = [Action::EarlyExit, Action::Probe, Action::Closing];
        let referenced = self
            .preload
            .iter()
            .chain(self.greeting_cue.iter())
            .chain(self.dialogue.backchannel_cues.iter())
            .map(String::as_str)
            .chain(fixed.iter().map(Action::cue_id));
        for cue in referenced {
            if !self.cues.contains_key(cue) {
                return Err(GrievanceError::Config(format!("cue '{cue}' has no asset")));
            }
        }
        Ok(())
    }
}

/// Returned by `SessionOrchestrator::run`.
#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: String,
    pub end: SessionEnd,
    /// The grievance as it stood when the session ended.
    pub record: GrievanceRecord,
    /// Background persistence task, if the grievance was non-empty.
    /// Awaiting it is optional; it never returns an error of its own.
    pub persistence: Option<JoinHandle<()>>,
}

/// Drives one call: transcripts in, cues out, grievance stored at the end.
pub struct SessionOrchestrator<R = StdRng> {
    session_id: String,
    config: SessionConfig,
    engine: DialogueEngine<R>,
    scheduler: PlaybackScheduler,
    repository: RepositoryHandle,
    events: broadcast::Sender<SessionEvent>,
    last_routed: Option<String>,
}

impl SessionOrchestrator<StdRng> {
    /// Session with an OS-seeded backchannel generator.
    pub fn new(config: SessionConfig, sink: SinkHandle, repository: RepositoryHandle) -> Result<Self> {
        let phrases = config.phrases()?;
        let engine = DialogueEngine::with_entropy(config.dialogue.clone(), &phrases);
        Ok(Self::with_engine(config, engine, sink, repository))
    }
}

impl<R: Rng> SessionOrchestrator<R> {
    /// Session around a prepared engine. Cues from `config` are registered
    /// with a fresh scheduler writing to `sink`.
    pub fn with_engine(
        config: SessionConfig,
        engine: DialogueEngine<R>,
        sink: SinkHandle,
        repository: RepositoryHandle,
    ) -> Self {
        let mut scheduler = PlaybackScheduler::new(config.geometry, config.tail_policy, sink);
        for (id, file) in &config.cues {
            scheduler.register_asset(id.clone(), config.asset_path(file));
        }
        let (events, _) = broadcast::channel(EVENT_CAP);
        Self {
            session_id: new_session_id(),
            config,
            engine,
            scheduler,
            repository,
            events,
            last_routed: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Cue registry, e.g. to register pre-decoded frames.
    pub fn scheduler_mut(&mut self) -> &mut PlaybackScheduler {
        &mut self.scheduler
    }

    pub fn state(&self) -> ConversationState {
        self.engine.state()
    }

    /// Run the call until it closes or the transcript stream ends.
    pub async fn run(mut self, transcripts: mpsc::Receiver<TranscriptEvent>) -> SessionSummary {
        let span = info_span!("session", id = self.session_id.as_str());
        async move {
            let (end, persistence) = self.drive(transcripts).await;
            self.scheduler.stop().await;

            let record = self.engine.record().clone();
            info!(?end, words = record.word_count, "session ended");
            self.emit(SessionEvent::Ended {
                end,
                word_count: record.word_count,
            });
            SessionSummary {
                session_id: self.session_id,
                end,
                record,
                persistence,
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &mut self,
        mut transcripts: mpsc::Receiver<TranscriptEvent>,
    ) -> (SessionEnd, Option<JoinHandle<()>>) {
        self.emit(SessionEvent::Started {
            session_id: self.session_id.clone(),
        });
        self.preload().await;

        // The greeting waits on a timer so speech during the delay is
        // still heard. It is dropped once the caller has been routed.
        let mut greeting = self.config.greeting_cue.clone();
        let greeting_timer = tokio::time::sleep(self.config.greeting_delay());
        tokio::pin!(greeting_timer);

        loop {
            let event = tokio::select! {
                event = transcripts.recv() => event,
                _ = &mut greeting_timer, if greeting.is_some() => {
                    if let Some(cue) = greeting.take() {
                        self.play(&cue).await;
                    }
                    continue;
                }
            };
            let Some(event) = event else {
                info!("transcript stream closed before closing");
                return (SessionEnd::HungUp, self.persist());
            };

            let action = self.route(event);
            if self.last_routed.is_some() {
                if let Some(cue) = greeting.take() {
                    debug!(cue = cue.as_str(), "caller spoke first, greeting skipped");
                }
            }
            let Some(action) = action else {
                continue;
            };

            if self.engine.record().should_disconnect {
                let end = if action == Action::EarlyExit {
                    SessionEnd::EarlyExit
                } else {
                    SessionEnd::Completed
                };
                return (end, self.close(&action).await);
            }
            self.play(action.cue_id()).await;
        }
    }

    /// Filter one transcript and feed it to the engine. Returns the action
    /// to perform, if any.
    fn route(&mut self, event: TranscriptEvent) -> Option<Action> {
        let text = event.text.trim();
        let reason = if !event.is_final {
            Some(IgnoreReason::Interim)
        } else if text.is_empty() {
            Some(IgnoreReason::Empty)
        } else if self.scheduler.is_playing() {
            Some(IgnoreReason::Playing)
        } else if self.last_routed.as_deref() == Some(text) {
            Some(IgnoreReason::Duplicate)
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(text, ?reason, "transcript ignored");
            if reason != IgnoreReason::Interim {
                self.emit(SessionEvent::TranscriptIgnored {
                    text: text.to_string(),
                    reason,
                });
            }
            return None;
        }

        self.last_routed = Some(text.to_string());
        let before = self.engine.state();
        let turn = self.engine.process_at(text, event.received_at);
        info!(
            text,
            state = %turn.state,
            action = turn.action.as_ref().map(Action::cue_id).unwrap_or("none"),
            "turn"
        );
        if turn.state != before {
            self.emit(SessionEvent::StateChanged {
                from: before,
                to: turn.state,
            });
        }
        self.emit(SessionEvent::Turn {
            text: text.to_string(),
            action: turn.action.clone(),
        });
        turn.action
    }

    /// Play the final cue to completion, hand off the grievance, then wait
    /// out the grace interval.
    async fn close(&mut self, action: &Action) -> Option<JoinHandle<()>> {
        let cue = action.cue_id();
        match self.scheduler.play(cue).await {
            Ok(()) => {
                self.emit(SessionEvent::CueStarted {
                    cue_id: cue.to_string(),
                });
                self.scheduler.wait_idle().await;
            }
            Err(e) => error!(cue, "final cue not played: {e}"),
        }
        let persistence = self.persist();
        tokio::time::sleep(self.config.grace()).await;
        persistence
    }

    fn persist(&self) -> Option<JoinHandle<()>> {
        let record = self.engine.record().clone();
        if record.is_empty() {
            info!("no grievance text, skipping persistence");
            return None;
        }
        Some(persist::dispatch(
            self.repository.clone(),
            record,
            self.events.clone(),
        ))
    }

    async fn play(&mut self, cue: &str) {
        match self.scheduler.play(cue).await {
            Ok(()) => self.emit(SessionEvent::CueStarted {
                cue_id: cue.to_string(),
            }),
            Err(e) => error!(cue, "cue not played: {e}"),
        }
    }

    async fn preload(&mut self) {
        for cue in self.config.preload.clone() {
            if let Err(e) = self.scheduler.preload(&cue).await {
                warn!(cue = cue.as_str(), "preload failed, will stream from disk: {e}");
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn new_session_id() -> String {
    format!(
        "session-{}-{:08x}",
        chrono::Utc::now().timestamp_micros(),
        rand::random::<u32>()
    )
}

//! Events flowing into and out of a session.
//!
//! | Event | Direction |
//! |-------|-----------|
//! | `TranscriptEvent` | speech recognition ─► orchestrator (`mpsc`) |
//! | `SessionEvent` | orchestrator ─► observers (`broadcast`) |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dialogue::{Action, ConversationState};

// ---------------------------------------------------------------------------
// Transcript events
// ---------------------------------------------------------------------------

/// One recognised utterance from the speech-recognition provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub text: String,
    /// Interim results may still change; only finals are routed.
    pub is_final: bool,
    pub received_at: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn final_transcript(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            received_at: Utc::now(),
        }
    }

    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            received_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session events
// ---------------------------------------------------------------------------

/// Why a transcript never reached the dialogue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnoreReason {
    Interim,
    Empty,
    /// Same text as the previous routed transcript.
    Duplicate,
    /// Arrived while a cue was playing (half-duplex).
    Playing,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEnd {
    /// Caller finished their statement and heard the closing cue.
    Completed,
    /// Caller declined in the greeting turn.
    EarlyExit,
    /// Transcript stream ended before the conversation closed.
    HungUp,
}

/// Broadcast to observers while a session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    Started {
        session_id: String,
    },
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
    /// An utterance was processed by the dialogue engine.
    Turn {
        text: String,
        action: Option<Action>,
    },
    TranscriptIgnored {
        text: String,
        reason: IgnoreReason,
    },
    CueStarted {
        cue_id: String,
    },
    PersistenceFinished {
        grievance_id: Option<String>,
        /// Error message when storing failed.
        error: Option<String>,
    },
    Ended {
        end: SessionEnd,
        word_count: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_event_serializes_camel_case() {
        let event = TranscriptEvent::final_transcript("that's all");
        let json = serde_json::to_value(&event).expect("serialize transcript event");
        assert_eq!(json["text"], "that's all");
        assert_eq!(json["isFinal"], true);
        assert!(json["receivedAt"].is_string());

        let round_trip: TranscriptEvent =
            serde_json::from_value(json).expect("deserialize transcript event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn session_events_are_internally_tagged() {
        let json = serde_json::to_value(SessionEvent::CueStarted {
            cue_id: "probe_details".into(),
        })
        .expect("serialize cue event");
        assert_eq!(json["type"], "cueStarted");
        assert_eq!(json["cueId"], "probe_details");

        let json = serde_json::to_value(SessionEvent::StateChanged {
            from: ConversationState::Greeting,
            to: ConversationState::Listening,
        })
        .expect("serialize state event");
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["from"], "greeting");
        assert_eq!(json["to"], "listening");
    }

    #[test]
    fn turn_event_carries_action_payload() {
        let json = serde_json::to_value(SessionEvent::Turn {
            text: "the lift is broken again and nobody has fixed it".into(),
            action: Some(Action::Backchannel("ack_2".into())),
        })
        .expect("serialize turn event");
        assert_eq!(json["action"]["kind"], "backchannel");
        assert_eq!(json["action"]["cue"], "ack_2");

        let ended = serde_json::to_value(SessionEvent::Ended {
            end: SessionEnd::HungUp,
            word_count: 12,
        })
        .expect("serialize ended event");
        assert_eq!(ended["end"], "hungUp");
        assert_eq!(ended["wordCount"], 12);
    }

    #[test]
    fn ignore_reason_rejects_unknown_values() {
        let err = serde_json::from_str::<IgnoreReason>("\"Playing\"");
        assert!(err.is_err());
        let ok: IgnoreReason = serde_json::from_str("\"duplicate\"").expect("lowercase reason");
        assert_eq!(ok, IgnoreReason::Duplicate);
    }
}

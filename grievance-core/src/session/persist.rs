//! Persistence hand-off: the collaborator trait, its record types, and the
//! fire-and-forget dispatch used when a call ends.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    dialogue::GrievanceRecord,
    error::{GrievanceError, Result},
    ipc::events::SessionEvent,
};

/// Summaries longer than this many characters are truncated in the fallback.
pub const FALLBACK_SUMMARY_CHARS: usize = 200;
pub const UNDISCLOSED_LOCATION: &str = "Undisclosed Location";
pub const GENERAL_DEPARTMENT: &str = "General";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Case-insensitive parse; anything unrecognised is `Medium`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" | "critical" | "urgent" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
    #[serde(rename = "Very Negative")]
    VeryNegative,
}

impl Sentiment {
    /// Case- and spacing-insensitive parse; anything unrecognised is `Neutral`.
    pub fn parse_lenient(raw: &str) -> Self {
        let key: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "positive" => Sentiment::Positive,
            "negative" => Sentiment::Negative,
            "verynegative" => Sentiment::VeryNegative,
            _ => Sentiment::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "Positive",
            Sentiment::Neutral => "Neutral",
            Sentiment::Negative => "Negative",
            Sentiment::VeryNegative => "Very Negative",
        }
    }
}

/// Structured categorisation of one grievance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrievanceAnalysis {
    pub category: String,
    pub priority: Priority,
    pub sentiment: Sentiment,
    pub summary: String,
    pub tags: Vec<String>,
    pub location: String,
    pub department: String,
}

impl GrievanceAnalysis {
    /// Minimal record used when categorisation is unavailable.
    pub fn fallback(transcript: &str) -> Self {
        let summary = if transcript.chars().count() > FALLBACK_SUMMARY_CHARS {
            let mut s: String = transcript.chars().take(FALLBACK_SUMMARY_CHARS).collect();
            s.push_str("...");
            s
        } else {
            transcript.to_string()
        };
        Self {
            category: "Uncategorized".into(),
            priority: Priority::Medium,
            sentiment: Sentiment::Neutral,
            summary,
            tags: Vec::new(),
            location: UNDISCLOSED_LOCATION.into(),
            department: GENERAL_DEPARTMENT.into(),
        }
    }
}

/// What the persistence collaborator returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredGrievance {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub transcript: String,
    #[serde(flatten)]
    pub analysis: GrievanceAnalysis,
}

/// Categorises and stores a finished grievance.
///
/// Implementations may block (HTTP, SQLite); the orchestrator always calls
/// them on the blocking pool.
pub trait GrievanceRepository: Send + Sync + 'static {
    fn process_and_store(&self, transcript: &str, timestamp: DateTime<Utc>)
        -> Result<StoredGrievance>;
}

/// Shared handle to any `GrievanceRepository`.
#[derive(Clone)]
pub struct RepositoryHandle(pub Arc<dyn GrievanceRepository>);

impl RepositoryHandle {
    pub fn new<T: GrievanceRepository>(repo: T) -> Self {
        Self(Arc::new(repo))
    }
}

impl std::fmt::Debug for RepositoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryHandle").finish_non_exhaustive()
    }
}

/// Keeps grievances in memory with fallback analysis. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    stored: Arc<Mutex<Vec<StoredGrievance>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> Vec<StoredGrievance> {
        self.stored.lock().clone()
    }
}

impl GrievanceRepository for MemoryRepository {
    fn process_and_store(
        &self,
        transcript: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<StoredGrievance> {
        let mut stored = self.stored.lock();
        let record = StoredGrievance {
            id: format!("grv-{}", stored.len() + 1),
            timestamp,
            transcript: transcript.to_string(),
            analysis: GrievanceAnalysis::fallback(transcript),
        };
        stored.push(record.clone());
        Ok(record)
    }
}

/// Store `record` in the background. Failures (and panics) in the
/// repository are logged and reported as a `PersistenceFinished` event; they
/// never reach the caller.
pub fn dispatch(
    repository: RepositoryHandle,
    record: GrievanceRecord,
    events: broadcast::Sender<SessionEvent>,
) -> JoinHandle<()> {
    let timestamp = record.first_utterance_at.unwrap_or_else(Utc::now);
    tokio::task::spawn_blocking(move || {
        info!(words = record.word_count, "storing grievance");
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            repository.0.process_and_store(&record.text, timestamp)
        }))
        .unwrap_or_else(|_| {
            Err(GrievanceError::Persistence(
                "grievance repository panicked".into(),
            ))
        });

        let event = match outcome {
            Ok(stored) => {
                info!(
                    id = stored.id.as_str(),
                    category = stored.analysis.category.as_str(),
                    priority = stored.analysis.priority.as_str(),
                    "grievance stored"
                );
                SessionEvent::PersistenceFinished {
                    grievance_id: Some(stored.id),
                    error: None,
                }
            }
            Err(e) => {
                error!("failed to store grievance: {e}");
                SessionEvent::PersistenceFinished {
                    grievance_id: None,
                    error: Some(e.to_string()),
                }
            }
        };
        let _ = events.send(event);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingRepository;

    impl GrievanceRepository for FailingRepository {
        fn process_and_store(&self, _: &str, _: DateTime<Utc>) -> Result<StoredGrievance> {
            Err(GrievanceError::Persistence("database is locked".into()))
        }
    }

    fn record(text: &str) -> GrievanceRecord {
        GrievanceRecord {
            text: text.into(),
            word_count: text.split_whitespace().count(),
            ..Default::default()
        }
    }

    #[test]
    fn fallback_truncates_long_transcripts_on_char_boundaries() {
        let long = "é".repeat(250);
        let analysis = GrievanceAnalysis::fallback(&long);
        assert_eq!(analysis.summary.chars().count(), 203);
        assert!(analysis.summary.ends_with("..."));
        assert_eq!(analysis.category, "Uncategorized");
        assert_eq!(analysis.priority, Priority::Medium);
        assert_eq!(analysis.sentiment, Sentiment::Neutral);
        assert!(analysis.tags.is_empty());
        assert_eq!(analysis.location, UNDISCLOSED_LOCATION);

        let short = GrievanceAnalysis::fallback("the lift is broken");
        assert_eq!(short.summary, "the lift is broken");
    }

    #[test]
    fn lenient_parsing() {
        assert_eq!(Priority::parse_lenient(" HIGH "), Priority::High);
        assert_eq!(Priority::parse_lenient("whenever"), Priority::Medium);
        assert_eq!(Sentiment::parse_lenient("Very Negative"), Sentiment::VeryNegative);
        assert_eq!(Sentiment::parse_lenient("very_negative"), Sentiment::VeryNegative);
        assert_eq!(Sentiment::parse_lenient("meh"), Sentiment::Neutral);
    }

    #[test]
    fn stored_grievance_flattens_analysis() {
        let stored = StoredGrievance {
            id: "grv-1".into(),
            timestamp: Utc::now(),
            transcript: "cold water only".into(),
            analysis: GrievanceAnalysis::fallback("cold water only"),
        };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["category"], "Uncategorized");
        assert_eq!(json["sentiment"], "Neutral");
        assert_eq!(json["location"], UNDISCLOSED_LOCATION);
    }

    #[tokio::test]
    async fn dispatch_stores_and_reports() {
        let repo = MemoryRepository::new();
        let (tx, mut rx) = broadcast::channel(8);
        dispatch(RepositoryHandle::new(repo.clone()), record("no hot water in block c"), tx)
            .await
            .unwrap();

        assert_eq!(repo.stored().len(), 1);
        assert_eq!(repo.stored()[0].transcript, "no hot water in block c");
        match rx.recv().await.unwrap() {
            SessionEvent::PersistenceFinished { grievance_id, error } => {
                assert_eq!(grievance_id.as_deref(), Some("grv-1"));
                assert!(error.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_isolates_failures() {
        let (tx, mut rx) = broadcast::channel(8);
        let handle = dispatch(RepositoryHandle::new(FailingRepository), record("leaky roof"), tx);
        assert!(handle.await.is_ok(), "failure must not escape the task");
        match rx.recv().await.unwrap() {
            SessionEvent::PersistenceFinished { grievance_id, error } => {
                assert!(grievance_id.is_none());
                assert!(error.unwrap().contains("database is locked"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

//! LLM categorisation of finished grievances, and the repository that
//! combines it with the SQLite store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use grievance_core::session::persist::{GENERAL_DEPARTMENT, UNDISCLOSED_LOCATION};
use grievance_core::{
    GrievanceAnalysis, GrievanceError, GrievanceRepository, Priority, Sentiment, StoredGrievance,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::storage::{new_id, GrievanceStatus, GrievanceStore};

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const MAX_TAGS: usize = 5;

/// Calls Gemini `generateContent` for a structured analysis.
#[derive(Debug, Clone)]
pub struct GeminiCategorizer {
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl GeminiCategorizer {
    pub fn new(api_key: Option<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_key,
            model: model.into(),
            timeout,
        }
    }

    /// Blocking; call from the blocking pool.
    pub fn categorize(&self, transcript: &str) -> Result<GrievanceAnalysis, String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "no Gemini API key configured".to_string())?;

        // Built per call: a blocking client must not be dropped on an async thread.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| format!("client build failed: {e}"))?;

        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": build_prompt(transcript) }] }],
            "generationConfig": { "responseMimeType": "application/json" }
        });
        let response = client
            .post(format!("{GEMINI_ENDPOINT}/{}:generateContent", self.model))
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .map_err(|e| format!("request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("request returned {}", response.status()));
        }

        let payload: serde_json::Value = response
            .json()
            .map_err(|e| format!("response json parse failed: {e}"))?;
        let text = payload
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "response has no candidate text".to_string())?;

        parse_analysis(text, transcript)
    }
}

pub fn build_prompt(transcript: &str) -> String {
    format!(
        r#"Analyze this employee grievance and provide a structured categorization.

Grievance transcript:
{transcript}

Please provide:
1. Category (e.g., POSH, Managerial, Data, Hygiene, Compensation, Workplace Environment, Conflict, Career, Attendance)
2. Priority (High, Medium, Low)
3. Sentiment (Positive, Neutral, Negative, Very Negative)
4. Brief Summary (1-2 sentences)
5. Tags (up to 5 relevant keywords)
6. Location (the specific branch, city, or office mentioned; if none, "{UNDISCLOSED_LOCATION}")
7. Department (e.g., Sales, IT, HR, Logistics; if none, "{GENERAL_DEPARTMENT}")

Respond strictly in JSON format:
{{
    "category": "...",
    "priority": "...",
    "sentiment": "...",
    "summary": "...",
    "tags": ["tag1", "tag2"],
    "location": "...",
    "department": "..."
}}"#
    )
}

/// Remove a surrounding ```json fence if the model added one.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAnalysis {
    category: Option<String>,
    priority: Option<String>,
    sentiment: Option<String>,
    summary: Option<String>,
    tags: Vec<String>,
    location: Option<String>,
    department: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse the model's JSON, filling gaps from the fallback analysis.
pub fn parse_analysis(raw: &str, transcript: &str) -> Result<GrievanceAnalysis, String> {
    let parsed: RawAnalysis = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| format!("analysis json parse failed: {e}"))?;
    let fallback = GrievanceAnalysis::fallback(transcript);

    Ok(GrievanceAnalysis {
        category: non_empty(parsed.category).unwrap_or(fallback.category),
        priority: parsed
            .priority
            .as_deref()
            .map(Priority::parse_lenient)
            .unwrap_or(fallback.priority),
        sentiment: parsed
            .sentiment
            .as_deref()
            .map(Sentiment::parse_lenient)
            .unwrap_or(fallback.sentiment),
        summary: non_empty(parsed.summary).unwrap_or(fallback.summary),
        tags: parsed
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .take(MAX_TAGS)
            .collect(),
        location: non_empty(parsed.location).unwrap_or(fallback.location),
        department: non_empty(parsed.department).unwrap_or(fallback.department),
    })
}

/// Categorises (when enabled) and stores grievances in SQLite.
pub struct CategorizingRepository {
    categorizer: Option<GeminiCategorizer>,
    store: GrievanceStore,
}

impl CategorizingRepository {
    pub fn new(categorizer: Option<GeminiCategorizer>, store: GrievanceStore) -> Self {
        Self { categorizer, store }
    }

    fn analyse(&self, transcript: &str) -> (GrievanceAnalysis, GrievanceStatus) {
        let Some(categorizer) = self.categorizer.as_ref() else {
            return (GrievanceAnalysis::fallback(transcript), GrievanceStatus::Pending);
        };
        match categorizer.categorize(transcript) {
            Ok(analysis) => (analysis, GrievanceStatus::Processed),
            Err(e) => {
                warn!(error = %e, "categorisation failed, storing fallback analysis");
                (GrievanceAnalysis::fallback(transcript), GrievanceStatus::Pending)
            }
        }
    }
}

impl GrievanceRepository for CategorizingRepository {
    fn process_and_store(
        &self,
        transcript: &str,
        timestamp: DateTime<Utc>,
    ) -> grievance_core::Result<StoredGrievance> {
        let (analysis, status) = self.analyse(transcript);
        let grievance = StoredGrievance {
            id: new_id("grv"),
            timestamp,
            transcript: transcript.to_string(),
            analysis,
        };
        self.store
            .insert(&grievance, status)
            .map_err(GrievanceError::Persistence)?;
        info!(
            id = grievance.id.as_str(),
            status = status.as_str(),
            location = grievance.analysis.location.as_str(),
            "grievance saved"
        );
        Ok(grievance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {}  "), "{}");
    }

    #[test]
    fn full_analysis_is_parsed() {
        let raw = r#"```json
        {"category":"Hygiene","priority":"high","sentiment":"Very Negative",
         "summary":"Washrooms are unclean.","tags":["washroom","cleaning","", "a","b","c","d"],
         "location":"Pune office","department":"Logistics"}
        ```"#;
        let analysis = parse_analysis(raw, "the washrooms are filthy").unwrap();
        assert_eq!(analysis.category, "Hygiene");
        assert_eq!(analysis.priority, Priority::High);
        assert_eq!(analysis.sentiment, Sentiment::VeryNegative);
        assert_eq!(analysis.tags.len(), MAX_TAGS);
        assert!(!analysis.tags.iter().any(|t| t.is_empty()));
        assert_eq!(analysis.location, "Pune office");
        assert_eq!(analysis.department, "Logistics");
    }

    #[test]
    fn missing_fields_fall_back() {
        let analysis = parse_analysis(r#"{"category":"  "}"#, "no fans in the hall").unwrap();
        assert_eq!(analysis.category, "Uncategorized");
        assert_eq!(analysis.priority, Priority::Medium);
        assert_eq!(analysis.summary, "no fans in the hall");
        assert_eq!(analysis.location, UNDISCLOSED_LOCATION);
        assert_eq!(analysis.department, GENERAL_DEPARTMENT);
        assert!(parse_analysis("not json", "x").is_err());
    }

    #[test]
    fn prompt_embeds_transcript() {
        let prompt = build_prompt("my badge stopped working");
        assert!(prompt.contains("my badge stopped working"));
        assert!(prompt.contains("\"department\""));
    }

    #[test]
    fn missing_key_stores_pending_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = GrievanceStore::new(dir.path().join("g.db")).unwrap();
        let repo = CategorizingRepository::new(
            Some(GeminiCategorizer::new(None, "gemini-2.5-flash", Duration::from_secs(1))),
            store.clone(),
        );
        let stored = repo
            .process_and_store("the vending machine ate my money", Utc::now())
            .unwrap();
        assert!(stored.id.starts_with("grv-"));
        assert_eq!(stored.analysis.category, "Uncategorized");

        let (row, status) = store.get(&stored.id).unwrap().expect("row stored");
        assert_eq!(status, "pending");
        assert_eq!(row.transcript, "the vending machine ate my money");
    }

    #[test]
    fn disabled_categorisation_stores_pending_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = GrievanceStore::new(dir.path().join("g.db")).unwrap();
        let repo = CategorizingRepository::new(None, store.clone());
        let stored = repo.process_and_store("no water on floor three", Utc::now()).unwrap();

        let (_, status) = store.get(&stored.id).unwrap().expect("row stored");
        assert_eq!(status, "pending");
    }
}

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use grievance_core::StoredGrievance;
use rand::RngCore;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

#[cfg(test)]
use chrono::DateTime;
#[cfg(test)]
use grievance_core::{GrievanceAnalysis, Priority, Sentiment};

/// Whether a row carries a real categorisation or the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrievanceStatus {
    Pending,
    Processed,
}

impl GrievanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrievanceStatus::Pending => "pending",
            GrievanceStatus::Processed => "processed",
        }
    }
}

/// SQLite store for finished grievances. Transcript and summary are
/// encrypted at rest.
#[derive(Debug, Clone)]
pub struct GrievanceStore {
    db_path: PathBuf,
    cipher: TextCipher,
}

#[derive(Debug, Clone)]
struct TextCipher {
    key: [u8; 32],
}

impl TextCipher {
    fn new(scope: &Path) -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        let computer = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_default();
        let material = format!(
            "{username}|{computer}|{}|grievance-line-v1",
            scope.to_string_lossy()
        );
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        Self { key }
    }

    fn encrypt(&self, plain: &str) -> Result<String, String> {
        if plain.is_empty() {
            return Ok(String::new());
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|e| e.to_string())?;
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let encrypted = cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|e| e.to_string())?;
        let mut out = Vec::with_capacity(12 + encrypted.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&encrypted);
        Ok(BASE64.encode(out))
    }

    fn decrypt(&self, encoded: &str) -> Option<String> {
        if encoded.is_empty() {
            return Some(String::new());
        }
        let bytes = BASE64.decode(encoded).ok()?;
        if bytes.len() <= 12 {
            return None;
        }
        let (nonce_bytes, cipher_bytes) = bytes.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let plain = cipher.decrypt(nonce, cipher_bytes).ok()?;
        String::from_utf8(plain).ok()
    }
}

impl GrievanceStore {
    pub fn default_db_path() -> PathBuf {
        crate::settings::data_dir().join("grievances.db")
    }

    pub fn new(db_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let store = Self {
            cipher: TextCipher::new(&db_path),
            db_path,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, String> {
        Connection::open(&self.db_path).map_err(|e| e.to_string())
    }

    fn init_schema(&self) -> Result<(), String> {
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS grievances (
              id TEXT PRIMARY KEY,
              timestamp TEXT NOT NULL,
              transcript_enc TEXT NOT NULL,
              category TEXT NOT NULL,
              priority TEXT NOT NULL,
              sentiment TEXT NOT NULL,
              summary_enc TEXT NOT NULL,
              tags_json TEXT NOT NULL,
              location TEXT NOT NULL,
              department TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_grievances_timestamp ON grievances(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_grievances_status ON grievances(status);
            "#,
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn insert(&self, grievance: &StoredGrievance, status: GrievanceStatus) -> Result<(), String> {
        let transcript_enc = self.cipher.encrypt(&grievance.transcript)?;
        let summary_enc = self.cipher.encrypt(&grievance.analysis.summary)?;
        let tags_json =
            serde_json::to_string(&grievance.analysis.tags).map_err(|e| e.to_string())?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO grievances
            (id, timestamp, transcript_enc, category, priority, sentiment, summary_enc, tags_json, location, department, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                grievance.id,
                grievance.timestamp.to_rfc3339(),
                transcript_enc,
                grievance.analysis.category,
                grievance.analysis.priority.as_str(),
                grievance.analysis.sentiment.as_str(),
                summary_enc,
                tags_json,
                grievance.analysis.location,
                grievance.analysis.department,
                status.as_str(),
                Utc::now().timestamp()
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: &str) -> Result<Option<(StoredGrievance, String)>, String> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, transcript_enc, category, priority, sentiment, summary_enc, tags_json, location, department, status
                 FROM grievances WHERE id = ?1",
            )
            .map_err(|e| e.to_string())?;
        let mut rows = stmt.query(params![id]).map_err(|e| e.to_string())?;
        let Some(row) = rows.next().map_err(|e| e.to_string())? else {
            return Ok(None);
        };
        let get = |i: usize| row.get::<_, String>(i).map_err(|e| e.to_string());

        let timestamp = DateTime::parse_from_rfc3339(&get(1)?)
            .map_err(|e| e.to_string())?
            .with_timezone(&Utc);
        let transcript = self
            .cipher
            .decrypt(&get(2)?)
            .ok_or_else(|| "transcript decrypt failed".to_string())?;
        let summary = self
            .cipher
            .decrypt(&get(6)?)
            .ok_or_else(|| "summary decrypt failed".to_string())?;
        let tags: Vec<String> = serde_json::from_str(&get(7)?).map_err(|e| e.to_string())?;

        Ok(Some((
            StoredGrievance {
                id: get(0)?,
                timestamp,
                transcript,
                analysis: GrievanceAnalysis {
                    category: get(3)?,
                    priority: Priority::parse_lenient(&get(4)?),
                    sentiment: Sentiment::parse_lenient(&get(5)?),
                    summary,
                    tags,
                    location: get(8)?,
                    department: get(9)?,
                },
            },
            get(10)?,
        )))
    }
}

pub fn new_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{:08x}",
        Utc::now().timestamp_micros(),
        rand::random::<u32>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> StoredGrievance {
        let transcript = "the night shift has no working fire exit";
        StoredGrievance {
            id: id.into(),
            timestamp: Utc::now(),
            transcript: transcript.into(),
            analysis: GrievanceAnalysis {
                category: "Workplace Environment".into(),
                priority: Priority::High,
                sentiment: Sentiment::VeryNegative,
                summary: "Fire exit blocked on night shift.".into(),
                tags: vec!["safety".into(), "fire".into()],
                location: "Undisclosed Location".into(),
                department: "General".into(),
            },
        }
    }

    #[test]
    fn insert_then_get_round_trips_through_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let store = GrievanceStore::new(dir.path().join("db").join("grievances.db")).unwrap();
        let grievance = sample("grv-a");
        store.insert(&grievance, GrievanceStatus::Processed).unwrap();

        let (loaded, status) = store.get("grv-a").unwrap().expect("row exists");
        assert_eq!(status, "processed");
        assert_eq!(loaded.transcript, grievance.transcript);
        assert_eq!(loaded.analysis, grievance.analysis);
        assert_eq!(loaded.timestamp.timestamp(), grievance.timestamp.timestamp());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn transcript_is_not_stored_in_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grievances.db");
        let store = GrievanceStore::new(path.clone()).unwrap();
        store.insert(&sample("grv-b"), GrievanceStatus::Pending).unwrap();

        let conn = Connection::open(&path).unwrap();
        let raw: String = conn
            .query_row("SELECT transcript_enc FROM grievances WHERE id = 'grv-b'", [], |r| r.get(0))
            .unwrap();
        assert!(!raw.contains("fire exit"));
    }

    #[test]
    fn cipher_rejects_tampered_payloads() {
        let cipher = TextCipher::new(Path::new("/tmp/a.db"));
        let enc = cipher.encrypt("hello").unwrap();
        assert_eq!(cipher.decrypt(&enc).as_deref(), Some("hello"));
        assert!(TextCipher::new(Path::new("/tmp/b.db")).decrypt(&enc).is_none());
        assert!(cipher.decrypt("AAAA").is_none());
        assert_eq!(cipher.encrypt("").unwrap(), "");
    }

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_id("grv");
        let b = new_id("grv");
        assert!(a.starts_with("grv-"));
        assert_ne!(a, b);
    }
}

//! Persistent application settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use grievance_core::SessionConfig;
use serde::{Deserialize, Serialize};

/// Overrides the settings file location.
pub const SETTINGS_ENV: &str = "GRIEVANCE_SETTINGS";
/// Gemini key; wins over the key in the settings file.
pub const API_KEY_ENV: &str = "GOOGLE_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub session: SessionConfig,
    /// "wav" records cues to `recording_path`; "device" plays them on the
    /// default output (needs the `audio-cpal` feature).
    pub output: String,
    pub recording_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub categorize: bool,
    pub gemini_model: String,
    pub gemini_api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            output: "wav".into(),
            recording_path: None,
            database_path: None,
            categorize: true,
            gemini_model: "gemini-2.5-flash".into(),
            gemini_api_key: None,
            request_timeout_secs: 20,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.output = normalize_output(&self.output);
        self.gemini_model = {
            let model = self.gemini_model.trim();
            if model.is_empty() {
                "gemini-2.5-flash".into()
            } else {
                model.to_string()
            }
        };
        self.gemini_api_key = self
            .gemini_api_key
            .as_ref()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        self.request_timeout_secs = self.request_timeout_secs.clamp(1, 120);

        let session = &mut self.session;
        session.greeting_delay_ms = session.greeting_delay_ms.min(10_000);
        session.grace_ms = session.grace_ms.min(30_000);
        session.locale = {
            let locale = session.locale.trim();
            if locale.is_empty() {
                "en".into()
            } else {
                locale.to_string()
            }
        };
        session.dialogue.normalize();
    }

    /// API key from the environment, else from the settings file.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .or_else(|| self.gemini_api_key.clone())
    }
}

pub fn normalize_output(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "device" | "speaker" | "cpal" => "device".into(),
        _ => "wav".into(),
    }
}

pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Grievance Line")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("grievance-line")
    }
}

/// `$GRIEVANCE_SETTINGS` if set, else `settings.json` in the data dir.
pub fn default_settings_path() -> PathBuf {
    std::env::var_os(SETTINGS_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("settings.json"))
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(load_settings(&path).output, "wav");

        std::fs::write(&path, "{ not json").unwrap();
        let settings = load_settings(&path);
        assert_eq!(settings.session.grace_ms, 2_000);
        assert!(settings.categorize);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = AppSettings::default();
        settings.output = "device".into();
        settings.session.locale = "hi".into();
        save_settings(&path, &settings).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"greetingDelayMs\""));
        let loaded = load_settings(&path);
        assert_eq!(loaded.output, "device");
        assert_eq!(loaded.session.locale, "hi");
    }

    #[test]
    fn normalize_clamps_and_trims() {
        let mut settings = AppSettings {
            output: " Speaker ".into(),
            gemini_model: "  ".into(),
            gemini_api_key: Some("   ".into()),
            request_timeout_secs: 0,
            ..Default::default()
        };
        settings.session.grace_ms = 999_999;
        settings.session.locale = " ".into();
        settings.session.dialogue.backchannel_probability = 7.0;
        settings.normalize();

        assert_eq!(settings.output, "device");
        assert_eq!(settings.gemini_model, "gemini-2.5-flash");
        assert!(settings.gemini_api_key.is_none());
        assert_eq!(settings.request_timeout_secs, 1);
        assert_eq!(settings.session.grace_ms, 30_000);
        assert_eq!(settings.session.locale, "en");
        assert_eq!(settings.session.dialogue.backchannel_probability, 1.0);
    }
}

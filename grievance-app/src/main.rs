//! Grievance line host.
//!
//! Reads one call's transcripts from stdin (one utterance per line), drives a
//! `SessionOrchestrator`, and stores the finished grievance in SQLite after
//! categorising it with Gemini when a key is available.

mod categorize;
mod settings;
mod storage;
mod transcripts;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use categorize::{CategorizingRepository, GeminiCategorizer};
use grievance_core::{
    RepositoryHandle, SessionEvent, SessionOrchestrator, SinkHandle, TranscriptEvent, WavFileSink,
};
use settings::{data_dir, default_settings_path, load_settings, save_settings, AppSettings};
use storage::GrievanceStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Transcript channel depth between stdin and the session.
const TRANSCRIPT_CAP: usize = 32;

fn build_sink(settings: &AppSettings) -> anyhow::Result<SinkHandle> {
    let geometry = settings.session.geometry;
    if settings.output == "device" {
        #[cfg(feature = "audio-cpal")]
        {
            match grievance_core::CpalSink::open_default(geometry) {
                Ok(sink) => {
                    info!("playing cues on the default output device");
                    return Ok(SinkHandle::new(sink));
                }
                Err(e) => warn!(error = %e, "output device unavailable, recording to WAV"),
            }
        }
        #[cfg(not(feature = "audio-cpal"))]
        warn!("built without audio-cpal, recording cues to WAV instead");
    }

    let path = settings
        .recording_path
        .clone()
        .unwrap_or_else(|| data_dir().join("last_call.wav"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating recording directory {}", parent.display()))?;
    }
    let sink = WavFileSink::create(&path, geometry)
        .with_context(|| format!("opening recording {}", path.display()))?;
    info!(path = ?path, "recording cues to WAV");
    Ok(SinkHandle::new(sink))
}

fn build_repository(settings: &AppSettings) -> anyhow::Result<RepositoryHandle> {
    let db_path: PathBuf = settings
        .database_path
        .clone()
        .unwrap_or_else(GrievanceStore::default_db_path);
    let store = GrievanceStore::new(db_path.clone())
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("opening grievance store {}", db_path.display()))?;

    let categorizer = settings.categorize.then(|| {
        let api_key = settings.api_key();
        if api_key.is_none() {
            warn!("no Gemini API key, grievances will be stored uncategorised");
        }
        GeminiCategorizer::new(
            api_key,
            settings.gemini_model.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        )
    });
    info!(db_path = ?db_path, categorize = settings.categorize, "grievance store ready");
    Ok(RepositoryHandle::new(CategorizingRepository::new(categorizer, store)))
}

async fn log_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(target: "grievance_line::events", "{json}"),
                Err(e) => debug!(error = %e, "event not serialisable"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// How long shutdown waits for blocking work, such as a pending stdin read.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("grievance_core=info,grievance_line=info")
            }),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    let result = runtime.block_on(run_call());
    // A stdin read may still be parked on the blocking pool.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run_call() -> anyhow::Result<()> {
    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &settings) {
            warn!(error = %e, path = ?settings_path, "could not write default settings");
        }
    }
    settings.session.validate().context("invalid session settings")?;
    info!(
        settings_path = ?settings_path,
        output = %settings.output,
        locale = %settings.session.locale,
        asset_dir = ?settings.session.asset_dir,
        "runtime settings loaded"
    );

    // ── Session ───────────────────────────────────────────────────────────
    let sink = build_sink(&settings)?;
    let repository = build_repository(&settings)?;
    let session = SessionOrchestrator::new(settings.session.clone(), sink, repository)
        .context("building session")?;
    let logger = tokio::spawn(log_events(session.subscribe()));

    let (tx, rx) = mpsc::channel::<TranscriptEvent>(TRANSCRIPT_CAP);
    let reader = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        match transcripts::forward_lines(stdin, tx).await {
            Ok(n) => debug!(lines = n, "transcript input finished"),
            Err(e) => warn!(error = %e, "transcript input failed"),
        }
    });

    let summary = session.run(rx).await;
    reader.abort();

    if let Some(persistence) = summary.persistence {
        if let Err(e) = persistence.await {
            warn!(error = %e, "persistence task did not complete");
        }
    }
    // The session owned the only event sender; the logger ends on its own.
    let _ = logger.await;

    info!(
        session_id = %summary.session_id,
        end = ?summary.end,
        words = summary.record.word_count,
        probe_played = summary.record.probe_played,
        "call finished"
    );
    Ok(())
}

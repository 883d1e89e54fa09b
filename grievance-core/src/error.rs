use thiserror::Error;

/// All errors produced by grievance-core.
#[derive(Debug, Error)]
pub enum GrievanceError {
    #[error("audio asset not found: {path}")]
    AssetNotFound { path: std::path::PathBuf },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("unknown cue: {0}")]
    UnknownCue(String),

    #[error("output sink error: {0}")]
    Sink(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GrievanceError>;

// PackCam Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Camera '{camera}' is misconfigured: {reason}")]
    CameraConfig { camera: String, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("FFprobe error: {0}")]
    FFprobe(String),

    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Detector timed out: {0}")]
    DetectorTimeout(String),

    #[error("Invalid scheduler state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

impl PackError {
    /// Transient failures are worth another attempt; everything else is
    /// permanent for the file (or a configuration problem).
    pub fn is_transient(&self) -> bool {
        match self {
            PackError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            PackError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            PackError::DetectorTimeout(_) => true,
            _ => false,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, PackError::Config(_) | PackError::CameraConfig { .. })
    }
}

impl From<anyhow::Error> for PackError {
    fn from(err: anyhow::Error) -> Self {
        PackError::Other(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for PackError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PackError::Other(format!("lock poisoned: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PackError>;

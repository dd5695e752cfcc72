use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Encoder error: {0}")]
    EncoderError(String),
}

impl AppError {
    /// Short machine-readable tag, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
            AppError::Transport(_) => "transport",
            AppError::WebRtcError(_) => "webrtc",
            AppError::VideoError(_) => "video",
            AppError::EncoderError(_) => "encoder",
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;

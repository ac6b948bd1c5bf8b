//! Error types for playcore
//!
//! This module defines the error taxonomy used throughout the playback
//! core. We use thiserror for convenient error type definitions. Transient
//! conditions (codec needs input, empty queue, I/O stall) are not errors
//! and never appear here; they are handled in-loop by their owners.

use thiserror::Error;

/// Main error type for the playback core
#[derive(Error, Debug)]
pub enum PlayerError {
    /// Packet or frame queue errors (put on an aborted queue)
    #[error("Queue error: {0}")]
    Queue(String),

    /// Decoder errors
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Audio render errors
    #[error("Audio error: {0}")]
    Audio(String),

    /// Video render errors
    #[error("Video error: {0}")]
    Video(String),

    /// Demuxer / data source errors
    #[error("Source error: {0}")]
    Source(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlayerError {
    /// Create a decoder error from string
    pub fn decoder_error<S: Into<String>>(msg: S) -> Self {
        PlayerError::Decoder(msg.into())
    }

    /// Create a source error from string
    pub fn source_error<S: Into<String>>(msg: S) -> Self {
        PlayerError::Source(msg.into())
    }
}

/// Convenience type alias for Results in playcore
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Extension trait for converting other errors to PlayerError
pub trait IntoPlayerError<T> {
    /// Convert this error into a PlayerError with the given context
    fn queue_err(self, context: &str) -> Result<T>;
    fn decoder_err(self, context: &str) -> Result<T>;
    fn audio_err(self, context: &str) -> Result<T>;
    fn video_err(self, context: &str) -> Result<T>;
    fn source_err(self, context: &str) -> Result<T>;
    fn config_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoPlayerError<T> for std::result::Result<T, E> {
    fn queue_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Queue(format!("{}: {}", context, e)))
    }

    fn decoder_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Decoder(format!("{}: {}", context, e)))
    }

    fn audio_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Audio(format!("{}: {}", context, e)))
    }

    fn video_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Video(format!("{}: {}", context, e)))
    }

    fn source_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Source(format!("{}: {}", context, e)))
    }

    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Config(format!("{}: {}", context, e)))
    }
}

//! Shared utilities for playcore

pub mod config;
pub mod error;

pub use config::{BufferingConfig, FrameDrop, PlayerConfig, SyncTuning};
pub use error::{IntoPlayerError, PlayerError, Result};

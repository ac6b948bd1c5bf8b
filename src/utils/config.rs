//! Configuration for playcore
//!
//! Playback configuration and synchronization tuning. All timing and
//! buffering constants live here so every subsystem reads one policy
//! instead of carrying its own copy.

use crate::clock::SyncMode;
use crate::utils::error::{IntoPlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Video picture queue capacity
pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;

/// Audio sample queue capacity
pub const SAMPLE_QUEUE_SIZE: usize = 9;

/// Hard upper bound on any frame queue capacity
pub const FRAME_QUEUE_SIZE: usize = 16;

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Which clock drives playback timing
    pub sync_mode: SyncMode,

    /// Frame dropping policy for the video scheduler
    pub frame_drop: FrameDrop,

    /// Buffering thresholds for the read thread
    pub buffering: BufferingConfig,

    /// Synchronization tuning constants
    pub tuning: SyncTuning,

    /// Play range start in seconds (None plays from the beginning)
    pub start_time: Option<f64>,

    /// Play range duration in seconds (None plays to the end)
    pub play_duration: Option<f64>,

    /// Initial volume (0.0 - 1.0)
    pub volume: f32,

    /// Never apply backpressure to the read thread (realtime sources)
    pub infinite_buffer: bool,
}

/// Frame dropping policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDrop {
    /// Drop late frames whenever video is not the master clock (default)
    Auto,

    /// Always drop late frames
    Always,

    /// Never drop frames
    Never,
}

/// Read-thread buffering thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferingConfig {
    /// Minimum packets per stream before the stream counts as buffered
    pub min_frames: usize,

    /// Minimum buffered duration per stream in seconds
    pub min_duration: f64,

    /// Total byte cap across all packet queues
    pub max_queue_bytes: usize,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            min_frames: 25,
            min_duration: 1.0,
            max_queue_bytes: 15 * 1024 * 1024,
        }
    }
}

/// Synchronization tuning constants
///
/// The defaults reproduce the reference playback feel; they are grouped
/// here so audio and video correction read the same values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTuning {
    /// Minimum AV-sync threshold in seconds
    pub sync_threshold_min: f64,

    /// Maximum AV-sync threshold in seconds
    pub sync_threshold_max: f64,

    /// Delay above which a late video clock extends rather than doubles
    pub framedup_threshold: f64,

    /// Drift beyond which clocks jump instead of adjusting, in seconds
    pub nosync_threshold: f64,

    /// Number of A-V difference samples in the audio drift average
    pub audio_diff_avg_nb: u32,

    /// Maximum audio speed correction in percent of the nominal sample count
    pub sample_correction_percent_max: f64,

    /// Video scheduler poll granularity in seconds
    pub refresh_rate: f64,

    /// External clock speed bounds and adjustment step
    pub external_clock_speed_min: f64,
    pub external_clock_speed_max: f64,
    pub external_clock_speed_step: f64,

    /// Packet counts steering external clock speed adaption
    pub external_clock_min_frames: usize,
    pub external_clock_max_frames: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            sync_threshold_min: 0.04,
            sync_threshold_max: 0.1,
            framedup_threshold: 0.1,
            nosync_threshold: 10.0,
            audio_diff_avg_nb: 20,
            sample_correction_percent_max: 10.0,
            refresh_rate: 0.01,
            external_clock_speed_min: 0.900,
            external_clock_speed_max: 1.010,
            external_clock_speed_step: 0.001,
            external_clock_min_frames: 2,
            external_clock_max_frames: 10,
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::AudioMaster,
            frame_drop: FrameDrop::Auto,
            buffering: BufferingConfig::default(),
            tuning: SyncTuning::default(),
            start_time: None,
            play_duration: None,
            volume: 0.7,
            infinite_buffer: false,
        }
    }
}

impl PlayerConfig {
    /// Parse a configuration from a TOML string
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).config_err("Parsing configuration")
    }

    /// Load a configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Validate ranges that would otherwise surface as silent misbehavior
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(crate::utils::error::PlayerError::Config(format!(
                "volume {} out of range 0.0..=1.0",
                self.volume
            )));
        }
        if self.tuning.sync_threshold_min > self.tuning.sync_threshold_max {
            return Err(crate::utils::error::PlayerError::Config(
                "sync_threshold_min exceeds sync_threshold_max".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tuning_matches_reference() {
        let t = SyncTuning::default();
        assert_eq!(t.sync_threshold_min, 0.04);
        assert_eq!(t.sync_threshold_max, 0.1);
        assert_eq!(t.nosync_threshold, 10.0);
        assert_eq!(t.audio_diff_avg_nb, 20);
        assert_eq!(t.sample_correction_percent_max, 10.0);
    }

    #[test]
    fn test_from_toml() {
        let cfg = PlayerConfig::from_toml(
            r#"
            sync_mode = "audio_master"
            frame_drop = "never"
            volume = 0.5
            infinite_buffer = true

            [buffering]
            min_frames = 10
            min_duration = 0.5
            max_queue_bytes = 1048576

            [tuning]
            sync_threshold_min = 0.04
            sync_threshold_max = 0.1
            framedup_threshold = 0.1
            nosync_threshold = 10.0
            audio_diff_avg_nb = 20
            sample_correction_percent_max = 10.0
            refresh_rate = 0.01
            external_clock_speed_min = 0.9
            external_clock_speed_max = 1.01
            external_clock_speed_step = 0.001
            external_clock_min_frames = 2
            external_clock_max_frames = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.frame_drop, FrameDrop::Never);
        assert_eq!(cfg.buffering.min_frames, 10);
        assert!(cfg.infinite_buffer);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_volume() {
        let cfg = PlayerConfig {
            volume: 1.5,
            ..PlayerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

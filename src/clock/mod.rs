//! Clock model for AV synchronization
//!
//! Three clocks (audio, video, external) each track a pts and its drift
//! against wall time. A clock read is only valid while the clock's serial
//! matches the flush epoch of the queue that feeds it; after a seek the
//! read returns NaN until the owner re-anchors the clock, and every
//! consumer must branch on that before use.

use crate::queue::Serial;
use crate::utils::config::SyncTuning;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic anchor for the session's relative time axis
static TIME_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since the session time origin
pub fn time_now() -> f64 {
    TIME_ORIGIN.elapsed().as_secs_f64()
}

/// Which clock is authoritative for playback timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Audio drives; video schedules against it (default)
    AudioMaster,

    /// Video drives; audio drift correction is disabled
    VideoMaster,

    /// A free-running external clock drives both renders
    ExternalMaster,
}

#[derive(Debug, Clone, Copy)]
struct ClockState {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    serial: Serial,
    paused: bool,
    speed: f64,
}

/// A single pts/drift clock
pub struct Clock {
    state: Mutex<ClockState>,
    /// Flush epoch of the governing packet queue; `None` for a clock that
    /// governs itself (the external clock).
    queue_serial: Option<Arc<AtomicI32>>,
}

impl Clock {
    /// A clock invalidated by its governing queue's flush epoch
    pub fn new(queue_serial: Arc<AtomicI32>) -> Self {
        Self::with_serial(Some(queue_serial))
    }

    /// A self-governed clock; reads are valid as soon as it is set
    pub fn detached() -> Self {
        Self::with_serial(None)
    }

    fn with_serial(queue_serial: Option<Arc<AtomicI32>>) -> Self {
        Self {
            state: Mutex::new(ClockState {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: time_now(),
                serial: -1,
                paused: false,
                speed: 1.0,
            }),
            queue_serial,
        }
    }

    /// Current clock value in seconds, NaN while invalid.
    ///
    /// Invalid means: never set, or set under a flush epoch that a seek
    /// has since retired.
    pub fn get(&self) -> f64 {
        let state = self.state.lock();
        if let Some(q) = &self.queue_serial {
            if q.load(Ordering::Acquire) != state.serial {
                return f64::NAN;
            }
        }
        if state.paused {
            state.pts
        } else {
            let time = time_now();
            state.pts_drift + time - (time - state.last_updated) * (1.0 - state.speed)
        }
    }

    /// Anchor the clock to `pts` at an explicit wall time
    pub fn set_at(&self, pts: f64, serial: Serial, time: f64) {
        let mut state = self.state.lock();
        state.pts = pts;
        state.last_updated = time;
        state.pts_drift = pts - time;
        state.serial = serial;
    }

    /// Anchor the clock to `pts` now
    pub fn set(&self, pts: f64, serial: Serial) {
        self.set_at(pts, serial, time_now());
    }

    pub fn serial(&self) -> Serial {
        self.state.lock().serial
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    /// Change the playback speed, re-anchoring the drift first so the
    /// clock value is continuous across the change.
    pub fn set_speed(&self, speed: f64) {
        let current = self.get();
        let serial = self.serial();
        self.set(current, serial);
        self.state.lock().speed = speed;
    }

    pub fn set_paused(&self, paused: bool) {
        // Latch the current value so the paused read stays put.
        let current = self.get();
        let serial = self.serial();
        if !current.is_nan() {
            self.set(current, serial);
        }
        self.state.lock().paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Jump to `other` when this clock is invalid or diverges from it by
    /// more than the no-sync threshold.
    pub fn sync_to(&self, other: &Clock, nosync_threshold: f64) {
        let clock = self.get();
        let other_clock = other.get();
        if !other_clock.is_nan() && (clock.is_nan() || (clock - other_clock).abs() > nosync_threshold)
        {
            self.set(other_clock, other.serial());
        }
    }
}

/// The three playback clocks plus master-clock resolution
pub struct ClockSet {
    audio: Clock,
    video: Clock,
    external: Clock,
    mode: SyncMode,
    audio_present: AtomicBool,
    video_present: AtomicBool,
    tuning: SyncTuning,
}

impl ClockSet {
    pub fn new(
        mode: SyncMode,
        audio_queue_serial: Arc<AtomicI32>,
        video_queue_serial: Arc<AtomicI32>,
        tuning: SyncTuning,
    ) -> Self {
        Self {
            audio: Clock::new(audio_queue_serial),
            video: Clock::new(video_queue_serial),
            external: Clock::detached(),
            mode,
            audio_present: AtomicBool::new(false),
            video_present: AtomicBool::new(false),
            tuning,
        }
    }

    pub fn audio(&self) -> &Clock {
        &self.audio
    }

    pub fn video(&self) -> &Clock {
        &self.video
    }

    pub fn external(&self) -> &Clock {
        &self.external
    }

    pub fn tuning(&self) -> &SyncTuning {
        &self.tuning
    }

    /// Record which streams the open source actually carries
    pub fn set_streams_present(&self, audio: bool, video: bool) {
        self.audio_present.store(audio, Ordering::Release);
        self.video_present.store(video, Ordering::Release);
    }

    /// Resolve the effective sync mode: video-master falls back to
    /// audio-master, audio-master falls back to the external clock, when
    /// the preferred stream is absent.
    pub fn master_sync_type(&self) -> SyncMode {
        let audio = self.audio_present.load(Ordering::Acquire);
        let video = self.video_present.load(Ordering::Acquire);
        match self.mode {
            SyncMode::VideoMaster if video => SyncMode::VideoMaster,
            SyncMode::VideoMaster | SyncMode::AudioMaster if audio => SyncMode::AudioMaster,
            _ => SyncMode::ExternalMaster,
        }
    }

    /// Current master clock value in seconds (NaN while invalid)
    pub fn master_clock(&self) -> f64 {
        match self.master_sync_type() {
            SyncMode::AudioMaster => self.audio.get(),
            SyncMode::VideoMaster => self.video.get(),
            SyncMode::ExternalMaster => self.external.get(),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.audio.set_paused(paused);
        self.video.set_paused(paused);
        self.external.set_paused(paused);
    }

    /// Nudge the external clock's speed toward queue equilibrium; only
    /// meaningful when the external clock is master for a realtime source.
    pub fn adapt_external_clock_speed(
        &self,
        video_packets: Option<usize>,
        audio_packets: Option<usize>,
    ) {
        let t = &self.tuning;
        let starving = |n: Option<usize>| matches!(n, Some(n) if n <= t.external_clock_min_frames);
        let saturated =
            |n: Option<usize>| n.map_or(true, |n| n > t.external_clock_max_frames);

        let speed = self.external.speed();
        if starving(video_packets) || starving(audio_packets) {
            self.external
                .set_speed(t.external_clock_speed_min.max(speed - t.external_clock_speed_step));
        } else if saturated(video_packets) && saturated(audio_packets) {
            self.external
                .set_speed(t.external_clock_speed_max.min(speed + t.external_clock_speed_step));
        } else if speed != 1.0 {
            self.external
                .set_speed(speed + t.external_clock_speed_step * (1.0 - speed) / (1.0 - speed).abs());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial_handle(value: Serial) -> Arc<AtomicI32> {
        Arc::new(AtomicI32::new(value))
    }

    fn clock_set(mode: SyncMode, audio: bool, video: bool) -> ClockSet {
        let set = ClockSet::new(mode, serial_handle(1), serial_handle(1), SyncTuning::default());
        set.set_streams_present(audio, video);
        set
    }

    #[test]
    fn test_unset_clock_is_invalid() {
        let clock = Clock::new(serial_handle(0));
        assert!(clock.get().is_nan());
    }

    #[test]
    fn test_serial_mismatch_invalidates() {
        let handle = serial_handle(1);
        let clock = Clock::new(Arc::clone(&handle));
        clock.set(5.0, 1);
        assert!(!clock.get().is_nan());

        // A flush retires the epoch; reads go invalid until re-anchored.
        handle.store(2, Ordering::Release);
        assert!(clock.get().is_nan());
        clock.set(7.0, 2);
        assert!((clock.get() - 7.0).abs() < 0.05);
    }

    #[test]
    fn test_paused_clock_holds_pts() {
        let clock = Clock::new(serial_handle(1));
        clock.set(3.0, 1);
        clock.set_paused(true);
        let a = clock.get();
        std::thread::sleep(std::time::Duration::from_millis(15));
        let b = clock.get();
        assert_eq!(a, b);
    }

    #[test]
    fn test_clock_advances_with_time() {
        let clock = Clock::new(serial_handle(1));
        clock.set(10.0, 1);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let value = clock.get();
        assert!(value > 10.0 && value < 10.5);
    }

    #[test]
    fn test_sync_to_adopts_divergent_value() {
        let a = Clock::detached();
        let b = Clock::detached();
        b.set(100.0, 3);
        a.sync_to(&b, 10.0);
        assert!((a.get() - 100.0).abs() < 0.05);
        assert_eq!(a.serial(), 3);

        // Within the threshold nothing changes.
        b.set(100.5, 4);
        a.sync_to(&b, 10.0);
        assert_eq!(a.serial(), 3);
    }

    #[test]
    fn test_master_fallback_table() {
        // {requested mode} x {stream presence} per the documented table.
        let cases = [
            (SyncMode::VideoMaster, true, true, SyncMode::VideoMaster),
            (SyncMode::VideoMaster, true, false, SyncMode::AudioMaster),
            (SyncMode::VideoMaster, false, false, SyncMode::ExternalMaster),
            (SyncMode::AudioMaster, true, true, SyncMode::AudioMaster),
            (SyncMode::AudioMaster, false, true, SyncMode::ExternalMaster),
            (SyncMode::AudioMaster, false, false, SyncMode::ExternalMaster),
            (SyncMode::ExternalMaster, true, true, SyncMode::ExternalMaster),
        ];
        for (mode, audio, video, expected) in cases {
            let set = clock_set(mode, audio, video);
            assert_eq!(set.master_sync_type(), expected, "{:?} a={} v={}", mode, audio, video);
        }
    }

    #[test]
    fn test_external_speed_adaption() {
        let set = clock_set(SyncMode::ExternalMaster, true, true);

        // Starved queues slow the clock down.
        set.adapt_external_clock_speed(Some(1), Some(30));
        assert!(set.external().speed() < 1.0);

        // Saturated queues speed it back up past nominal.
        for _ in 0..400 {
            set.adapt_external_clock_speed(Some(30), Some(30));
        }
        assert!(set.external().speed() > 1.0);
    }
}

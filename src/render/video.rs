//! Video scheduling and presentation
//!
//! The video render runs its own thread, polling the picture queue on a
//! short tick. For every picture it computes how long the previous one
//! should stay on screen given the drift between the video clock and the
//! master clock: late frames shorten the delay or get dropped, early
//! frames extend it. Presentation itself goes through a `VideoPresenter`
//! so the core never touches a windowing system.

use crate::clock::{time_now, ClockSet, SyncMode};
use crate::msg::{MessageQueue, PlayerEvent};
use crate::queue::{Frame, FrameQueue, QueueDepth};
use crate::utils::config::{FrameDrop, SyncTuning};
use crate::utils::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A decoded picture ready for presentation
#[derive(Debug, Clone)]
pub struct VideoPicture {
    pub width: u32,
    pub height: u32,

    /// Sample aspect ratio (1.0 for square pixels)
    pub sar: f64,

    /// Opaque pixel payload, shared so queue slots stay cheap to clone
    pub pixels: Arc<Vec<u8>>,
}

/// Display seam. Implementations own the actual output surface.
pub trait VideoPresenter: Send {
    fn present(&mut self, frame: &Frame<VideoPicture>) -> Result<()>;
}

/// Commands accepted by the running render thread
#[derive(Debug, Clone, Copy)]
pub enum VideoCommand {
    SetPaused(bool),

    /// Advance exactly one frame, then hold
    Step,

    /// Re-present the current frame (e.g. after a surface resize)
    ForceRefresh,
}

/// How long the previous picture stays up, given the current scheduling
/// delay and the video-to-master clock difference.
///
/// Within the jitter threshold the delay passes through unchanged. A late
/// video clock eats into the delay (down to zero); an early one extends
/// it, either by doubling or, for long frames, by the full difference so
/// a single frame absorbs the gap. Differences beyond `max_frame_duration`
/// are treated as timestamp discontinuities and left to the clocks.
pub fn compute_target_delay(
    delay: f64,
    diff: f64,
    tuning: &SyncTuning,
    max_frame_duration: f64,
) -> f64 {
    let sync_threshold = delay.clamp(tuning.sync_threshold_min, tuning.sync_threshold_max);
    if !diff.is_nan() && diff.abs() < max_frame_duration {
        if diff <= -sync_threshold {
            return (delay + diff).max(0.0);
        }
        if diff >= sync_threshold && delay > tuning.framedup_threshold {
            return delay + diff;
        }
        if diff >= sync_threshold {
            return 2.0 * delay;
        }
    }
    delay
}

/// Nominal on-screen duration of `frame` given its successor. Falls back
/// to the frame's own duration across epochs, non-monotonic timestamps,
/// and gaps larger than `max_frame_duration`.
pub fn frame_duration<T>(frame: &Frame<T>, next: &Frame<T>, max_frame_duration: f64) -> f64 {
    if frame.serial != next.serial {
        return 0.0;
    }
    let d = next.pts - frame.pts;
    if d.is_nan() || d <= 0.0 || d > max_frame_duration {
        frame.duration
    } else {
        d
    }
}

/// Video render thread state
pub struct VideoRender<P: VideoPresenter> {
    picq: Arc<FrameQueue<VideoPicture>>,
    clocks: Arc<ClockSet>,
    presenter: P,
    events: Arc<MessageQueue>,
    frame_drop: FrameDrop,
    max_frame_duration: f64,

    frame_timer: f64,
    force_refresh: bool,
    paused: bool,
    step: bool,
    rendered_first: bool,

    frame_drops_late: Arc<AtomicU64>,
    commands: Receiver<VideoCommand>,
    abort: Arc<AtomicBool>,
}

/// Control handle for a running video render thread
pub struct VideoRenderHandle {
    join: Option<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    commands: Sender<VideoCommand>,
    frame_drops_late: Arc<AtomicU64>,
}

impl VideoRenderHandle {
    pub fn set_paused(&self, paused: bool) {
        let _ = self.commands.send(VideoCommand::SetPaused(paused));
    }

    pub fn step(&self) {
        let _ = self.commands.send(VideoCommand::Step);
    }

    pub fn force_refresh(&self) {
        let _ = self.commands.send(VideoCommand::ForceRefresh);
    }

    /// Frames dropped for arriving after their display window
    pub fn frame_drops_late(&self) -> u64 {
        self.frame_drops_late.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("video render thread panicked");
            }
        }
    }
}

impl<P: VideoPresenter + 'static> VideoRender<P> {
    pub fn new(
        picq: Arc<FrameQueue<VideoPicture>>,
        clocks: Arc<ClockSet>,
        presenter: P,
        events: Arc<MessageQueue>,
        frame_drop: FrameDrop,
        max_frame_duration: f64,
    ) -> (Self, Sender<VideoCommand>) {
        let (tx, rx) = unbounded();
        let render = Self {
            picq,
            clocks,
            presenter,
            events,
            frame_drop,
            max_frame_duration,
            frame_timer: 0.0,
            force_refresh: false,
            paused: false,
            step: false,
            rendered_first: false,
            frame_drops_late: Arc::new(AtomicU64::new(0)),
            commands: rx,
            abort: Arc::new(AtomicBool::new(false)),
        };
        (render, tx)
    }

    pub fn spawn(self, commands: Sender<VideoCommand>) -> VideoRenderHandle {
        let abort = Arc::clone(&self.abort);
        let frame_drops_late = Arc::clone(&self.frame_drops_late);
        let join = std::thread::Builder::new()
            .name("video-render".to_string())
            .spawn(move || {
                self.run();
                debug!("thread video-render done");
            })
            .expect("failed to spawn video render thread");
        VideoRenderHandle {
            join: Some(join),
            abort,
            commands,
            frame_drops_late,
        }
    }

    fn run(mut self) {
        let mut remaining = 0.0f64;
        loop {
            if self.abort.load(Ordering::Acquire) || self.picq.is_aborted() {
                break;
            }
            while let Ok(cmd) = self.commands.try_recv() {
                match cmd {
                    VideoCommand::SetPaused(paused) => {
                        self.paused = paused;
                        // Scheduling restarts from now, not from where the
                        // timer was when we paused.
                        if !paused {
                            self.frame_timer = time_now();
                        }
                    }
                    VideoCommand::Step => {
                        self.paused = false;
                        self.step = true;
                    }
                    VideoCommand::ForceRefresh => self.force_refresh = true,
                }
            }
            if remaining > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(remaining));
            }
            remaining = self.clocks.tuning().refresh_rate;
            if !self.paused || self.force_refresh {
                self.refresh(&mut remaining);
            }
        }
    }

    /// One scheduling pass. May consume several pictures (stale epochs,
    /// late drops), advance one, or just shorten `remaining` until the
    /// current picture's display window ends.
    fn refresh(&mut self, remaining: &mut f64) {
        loop {
            if self.picq.nb_remaining() == 0 {
                break;
            }
            let Some(vp) = self.picq.peek() else { break };

            // Pre-seek pictures are consumed without display.
            if vp.serial != self.picq.queue_serial() {
                self.picq.next();
                continue;
            }

            let lastvp = self.picq.peek_last();
            if lastvp.as_ref().map_or(true, |l| l.serial != vp.serial) {
                self.frame_timer = time_now();
            }
            if self.paused {
                break;
            }

            let last_duration = lastvp
                .map(|l| frame_duration(&l, &vp, self.max_frame_duration))
                .unwrap_or(vp.duration);
            let delay = self.target_delay(last_duration);

            let time = time_now();
            if time < self.frame_timer + delay {
                // The current picture's window has not ended; wake up when
                // it does.
                *remaining = (self.frame_timer + delay - time).min(*remaining);
                break;
            }

            self.frame_timer += delay;
            if delay > 0.0 && time - self.frame_timer > self.clocks.tuning().sync_threshold_max
            {
                // Fell too far behind schedule to catch up gradually.
                self.frame_timer = time;
            }

            if !vp.pts.is_nan() {
                self.clocks.video().set(vp.pts, vp.serial);
                self.clocks
                    .external()
                    .sync_to(self.clocks.video(), self.clocks.tuning().nosync_threshold);
            }

            if self.picq.nb_remaining() > 1 {
                if let Some(nextvp) = self.picq.peek_next() {
                    let duration = frame_duration(&vp, &nextvp, self.max_frame_duration);
                    if !self.step
                        && self.dropping_enabled()
                        && time > self.frame_timer + duration
                    {
                        self.frame_drops_late.fetch_add(1, Ordering::AcqRel);
                        self.picq.next();
                        continue;
                    }
                }
            }

            self.picq.next();
            self.force_refresh = true;
            if self.step && !self.paused {
                self.paused = true;
                self.step = false;
            }
            break;
        }

        if self.force_refresh {
            if let Some(frame) = self.picq.shown_frame() {
                self.display(&frame);
            }
            self.force_refresh = false;
        }
    }

    fn target_delay(&self, delay: f64) -> f64 {
        if self.clocks.master_sync_type() == SyncMode::VideoMaster {
            return delay;
        }
        let diff = self.clocks.video().get() - self.clocks.master_clock();
        compute_target_delay(
            delay,
            diff,
            self.clocks.tuning(),
            self.max_frame_duration,
        )
    }

    fn dropping_enabled(&self) -> bool {
        match self.frame_drop {
            FrameDrop::Always => true,
            FrameDrop::Never => false,
            FrameDrop::Auto => self.clocks.master_sync_type() != SyncMode::VideoMaster,
        }
    }

    fn display(&mut self, frame: &Frame<VideoPicture>) {
        if let Err(e) = self.presenter.present(frame) {
            warn!("video presentation failed: {}", e);
            return;
        }
        if !self.rendered_first {
            self.rendered_first = true;
            self.events.post_args(
                PlayerEvent::FirstVideoFrameRendered,
                i64::from(frame.data.width),
                i64::from(frame.data.height),
            );
        }
    }
}

//! Demuxer read thread
//!
//! One thread pulls compressed packets from the external container and
//! routes them into the per-stream packet queues. It owns seek execution
//! (flush all queues, bump their epochs, re-anchor the external clock),
//! applies backpressure when the queues hold enough data, and injects the
//! one-shot end-of-stream sentinels.

use crate::clock::ClockSet;
use crate::msg::{MessageQueue, PlayerEvent};
use crate::queue::{Packet, PacketEntry, PacketQueue, QueueDepth};
use crate::utils::config::BufferingConfig;
use crate::utils::error::Result;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the read thread naps when stalled or backpressured
const READ_WAIT: Duration = Duration::from_millis(10);

/// Wakeup handle the decoders use to prod a backpressured read thread
/// when their queue runs dry.
pub struct ReadWake {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Default for ReadWake {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadWake {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

/// Stream classification as reported by the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

/// Per-stream metadata from the container
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,

    /// Stream start time in seconds (NaN if unknown)
    pub start_time: f64,

    /// The stream is a single attached picture (cover art), not a feed
    pub attached_picture: bool,
}

/// Outcome of one container read
pub enum DemuxPoll {
    Packet(Packet),

    /// Transiently unavailable (network stall); retry shortly
    Again,

    /// End of container
    Eof,
}

/// External container seam
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Pull the next packet; fatal I/O errors terminate the read thread
    fn read_packet(&mut self) -> Result<DemuxPoll>;

    /// Reposition the container. Failure is recoverable: playback
    /// continues from the prior position.
    fn seek(&mut self, target: f64, by_bytes: bool) -> Result<()>;

    /// The attached picture packet for a cover-art stream
    fn attached_picture(&mut self, stream_index: usize) -> Option<Packet>;

    /// Total container duration in seconds, when the container knows it
    fn duration(&self) -> Option<f64> {
        None
    }

    /// Containers with discontinuous timestamps cap frame durations lower
    fn discontinuous_timestamps(&self) -> bool {
        false
    }
}

/// A pending reposition request, served by the read thread
#[derive(Debug, Clone, Copy)]
pub struct SeekRequest {
    pub target: f64,
    pub by_bytes: bool,
}

/// Everything the read thread needs to know about one open stream
pub struct StreamBinding {
    pub index: usize,
    pub queue: Arc<PacketQueue>,
    pub frames: Arc<dyn QueueDepth>,
    pub finished: Arc<AtomicI32>,
    pub start_time: f64,
    pub attached_picture: bool,
}

impl StreamBinding {
    fn finished_and_drained(&self) -> bool {
        self.finished.load(Ordering::Acquire) == self.queue.serial()
            && self.frames.nb_remaining() == 0
    }
}

/// Play-range and buffering policy for the read thread
pub struct SourceConfig {
    pub buffering: BufferingConfig,
    pub start_time: Option<f64>,
    pub play_duration: Option<f64>,
    pub infinite_buffer: bool,
}

/// The read thread body
pub struct DataSource<D: Demuxer> {
    demuxer: D,
    audio: Option<StreamBinding>,
    video: Option<StreamBinding>,
    clocks: Arc<ClockSet>,
    events: Arc<MessageQueue>,
    read_wake: Arc<ReadWake>,
    seek_req: Arc<Mutex<Option<SeekRequest>>>,
    abort: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    cfg: SourceConfig,

    eof: bool,
    queue_attachments_req: bool,
    completed: bool,

    /// True while the queues sit below their thresholds; the buffered
    /// state is announced once when they cross back over.
    buffering: bool,
}

/// Control handle for the running read thread
pub struct SourceHandle {
    join: Option<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    seek_req: Arc<Mutex<Option<SeekRequest>>>,
    read_wake: Arc<ReadWake>,
}

impl SourceHandle {
    /// Record a seek; the read thread serves it on its next iteration
    pub fn request_seek(&self, target: f64, by_bytes: bool) {
        *self.seek_req.lock() = Some(SeekRequest { target, by_bytes });
        self.read_wake.notify();
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
        self.read_wake.notify();
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("read thread panicked");
            }
        }
    }
}

impl<D: Demuxer + 'static> DataSource<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        demuxer: D,
        audio: Option<StreamBinding>,
        video: Option<StreamBinding>,
        clocks: Arc<ClockSet>,
        events: Arc<MessageQueue>,
        read_wake: Arc<ReadWake>,
        seek_req: Arc<Mutex<Option<SeekRequest>>>,
        paused: Arc<AtomicBool>,
        cfg: SourceConfig,
    ) -> Self {
        Self {
            demuxer,
            audio,
            video,
            clocks,
            events,
            read_wake,
            seek_req,
            abort: Arc::new(AtomicBool::new(false)),
            paused,
            cfg,
            eof: false,
            queue_attachments_req: true,
            completed: false,
            buffering: true,
        }
    }

    pub fn spawn(self) -> SourceHandle {
        let abort = Arc::clone(&self.abort);
        let seek_req = Arc::clone(&self.seek_req);
        let read_wake = Arc::clone(&self.read_wake);
        let join = std::thread::Builder::new()
            .name("demux-read".to_string())
            .spawn(move || {
                self.run();
                debug!("thread demux-read done");
            })
            .expect("failed to spawn read thread");
        SourceHandle {
            join: Some(join),
            abort,
            seek_req,
            read_wake,
        }
    }

    fn run(mut self) {
        loop {
            if self.abort.load(Ordering::Acquire) {
                break;
            }

            let pending_seek = self.seek_req.lock().take();
            if let Some(req) = pending_seek {
                self.serve_seek(req);
            }

            if self.queue_attachments_req {
                self.queue_attachments();
                self.queue_attachments_req = false;
            }

            // A free-running master clock is steered toward queue
            // equilibrium instead of letting the buffers run away.
            if self.clocks.master_sync_type() == crate::clock::SyncMode::ExternalMaster {
                self.clocks.adapt_external_clock_speed(
                    self.video.as_ref().map(|b| b.queue.nb_packets()),
                    self.audio.as_ref().map(|b| b.queue.nb_packets()),
                );
            }

            if !self.cfg.infinite_buffer && self.queues_are_full() {
                if self.buffering {
                    self.buffering = false;
                    self.report_buffered();
                }
                self.read_wake.wait_timeout(READ_WAIT);
                continue;
            }
            self.buffering = true;

            self.check_completed();

            match self.demuxer.read_packet() {
                Ok(DemuxPoll::Packet(pkt)) => {
                    self.eof = false;
                    self.route(pkt);
                }
                Ok(DemuxPoll::Again) => {
                    self.read_wake.wait_timeout(READ_WAIT);
                }
                Ok(DemuxPoll::Eof) => {
                    if !self.eof {
                        self.eof = true;
                        self.inject_eof_sentinels();
                    }
                    self.read_wake.wait_timeout(READ_WAIT);
                }
                Err(e) => {
                    // Fatal to this subsystem only; the rest of the
                    // pipeline stays alive and reports through events.
                    error!("container read failed: {}", e);
                    self.events.post(PlayerEvent::SubsystemError);
                    break;
                }
            }
        }
    }

    fn serve_seek(&mut self, req: SeekRequest) {
        match self.demuxer.seek(req.target, req.by_bytes) {
            Err(e) => {
                warn!("seek to {:.3}s failed: {}", req.target, e);
            }
            Ok(()) => {
                for binding in [&self.audio, &self.video].into_iter().flatten() {
                    binding.queue.flush();
                    let _ = binding.queue.put_flush();
                }
                if req.by_bytes {
                    self.clocks.external().set(f64::NAN, 0);
                } else {
                    self.clocks.external().set(req.target, 0);
                }
                self.events.post_args(
                    PlayerEvent::SeekCompleted,
                    (req.target * 1000.0) as i64,
                    0,
                );
            }
        }
        self.queue_attachments_req = true;
        self.eof = false;
        self.completed = false;
        self.buffering = true;
    }

    /// Cover art is delivered as a one-frame video stream: inject the
    /// picture packet followed by its end-of-stream sentinel.
    fn queue_attachments(&mut self) {
        let Some(video) = &self.video else { return };
        if !video.attached_picture {
            return;
        }
        if let Some(pic) = self.demuxer.attached_picture(video.index) {
            let _ = video.queue.put(PacketEntry::Data(pic));
            let _ = video.queue.put_eof(video.index);
        }
    }

    fn stream_has_enough(&self, binding: &Option<StreamBinding>) -> bool {
        let Some(b) = binding else { return true };
        if b.queue.is_aborted() || b.attached_picture {
            return true;
        }
        let stats = b.queue.stats();
        stats.nb_packets > self.cfg.buffering.min_frames
            && (stats.duration == 0.0 || stats.duration > self.cfg.buffering.min_duration)
    }

    fn queues_are_full(&self) -> bool {
        let total_bytes: usize = [&self.audio, &self.video]
            .into_iter()
            .flatten()
            .map(|b| b.queue.stats().size)
            .sum();
        total_bytes > self.cfg.buffering.max_queue_bytes
            || (self.stream_has_enough(&self.audio) && self.stream_has_enough(&self.video))
    }

    /// Announce the buffered state: one position update plus the end of
    /// the refill cycle. Called on the below-to-above threshold
    /// transition only.
    fn report_buffered(&self) {
        let buffered = [&self.audio, &self.video]
            .into_iter()
            .flatten()
            .filter(|b| !b.attached_picture)
            .map(|b| b.queue.stats().duration)
            .fold(f64::INFINITY, f64::min);
        if buffered.is_finite() {
            self.events
                .post_args(PlayerEvent::BufferingUpdate, (buffered * 1000.0) as i64, 0);
        }
        self.events.post(PlayerEvent::BufferingEnd);
    }

    fn check_completed(&mut self) {
        if self.completed || self.paused.load(Ordering::Acquire) {
            return;
        }
        let done = |b: &Option<StreamBinding>| b.as_ref().map_or(true, |b| b.finished_and_drained());
        if (self.audio.is_some() || self.video.is_some())
            && done(&self.audio)
            && done(&self.video)
        {
            self.completed = true;
            self.events.post(PlayerEvent::Completed);
        }
    }

    fn inject_eof_sentinels(&self) {
        for binding in [&self.audio, &self.video].into_iter().flatten() {
            let _ = binding.queue.put_eof(binding.index);
        }
    }

    fn in_play_range(&self, binding: &StreamBinding, pkt: &Packet) -> bool {
        let Some(duration) = self.cfg.play_duration else {
            return true;
        };
        let ts = pkt.pts_or_dts();
        if ts.is_nan() {
            return true;
        }
        let stream_start = if binding.start_time.is_nan() {
            0.0
        } else {
            binding.start_time
        };
        ts - stream_start - self.cfg.start_time.unwrap_or(0.0) <= duration
    }

    fn route(&mut self, pkt: Packet) {
        if let Some(audio) = &self.audio {
            if pkt.stream_index == audio.index && self.in_play_range(audio, &pkt) {
                let _ = audio.queue.put(PacketEntry::Data(pkt));
                return;
            }
        }
        if let Some(video) = &self.video {
            if pkt.stream_index == video.index
                && !video.attached_picture
                && self.in_play_range(video, &pkt)
            {
                let _ = video.queue.put(PacketEntry::Data(pkt));
                return;
            }
        }
        // Unmatched stream or outside the play range: discard.
    }
}

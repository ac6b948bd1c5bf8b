//! Serial-stamped packet queue
//!
//! Thread-safe FIFO of compressed units between the read thread and one
//! decoder thread. Every entry is stamped with the queue's flush epoch
//! ("serial") at enqueue time; a flush entry bumps the epoch, so consumers
//! can discard anything queued before a seek without racing the new data.

use crate::utils::error::{PlayerError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Flush epoch counter type. `-1` means "never stamped".
pub type Serial = i32;

/// A compressed unit as handed over by the demuxer
#[derive(Debug, Clone)]
pub struct Packet {
    /// Index of the originating stream in the container
    pub stream_index: usize,

    /// Presentation timestamp in seconds (NaN if undefined)
    pub pts: f64,

    /// Decode timestamp in seconds (NaN if undefined)
    pub dts: f64,

    /// Duration in seconds (0.0 if unknown)
    pub duration: f64,

    /// Byte position in the source (-1 if unknown)
    pub pos: i64,

    /// Opaque compressed payload
    pub data: Vec<u8>,
}

impl Packet {
    /// Byte size used for queue accounting
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// pts, falling back to dts when the pts is undefined
    pub fn pts_or_dts(&self) -> f64 {
        if self.pts.is_nan() {
            self.dts
        } else {
            self.pts
        }
    }
}

/// Queue entries: data, flush marker, or per-stream end-of-stream sentinel
#[derive(Debug, Clone)]
pub enum PacketEntry {
    Data(Packet),

    /// Bumps the queue serial on enqueue; receivers reset codec state
    Flush,

    /// One-shot end-of-stream marker; puts the codec into drain mode
    Eof { stream_index: usize },
}

impl PacketEntry {
    fn size(&self) -> usize {
        match self {
            PacketEntry::Data(p) => p.size(),
            _ => 0,
        }
    }

    fn duration(&self) -> f64 {
        match self {
            PacketEntry::Data(p) => p.duration,
            _ => 0.0,
        }
    }
}

/// Queue occupancy statistics used for backpressure and progress reporting
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketQueueStats {
    /// Number of queued entries
    pub nb_packets: usize,

    /// Total payload bytes queued
    pub size: usize,

    /// Total queued duration in seconds
    pub duration: f64,
}

struct Inner {
    entries: VecDeque<(PacketEntry, Serial)>,
    nb_packets: usize,
    size: usize,
    duration: f64,
}

/// Thread-safe packet FIFO with abort semantics and a flush epoch
pub struct PacketQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    serial: Arc<AtomicI32>,
    abort_request: AtomicBool,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    /// Create a queue in the aborted state; call `start()` before use.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                nb_packets: 0,
                size: 0,
                duration: 0.0,
            }),
            cond: Condvar::new(),
            serial: Arc::new(AtomicI32::new(0)),
            abort_request: AtomicBool::new(true),
        }
    }

    /// Shared handle to the current flush epoch, for clocks and decoders
    pub fn serial_handle(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.serial)
    }

    /// The current flush epoch
    pub fn serial(&self) -> Serial {
        self.serial.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_request.load(Ordering::Acquire)
    }

    /// Clear the abort flag and enqueue a flush entry to establish the
    /// initial epoch. No-op when the queue is already running.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if !self.is_aborted() {
            return;
        }
        self.abort_request.store(false, Ordering::Release);
        self.put_locked(&mut inner, PacketEntry::Flush);
    }

    /// Set the abort flag and wake every blocked caller
    pub fn abort(&self) {
        let _inner = self.inner.lock();
        self.abort_request.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Append an entry, stamping the current epoch.
    ///
    /// The only error path is putting on an aborted queue; the entry is
    /// dropped and the caller may retry after checking abort state.
    pub fn put(&self, entry: PacketEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.is_aborted() {
            return Err(PlayerError::Queue("put on aborted queue".to_string()));
        }
        self.put_locked(&mut inner, entry);
        Ok(())
    }

    /// Enqueue the per-stream end-of-stream sentinel
    pub fn put_eof(&self, stream_index: usize) -> Result<()> {
        self.put(PacketEntry::Eof { stream_index })
    }

    /// Enqueue a flush entry, bumping the epoch
    pub fn put_flush(&self) -> Result<()> {
        self.put(PacketEntry::Flush)
    }

    fn put_locked(&self, inner: &mut Inner, entry: PacketEntry) {
        if matches!(entry, PacketEntry::Flush) {
            self.serial.fetch_add(1, Ordering::AcqRel);
        }
        let serial = self.serial.load(Ordering::Acquire);
        inner.nb_packets += 1;
        inner.size += entry.size();
        inner.duration += entry.duration();
        inner.entries.push_back((entry, serial));
        self.cond.notify_one();
    }

    /// Dequeue the oldest entry together with its stamped serial.
    ///
    /// Non-blocking mode returns `Ok(None)` on an empty queue. Blocking
    /// mode waits for data, invoking `on_block` once before first waiting,
    /// and returns an error as soon as the queue is aborted.
    pub fn get(
        &self,
        block: bool,
        mut on_block: Option<&mut dyn FnMut()>,
    ) -> Result<Option<(PacketEntry, Serial)>> {
        let mut inner = self.inner.lock();
        loop {
            if self.is_aborted() {
                return Err(PlayerError::Queue("queue aborted".to_string()));
            }
            if let Some((entry, serial)) = inner.entries.pop_front() {
                inner.nb_packets -= 1;
                inner.size -= entry.size();
                inner.duration -= entry.duration();
                return Ok(Some((entry, serial)));
            }
            if !block {
                return Ok(None);
            }
            if let Some(hook) = on_block.take() {
                hook();
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Discard all buffered entries and reset the accounting counters.
    /// The epoch is unchanged; only flush entries move it.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.nb_packets = 0;
        inner.size = 0;
        inner.duration = 0.0;
    }

    pub fn stats(&self) -> PacketQueueStats {
        let inner = self.inner.lock();
        PacketQueueStats {
            nb_packets: inner.nb_packets,
            size: inner.size,
            duration: inner.duration,
        }
    }

    pub fn nb_packets(&self) -> usize {
        self.inner.lock().nb_packets
    }
}

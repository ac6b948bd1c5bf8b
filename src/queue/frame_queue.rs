//! Bounded frame ring buffer
//!
//! Decoded units travel from a decoder thread to exactly one render
//! through this fixed-capacity ring. Capacity is intentionally small; the
//! pipeline is latency-bounded, not a large buffer. The reader can keep
//! the most recently displayed frame visible (`keep_last`) so the video
//! scheduler can re-present it while paused and compute durations against
//! it, and gets one-ahead lookahead for the sync math.

use crate::queue::packet_queue::{PacketQueue, Serial};
use crate::utils::config::FRAME_QUEUE_SIZE;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// A decoded unit plus the timing metadata the renders need
#[derive(Debug, Clone)]
pub struct Frame<T> {
    /// Decoded payload (cheaply clonable; pixel/sample data is shared)
    pub data: T,

    /// Presentation timestamp in seconds (NaN if undefined)
    pub pts: f64,

    /// Nominal duration in seconds
    pub duration: f64,

    /// Byte position of the originating packet in the source
    pub pos: i64,

    /// Flush epoch of the packet this frame was decoded from
    pub serial: Serial,
}

struct Ring<T> {
    slots: Vec<Option<Frame<T>>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
}

/// Fixed-capacity frame queue with independent read/write cursors
pub struct FrameQueue<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    pktq: Arc<PacketQueue>,
    max_size: usize,
    keep_last: bool,
}

/// Read access to queue depth without knowing the payload type
pub trait QueueDepth: Send + Sync {
    /// Number of frames still to be consumed
    fn nb_remaining(&self) -> usize;
}

impl<T: Clone + Send> QueueDepth for FrameQueue<T> {
    fn nb_remaining(&self) -> usize {
        let ring = self.ring.lock();
        ring.size - ring.rindex_shown
    }
}

impl<T: Clone + Send> FrameQueue<T> {
    /// Create a queue bound to the packet queue whose abort flag governs
    /// all blocking operations here.
    pub fn new(pktq: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let max_size = max_size.min(FRAME_QUEUE_SIZE).max(1);
        let mut slots = Vec::with_capacity(max_size);
        slots.resize_with(max_size, || None);
        Self {
            ring: Mutex::new(Ring {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            pktq,
            max_size,
            keep_last,
        }
    }

    /// Wake all waiters; used on abort so blocked peers re-check state
    pub fn signal(&self) {
        self.cond.notify_all();
    }

    /// Append a frame, blocking while the ring is full.
    ///
    /// Returns `false` when the governing packet queue aborted; the frame
    /// is dropped in that case.
    pub fn push(&self, frame: Frame<T>) -> bool {
        let mut ring = self.ring.lock();
        while ring.size >= self.max_size && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return false;
        }
        let windex = ring.windex;
        ring.slots[windex] = Some(frame);
        ring.windex = (windex + 1) % self.max_size;
        ring.size += 1;
        drop(ring);
        self.cond.notify_all();
        true
    }

    /// The frame the reader would consume next
    pub fn peek(&self) -> Option<Frame<T>> {
        let ring = self.ring.lock();
        ring.slots[(ring.rindex + ring.rindex_shown) % self.max_size].clone()
    }

    /// One frame of lookahead past `peek()`
    pub fn peek_next(&self) -> Option<Frame<T>> {
        let ring = self.ring.lock();
        ring.slots[(ring.rindex + ring.rindex_shown + 1) % self.max_size].clone()
    }

    /// The most recently displayed frame (valid once `rindex_shown` is set)
    pub fn peek_last(&self) -> Option<Frame<T>> {
        let ring = self.ring.lock();
        ring.slots[ring.rindex].clone()
    }

    /// Block until a frame is readable, returning it without consuming.
    ///
    /// Returns `None` when the governing packet queue aborted.
    pub fn peek_readable(&self) -> Option<Frame<T>> {
        let mut ring = self.ring.lock();
        while ring.size - ring.rindex_shown == 0 && !self.pktq.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return None;
        }
        ring.slots[(ring.rindex + ring.rindex_shown) % self.max_size].clone()
    }

    /// Advance the read cursor past the current frame.
    ///
    /// With `keep_last`, the first call only marks the current frame as
    /// shown; it stays addressable through `peek_last()`.
    pub fn next(&self) {
        let mut ring = self.ring.lock();
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = None;
        ring.rindex = (rindex + 1) % self.max_size;
        ring.size -= 1;
        drop(ring);
        self.cond.notify_all();
    }

    /// The last shown frame, or `None` before anything was shown
    pub fn shown_frame(&self) -> Option<Frame<T>> {
        let ring = self.ring.lock();
        if ring.rindex_shown == 0 {
            return None;
        }
        ring.slots[ring.rindex].clone()
    }

    /// Byte position of the last shown frame, if it belongs to the
    /// current epoch; used to anchor byte-based seeks.
    pub fn last_shown_pos(&self) -> Option<i64> {
        let ring = self.ring.lock();
        if ring.rindex_shown == 0 {
            return None;
        }
        match &ring.slots[ring.rindex] {
            Some(f) if f.serial == self.pktq.serial() => Some(f.pos),
            _ => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Current flush epoch of the governing packet queue
    pub fn queue_serial(&self) -> Serial {
        self.pktq.serial()
    }

    /// Abort state of the governing packet queue
    pub fn is_aborted(&self) -> bool {
        self.pktq.is_aborted()
    }
}

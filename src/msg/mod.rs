//! Cross-thread notification queue for playcore
//!
//! Pipeline threads post typed events here; the host drains them on its
//! own message loop. Messages carry a due time so state reports can be
//! scheduled slightly into the future (e.g. periodic buffering updates),
//! and identical pending messages are coalesced so a stalled consumer is
//! not flooded with duplicates.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How long `next()` sleeps between polls when nothing is due
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Event codes posted out of the playback core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The pipeline ran out of buffered data and is refilling
    BufferingStart,

    /// Buffered position report; arg1 = buffered position in ms
    BufferingUpdate,

    /// Enough data is buffered to resume playback
    BufferingEnd,

    /// Playback state changed; arg1 = new state discriminant
    PlaybackStateChanged,

    /// First video frame left the decoder
    FirstVideoFrameDecoded,

    /// First video frame was presented; arg1 = width, arg2 = height
    FirstVideoFrameRendered,

    /// A seek request finished; arg1 = target position in ms
    SeekCompleted,

    /// Every stream reached end of stream and drained
    Completed,

    /// A subsystem terminated on a fatal error; playback may be degraded
    SubsystemError,
}

/// A scheduled notification
#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub what: PlayerEvent,
    pub arg1: i64,
    pub arg2: i64,
    pub due: Instant,
}

struct Inner {
    /// Pending messages sorted by due time
    messages: Vec<Message>,
    quitting: bool,
}

/// Due-time-ordered message queue with a blocking consumer end
pub struct MessageQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                quitting: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Post an event due immediately
    pub fn post(&self, what: PlayerEvent) {
        self.post_args(what, 0, 0);
    }

    /// Post an event with arguments, due immediately
    pub fn post_args(&self, what: PlayerEvent, arg1: i64, arg2: i64) {
        self.post_delayed(what, arg1, arg2, Duration::ZERO);
    }

    /// Post an event due after `delay`
    pub fn post_delayed(&self, what: PlayerEvent, arg1: i64, arg2: i64, delay: Duration) {
        let msg = Message {
            what,
            arg1,
            arg2,
            due: Instant::now() + delay,
        };

        let mut inner = self.inner.lock();
        if inner.quitting {
            log::warn!("posting {:?} on a dead message queue", what);
            return;
        }
        // Coalesce: an identical pending message makes this one redundant.
        if inner
            .messages
            .iter()
            .any(|m| m.what == msg.what && m.arg1 == msg.arg1 && m.arg2 == msg.arg2)
        {
            return;
        }
        let pos = inner.messages.partition_point(|m| m.due <= msg.due);
        let wake = pos == 0;
        inner.messages.insert(pos, msg);
        drop(inner);

        if wake {
            self.cond.notify_one();
        }
    }

    /// Block until the earliest message is due, returning it.
    ///
    /// Returns `None` once `quit()` has been called and the queue drained.
    pub fn next(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        loop {
            let now = Instant::now();
            if let Some(first) = inner.messages.first() {
                if first.due <= now {
                    return Some(inner.messages.remove(0));
                }
                let wait = (first.due - now).min(POLL_INTERVAL);
                self.cond.wait_for(&mut inner, wait);
            } else {
                if inner.quitting {
                    return None;
                }
                self.cond.wait_for(&mut inner, POLL_INTERVAL);
            }
            if inner.quitting && inner.messages.is_empty() {
                return None;
            }
        }
    }

    /// Non-blocking variant of `next()` for polling consumers
    pub fn try_next(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        match inner.messages.first() {
            Some(first) if first.due <= Instant::now() => Some(inner.messages.remove(0)),
            _ => None,
        }
    }

    /// Shut the queue down. Idempotent; discards pending messages and
    /// wakes any blocked consumer.
    pub fn quit(&self) {
        let mut inner = self.inner.lock();
        if inner.quitting {
            return;
        }
        inner.quitting = true;
        inner.messages.clear();
        drop(inner);
        self.cond.notify_all();
    }
}

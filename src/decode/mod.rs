//! Per-stream decoder thread
//!
//! A decoder pulls serial-stamped packets from its packet queue, feeds
//! them to the external codec, and pushes decoded frames into the frame
//! queue its render consumes. Packets stamped with a retired flush epoch
//! are discarded undecoded, and a flush entry resets the codec and the
//! pts continuity tracking, so seeks never leak stale frames downstream.

use crate::msg::{MessageQueue, PlayerEvent};
use crate::queue::{Frame, FrameQueue, Packet, PacketEntry, PacketQueue, Serial};
use crate::source::ReadWake;
use crate::utils::error::Result;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Outcome of asking the codec for a decoded frame
pub enum CodecPoll<T> {
    /// A decoded unit
    Frame(DecodedFrame<T>),

    /// The codec wants another packet before it can produce output
    NeedsInput,

    /// The codec drained fully for the current input sequence
    EndOfStream,
}

/// Outcome of submitting a packet to the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,

    /// The codec's input queue is full; output must be drained first
    Full,
}

/// A decoded unit before queue admission
pub struct DecodedFrame<T> {
    pub data: T,

    /// Presentation timestamp in seconds (NaN if the codec had none)
    pub pts: f64,

    /// Duration in seconds
    pub duration: f64,

    /// Byte position of the originating packet
    pub pos: i64,
}

/// External codec seam. Implementations wrap the actual codec library;
/// hard failures map to errors, "needs more input" and end-of-stream are
/// normal outcomes.
pub trait MediaCodec: Send {
    type Frame: Clone + Send;

    /// Submit one packet; `None` switches the codec into drain mode
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus>;

    /// Poll for a decoded frame
    fn receive_frame(&mut self) -> Result<CodecPoll<Self::Frame>>;

    /// Drop all internal codec state (after a flush or end-of-stream)
    fn reset(&mut self);
}

enum Outcome<T> {
    Frame(Frame<T>),
    Eof,
    Aborted,
}

/// Per-stream decoder state and thread body
pub struct Decoder<C: MediaCodec> {
    codec: C,
    queue: Arc<PacketQueue>,
    sink: Arc<FrameQueue<C::Frame>>,
    read_wake: Arc<ReadWake>,
    events: Arc<MessageQueue>,
    label: &'static str,

    abort: Arc<AtomicBool>,
    finished: Arc<AtomicI32>,

    pkt_serial: Serial,
    pending: Option<Packet>,

    /// Backfill undefined frame pts from the running position (audio)
    fill_missing_pts: bool,
    start_pts: f64,
    next_pts: f64,

    /// Post a one-shot event when the first frame comes out (video)
    notify_first_frame: bool,
    decoded_any: bool,
}

/// Control handle for a running decoder thread
pub struct DecoderHandle {
    join: Option<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    finished: Arc<AtomicI32>,
    queue: Arc<PacketQueue>,
}

impl DecoderHandle {
    /// Serial of the epoch the decoder finished draining, 0 if none
    pub fn finished_serial(&self) -> Serial {
        self.finished.load(Ordering::Acquire)
    }

    /// Shared handle to the finished-epoch marker, for completion checks
    pub fn finished_handle(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.finished)
    }

    /// Abort the queue and wake the thread; must be followed by `join()`.
    pub fn abort<T: Clone + Send>(&self, sink: &FrameQueue<T>) {
        self.abort.store(true, Ordering::Release);
        self.queue.abort();
        sink.signal();
        self.queue.flush();
    }

    /// Wait for the decoder thread to exit
    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("decoder thread panicked");
            }
        }
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            log::warn!("decoder handle dropped without join");
        }
    }
}

impl<C: MediaCodec + 'static> Decoder<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        codec: C,
        queue: Arc<PacketQueue>,
        sink: Arc<FrameQueue<C::Frame>>,
        read_wake: Arc<ReadWake>,
        events: Arc<MessageQueue>,
        label: &'static str,
        fill_missing_pts: bool,
        notify_first_frame: bool,
    ) -> Self {
        Self {
            codec,
            queue,
            sink,
            read_wake,
            events,
            label,
            abort: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicI32::new(0)),
            pkt_serial: -1,
            pending: None,
            fill_missing_pts,
            start_pts: f64::NAN,
            next_pts: f64::NAN,
            notify_first_frame,
            decoded_any: false,
        }
    }

    /// Anchor for pts continuity after a flush (stream start time)
    pub fn set_start_pts(&mut self, start_pts: f64) {
        self.start_pts = start_pts;
    }

    /// Start the packet queue and spawn the decode thread
    pub fn spawn(self) -> DecoderHandle {
        self.queue.start();
        let abort = Arc::clone(&self.abort);
        let finished = Arc::clone(&self.finished);
        let queue = Arc::clone(&self.queue);
        let label = self.label;
        let join = std::thread::Builder::new()
            .name(format!("decode-{}", label))
            .spawn(move || {
                self.run();
                debug!("thread decode-{} done", label);
            })
            .expect("failed to spawn decoder thread");
        DecoderHandle {
            join: Some(join),
            abort,
            finished,
            queue,
        }
    }

    fn run(mut self) {
        loop {
            match self.decode_next() {
                Ok(Outcome::Frame(frame)) => {
                    if self.notify_first_frame && !self.decoded_any {
                        self.decoded_any = true;
                        self.events.post(PlayerEvent::FirstVideoFrameDecoded);
                    }
                    if !self.sink.push(frame) {
                        break;
                    }
                }
                // End of stream is not an exit: a seek can enqueue a new
                // epoch, so keep pulling packets.
                Ok(Outcome::Eof) => continue,
                Ok(Outcome::Aborted) => break,
                Err(e) => {
                    error!("{} decoder failed: {}", self.label, e);
                    self.events.post(PlayerEvent::SubsystemError);
                    break;
                }
            }
        }
    }

    fn decode_next(&mut self) -> Result<Outcome<C::Frame>> {
        loop {
            // Only poll the codec while our packets belong to the current
            // epoch; anything else would resurrect pre-seek frames.
            if self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() || self.abort.load(Ordering::Acquire) {
                        return Ok(Outcome::Aborted);
                    }
                    match self.codec.receive_frame()? {
                        CodecPoll::Frame(decoded) => {
                            return Ok(Outcome::Frame(self.admit(decoded)));
                        }
                        CodecPoll::EndOfStream => {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            self.codec.reset();
                            return Ok(Outcome::Eof);
                        }
                        CodecPoll::NeedsInput => break,
                    }
                }
            }

            let (entry, serial) = loop {
                if self.queue.nb_packets() == 0 {
                    self.read_wake.notify();
                }
                if let Some(pkt) = self.pending.take() {
                    break (PacketEntry::Data(pkt), self.pkt_serial);
                }
                let events = Arc::clone(&self.events);
                let mut on_block = move || events.post(PlayerEvent::BufferingStart);
                match self.queue.get(true, Some(&mut on_block)) {
                    Ok(Some(got)) => {
                        // Entries stamped before the latest flush predate a
                        // seek; drop them undecoded.
                        if got.1 == self.queue.serial() {
                            break got;
                        }
                    }
                    Ok(None) => unreachable!("blocking get returned no data"),
                    Err(_) => return Ok(Outcome::Aborted),
                }
            };
            self.pkt_serial = serial;

            match entry {
                PacketEntry::Flush => {
                    self.codec.reset();
                    self.finished.store(0, Ordering::Release);
                    self.next_pts = self.start_pts;
                }
                PacketEntry::Eof { .. } => {
                    self.codec.send_packet(None)?;
                }
                PacketEntry::Data(pkt) => {
                    if self.codec.send_packet(Some(&pkt))? == SendStatus::Full {
                        // receive_frame and send_packet both stalling is a
                        // codec contract violation; retry the packet after
                        // the next drain instead of losing it.
                        error!(
                            "{}: codec refused input while also producing no output",
                            self.label
                        );
                        self.pending = Some(pkt);
                    }
                }
            }
        }
    }

    fn admit(&mut self, decoded: DecodedFrame<C::Frame>) -> Frame<C::Frame> {
        let mut pts = decoded.pts;
        if self.fill_missing_pts {
            if pts.is_nan() && !self.next_pts.is_nan() {
                pts = self.next_pts;
            }
            if !pts.is_nan() {
                self.next_pts = pts + decoded.duration;
            }
        }
        Frame {
            data: decoded.data,
            pts,
            duration: decoded.duration,
            pos: decoded.pos,
            serial: self.pkt_serial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted codec: one packet in, one frame out, draining on demand.
    struct ScriptedCodec {
        queued: VecDeque<DecodedFrame<u64>>,
        draining: bool,
        counter: u64,
        refuse_next: bool,
    }

    impl ScriptedCodec {
        fn new() -> Self {
            Self {
                queued: VecDeque::new(),
                draining: false,
                counter: 0,
                refuse_next: false,
            }
        }
    }

    impl MediaCodec for ScriptedCodec {
        type Frame = u64;

        fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus> {
            match packet {
                Some(pkt) => {
                    if self.refuse_next {
                        self.refuse_next = false;
                        return Ok(SendStatus::Full);
                    }
                    self.counter += 1;
                    self.queued.push_back(DecodedFrame {
                        data: self.counter,
                        pts: pkt.pts,
                        duration: pkt.duration,
                        pos: pkt.pos,
                    });
                    Ok(SendStatus::Accepted)
                }
                None => {
                    self.draining = true;
                    Ok(SendStatus::Accepted)
                }
            }
        }

        fn receive_frame(&mut self) -> Result<CodecPoll<u64>> {
            if let Some(frame) = self.queued.pop_front() {
                Ok(CodecPoll::Frame(frame))
            } else if self.draining {
                Ok(CodecPoll::EndOfStream)
            } else {
                Ok(CodecPoll::NeedsInput)
            }
        }

        fn reset(&mut self) {
            self.queued.clear();
            self.draining = false;
        }
    }

    fn packet(pts: f64) -> Packet {
        Packet {
            stream_index: 0,
            pts,
            dts: pts,
            duration: 0.04,
            pos: -1,
            data: vec![0u8; 32],
        }
    }

    fn pipeline() -> (Arc<PacketQueue>, Arc<FrameQueue<u64>>, DecoderHandle) {
        let queue = Arc::new(PacketQueue::new());
        let sink = Arc::new(FrameQueue::new(Arc::clone(&queue), 8, false));
        let decoder = Decoder::new(
            ScriptedCodec::new(),
            Arc::clone(&queue),
            Arc::clone(&sink),
            Arc::new(ReadWake::new()),
            Arc::new(MessageQueue::new()),
            "test",
            false,
            false,
        );
        let handle = decoder.spawn();
        (queue, sink, handle)
    }

    #[test]
    fn test_decodes_in_order() {
        let (queue, sink, mut handle) = pipeline();
        for i in 0..3 {
            queue.put(PacketEntry::Data(packet(i as f64 * 0.04))).unwrap();
        }
        for i in 0..3u64 {
            let frame = sink.peek_readable().unwrap();
            assert_eq!(frame.data, i + 1);
            assert!((frame.pts - i as f64 * 0.04).abs() < 1e-9);
            sink.next();
        }
        handle.abort(&sink);
        handle.join();
    }

    #[test]
    fn test_eof_marks_finished_epoch() {
        let (queue, sink, mut handle) = pipeline();
        queue.put(PacketEntry::Data(packet(0.0))).unwrap();
        queue.put_eof(0).unwrap();

        let frame = sink.peek_readable().unwrap();
        assert_eq!(frame.data, 1);
        sink.next();

        // Once the codec drains, the decoder reports the finished epoch.
        let serial = queue.serial();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.finished_serial() != serial {
            assert!(std::time::Instant::now() < deadline, "decoder never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.abort(&sink);
        handle.join();
    }

    #[test]
    fn test_stale_packets_discarded_after_flush() {
        let queue = Arc::new(PacketQueue::new());
        let sink = Arc::new(FrameQueue::new(Arc::clone(&queue), 8, false));

        // Pre-seed stale data, a flush, then fresh data before the decoder
        // thread starts consuming, so the race is deterministic.
        queue.start();
        queue.put(PacketEntry::Data(packet(0.0))).unwrap();
        queue.put(PacketEntry::Data(packet(0.04))).unwrap();
        queue.put_flush().unwrap();
        queue.put(PacketEntry::Data(packet(60.0))).unwrap();

        let decoder = Decoder::new(
            ScriptedCodec::new(),
            Arc::clone(&queue),
            Arc::clone(&sink),
            Arc::new(ReadWake::new()),
            Arc::new(MessageQueue::new()),
            "test",
            false,
            false,
        );
        let mut handle = decoder.spawn();

        let frame = sink.peek_readable().unwrap();
        assert!((frame.pts - 60.0).abs() < 1e-9, "pre-flush packets must not decode");
        assert_eq!(frame.serial, queue.serial());
        sink.next();

        handle.abort(&sink);
        handle.join();
    }

    #[test]
    fn test_contract_violation_retries_packet() {
        let queue = Arc::new(PacketQueue::new());
        let sink = Arc::new(FrameQueue::new(Arc::clone(&queue), 8, false));
        let mut codec = ScriptedCodec::new();
        codec.refuse_next = true;
        let decoder = Decoder::new(
            codec,
            Arc::clone(&queue),
            Arc::clone(&sink),
            Arc::new(ReadWake::new()),
            Arc::new(MessageQueue::new()),
            "test",
            false,
            false,
        );
        let mut handle = decoder.spawn();
        queue.put(PacketEntry::Data(packet(0.0))).unwrap();

        // The refused packet is retained and decoded on retry.
        let frame = sink.peek_readable().unwrap();
        assert_eq!(frame.data, 1);
        sink.next();
        handle.abort(&sink);
        handle.join();
    }

    #[test]
    fn test_missing_pts_backfilled_from_continuity() {
        let queue = Arc::new(PacketQueue::new());
        let sink = Arc::new(FrameQueue::new(Arc::clone(&queue), 8, false));
        let decoder = Decoder::new(
            ScriptedCodec::new(),
            Arc::clone(&queue),
            Arc::clone(&sink),
            Arc::new(ReadWake::new()),
            Arc::new(MessageQueue::new()),
            "test",
            true,
            false,
        );
        let mut handle = decoder.spawn();

        queue.put(PacketEntry::Data(packet(1.0))).unwrap();
        queue.put(PacketEntry::Data(packet(f64::NAN))).unwrap();

        let first = sink.peek_readable().unwrap();
        assert!((first.pts - 1.0).abs() < 1e-9);
        sink.next();

        let second = sink.peek_readable().unwrap();
        assert!((second.pts - 1.04).abs() < 1e-9, "pts continues past the gap");
        sink.next();

        handle.abort(&sink);
        handle.join();
    }
}

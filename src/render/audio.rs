//! Audio render and drift correction
//!
//! The audio device pulls interleaved f32 samples through `fill()` from
//! its callback thread. Each callback drains decoded frames from the
//! sample queue, resamples them to the device format, and re-anchors the
//! audio clock to the playout position so the rest of the pipeline can
//! schedule against actual output latency. When audio is not the master
//! clock, the requested sample count is stretched or shrunk a little to
//! chase the master without audible artifacts.

use crate::clock::{ClockSet, SyncMode};
use crate::queue::FrameQueue;
use crate::utils::error::Result;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Negotiated device/output format. Samples are interleaved f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    /// Sample rate in Hz
    pub freq: u32,

    /// Interleaved channel count
    pub channels: u16,
}

impl AudioParams {
    /// Output bytes consumed per second of playback
    pub fn bytes_per_sec(&self) -> usize {
        self.freq as usize * self.channels as usize * std::mem::size_of::<f32>()
    }

    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * std::mem::size_of::<f32>()
    }
}

/// A decoded block of interleaved samples, shared cheaply across queues
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub data: Arc<Vec<f32>>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSamples {
    /// Samples per channel
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.data.len() / self.channels as usize
    }
}

/// Format conversion seam. `wanted_nb_samples` differs from the frame's
/// own count when drift correction wants the block stretched or shrunk.
pub trait Resampler: Send {
    fn resample(
        &mut self,
        frame: &AudioSamples,
        wanted_nb_samples: usize,
        target: AudioParams,
    ) -> Result<Vec<f32>>;
}

/// Linear-interpolation resampler covering rate, channel count, and
/// drift-correction compensation. Adequate for a correction window of a
/// few percent; a hardware path would substitute a bandlimited one.
pub struct LinearResampler;

impl Resampler for LinearResampler {
    fn resample(
        &mut self,
        frame: &AudioSamples,
        wanted_nb_samples: usize,
        target: AudioParams,
    ) -> Result<Vec<f32>> {
        let src_nb = frame.nb_samples();
        if src_nb == 0 || frame.channels == 0 || target.channels == 0 {
            return Ok(Vec::new());
        }
        // The corrected sample count is expressed at the source rate;
        // rescale it to the device rate for the output frame count.
        let out_nb = (wanted_nb_samples as u64 * u64::from(target.freq)
            / u64::from(frame.sample_rate)) as usize;
        if out_nb == 0 {
            return Ok(Vec::new());
        }

        let src_ch = frame.channels as usize;
        let dst_ch = target.channels as usize;
        let step = src_nb as f64 / out_nb as f64;
        let mut out = Vec::with_capacity(out_nb * dst_ch);
        for i in 0..out_nb {
            let pos = i as f64 * step;
            let i0 = pos.floor() as usize;
            let i1 = (i0 + 1).min(src_nb - 1);
            let frac = pos - i0 as f64;
            for c in 0..dst_ch {
                let sc = c.min(src_ch - 1);
                let a = f64::from(frame.data[i0 * src_ch + sc]);
                let b = f64::from(frame.data[i1 * src_ch + sc]);
                out.push((a + (b - a) * frac) as f32);
            }
        }
        Ok(out)
    }
}

/// Result of opening an audio device
pub struct AudioOpenResult {
    /// The format the device actually runs at
    pub params: AudioParams,

    /// Size of one hardware buffer in bytes
    pub buffer_bytes: usize,
}

/// Platform audio output seam. After `open` negotiates a format, `start`
/// takes ownership of the render; the device's callback thread then calls
/// `AudioRender::fill()` for every buffer it needs.
pub trait AudioDevice: Send {
    fn open(&mut self, wanted: AudioParams) -> Result<AudioOpenResult>;
    fn start(&mut self, render: AudioRender) -> Result<()>;
    fn pause(&mut self, paused: bool);
    fn close(&mut self);
}

/// Volume/mute/pause flags shared with the controlling thread
pub struct AudioControls {
    volume_bits: AtomicU32,
    muted: AtomicBool,
    paused: AtomicBool,
}

impl AudioControls {
    pub fn new(volume: f32) -> Self {
        Self {
            volume_bits: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            muted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Acquire))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }
}

/// Audio playout state, owned by the device callback thread
pub struct AudioRender {
    sink: Arc<FrameQueue<AudioSamples>>,
    clocks: Arc<ClockSet>,
    resampler: Box<dyn Resampler>,
    controls: Arc<AudioControls>,
    target: AudioParams,
    hw_buffer_bytes: usize,

    /// Resampled output not yet handed to the device
    buf: Vec<f32>,
    buf_index: usize,

    /// End-of-block pts of the last decoded frame (NaN if unknown)
    audio_clock: f64,
    audio_clock_serial: i32,

    // Drift-average state for the sample-count correction.
    diff_cum: f64,
    diff_avg_coef: f64,
    diff_avg_count: u32,
    diff_threshold: f64,
}

impl AudioRender {
    pub fn new(
        sink: Arc<FrameQueue<AudioSamples>>,
        clocks: Arc<ClockSet>,
        resampler: Box<dyn Resampler>,
        controls: Arc<AudioControls>,
        target: AudioParams,
        hw_buffer_bytes: usize,
    ) -> Self {
        let tuning = clocks.tuning().clone();
        Self {
            sink,
            clocks: Arc::clone(&clocks),
            resampler,
            controls,
            target,
            hw_buffer_bytes,
            buf: Vec::new(),
            buf_index: 0,
            audio_clock: f64::NAN,
            audio_clock_serial: -1,
            diff_cum: 0.0,
            diff_avg_coef: (0.01f64.ln() / f64::from(tuning.audio_diff_avg_nb)).exp(),
            diff_avg_count: 0,
            // The device buffer itself causes this much jitter; smaller
            // differences are noise, not drift.
            diff_threshold: hw_buffer_bytes as f64 / target.bytes_per_sec() as f64,
        }
    }

    /// Fill one device buffer. Called from the audio callback thread at
    /// `callback_time` (session-relative seconds, see `clock::time_now`).
    pub fn fill(&mut self, out: &mut [f32], callback_time: f64) {
        if self.controls.paused() {
            out.fill(0.0);
            return;
        }

        let mut filled = 0;
        while filled < out.len() {
            if self.buf_index >= self.buf.len() && !self.refill_buf(callback_time) {
                // Queue empty or aborted: pad with silence, keep the
                // callback realtime.
                out[filled..].fill(0.0);
                break;
            }
            let n = (out.len() - filled).min(self.buf.len() - self.buf_index);
            out[filled..filled + n].copy_from_slice(&self.buf[self.buf_index..self.buf_index + n]);
            self.buf_index += n;
            filled += n;
        }

        let volume = if self.controls.muted() {
            0.0
        } else {
            self.controls.volume()
        };
        if volume != 1.0 {
            for sample in out.iter_mut() {
                *sample *= volume;
            }
        }

        // audio_clock marks the end of the last decoded block. What the
        // listener hears lags behind it by the unplayed remainder plus
        // two hardware buffers in flight.
        if !self.audio_clock.is_nan() {
            let unplayed = (self.buf.len() - self.buf_index) * std::mem::size_of::<f32>();
            let latency =
                (2 * self.hw_buffer_bytes + unplayed) as f64 / self.target.bytes_per_sec() as f64;
            self.clocks.audio().set_at(
                self.audio_clock - latency,
                self.audio_clock_serial,
                callback_time,
            );
            self.clocks
                .external()
                .sync_to(self.clocks.audio(), self.clocks.tuning().nosync_threshold);
        }
    }

    /// Pull the next same-epoch frame from the queue, correct its length
    /// against the master clock, and resample it into `buf`.
    ///
    /// The callback thread must stay realtime, so an empty queue is only
    /// waited on briefly; once half a hardware buffer of time has passed
    /// the caller pads with silence instead.
    fn refill_buf(&mut self, callback_time: f64) -> bool {
        use crate::clock::time_now;
        use crate::queue::QueueDepth;

        let half_buffer =
            self.hw_buffer_bytes as f64 / self.target.bytes_per_sec() as f64 / 2.0;
        let frame = loop {
            while self.sink.nb_remaining() == 0 {
                if self.sink.is_aborted() || time_now() - callback_time > half_buffer {
                    return false;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            let Some(frame) = self.sink.peek() else {
                return false;
            };
            if frame.serial == self.sink.queue_serial() {
                break frame;
            }
            self.sink.next();
        };

        let nb_samples = frame.data.nb_samples();
        let wanted = self.synchronize_audio(nb_samples, frame.data.sample_rate);
        match self
            .resampler
            .resample(&frame.data, wanted, self.target)
        {
            Ok(samples) => {
                self.buf = samples;
                self.buf_index = 0;
            }
            Err(e) => {
                warn!("audio resample failed: {}", e);
                self.sink.next();
                return false;
            }
        }

        self.audio_clock = if frame.pts.is_nan() {
            f64::NAN
        } else {
            frame.pts + nb_samples as f64 / frame.data.sample_rate as f64
        };
        self.audio_clock_serial = frame.serial;
        self.sink.next();
        true
    }

    /// Decide how many samples this block should play as.
    ///
    /// When audio is the master clock the count passes through untouched.
    /// Otherwise a running average of the audio-to-master difference is
    /// kept; once it has warmed up and exceeds the jitter threshold, the
    /// count is adjusted by the current difference at the source rate,
    /// capped at a small percentage so the correction stays inaudible. A difference past the no-sync threshold means a
    /// discontinuity and resets the average.
    fn synchronize_audio(&mut self, nb_samples: usize, source_rate: u32) -> usize {
        if self.clocks.master_sync_type() == SyncMode::AudioMaster {
            return nb_samples;
        }
        let tuning = self.clocks.tuning();
        let diff = self.clocks.audio().get() - self.clocks.master_clock();
        if diff.is_nan() || diff.abs() >= tuning.nosync_threshold {
            self.diff_avg_count = 0;
            self.diff_cum = 0.0;
            return nb_samples;
        }

        self.diff_cum = diff + self.diff_avg_coef * self.diff_cum;
        if self.diff_avg_count < tuning.audio_diff_avg_nb {
            self.diff_avg_count += 1;
            return nb_samples;
        }

        let avg_diff = self.diff_cum * (1.0 - self.diff_avg_coef);
        if avg_diff.abs() < self.diff_threshold {
            return nb_samples;
        }

        // The count is expressed at the source rate, so the correction
        // converts seconds of drift with the source rate too.
        let wanted = nb_samples as f64 + diff * f64::from(source_rate);
        let max_pct = tuning.sample_correction_percent_max / 100.0;
        let min = nb_samples as f64 * (1.0 - max_pct);
        let max = nb_samples as f64 * (1.0 + max_pct);
        let corrected = wanted.clamp(min, max).round() as usize;
        if corrected != nb_samples {
            debug!(
                "audio correction: {} -> {} samples (avg diff {:.6}s)",
                nb_samples, corrected, avg_diff
            );
        }
        corrected
    }

    /// End-of-block pts of the last decoded frame
    pub fn clock_position(&self) -> f64 {
        self.audio_clock
    }
}

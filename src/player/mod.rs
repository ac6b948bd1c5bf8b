//! Player facade
//!
//! Wires the whole pipeline together: one packet queue, decoder, and
//! frame queue per selected stream, the three clocks, the read thread,
//! and the two output stages. The host supplies the codec, device, and
//! presenter implementations and drains the event queue; everything else
//! runs on the pipeline's own threads.

use crate::clock::ClockSet;
use crate::decode::{Decoder, DecoderHandle, MediaCodec};
use crate::msg::{MessageQueue, PlayerEvent};
use crate::queue::{FrameQueue, PacketQueue};
use crate::render::audio::{
    AudioControls, AudioDevice, AudioParams, AudioRender, AudioSamples, Resampler,
};
use crate::render::video::{VideoPicture, VideoPresenter, VideoRender, VideoRenderHandle};
use crate::source::{
    DataSource, Demuxer, ReadWake, SeekRequest, SourceConfig, SourceHandle, StreamBinding,
    StreamInfo, StreamKind,
};
use crate::utils::config::{PlayerConfig, SAMPLE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE};
use crate::utils::error::{PlayerError, Result};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Frame-duration cap for containers with well-behaved timestamps
const MAX_FRAME_DURATION: f64 = 3600.0;

/// Frame-duration cap when the container may jump timestamps
const MAX_FRAME_DURATION_DISCONT: f64 = 10.0;

/// Externally visible playback state; the discriminant travels as the
/// `arg1` of `PlayerEvent::PlaybackStateChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing = 0,
    Paused = 1,
}

/// Audio output half supplied by the host
pub struct AudioOutput<C> {
    pub codec: C,
    pub device: Box<dyn AudioDevice>,
    pub resampler: Box<dyn Resampler>,

    /// Preferred device format, typically the stream's native one
    pub wanted: AudioParams,
}

/// Video output half supplied by the host
pub struct VideoOutput<C, P> {
    pub codec: C,
    pub presenter: P,
}

/// The shared handles every pipeline stage hangs on to.
///
/// Stages share this context instead of holding references to each
/// other, so ownership stays a DAG and shutdown order is free.
#[derive(Clone)]
pub struct PlaybackContext {
    pub clocks: Arc<ClockSet>,
    pub events: Arc<MessageQueue>,
    pub read_wake: Arc<ReadWake>,
    pub paused: Arc<AtomicBool>,
}

impl PlaybackContext {
    fn new(clocks: Arc<ClockSet>) -> Self {
        Self {
            clocks,
            events: Arc::new(MessageQueue::new()),
            read_wake: Arc::new(ReadWake::new()),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct AudioPipeline {
    frames: Arc<FrameQueue<AudioSamples>>,
    decoder: DecoderHandle,
    device: Box<dyn AudioDevice>,
}

struct VideoPipeline {
    frames: Arc<FrameQueue<VideoPicture>>,
    decoder: DecoderHandle,
    render: VideoRenderHandle,
}

/// A running playback pipeline
pub struct Player {
    ctx: PlaybackContext,
    controls: Arc<AudioControls>,

    audio: Option<AudioPipeline>,
    video: Option<VideoPipeline>,
    source: Option<SourceHandle>,
    state: PlaybackState,

    /// Most recent time-based seek target, the position fallback while
    /// every clock is invalid
    last_seek: Option<f64>,

    /// Container duration as reported at open
    duration: Option<f64>,
    shut_down: bool,
}

fn pick_stream(streams: &[StreamInfo], kind: StreamKind) -> Option<StreamInfo> {
    streams.iter().find(|s| s.kind == kind).cloned()
}

impl Player {
    /// Open a source and start playback.
    ///
    /// Streams without a matching output half are ignored. Fails when the
    /// source carries neither a usable audio nor a usable video stream.
    pub fn open<D, AC, VC, P>(
        demuxer: D,
        audio_out: Option<AudioOutput<AC>>,
        video_out: Option<VideoOutput<VC, P>>,
        config: PlayerConfig,
    ) -> Result<Player>
    where
        D: Demuxer + 'static,
        AC: MediaCodec<Frame = AudioSamples> + 'static,
        VC: MediaCodec<Frame = VideoPicture> + 'static,
        P: VideoPresenter + 'static,
    {
        config.validate()?;

        let streams = demuxer.streams();
        let audio_stream = audio_out
            .as_ref()
            .and_then(|_| pick_stream(streams, StreamKind::Audio));
        let video_stream = video_out
            .as_ref()
            .and_then(|_| pick_stream(streams, StreamKind::Video));
        if audio_stream.is_none() && video_stream.is_none() {
            return Err(PlayerError::Source(
                "source has no playable audio or video stream".to_string(),
            ));
        }

        let audio_queue = Arc::new(PacketQueue::new());
        let video_queue = Arc::new(PacketQueue::new());
        let clocks = Arc::new(ClockSet::new(
            config.sync_mode,
            audio_queue.serial_handle(),
            video_queue.serial_handle(),
            config.tuning.clone(),
        ));
        clocks.set_streams_present(audio_stream.is_some(), video_stream.is_some());

        let ctx = PlaybackContext::new(Arc::clone(&clocks));
        let events = Arc::clone(&ctx.events);
        let read_wake = Arc::clone(&ctx.read_wake);
        let controls = Arc::new(AudioControls::new(config.volume));

        let max_frame_duration = if demuxer.discontinuous_timestamps() {
            MAX_FRAME_DURATION_DISCONT
        } else {
            MAX_FRAME_DURATION
        };
        let duration = demuxer.duration();

        let mut audio_binding = None;
        let audio = match (audio_out, &audio_stream) {
            (Some(out), Some(stream)) => {
                let AudioOutput {
                    codec,
                    mut device,
                    resampler,
                    wanted,
                } = out;
                let opened = device.open(wanted)?;
                info!(
                    "audio device: {} Hz, {} ch, {} byte buffer",
                    opened.params.freq, opened.params.channels, opened.buffer_bytes
                );

                let frames = Arc::new(FrameQueue::new(
                    Arc::clone(&audio_queue),
                    SAMPLE_QUEUE_SIZE,
                    true,
                ));
                let render = AudioRender::new(
                    Arc::clone(&frames),
                    Arc::clone(&clocks),
                    resampler,
                    Arc::clone(&controls),
                    opened.params,
                    opened.buffer_bytes,
                );
                device.start(render)?;

                let mut decoder = Decoder::new(
                    codec,
                    Arc::clone(&audio_queue),
                    Arc::clone(&frames),
                    Arc::clone(&read_wake),
                    Arc::clone(&events),
                    "audio",
                    true,
                    false,
                );
                decoder.set_start_pts(stream.start_time);
                let decoder = decoder.spawn();

                audio_binding = Some(StreamBinding {
                    index: stream.index,
                    queue: Arc::clone(&audio_queue),
                    frames: Arc::clone(&frames) as _,
                    finished: decoder.finished_handle(),
                    start_time: stream.start_time,
                    attached_picture: false,
                });
                Some(AudioPipeline {
                    frames,
                    decoder,
                    device,
                })
            }
            _ => None,
        };

        let mut video_binding = None;
        let video = match (video_out, &video_stream) {
            (Some(out), Some(stream)) => {
                let frames = Arc::new(FrameQueue::new(
                    Arc::clone(&video_queue),
                    VIDEO_PICTURE_QUEUE_SIZE,
                    true,
                ));
                let decoder = Decoder::new(
                    out.codec,
                    Arc::clone(&video_queue),
                    Arc::clone(&frames),
                    Arc::clone(&read_wake),
                    Arc::clone(&events),
                    "video",
                    false,
                    true,
                )
                .spawn();

                let (render, commands) = VideoRender::new(
                    Arc::clone(&frames),
                    Arc::clone(&clocks),
                    out.presenter,
                    Arc::clone(&events),
                    config.frame_drop,
                    max_frame_duration,
                );
                let render = render.spawn(commands);

                video_binding = Some(StreamBinding {
                    index: stream.index,
                    queue: Arc::clone(&video_queue),
                    frames: Arc::clone(&frames) as _,
                    finished: decoder.finished_handle(),
                    start_time: stream.start_time,
                    attached_picture: stream.attached_picture,
                });
                Some(VideoPipeline {
                    frames,
                    decoder,
                    render,
                })
            }
            _ => None,
        };

        let seek_req = Arc::new(Mutex::new(
            config.start_time.map(|target| SeekRequest {
                target,
                by_bytes: false,
            }),
        ));
        let source = DataSource::new(
            demuxer,
            audio_binding,
            video_binding,
            Arc::clone(&clocks),
            Arc::clone(&events),
            Arc::clone(&read_wake),
            seek_req,
            Arc::clone(&ctx.paused),
            SourceConfig {
                buffering: config.buffering.clone(),
                start_time: config.start_time,
                play_duration: config.play_duration,
                infinite_buffer: config.infinite_buffer,
            },
        )
        .spawn();

        Ok(Player {
            ctx,
            controls,
            audio,
            video,
            source: Some(source),
            state: PlaybackState::Playing,
            last_seek: config.start_time,
            duration,
            shut_down: false,
        })
    }

    /// The event queue the host should drain
    pub fn events(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.ctx.events)
    }

    /// The shared handles the pipeline stages run on
    pub fn context(&self) -> &PlaybackContext {
        &self.ctx
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Current playback position from the master clock, in seconds.
    /// While every clock is invalid (right after open or mid-seek) the
    /// last seek target answers instead; NaN if there is none.
    pub fn position(&self) -> f64 {
        let pos = self.ctx.clocks.master_clock();
        if pos.is_nan() {
            return self.last_seek.unwrap_or(f64::NAN);
        }
        pos
    }

    /// Total source duration in seconds, when the container reports one
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn pause(&mut self) {
        self.set_paused(true);
    }

    pub fn resume(&mut self) {
        self.set_paused(false);
    }

    pub fn toggle_pause(&mut self) {
        self.set_paused(self.state == PlaybackState::Playing);
    }

    fn set_paused(&mut self, paused: bool) {
        let state = if paused {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        };
        if state == self.state {
            return;
        }
        self.state = state;
        self.ctx.paused.store(paused, Ordering::Release);
        // Silence the audio callback before freezing the clocks so a
        // concurrent fill cannot move the audio clock mid-pause.
        self.controls.set_paused(paused);
        self.ctx.clocks.set_paused(paused);
        if let Some(audio) = &mut self.audio {
            audio.device.pause(paused);
        }
        if let Some(video) = &self.video {
            video.render.set_paused(paused);
        }
        self.ctx
            .events
            .post_args(PlayerEvent::PlaybackStateChanged, state as i64, 0);
        debug!("playback {}", if paused { "paused" } else { "resumed" });
    }

    /// Advance exactly one video frame, then hold
    pub fn step_frame(&mut self) {
        if let Some(video) = &self.video {
            video.render.step();
        }
    }

    /// Seek to an absolute position in seconds
    pub fn seek(&mut self, target: f64) {
        self.last_seek = Some(target);
        if let Some(source) = &self.source {
            source.request_seek(target, false);
        }
    }

    /// Seek by byte position, for sources without usable timestamps.
    /// Anchors at the last shown video frame when one is available.
    pub fn seek_bytes(&self, pos: i64) {
        if let Some(source) = &self.source {
            source.request_seek(pos as f64, true);
        }
    }

    /// Byte position of the last shown video frame, if current
    pub fn last_video_pos(&self) -> Option<i64> {
        self.video.as_ref().and_then(|v| v.frames.last_shown_pos())
    }

    pub fn volume(&self) -> f32 {
        self.controls.volume()
    }

    pub fn set_volume(&self, volume: f32) {
        self.controls.set_volume(volume);
    }

    pub fn set_muted(&self, muted: bool) {
        self.controls.set_muted(muted);
    }

    /// Frames the video scheduler dropped for arriving late
    pub fn frame_drops_late(&self) -> u64 {
        self.video.as_ref().map_or(0, |v| v.render.frame_drops_late())
    }

    /// Stop every pipeline thread and release the outputs. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        // Read thread first so no new packets arrive while draining.
        if let Some(mut source) = self.source.take() {
            source.abort();
            source.join();
        }
        if let Some(mut audio) = self.audio.take() {
            audio.decoder.abort(&audio.frames);
            audio.decoder.join();
            audio.device.pause(true);
            audio.device.close();
        }
        if let Some(mut video) = self.video.take() {
            video.decoder.abort(&video.frames);
            video.decoder.join();
            video.render.abort();
            video.render.join();
        }
        self.ctx.events.quit();
        debug!("player shut down");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{CodecPoll, SendStatus};
    use crate::queue::Packet;
    use crate::render::audio::{AudioOpenResult, LinearResampler};
    use crate::render::video::VideoPresenter;
    use crate::utils::error::Result;

    struct NullAudioCodec;

    impl MediaCodec for NullAudioCodec {
        type Frame = AudioSamples;

        fn send_packet(&mut self, _packet: Option<&Packet>) -> Result<SendStatus> {
            Ok(SendStatus::Accepted)
        }

        fn receive_frame(&mut self) -> Result<CodecPoll<AudioSamples>> {
            Ok(CodecPoll::NeedsInput)
        }

        fn reset(&mut self) {}
    }

    struct NullVideoCodec;

    impl MediaCodec for NullVideoCodec {
        type Frame = VideoPicture;

        fn send_packet(&mut self, _packet: Option<&Packet>) -> Result<SendStatus> {
            Ok(SendStatus::Accepted)
        }

        fn receive_frame(&mut self) -> Result<CodecPoll<VideoPicture>> {
            Ok(CodecPoll::NeedsInput)
        }

        fn reset(&mut self) {}
    }

    struct NullPresenter;

    impl VideoPresenter for NullPresenter {
        fn present(&mut self, _frame: &crate::queue::Frame<VideoPicture>) -> Result<()> {
            Ok(())
        }
    }

    struct NullDevice;

    impl AudioDevice for NullDevice {
        fn open(&mut self, wanted: AudioParams) -> Result<AudioOpenResult> {
            Ok(AudioOpenResult {
                params: wanted,
                buffer_bytes: 8192,
            })
        }

        fn start(&mut self, _render: AudioRender) -> Result<()> {
            Ok(())
        }

        fn pause(&mut self, _paused: bool) {}

        fn close(&mut self) {}
    }

    struct EmptyDemuxer {
        streams: Vec<StreamInfo>,
        duration: Option<f64>,
    }

    impl Demuxer for EmptyDemuxer {
        fn streams(&self) -> &[StreamInfo] {
            &self.streams
        }

        fn duration(&self) -> Option<f64> {
            self.duration
        }

        fn read_packet(&mut self) -> Result<crate::source::DemuxPoll> {
            Ok(crate::source::DemuxPoll::Eof)
        }

        fn seek(&mut self, _target: f64, _by_bytes: bool) -> Result<()> {
            Ok(())
        }

        fn attached_picture(&mut self, _stream_index: usize) -> Option<Packet> {
            None
        }
    }

    fn audio_out() -> AudioOutput<NullAudioCodec> {
        AudioOutput {
            codec: NullAudioCodec,
            device: Box::new(NullDevice),
            resampler: Box::new(LinearResampler),
            wanted: AudioParams {
                freq: 48_000,
                channels: 2,
            },
        }
    }

    #[test]
    fn test_open_fails_without_streams() {
        let demuxer = EmptyDemuxer {
            streams: vec![],
            duration: None,
        };
        let result = Player::open(
            demuxer,
            Some(audio_out()),
            None::<VideoOutput<NullVideoCodec, NullPresenter>>,
            PlayerConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_open_audio_only_and_shutdown() {
        let demuxer = EmptyDemuxer {
            streams: vec![StreamInfo {
                index: 0,
                kind: StreamKind::Audio,
                start_time: 0.0,
                attached_picture: false,
            }],
            duration: Some(42.5),
        };
        let mut player = Player::open(
            demuxer,
            Some(audio_out()),
            None::<VideoOutput<NullVideoCodec, NullPresenter>>,
            PlayerConfig::default(),
        )
        .unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert!(player.position().is_nan(), "no clock is valid yet");
        assert_eq!(player.duration(), Some(42.5));
        player.shutdown();
    }

    #[test]
    fn test_pause_resume_posts_state_changes() {
        let demuxer = EmptyDemuxer {
            streams: vec![StreamInfo {
                index: 0,
                kind: StreamKind::Audio,
                start_time: 0.0,
                attached_picture: false,
            }],
            duration: None,
        };
        let mut player = Player::open(
            demuxer,
            Some(audio_out()),
            None::<VideoOutput<NullVideoCodec, NullPresenter>>,
            PlayerConfig::default(),
        )
        .unwrap();

        player.pause();
        assert_eq!(player.state(), PlaybackState::Paused);
        // Pausing twice is a no-op.
        player.pause();
        player.resume();
        assert_eq!(player.state(), PlaybackState::Playing);

        let mut states = Vec::new();
        while let Some(msg) = player.ctx.events.try_next() {
            if msg.what == PlayerEvent::PlaybackStateChanged {
                states.push(msg.arg1);
            }
        }
        assert_eq!(states, vec![1, 0]);
        player.shutdown();
    }
}

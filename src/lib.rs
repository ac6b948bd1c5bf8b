//! playcore - media playback synchronization engine
//!
//! The timing and buffering core of a media player: serial-stamped packet
//! queues, bounded frame rings, a three-clock synchronization model, the
//! decoder and demuxer thread loops, audio drift correction, and video
//! frame scheduling with late-frame dropping.
//!
//! Codecs, containers, audio devices, and display surfaces stay outside
//! the crate; the host plugs them in through the [`decode::MediaCodec`],
//! [`source::Demuxer`], [`render::AudioDevice`], and
//! [`render::VideoPresenter`] traits and drives playback through
//! [`player::Player`], draining progress from its event queue.
//!
//! ```no_run
//! use playcore::player::{Player, AudioOutput, VideoOutput};
//! use playcore::utils::config::PlayerConfig;
//! # fn demo<D, AC, VC, P>(
//! #     demuxer: D,
//! #     audio: AudioOutput<AC>,
//! #     video: VideoOutput<VC, P>,
//! # ) -> playcore::Result<()>
//! # where
//! #     D: playcore::source::Demuxer + 'static,
//! #     AC: playcore::decode::MediaCodec<Frame = playcore::render::AudioSamples> + 'static,
//! #     VC: playcore::decode::MediaCodec<Frame = playcore::render::VideoPicture> + 'static,
//! #     P: playcore::render::VideoPresenter + 'static,
//! # {
//! let player = Player::open(demuxer, Some(audio), Some(video), PlayerConfig::default())?;
//! let events = player.events();
//! while let Some(_msg) = events.next() {
//!     // react to buffering, seeks, completion, ...
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod decode;
pub mod msg;
pub mod player;
pub mod queue;
pub mod render;
pub mod source;
pub mod utils;

pub use clock::{Clock, ClockSet, SyncMode};
pub use msg::{Message, MessageQueue, PlayerEvent};
pub use player::{AudioOutput, PlaybackContext, PlaybackState, Player, VideoOutput};
pub use queue::{Frame, FrameQueue, Packet, PacketEntry, PacketQueue, Serial};
pub use utils::config::PlayerConfig;
pub use utils::error::{PlayerError, Result};

//! Audio and video output stages
//!
//! Both renders consume decoded frames from their queues and anchor their
//! clocks to what is actually playing out. Audio is pull-based (the device
//! callback drains it), video runs its own scheduling thread. Device and
//! display access go through the `AudioDevice` and `VideoPresenter` seams.

pub mod audio;
pub mod video;

pub use audio::{
    AudioControls, AudioDevice, AudioOpenResult, AudioParams, AudioRender, AudioSamples,
    LinearResampler, Resampler,
};
pub use video::{
    compute_target_delay, frame_duration, VideoCommand, VideoPicture, VideoPresenter, VideoRender,
    VideoRenderHandle,
};

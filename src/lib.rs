//! Always-on capture core: rolling audio/video history with triggered export.
//!
//! Capture sources push frames and audio chunks into duration-bounded rolling
//! buffers; a wake-phrase trigger snapshots the last 30 seconds, aligns both
//! streams onto one timeline, and muxes them into a QuickTime artifact through
//! FFmpeg.

pub mod buffer;
pub mod capture;
pub mod clock;
pub mod export;
pub mod sync;
pub mod trigger;

pub use buffer::{RollingWindow, DEFAULT_WINDOW};
pub use capture::frame::{
    AudioChunk, PixelFormat, TimestampedAudioChunk, TimestampedVideoFrame, VideoFrame,
};
pub use capture::ingest::CaptureEngine;
pub use capture::source::{CaptureSource, DeviceSource, MockSource};
pub use clock::{HostTime, MonotonicClock};
pub use export::muxer::Muxer;
pub use export::types::{ExportConfig, ExportError, ExportProgress, ExportResult, Resolution};
pub use sync::CaptureSnapshot;
pub use trigger::{
    CaptureEvent, ClipRecord, ClipStatus, TriggerConfig, TriggerCoordinator, TriggerEvent,
    TriggerOutcome,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging for binaries embedding the capture core.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replay_capture=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

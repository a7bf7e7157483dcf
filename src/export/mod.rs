//! Snapshot export
//!
//! This module turns one capture snapshot into one container artifact:
//! sink abstraction, FFmpeg-backed writer, the muxer pipeline driving it
//! under backpressure, and the job state machine governing the lifecycle.

pub mod ffmpeg;
pub mod muxer;
pub mod sink;
pub mod state;
pub mod types;

pub use ffmpeg::FfmpegSink;
pub use muxer::Muxer;
pub use sink::{AudioTrackSpec, MediaSink, MemorySink, MemorySinkHandle, SinkError, VideoTrackSpec};
pub use state::{ExportPhase, ExportStateMachine, TransitionError};
pub use types::{ExportConfig, ExportError, ExportProgress, ExportResult, Resolution};

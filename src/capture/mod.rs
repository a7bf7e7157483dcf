//! Live capture: media types, sources, and ingestion
//!
//! Frames and audio are pushed in by the capture collaborator, stamped
//! against the clock reference, and retained in the rolling windows.

pub mod frame;
pub mod ingest;
pub mod source;

pub use frame::{
    AudioChunk, HostStamped, PixelFormat, TimestampedAudioChunk, TimestampedVideoFrame, VideoFrame,
};
pub use ingest::CaptureEngine;
pub use source::{AudioPush, CaptureSource, CaptureStreams, DeviceSource, MockSource, VideoPush};

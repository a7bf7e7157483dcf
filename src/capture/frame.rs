//! Timestamped media types
//!
//! Raw frames and audio chunks arrive from the capture collaborator without
//! a shared clock; these types pair each buffer with a host time from the
//! clock reference so the rolling buffers can evict by age and the
//! synchronizer can line the streams up.

use crate::clock::HostTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pixel layout of a video frame's data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit RGBA, 4 bytes per pixel.
    Rgba,
    /// 8-bit BGRA, 4 bytes per pixel.
    Bgra,
    /// Planar Y + interleaved UV, 1.5 bytes per pixel.
    Nv12,
}

impl PixelFormat {
    /// Expected buffer size for a frame of the given dimensions.
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let pixels = (width * height) as usize;
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => pixels * 4,
            PixelFormat::Nv12 => pixels + pixels / 2,
        }
    }
}

/// A raw video frame as pushed by the device/link collaborator.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Pixel data in `format` layout.
    pub pixel_data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel layout of `pixel_data`.
    pub format: PixelFormat,
    /// Media-clock presentation time reported by the capture hardware.
    pub presentation_time: Duration,
}

impl VideoFrame {
    /// Validate that the data buffer matches the declared dimensions.
    pub fn is_valid(&self) -> bool {
        self.pixel_data.len() == self.format.buffer_size(self.width, self.height)
    }
}

/// A raw audio chunk as pushed by the device/link (or microphone) collaborator.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved signed 16-bit samples.
    pub samples: Vec<i16>,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Number of sample frames (samples per channel) in this chunk.
    pub fn frame_count(&self) -> u64 {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() as u64 / self.channels as u64
    }

    /// Playback duration of this chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }
}

/// Items that carry a host time from the clock reference.
///
/// The rolling buffer is generic over this so the two streams share one
/// eviction implementation.
pub trait HostStamped {
    fn host_time(&self) -> HostTime;
}

/// A video frame stamped on ingest.
///
/// Within one ingestor's output, `host_time` is non-decreasing.
#[derive(Debug, Clone)]
pub struct TimestampedVideoFrame {
    /// The owned frame.
    pub frame: VideoFrame,
    /// Clock-reference time at ingest.
    pub host_time: HostTime,
}

impl HostStamped for TimestampedVideoFrame {
    fn host_time(&self) -> HostTime {
        self.host_time
    }
}

/// An audio chunk stamped on ingest.
#[derive(Debug, Clone)]
pub struct TimestampedAudioChunk {
    /// The owned chunk.
    pub chunk: AudioChunk,
    /// Clock-reference time at ingest.
    pub host_time: HostTime,
    /// Running sample-frame position within the stream; monotonically
    /// increasing across one ingestor's output.
    pub sample_position: u64,
}

impl HostStamped for TimestampedAudioChunk {
    fn host_time(&self) -> HostTime {
        self.host_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_buffer_sizes() {
        assert_eq!(PixelFormat::Rgba.buffer_size(4, 2), 32);
        assert_eq!(PixelFormat::Bgra.buffer_size(4, 2), 32);
        assert_eq!(PixelFormat::Nv12.buffer_size(4, 2), 12);
    }

    #[test]
    fn test_video_frame_validation() {
        let good = VideoFrame {
            pixel_data: vec![0u8; 32],
            width: 4,
            height: 2,
            format: PixelFormat::Rgba,
            presentation_time: Duration::ZERO,
        };
        assert!(good.is_valid());

        let truncated = VideoFrame {
            pixel_data: vec![0u8; 31],
            ..good
        };
        assert!(!truncated.is_valid());
    }

    #[test]
    fn test_audio_chunk_duration() {
        let chunk = AudioChunk {
            samples: vec![0i16; 16000],
            channels: 1,
            sample_rate: 16000,
        };
        assert_eq!(chunk.frame_count(), 16000);
        assert_eq!(chunk.duration(), Duration::from_secs(1));

        let stereo = AudioChunk {
            samples: vec![0i16; 16000],
            channels: 2,
            sample_rate: 16000,
        };
        assert_eq!(stereo.frame_count(), 8000);
        assert_eq!(stereo.duration(), Duration::from_millis(500));
    }
}

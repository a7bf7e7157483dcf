//! Capture sources
//!
//! Frames and audio reach the core over one single-producer channel per
//! stream. `DeviceSource` exposes push handles for the device/link
//! collaborator; `MockSource` synthesizes both streams at a fixed cadence
//! for tests and the demo harness. Which one feeds the pipeline is decided
//! at construction time.

use crate::capture::frame::{AudioChunk, PixelFormat, VideoFrame};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// The two live streams a source yields, one SPSC channel each.
pub struct CaptureStreams {
    pub video: mpsc::Receiver<VideoFrame>,
    pub audio: mpsc::Receiver<AudioChunk>,
}

/// Anything that can feed the capture pipeline.
#[async_trait]
pub trait CaptureSource: Send {
    /// Start producing and hand over the live streams. Async so device
    /// implementations can wait for the link to come up.
    async fn into_streams(self: Box<Self>) -> CaptureStreams;
}

/// Source fed externally by the device/link collaborator.
pub struct DeviceSource {
    streams: CaptureStreams,
}

/// Push handle the link collaborator uses to deliver video frames.
#[derive(Clone)]
pub struct VideoPush {
    tx: mpsc::Sender<VideoFrame>,
}

/// Push handle for audio chunks (device link or fallback microphone).
#[derive(Clone)]
pub struct AudioPush {
    tx: mpsc::Sender<AudioChunk>,
}

impl DeviceSource {
    /// Create a device-fed source plus its two push handles.
    ///
    /// Channel capacities bound how far the link can run ahead of the
    /// ingestors before pushes start reporting overflow.
    pub fn new(video_capacity: usize, audio_capacity: usize) -> (Self, VideoPush, AudioPush) {
        let (video_tx, video_rx) = mpsc::channel(video_capacity);
        let (audio_tx, audio_rx) = mpsc::channel(audio_capacity);
        (
            Self {
                streams: CaptureStreams {
                    video: video_rx,
                    audio: audio_rx,
                },
            },
            VideoPush { tx: video_tx },
            AudioPush { tx: audio_tx },
        )
    }
}

#[async_trait]
impl CaptureSource for DeviceSource {
    async fn into_streams(self: Box<Self>) -> CaptureStreams {
        self.streams
    }
}

impl VideoPush {
    /// Deliver one frame without blocking.
    ///
    /// Live capture never stalls on a slow consumer: a full channel returns
    /// the frame to the caller, which may drop it.
    pub fn try_push(&self, frame: VideoFrame) -> Result<(), VideoFrame> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(f) | mpsc::error::TrySendError::Closed(f) => f,
        })
    }
}

impl AudioPush {
    /// Deliver one audio chunk without blocking.
    pub fn try_push(&self, chunk: AudioChunk) -> Result<(), AudioChunk> {
        self.tx.try_send(chunk).map_err(|e| match e {
            mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
        })
    }
}

/// Synthetic source producing solid-color frames and a ramp tone.
pub struct MockSource {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    /// Audio chunk length as a duration of samples.
    pub chunk_duration: Duration,
}

impl Default for MockSource {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            frame_rate: 10,
            sample_rate: 16_000,
            chunk_duration: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl CaptureSource for MockSource {
    async fn into_streams(self: Box<Self>) -> CaptureStreams {
        let (video_tx, video_rx) = mpsc::channel(8);
        let (audio_tx, audio_rx) = mpsc::channel(8);

        let width = self.width;
        let height = self.height;
        let frame_interval = Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_interval);
            let mut n: u64 = 0;
            loop {
                ticker.tick().await;
                let shade = (n % 256) as u8;
                let frame = VideoFrame {
                    pixel_data: [shade, shade, shade, 255u8]
                        .repeat((width * height) as usize),
                    width,
                    height,
                    format: PixelFormat::Rgba,
                    presentation_time: frame_interval.mul_f64(n as f64),
                };
                if video_tx.send(frame).await.is_err() {
                    break;
                }
                n += 1;
            }
        });

        let sample_rate = self.sample_rate;
        let chunk_frames =
            (self.chunk_duration.as_secs_f64() * sample_rate as f64).max(1.0) as usize;
        let chunk_interval = self.chunk_duration;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(chunk_interval);
            let mut phase: u64 = 0;
            loop {
                ticker.tick().await;
                let samples: Vec<i16> = (0..chunk_frames)
                    .map(|i| (((phase + i as u64) % 64) as i16 - 32) * 256)
                    .collect();
                phase += chunk_frames as u64;
                let chunk = AudioChunk {
                    samples,
                    channels: 1,
                    sample_rate,
                };
                if audio_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        CaptureStreams {
            video: video_rx,
            audio: audio_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_device_source_forwards_pushes() {
        let (source, video_push, audio_push) = DeviceSource::new(4, 4);
        let mut streams = Box::new(source).into_streams().await;

        video_push
            .try_push(VideoFrame {
                pixel_data: vec![0u8; 16],
                width: 2,
                height: 2,
                format: PixelFormat::Rgba,
                presentation_time: Duration::ZERO,
            })
            .unwrap();
        audio_push
            .try_push(AudioChunk {
                samples: vec![0i16; 160],
                channels: 1,
                sample_rate: 16_000,
            })
            .unwrap();

        assert!(streams.video.recv().await.is_some());
        assert!(streams.audio.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_full_channel_returns_frame_to_pusher() {
        let (_source, video_push, _audio_push) = DeviceSource::new(1, 1);
        let frame = || VideoFrame {
            pixel_data: vec![0u8; 16],
            width: 2,
            height: 2,
            format: PixelFormat::Rgba,
            presentation_time: Duration::ZERO,
        };
        video_push.try_push(frame()).unwrap();
        // Second push overflows the capacity-1 channel; no blocking.
        assert!(video_push.try_push(frame()).is_err());
    }

    #[tokio::test]
    async fn test_mock_source_produces_valid_media() {
        let source = MockSource {
            frame_rate: 100,
            chunk_duration: Duration::from_millis(10),
            ..Default::default()
        };
        let mut streams = Box::new(source).into_streams().await;

        let frame = streams.video.recv().await.expect("mock video");
        assert!(frame.is_valid());

        let chunk = streams.audio.recv().await.expect("mock audio");
        assert_eq!(chunk.sample_rate, 16_000);
        assert_eq!(chunk.frame_count(), 160);
    }
}

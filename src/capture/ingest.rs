//! Stream ingestors
//!
//! One background task per stream drains its source channel, stamps each
//! item against the shared clock reference, and appends it to the stream's
//! rolling window. The two ingestors share nothing but the clock, so a
//! hiccup on one stream never delays the other.

use crate::buffer::RollingWindow;
use crate::capture::frame::{TimestampedAudioChunk, TimestampedVideoFrame};
use crate::capture::source::CaptureSource;
use crate::clock::MonotonicClock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Live capture state: the clock, both rolling windows, and the ingest
/// tasks feeding them.
///
/// Created once at startup and alive for the process lifetime; export jobs
/// only ever read snapshots out of the windows.
pub struct CaptureEngine {
    clock: MonotonicClock,
    video: Arc<RollingWindow<TimestampedVideoFrame>>,
    audio: Arc<RollingWindow<TimestampedAudioChunk>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CaptureEngine {
    /// Start ingesting from `source` into fresh rolling windows of
    /// `window` duration.
    pub async fn start(
        source: Box<dyn CaptureSource>,
        clock: MonotonicClock,
        window: Duration,
    ) -> Self {
        let video = Arc::new(RollingWindow::new(window));
        let audio = Arc::new(RollingWindow::new(window));
        let streams = source.into_streams().await;

        let video_task = {
            let clock = clock.clone();
            let buffer = video.clone();
            let mut rx = streams.video;
            tokio::spawn(async move {
                let mut accepted: u64 = 0;
                let mut rejected: u64 = 0;
                while let Some(frame) = rx.recv().await {
                    if !frame.is_valid() {
                        rejected += 1;
                        if rejected == 1 {
                            tracing::warn!(
                                width = frame.width,
                                height = frame.height,
                                bytes = frame.pixel_data.len(),
                                "rejecting malformed video frame"
                            );
                        }
                        continue;
                    }
                    buffer.append(TimestampedVideoFrame {
                        frame,
                        host_time: clock.now(),
                    });
                    accepted += 1;
                }
                tracing::info!(accepted, rejected, "video ingestor stopped");
            })
        };

        let audio_task = {
            let clock = clock.clone();
            let buffer = audio.clone();
            let mut rx = streams.audio;
            tokio::spawn(async move {
                // Running frame position of the next chunk's first sample.
                let mut sample_position: u64 = 0;
                while let Some(chunk) = rx.recv().await {
                    let frames = chunk.frame_count();
                    buffer.append(TimestampedAudioChunk {
                        chunk,
                        host_time: clock.now(),
                        sample_position,
                    });
                    sample_position += frames;
                }
                tracing::info!(sample_position, "audio ingestor stopped");
            })
        };

        tracing::info!(window_secs = window.as_secs(), "capture engine started");
        Self {
            clock,
            video,
            audio,
            tasks: vec![video_task, audio_task],
        }
    }

    /// The shared clock reference.
    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    /// The video rolling window.
    pub fn video_buffer(&self) -> Arc<RollingWindow<TimestampedVideoFrame>> {
        self.video.clone()
    }

    /// The audio rolling window.
    pub fn audio_buffer(&self) -> Arc<RollingWindow<TimestampedAudioChunk>> {
        self.audio.clone()
    }

    /// Stop the ingest tasks. Buffer contents are left in place.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("capture engine shut down");
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{AudioChunk, PixelFormat, VideoFrame};
    use crate::capture::source::DeviceSource;

    fn rgba_frame() -> VideoFrame {
        VideoFrame {
            pixel_data: vec![0u8; 16],
            width: 2,
            height: 2,
            format: PixelFormat::Rgba,
            presentation_time: Duration::ZERO,
        }
    }

    fn chunk(frames: usize) -> AudioChunk {
        AudioChunk {
            samples: vec![0i16; frames],
            channels: 1,
            sample_rate: 16_000,
        }
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_video_frames_land_in_buffer_stamped() {
        let (source, video_push, _audio_push) = DeviceSource::new(8, 8);
        let engine = CaptureEngine::start(
            Box::new(source),
            MonotonicClock::new(),
            Duration::from_secs(30),
        )
        .await;

        video_push.try_push(rgba_frame()).unwrap();
        video_push.try_push(rgba_frame()).unwrap();
        settle(|| engine.video_buffer().len() == 2).await;

        let snap = engine.video_buffer().snapshot();
        assert!(snap[1].host_time >= snap[0].host_time);
    }

    #[tokio::test]
    async fn test_audio_sample_positions_accumulate() {
        let (source, _video_push, audio_push) = DeviceSource::new(8, 8);
        let engine = CaptureEngine::start(
            Box::new(source),
            MonotonicClock::new(),
            Duration::from_secs(30),
        )
        .await;

        audio_push.try_push(chunk(160)).unwrap();
        audio_push.try_push(chunk(320)).unwrap();
        audio_push.try_push(chunk(160)).unwrap();
        settle(|| engine.audio_buffer().len() == 3).await;

        let positions: Vec<u64> = engine
            .audio_buffer()
            .snapshot()
            .iter()
            .map(|c| c.sample_position)
            .collect();
        assert_eq!(positions, vec![0, 160, 480]);
    }

    #[tokio::test]
    async fn test_malformed_frames_rejected_before_buffer() {
        let (source, video_push, _audio_push) = DeviceSource::new(8, 8);
        let engine = CaptureEngine::start(
            Box::new(source),
            MonotonicClock::new(),
            Duration::from_secs(30),
        )
        .await;

        let mut bad = rgba_frame();
        bad.pixel_data.truncate(3);
        video_push.try_push(bad).unwrap();
        video_push.try_push(rgba_frame()).unwrap();
        settle(|| engine.video_buffer().len() == 1).await;
        assert_eq!(engine.video_buffer().len(), 1);
    }
}

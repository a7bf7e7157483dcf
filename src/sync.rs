//! Snapshot alignment across clock domains
//!
//! Video frames are stamped by arrival time while audio timing is really
//! governed by its sample count; assuming a shared epoch between the two
//! produces drift over a 30 second window. The synchronizer re-derives each
//! audio chunk's time from its sample position, anchored at the first chunk
//! in the snapshot, then folds both streams onto one relative timeline.

use crate::capture::frame::{TimestampedAudioChunk, TimestampedVideoFrame};
use crate::clock::HostTime;
use std::time::Duration;

/// An immutable, consistent cut of both rolling buffers at trigger time.
#[derive(Debug, Clone)]
pub struct CaptureSnapshot {
    /// Video frames, oldest first.
    pub video: Vec<TimestampedVideoFrame>,
    /// Audio chunks, oldest first.
    pub audio: Vec<TimestampedAudioChunk>,
    /// Clock-reference time when the snapshot was taken.
    pub taken_at: HostTime,
}

impl CaptureSnapshot {
    /// Earliest host time across both streams; the zero of the relative
    /// timeline. `None` when the snapshot holds nothing at all.
    pub fn base_time(&self) -> Option<HostTime> {
        let first_video = self.video.first().map(|f| f.host_time);
        let first_audio = self.audio.first().map(|a| a.host_time);
        match (first_video, first_audio) {
            (Some(v), Some(a)) => Some(v.min(a)),
            (Some(v), None) => Some(v),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    /// Wall span actually captured: the longer of the two stream spans.
    pub fn captured_duration(&self) -> Duration {
        let span = |first: Option<HostTime>, last: Option<HostTime>| match (first, last) {
            (Some(f), Some(l)) => l.saturating_sub(f),
            _ => Duration::ZERO,
        };
        let video_span = span(
            self.video.first().map(|f| f.host_time),
            self.video.last().map(|f| f.host_time),
        );
        let audio_span = span(
            self.audio.first().map(|a| a.host_time),
            self.audio.last().map(|a| a.host_time),
        );
        video_span.max(audio_span)
    }
}

/// One entry of the aligned timeline handed to the muxer.
#[derive(Debug, Clone)]
pub enum TimelineItem {
    Video {
        frame: TimestampedVideoFrame,
        /// Offset from the snapshot's base time.
        relative_time: Duration,
    },
    Audio {
        chunk: TimestampedAudioChunk,
        relative_time: Duration,
    },
}

impl TimelineItem {
    /// Offset from the snapshot base time.
    pub fn relative_time(&self) -> Duration {
        match self {
            TimelineItem::Video { relative_time, .. } => *relative_time,
            TimelineItem::Audio { relative_time, .. } => *relative_time,
        }
    }

    /// Whether this entry is a video frame.
    pub fn is_video(&self) -> bool {
        matches!(self, TimelineItem::Video { .. })
    }
}

/// Reconcile a snapshot's two timestamp domains onto one relative timeline.
///
/// Audio times are recomputed from `sample_position` against the first
/// chunk's host time, which removes cross-clock drift within the window.
/// Negative offsets from clock jitter clamp to zero. Items with equal
/// relative times keep their per-stream arrival order, video ahead of audio
/// on exact cross-stream ties.
pub fn align(snapshot: &CaptureSnapshot) -> Vec<TimelineItem> {
    let Some(base) = snapshot.base_time() else {
        return Vec::new();
    };

    let video_times: Vec<Duration> = snapshot
        .video
        .iter()
        .map(|f| f.host_time.saturating_sub(base))
        .collect();

    let audio_times: Vec<Duration> = match snapshot.audio.first() {
        Some(anchor) => snapshot
            .audio
            .iter()
            .map(|chunk| {
                let rate = chunk.chunk.sample_rate.max(1) as f64;
                let frames_since_anchor =
                    chunk.sample_position.saturating_sub(anchor.sample_position);
                let offset = Duration::from_secs_f64(frames_since_anchor as f64 / rate);
                (anchor.host_time + offset).saturating_sub(base)
            })
            .collect(),
        None => Vec::new(),
    };

    // Stable two-way merge; both inputs are already non-decreasing.
    let mut out = Vec::with_capacity(video_times.len() + audio_times.len());
    let mut vi = 0;
    let mut ai = 0;
    while vi < video_times.len() || ai < audio_times.len() {
        let take_video = match (video_times.get(vi), audio_times.get(ai)) {
            (Some(v), Some(a)) => v <= a,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_video {
            out.push(TimelineItem::Video {
                frame: snapshot.video[vi].clone(),
                relative_time: video_times[vi],
            });
            vi += 1;
        } else {
            out.push(TimelineItem::Audio {
                chunk: snapshot.audio[ai].clone(),
                relative_time: audio_times[ai],
            });
            ai += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{AudioChunk, PixelFormat, VideoFrame};

    fn video_at(ms: u64) -> TimestampedVideoFrame {
        TimestampedVideoFrame {
            frame: VideoFrame {
                pixel_data: vec![0u8; 16],
                width: 2,
                height: 2,
                format: PixelFormat::Rgba,
                presentation_time: Duration::from_millis(ms),
            },
            host_time: Duration::from_millis(ms),
        }
    }

    fn audio_at(ms: u64, sample_position: u64) -> TimestampedAudioChunk {
        TimestampedAudioChunk {
            chunk: AudioChunk {
                samples: vec![0i16; 160],
                channels: 1,
                sample_rate: 16000,
            },
            host_time: Duration::from_millis(ms),
            sample_position,
        }
    }

    #[test]
    fn test_base_time_is_earliest_first_item() {
        let snapshot = CaptureSnapshot {
            video: vec![video_at(1000)],
            audio: vec![audio_at(1050, 0)],
            taken_at: Duration::from_secs(2),
        };
        assert_eq!(snapshot.base_time(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_relative_times_against_base() {
        // firstVideo at 1000ms, firstAudio at 1050ms: base = 1000ms,
        // video offset 0, audio offset 50ms.
        let snapshot = CaptureSnapshot {
            video: vec![video_at(1000)],
            audio: vec![audio_at(1050, 0)],
            taken_at: Duration::from_secs(2),
        };
        let timeline = align(&snapshot);
        assert_eq!(timeline.len(), 2);
        assert!(timeline[0].is_video());
        assert_eq!(timeline[0].relative_time(), Duration::ZERO);
        assert_eq!(timeline[1].relative_time(), Duration::from_millis(50));
    }

    #[test]
    fn test_audio_time_derived_from_sample_position() {
        // Second chunk is 160 frames (10ms at 16kHz) past the anchor even
        // though its host stamp claims 40ms; sample arithmetic wins.
        let snapshot = CaptureSnapshot {
            video: vec![],
            audio: vec![audio_at(0, 0), audio_at(40, 160)],
            taken_at: Duration::from_secs(1),
        };
        let timeline = align(&snapshot);
        assert_eq!(timeline[1].relative_time(), Duration::from_millis(10));
    }

    #[test]
    fn test_negative_offsets_clamp_to_zero() {
        // Audio anchor earlier than base is impossible, but a video frame
        // stamped before the audio anchor puts audio at base and leaves the
        // earlier-stamped stream clamped rather than negative.
        let snapshot = CaptureSnapshot {
            video: vec![video_at(100)],
            audio: vec![audio_at(50, 0)],
            taken_at: Duration::from_secs(1),
        };
        let timeline = align(&snapshot);
        assert_eq!(timeline[0].relative_time(), Duration::ZERO);
        assert_eq!(timeline[1].relative_time(), Duration::from_millis(50));
    }

    #[test]
    fn test_video_only_snapshot_aligns() {
        let snapshot = CaptureSnapshot {
            video: vec![video_at(10), video_at(20)],
            audio: vec![],
            taken_at: Duration::from_secs(1),
        };
        let timeline = align(&snapshot);
        assert_eq!(timeline.len(), 2);
        assert!(timeline.iter().all(|i| i.is_video()));
    }

    #[test]
    fn test_empty_snapshot_yields_empty_timeline() {
        let snapshot = CaptureSnapshot {
            video: vec![],
            audio: vec![],
            taken_at: Duration::ZERO,
        };
        assert!(snapshot.base_time().is_none());
        assert!(align(&snapshot).is_empty());
    }

    #[test]
    fn test_merge_is_chronological() {
        let snapshot = CaptureSnapshot {
            video: vec![video_at(0), video_at(100), video_at(200)],
            audio: vec![audio_at(0, 0), audio_at(0, 2400)], // 150ms apart
            taken_at: Duration::from_secs(1),
        };
        let timeline = align(&snapshot);
        for pair in timeline.windows(2) {
            assert!(pair[0].relative_time() <= pair[1].relative_time());
        }
    }

    #[test]
    fn test_captured_duration_uses_longer_span() {
        let snapshot = CaptureSnapshot {
            video: vec![video_at(0), video_at(1000)],
            audio: vec![audio_at(0, 0), audio_at(2500, 40000)],
            taken_at: Duration::from_secs(3),
        };
        assert_eq!(snapshot.captured_duration(), Duration::from_millis(2500));
    }
}

//! Muxer pipeline
//!
//! Consumes one aligned snapshot and produces one container artifact under
//! backpressure. The loop is synchronous and runs on a blocking task so a
//! slow writer can never stall live ingestion; the readiness wait against
//! the sink is bounded, so a stalled encoder surfaces as `WriteTimeout`
//! instead of a hang.

use crate::capture::frame::{PixelFormat, VideoFrame};
use crate::export::sink::{
    AudioTrackSpec, BufferLease, BufferPool, MediaSink, Readiness, SinkError, VideoTrackSpec,
};
use crate::export::state::{ExportPhase, ExportStateMachine};
use crate::export::types::{ExportConfig, ExportError, ExportProgress, ExportResult, Resolution};
use crate::sync::{self, CaptureSnapshot, TimelineItem};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed readiness wait slice.
const READY_SLICE: Duration = Duration::from_millis(50);

/// Default cumulative readiness bound per item.
pub const DEFAULT_READY_CAP: Duration = Duration::from_secs(30);

/// Progress emission cadence, in items.
const PROGRESS_EVERY: u64 = 10;

/// Drives one snapshot through a [`MediaSink`].
pub struct Muxer {
    config: ExportConfig,
    ready_cap: Duration,
    cancel: Arc<AtomicBool>,
}

impl Muxer {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            config,
            ready_cap: DEFAULT_READY_CAP,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the cumulative readiness bound (tests use a short cap).
    pub fn with_ready_cap(mut self, cap: Duration) -> Self {
        self.ready_cap = cap;
        self
    }

    /// Flag observed between items; setting it aborts the job with
    /// `Cancelled` and discards partial output.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run the full export: align, configure, write, finalize.
    ///
    /// `open_sink` is only invoked after the snapshot is known to have
    /// content, so a `NoContent` failure allocates no sink resources.
    pub fn run<S, F, P>(
        &self,
        snapshot: &CaptureSnapshot,
        open_sink: F,
        mut progress: P,
    ) -> Result<ExportResult, ExportError>
    where
        S: MediaSink,
        F: FnOnce() -> Result<S, SinkError>,
        P: FnMut(ExportProgress),
    {
        let mut state = ExportStateMachine::new();

        // Content policy: no video, no artifact. An empty audio sequence is
        // a valid video-only export.
        if snapshot.video.is_empty() {
            let _ = state.fail(ExportError::NoContent);
            return Err(ExportError::NoContent);
        }

        state
            .advance(ExportPhase::Preparing)
            .expect("fresh state machine accepts Preparing");

        let mut sink = open_sink().map_err(|e| {
            let err = translate(e);
            let _ = state.fail(err.clone());
            err
        })?;

        let first = &snapshot.video[0].frame;
        let source = Resolution {
            width: first.width,
            height: first.height,
        };
        let video_spec = VideoTrackSpec {
            source,
            output: self.config.resolution.aligned(),
            frame_rate: self.config.frame_rate,
            bit_rate: self.config.video_bit_rate,
        };
        let audio_spec = (!snapshot.audio.is_empty()).then_some(AudioTrackSpec {
            sample_rate: self.config.audio_sample_rate,
            channels: self.config.audio_channels,
        });

        if let Err(e) = sink.configure_tracks(video_spec, audio_spec) {
            return Err(self.abort(&mut state, &mut sink, translate(e)));
        }

        let timeline = sync::align(snapshot);
        let items_total = timeline.len() as u64;
        tracing::info!(
            video_frames = snapshot.video.len(),
            audio_chunks = snapshot.audio.len(),
            source_width = source.width,
            source_height = source.height,
            "starting mux of {} items",
            items_total
        );

        state
            .advance(ExportPhase::Writing)
            .expect("Preparing advances to Writing");

        let pool = sink.pool();
        let mut items_written: u64 = 0;
        let mut items_dropped: u64 = 0;

        for item in &timeline {
            if self.is_cancelled() {
                return Err(self.abort(&mut state, &mut sink, ExportError::Cancelled));
            }

            if let Err(e) = self.await_ready(&mut sink) {
                return Err(self.abort(&mut state, &mut sink, e));
            }

            let result = match item {
                TimelineItem::Video {
                    frame,
                    relative_time,
                } => match convert_to_rgba(&frame.frame, source, &pool) {
                    Ok(rgba) => sink.append_video(&rgba, *relative_time),
                    Err(reason) => {
                        // Conversion is the only per-item recoverable
                        // failure: skip the frame, count it, keep going.
                        items_dropped += 1;
                        tracing::warn!(%reason, dropped = items_dropped, "dropping frame");
                        continue;
                    }
                },
                TimelineItem::Audio {
                    chunk,
                    relative_time,
                } => sink.append_audio(&chunk.chunk.samples, *relative_time),
            };

            if let Err(e) = result {
                return Err(self.abort(&mut state, &mut sink, translate(e)));
            }

            items_written += 1;
            if items_written % PROGRESS_EVERY == 0 {
                progress(ExportProgress {
                    items_written,
                    items_total,
                });
            }
        }

        state
            .advance(ExportPhase::Finalizing)
            .expect("Writing advances to Finalizing");

        let artifact_path = match sink.finish() {
            Ok(path) => path,
            Err(e) => return Err(self.abort(&mut state, &mut sink, translate(e))),
        };

        state
            .advance(ExportPhase::Completed)
            .expect("Finalizing advances to Completed");

        progress(ExportProgress {
            items_written,
            items_total,
        });
        tracing::info!(
            ?artifact_path,
            items_written,
            items_dropped,
            "mux complete"
        );

        Ok(ExportResult {
            artifact_path,
            captured_duration: snapshot.captured_duration(),
            items_written,
            items_dropped,
        })
    }

    /// Bounded wait for the sink to accept more data.
    fn await_ready<S: MediaSink>(&self, sink: &mut S) -> Result<(), ExportError> {
        let started = Instant::now();
        loop {
            match sink.wait_ready(READY_SLICE) {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(msg) => return Err(ExportError::WriterUnavailable(msg)),
                Readiness::NotReady => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.ready_cap {
                        return Err(ExportError::WriteTimeout { elapsed });
                    }
                }
            }
            if self.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
        }
    }

    /// Record the terminal failure and release sink resources, deleting any
    /// partial output.
    fn abort<S: MediaSink>(
        &self,
        state: &mut ExportStateMachine,
        sink: &mut S,
        err: ExportError,
    ) -> ExportError {
        let _ = state.fail(err.clone());
        sink.discard();
        err
    }
}

/// Translate low-level sink errors into the closed caller-visible set.
fn translate(e: SinkError) -> ExportError {
    match e {
        SinkError::Unavailable(msg) => ExportError::WriterUnavailable(msg),
        SinkError::NotConfigured => {
            ExportError::WriterUnavailable("append before track configuration".into())
        }
        SinkError::WriterFailed(msg) => ExportError::WriterUnavailable(msg),
        SinkError::Finalize(msg) => ExportError::WriteFinalizeError(msg),
    }
}

/// Convert a frame to the RGBA layout the sink requires, using a pooled
/// scratch buffer so the hot path does not allocate.
fn convert_to_rgba(
    frame: &VideoFrame,
    expected: Resolution,
    pool: &Arc<BufferPool>,
) -> Result<BufferLease, String> {
    if frame.width != expected.width || frame.height != expected.height {
        return Err(format!(
            "frame size {}x{} does not match track {}x{}",
            frame.width, frame.height, expected.width, expected.height
        ));
    }
    if !frame.is_valid() {
        return Err(format!(
            "buffer of {} bytes does not match {:?} {}x{}",
            frame.pixel_data.len(),
            frame.format,
            frame.width,
            frame.height
        ));
    }
    // NV12 subsamples chroma 2x2; the plane math below needs even dims.
    if frame.format == PixelFormat::Nv12 && (frame.width % 2 != 0 || frame.height % 2 != 0) {
        return Err(format!(
            "nv12 requires even dimensions, got {}x{}",
            frame.width, frame.height
        ));
    }

    let pixels = (frame.width * frame.height) as usize;
    let mut out = pool.acquire(pixels * 4);

    match frame.format {
        PixelFormat::Rgba => out.copy_from_slice(&frame.pixel_data),
        PixelFormat::Bgra => {
            for (dst, src) in out.chunks_exact_mut(4).zip(frame.pixel_data.chunks_exact(4)) {
                dst[0] = src[2];
                dst[1] = src[1];
                dst[2] = src[0];
                dst[3] = src[3];
            }
        }
        PixelFormat::Nv12 => {
            nv12_to_rgba(
                &frame.pixel_data,
                frame.width as usize,
                frame.height as usize,
                &mut out,
            );
        }
    }
    Ok(out)
}

/// BT.601 limited-range NV12 to RGBA.
fn nv12_to_rgba(src: &[u8], width: usize, height: usize, out: &mut [u8]) {
    let y_plane = &src[..width * height];
    let uv_plane = &src[width * height..];

    for row in 0..height {
        for col in 0..width {
            let y = y_plane[row * width + col] as f32;
            let uv_idx = (row / 2) * width + (col / 2) * 2;
            let u = uv_plane[uv_idx] as f32 - 128.0;
            let v = uv_plane[uv_idx + 1] as f32 - 128.0;

            let c = (y - 16.0).max(0.0) * 1.164;
            let r = (c + 1.596 * v).clamp(0.0, 255.0) as u8;
            let g = (c - 0.392 * u - 0.813 * v).clamp(0.0, 255.0) as u8;
            let b = (c + 2.017 * u).clamp(0.0, 255.0) as u8;

            let o = (row * width + col) * 4;
            out[o] = r;
            out[o + 1] = g;
            out[o + 2] = b;
            out[o + 3] = 255;
        }
    }
}

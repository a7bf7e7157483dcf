//! FFmpeg-backed media sink
//!
//! Real export target: raw RGBA frames are piped to an FFmpeg child that
//! encodes the video track, audio is staged into a scratch WAV, and a final
//! mux pass joins them into one QuickTime container with the audio as
//! uncompressed linear PCM. Output lands at a `.part` path and is renamed
//! into place only when finalize succeeds, so a cancelled or failed job
//! never leaves a truncated artifact behind.
//!
//! Frames go through a bounded queue drained by a dedicated writer thread.
//! The queue's fill level backs `wait_ready`, so a stalled encoder shows up
//! as `NotReady` at the sink boundary instead of blocking an append on the
//! stdin pipe forever.

use crate::export::sink::{
    AudioTrackSpec, BufferPool, MediaSink, Readiness, SinkError, VideoTrackSpec,
};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempPath;

/// Frames buffered ahead of the encoder before the sink reports busy.
const FRAME_QUEUE_DEPTH: usize = 8;

#[derive(Default)]
struct FrameQueueState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
    failure: Option<String>,
}

/// Bounded frame queue between the append path and the stdin writer thread.
struct FrameQueue {
    state: Mutex<FrameQueueState>,
    space: Condvar,
    data: Condvar,
}

impl FrameQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(FrameQueueState::default()),
            space: Condvar::new(),
            data: Condvar::new(),
        }
    }

    /// Enqueue one frame; fails once the writer has died.
    fn push(&self, frame: Vec<u8>) -> Result<(), String> {
        let mut state = self.state.lock();
        if let Some(msg) = &state.failure {
            return Err(msg.clone());
        }
        state.frames.push_back(frame);
        self.data.notify_one();
        Ok(())
    }

    /// Bounded wait for queue space; `Ok(false)` means still full after
    /// `slice`.
    fn wait_space(&self, slice: Duration) -> Result<bool, String> {
        let mut state = self.state.lock();
        if let Some(msg) = &state.failure {
            return Err(msg.clone());
        }
        if state.frames.len() < FRAME_QUEUE_DEPTH {
            return Ok(true);
        }
        self.space.wait_for(&mut state, slice);
        if let Some(msg) = &state.failure {
            return Err(msg.clone());
        }
        Ok(state.frames.len() < FRAME_QUEUE_DEPTH)
    }

    /// Blocking pop for the writer thread; `None` once closed and drained.
    fn next(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                self.space.notify_all();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            self.data.wait(&mut state);
        }
    }

    /// Stop accepting frames; the writer drains what is queued, then exits.
    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.data.notify_all();
    }

    /// Record a writer failure and unblock everyone.
    fn fail(&self, msg: String) {
        let mut state = self.state.lock();
        state.failure = Some(msg);
        state.frames.clear();
        state.closed = true;
        self.space.notify_all();
        self.data.notify_all();
    }

    fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }
}

/// Drains the queue into the encoder's stdin. Dropping stdin on exit is the
/// EOF signal that lets the encoder flush.
fn pump_frames(queue: Arc<FrameQueue>, mut stdin: ChildStdin) {
    while let Some(frame) = queue.next() {
        if let Err(e) = stdin.write_all(&frame) {
            queue.fail(format!("frame write: {e}"));
            return;
        }
    }
}

/// Encoder invocation for the raw-RGBA-over-stdin video pass.
fn encoder_args(video: &VideoTrackSpec, part_path: &Path) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "-s".to_string(),
        format!("{}x{}", video.source.width, video.source.height),
        "-r".to_string(),
        video.frame_rate.to_string(),
        "-i".to_string(),
        "-".to_string(),
    ];

    // Scale with aspect preserved and pad to the aligned output size.
    if video.source != video.output {
        args.extend([
            "-vf".to_string(),
            format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black",
                w = video.output.width,
                h = video.output.height
            ),
        ]);
    }

    args.extend([
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-b:v".to_string(),
        video.bit_rate.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        // MOV, not MP4: the container must carry the audio track as raw
        // pcm_s16le, which the MP4 muxer rejects on older ffmpeg builds.
        "-f".to_string(),
        "mov".to_string(),
        part_path.to_string_lossy().to_string(),
    ]);
    args
}

/// Second-pass invocation joining the encoded video with the scratch WAV.
fn mux_args(part_path: &Path, wav_path: &Path, output_path: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        part_path.to_string_lossy().to_string(),
        "-i".to_string(),
        wav_path.to_string_lossy().to_string(),
        "-map".to_string(),
        "0:v".to_string(),
        "-map".to_string(),
        "1:a".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "pcm_s16le".to_string(),
        "-f".to_string(),
        "mov".to_string(),
        output_path.to_string_lossy().to_string(),
    ]
}

struct AudioScratch {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    // Deletes the scratch file on drop.
    path: TempPath,
}

/// Sink writing one container artifact through FFmpeg.
pub struct FfmpegSink {
    output_path: PathBuf,
    part_path: PathBuf,
    child: Option<Child>,
    frames: Option<Arc<FrameQueue>>,
    writer: Option<JoinHandle<()>>,
    audio: Option<AudioScratch>,
    pool: Arc<BufferPool>,
    frames_written: u64,
    finished: bool,
}

impl FfmpegSink {
    /// Create the sink, failing early if the output target is unusable.
    pub fn open(output_path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SinkError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }

        let mut part_path = output_path.to_path_buf();
        part_path.as_mut_os_string().push(".part");

        // Prove the target is writable before any encoder resources exist.
        File::create(&part_path)
            .map_err(|e| SinkError::Unavailable(format!("{}: {e}", part_path.display())))?;

        Ok(Self {
            output_path: output_path.to_path_buf(),
            part_path,
            child: None,
            frames: None,
            writer: None,
            audio: None,
            pool: BufferPool::new(),
            frames_written: 0,
            finished: false,
        })
    }

    fn spawn_encoder(&mut self, video: &VideoTrackSpec) -> Result<(), SinkError> {
        let args = encoder_args(video, &self.part_path);
        tracing::info!("starting FFmpeg encoder: {:?}", args);

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SinkError::Unavailable(format!("failed to start ffmpeg: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError::Unavailable("failed to capture ffmpeg stdin".into()))?;

        let queue = Arc::new(FrameQueue::new());
        let pump_queue = queue.clone();
        self.writer = Some(std::thread::spawn(move || pump_frames(pump_queue, stdin)));
        self.frames = Some(queue);
        self.child = Some(child);
        Ok(())
    }

    /// Join the encoded video and scratch WAV into the final container,
    /// carrying the audio as uncompressed PCM.
    fn mux_with_audio(&self, wav_path: &Path) -> Result<(), SinkError> {
        let output = Command::new("ffmpeg")
            .args(mux_args(&self.part_path, wav_path, &self.output_path))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SinkError::Finalize(format!("failed to start mux pass: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SinkError::Finalize(format!("mux pass failed: {stderr}")));
        }
        Ok(())
    }

    fn cleanup_partials(&mut self) {
        // Wake the writer first so killing the child cannot strand it on a
        // full pipe.
        if let Some(queue) = self.frames.take() {
            queue.close();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        // TempPath in `audio` removes the scratch WAV when dropped.
        self.audio = None;
        if self.part_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.part_path) {
                tracing::warn!("failed to remove partial output: {e}");
            }
        }
    }
}

impl MediaSink for FfmpegSink {
    fn configure_tracks(
        &mut self,
        video: VideoTrackSpec,
        audio: Option<AudioTrackSpec>,
    ) -> Result<(), SinkError> {
        self.spawn_encoder(&video)?;

        if let Some(spec) = audio {
            let temp = tempfile::Builder::new()
                .prefix("replay-audio-")
                .suffix(".wav")
                .tempfile()
                .map_err(|e| SinkError::Unavailable(format!("audio scratch: {e}")))?;
            let path = temp.into_temp_path();
            let writer = hound::WavWriter::create(
                &path,
                hound::WavSpec {
                    channels: spec.channels,
                    sample_rate: spec.sample_rate,
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                },
            )
            .map_err(|e| SinkError::Unavailable(format!("audio scratch: {e}")))?;
            self.audio = Some(AudioScratch {
                writer: Some(writer),
                path,
            });
        }
        Ok(())
    }

    fn wait_ready(&mut self, slice: Duration) -> Readiness {
        let Some(child) = self.child.as_mut() else {
            return Readiness::Failed("encoder not configured".into());
        };
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => return Readiness::Failed(format!("ffmpeg exited early: {status}")),
            Err(e) => return Readiness::Failed(format!("ffmpeg status unavailable: {e}")),
        }
        let Some(queue) = self.frames.as_ref() else {
            return Readiness::Failed("encoder not configured".into());
        };
        match queue.wait_space(slice) {
            Ok(true) => Readiness::Ready,
            Ok(false) => Readiness::NotReady,
            Err(msg) => Readiness::Failed(msg),
        }
    }

    fn pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    fn append_video(&mut self, rgba: &[u8], _relative_time: Duration) -> Result<(), SinkError> {
        // Raw stdin input is constant-rate; frame cadence is fixed by the
        // track's frame rate, so the offset is implicit in frame order.
        let queue = self.frames.as_ref().ok_or(SinkError::NotConfigured)?;
        queue
            .push(rgba.to_vec())
            .map_err(SinkError::WriterFailed)?;
        self.frames_written += 1;
        Ok(())
    }

    fn append_audio(&mut self, samples: &[i16], _relative_time: Duration) -> Result<(), SinkError> {
        let scratch = self.audio.as_mut().ok_or(SinkError::NotConfigured)?;
        let writer = scratch.writer.as_mut().ok_or(SinkError::NotConfigured)?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| SinkError::WriterFailed(format!("audio write: {e}")))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<PathBuf, SinkError> {
        if self.finished {
            return Err(SinkError::Finalize("sink already finalized".into()));
        }

        // Drain the queue, then EOF to the encoder via the writer's exit.
        let queue = self.frames.take().ok_or(SinkError::NotConfigured)?;
        queue.close();
        if let Some(writer) = self.writer.take() {
            writer
                .join()
                .map_err(|_| SinkError::Finalize("frame writer thread panicked".into()))?;
        }
        if let Some(msg) = queue.failure() {
            return Err(SinkError::Finalize(msg));
        }

        let child = self.child.take().ok_or(SinkError::NotConfigured)?;
        let output = child
            .wait_with_output()
            .map_err(|e| SinkError::Finalize(format!("failed to wait for ffmpeg: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SinkError::Finalize(format!("ffmpeg exited with: {stderr}")));
        }

        match self.audio.take() {
            Some(mut scratch) => {
                if let Some(writer) = scratch.writer.take() {
                    writer
                        .finalize()
                        .map_err(|e| SinkError::Finalize(format!("audio scratch: {e}")))?;
                }
                self.mux_with_audio(&scratch.path)?;
                let _ = std::fs::remove_file(&self.part_path);
            }
            None => {
                std::fs::rename(&self.part_path, &self.output_path)
                    .map_err(|e| SinkError::Finalize(format!("rename into place: {e}")))?;
            }
        }

        self.finished = true;
        tracing::info!(
            frames = self.frames_written,
            path = %self.output_path.display(),
            "artifact finalized"
        );
        Ok(self.output_path.clone())
    }

    fn discard(&mut self) {
        self.cleanup_partials();
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if !self.finished {
            self.cleanup_partials();
        }
    }
}

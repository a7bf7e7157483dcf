//! Media sink abstraction
//!
//! The muxer drives a `MediaSink` without knowing whether frames land in an
//! FFmpeg child process or an in-memory test double. Sinks own their
//! readiness signal (a condition variable, not a busy-wait) and a small
//! buffer pool the muxer borrows from for pixel-layout conversion, keeping
//! allocations off the append path.

use crate::export::types::Resolution;
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Video track parameters handed to the sink at configuration time.
/// `output` is already 16-aligned by the muxer; `source` is the raw frame
/// size the appends will arrive in.
#[derive(Debug, Clone, Copy)]
pub struct VideoTrackSpec {
    pub source: Resolution,
    pub output: Resolution,
    pub frame_rate: u32,
    pub bit_rate: u32,
}

/// Audio track parameters; absent for video-only artifacts.
#[derive(Debug, Clone, Copy)]
pub struct AudioTrackSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Low-level sink failures, translated into the closed `ExportError` set at
/// the muxer boundary. Callers outside the export module never see these.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("append before track configuration")]
    NotConfigured,

    #[error("writer failed: {0}")]
    WriterFailed(String),

    #[error("finalize failed: {0}")]
    Finalize(String),
}

/// Result of one bounded readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Sink will accept the next append.
    Ready,
    /// Still busy after the wait slice; caller decides whether to keep
    /// waiting against its cumulative bound.
    NotReady,
    /// Writer entered a failed state; the whole job must abort.
    Failed(String),
}

/// A sink the muxer can feed one aligned snapshot into.
///
/// Contract: `configure_tracks` must precede any append; appends happen in
/// snapshot chronological order; `finish` or `discard` ends the sink's life.
/// `discard` must remove any partial output.
pub trait MediaSink: Send {
    /// Declare the tracks before any data is appended.
    fn configure_tracks(
        &mut self,
        video: VideoTrackSpec,
        audio: Option<AudioTrackSpec>,
    ) -> Result<(), SinkError>;

    /// Block up to `slice` for the sink to become ready for more data.
    fn wait_ready(&mut self, slice: Duration) -> Readiness;

    /// Pool for conversion scratch buffers.
    fn pool(&self) -> Arc<BufferPool>;

    /// Append one RGBA video frame at the given timeline offset.
    fn append_video(&mut self, rgba: &[u8], relative_time: Duration) -> Result<(), SinkError>;

    /// Append interleaved i16 audio at the given timeline offset.
    fn append_audio(&mut self, samples: &[i16], relative_time: Duration) -> Result<(), SinkError>;

    /// Mark all track inputs finished, await writer completion, and return
    /// the artifact path.
    fn finish(&mut self) -> Result<PathBuf, SinkError>;

    /// Abort: release writer resources and delete any partial output.
    fn discard(&mut self);
}

impl MediaSink for Box<dyn MediaSink> {
    fn configure_tracks(
        &mut self,
        video: VideoTrackSpec,
        audio: Option<AudioTrackSpec>,
    ) -> Result<(), SinkError> {
        (**self).configure_tracks(video, audio)
    }

    fn wait_ready(&mut self, slice: Duration) -> Readiness {
        (**self).wait_ready(slice)
    }

    fn pool(&self) -> Arc<BufferPool> {
        (**self).pool()
    }

    fn append_video(&mut self, rgba: &[u8], relative_time: Duration) -> Result<(), SinkError> {
        (**self).append_video(rgba, relative_time)
    }

    fn append_audio(&mut self, samples: &[i16], relative_time: Duration) -> Result<(), SinkError> {
        (**self).append_audio(samples, relative_time)
    }

    fn finish(&mut self) -> Result<PathBuf, SinkError> {
        (**self).finish()
    }

    fn discard(&mut self) {
        (**self).discard()
    }
}

/// A reuse pool for conversion scratch buffers.
///
/// Buffers return to the pool when their lease drops, so steady-state
/// exports allocate once per distinct size rather than once per frame.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
        })
    }

    /// Borrow a zero-filled buffer of exactly `len` bytes.
    pub fn acquire(self: &Arc<Self>, len: usize) -> BufferLease {
        let mut free = self.free.lock();
        let mut buf = free
            .iter()
            .position(|b| b.capacity() >= len)
            .map(|i| free.swap_remove(i))
            .unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        BufferLease {
            pool: self.clone(),
            buf,
        }
    }

    fn release(&self, buf: Vec<u8>) {
        self.free.lock().push(buf);
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// A pooled buffer; returns to its pool on drop.
pub struct BufferLease {
    pool: Arc<BufferPool>,
    buf: Vec<u8>,
}

impl std::ops::Deref for BufferLease {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

/// Scripted behavior for [`MemorySink`], shared with the test that drives it.
#[derive(Debug, Default)]
struct MemorySinkState {
    ready: bool,
    /// Appends remaining until the sink reports ready again; models a slow
    /// downstream encoder.
    stall_after: Option<u64>,
    fail_writer_at: Option<u64>,
    fail_finalize: bool,
    appends: u64,
    video_appended: u64,
    audio_appended: u64,
    configured: bool,
    has_audio_track: bool,
    finished: bool,
    discarded: bool,
}

/// In-memory sink with scriptable readiness and failure injection.
///
/// Stands in for the FFmpeg-backed sink in tests and honors the same
/// protocol, including the condition-variable readiness wait.
pub struct MemorySink {
    shared: Arc<(Mutex<MemorySinkState>, Condvar)>,
    pool: Arc<BufferPool>,
    artifact_path: PathBuf,
}

/// Inspection and scripting handle for a [`MemorySink`].
#[derive(Clone)]
pub struct MemorySinkHandle {
    shared: Arc<(Mutex<MemorySinkState>, Condvar)>,
}

impl MemorySink {
    pub fn new(artifact_path: impl Into<PathBuf>) -> (Self, MemorySinkHandle) {
        let shared = Arc::new((
            Mutex::new(MemorySinkState {
                ready: true,
                ..Default::default()
            }),
            Condvar::new(),
        ));
        let sink = Self {
            shared: shared.clone(),
            pool: BufferPool::new(),
            artifact_path: artifact_path.into(),
        };
        (sink, MemorySinkHandle { shared })
    }
}

impl MemorySinkHandle {
    /// Make the sink stop reporting ready after `n` further appends.
    pub fn stall_after(&self, n: u64) {
        self.shared.0.lock().stall_after = Some(n);
    }

    /// Flip the sink back to ready and wake any waiter.
    pub fn set_ready(&self) {
        let mut state = self.shared.0.lock();
        state.ready = true;
        state.stall_after = None;
        self.shared.1.notify_all();
    }

    /// Fail the writer on the `n`-th append (0-based).
    pub fn fail_writer_at(&self, n: u64) {
        self.shared.0.lock().fail_writer_at = Some(n);
    }

    /// Make `finish` report a writer error.
    pub fn fail_finalize(&self) {
        self.shared.0.lock().fail_finalize = true;
    }

    pub fn video_appended(&self) -> u64 {
        self.shared.0.lock().video_appended
    }

    pub fn audio_appended(&self) -> u64 {
        self.shared.0.lock().audio_appended
    }

    pub fn has_audio_track(&self) -> bool {
        self.shared.0.lock().has_audio_track
    }

    pub fn finished(&self) -> bool {
        self.shared.0.lock().finished
    }

    pub fn discarded(&self) -> bool {
        self.shared.0.lock().discarded
    }
}

impl MemorySink {
    fn record_append(&self, video: bool) -> Result<(), SinkError> {
        let mut state = self.shared.0.lock();
        if !state.configured {
            return Err(SinkError::NotConfigured);
        }
        if state.fail_writer_at == Some(state.appends) {
            return Err(SinkError::WriterFailed("injected writer failure".into()));
        }
        state.appends += 1;
        if video {
            state.video_appended += 1;
        } else {
            state.audio_appended += 1;
        }
        if let Some(remaining) = state.stall_after.as_mut() {
            if *remaining == 0 {
                state.ready = false;
            } else {
                *remaining -= 1;
            }
        }
        Ok(())
    }
}

impl MediaSink for MemorySink {
    fn configure_tracks(
        &mut self,
        _video: VideoTrackSpec,
        audio: Option<AudioTrackSpec>,
    ) -> Result<(), SinkError> {
        let mut state = self.shared.0.lock();
        state.configured = true;
        state.has_audio_track = audio.is_some();
        Ok(())
    }

    fn wait_ready(&mut self, slice: Duration) -> Readiness {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock();
        if state.ready {
            return Readiness::Ready;
        }
        cvar.wait_for(&mut state, slice);
        if state.ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    fn pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    fn append_video(&mut self, _rgba: &[u8], _relative_time: Duration) -> Result<(), SinkError> {
        self.record_append(true)
    }

    fn append_audio(&mut self, _samples: &[i16], _relative_time: Duration) -> Result<(), SinkError> {
        self.record_append(false)
    }

    fn finish(&mut self) -> Result<PathBuf, SinkError> {
        let mut state = self.shared.0.lock();
        if state.fail_finalize {
            return Err(SinkError::Finalize("injected finalize failure".into()));
        }
        state.finished = true;
        Ok(self.artifact_path.clone())
    }

    fn discard(&mut self) {
        self.shared.0.lock().discarded = true;
    }
}

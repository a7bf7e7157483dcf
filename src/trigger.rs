//! Trigger coordination
//!
//! The phrase detector fires a trigger; the coordinator takes one atomic
//! snapshot of both rolling buffers, registers a placeholder clip record
//! for the orchestrator, and dispatches an export job on a background task.
//! At most one job runs and one trigger waits; anything beyond that is
//! rejected with a visible busy signal rather than silently merged.

use crate::buffer::RollingWindow;
use crate::capture::frame::{TimestampedAudioChunk, TimestampedVideoFrame};
use crate::clock::{HostTime, MonotonicClock};
use crate::export::ffmpeg::FfmpegSink;
use crate::export::muxer::Muxer;
use crate::export::sink::{MediaSink, SinkError};
use crate::export::types::{ExportConfig, ExportError, ExportProgress, ExportResult};
use crate::sync::CaptureSnapshot;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default de-duplication window for back-to-back triggers.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

/// A trigger event from the phrase-detection collaborator.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// The recognized utterance that fired the trigger.
    pub utterance_text: String,
    /// Detector-reported time of the utterance, informational.
    pub trigger_time: HostTime,
}

/// How the coordinator handled a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Snapshot taken, export job started.
    Started(Uuid),
    /// Snapshot taken, job queued behind the running export.
    Queued(Uuid),
    /// One job running and one queued; trigger rejected.
    Busy,
    /// Within the cooldown of the previous accepted trigger; ignored.
    CoolingDown,
}

/// Lifecycle of one clip record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipStatus {
    Queued,
    Exporting,
    Ready,
    Failed,
}

/// Placeholder record registered per accepted trigger.
///
/// The upload/transcription collaborator enriches this later; the core only
/// tracks identity, the utterance, and export state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipRecord {
    pub id: Uuid,
    pub utterance: String,
    pub created_at: DateTime<Utc>,
    pub status: ClipStatus,
    pub artifact_path: Option<PathBuf>,
    pub result: Option<ExportResult>,
}

/// Events broadcast to the orchestrator.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    TriggerAccepted { clip_id: Uuid },
    TriggerQueued { clip_id: Uuid },
    TriggerRejected,
    ExportProgress { clip_id: Uuid, progress: ExportProgress },
    ExportCompleted { clip_id: Uuid, result: ExportResult },
    ExportFailed { clip_id: Uuid, error: ExportError },
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Directory receiving finished artifacts.
    pub output_dir: PathBuf,
    /// Encoder settings for every export.
    pub export: ExportConfig,
    /// De-duplication window; triggers inside it are ignored.
    pub cooldown: Duration,
}

impl TriggerConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            export: ExportConfig::default(),
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

type SinkFactory = dyn Fn(&Path) -> Result<Box<dyn MediaSink>, SinkError> + Send + Sync;

struct RunningJob {
    clip_id: Uuid,
    cancel: Arc<AtomicBool>,
}

struct PendingJob {
    clip_id: Uuid,
    snapshot: CaptureSnapshot,
}

#[derive(Default)]
struct CoordinatorState {
    running: Option<RunningJob>,
    queued: Option<PendingJob>,
    last_accepted: Option<HostTime>,
}

/// Serializes snapshot acquisition and governs export job slots.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TriggerCoordinator {
    clock: MonotonicClock,
    video: Arc<RollingWindow<TimestampedVideoFrame>>,
    audio: Arc<RollingWindow<TimestampedAudioChunk>>,
    config: Arc<TriggerConfig>,
    state: Arc<Mutex<CoordinatorState>>,
    clips: Arc<Mutex<HashMap<Uuid, ClipRecord>>>,
    events: broadcast::Sender<CaptureEvent>,
    sink_factory: Arc<SinkFactory>,
}

impl TriggerCoordinator {
    /// Coordinator exporting through the FFmpeg sink.
    pub fn new(
        clock: MonotonicClock,
        video: Arc<RollingWindow<TimestampedVideoFrame>>,
        audio: Arc<RollingWindow<TimestampedAudioChunk>>,
        config: TriggerConfig,
    ) -> Self {
        Self::with_sink_factory(
            clock,
            video,
            audio,
            config,
            Arc::new(|path| FfmpegSink::open(path).map(|s| Box::new(s) as Box<dyn MediaSink>)),
        )
    }

    /// Coordinator with an injected sink factory (tests use `MemorySink`).
    pub fn with_sink_factory(
        clock: MonotonicClock,
        video: Arc<RollingWindow<TimestampedVideoFrame>>,
        audio: Arc<RollingWindow<TimestampedAudioChunk>>,
        config: TriggerConfig,
        sink_factory: Arc<SinkFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            clock,
            video,
            audio,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            clips: Arc::new(Mutex::new(HashMap::new())),
            events,
            sink_factory,
        }
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    /// Look up a clip record.
    pub fn clip(&self, id: Uuid) -> Option<ClipRecord> {
        self.clips.lock().get(&id).cloned()
    }

    /// All clip records, newest last.
    pub fn clips(&self) -> Vec<ClipRecord> {
        let mut records: Vec<ClipRecord> = self.clips.lock().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Handle one trigger from the phrase detector.
    ///
    /// The snapshot is taken here, under the coordinator lock, so the clip
    /// always holds the history as of the trigger even if the job has to
    /// wait its turn. Buffer appends only contend with the copy itself.
    pub fn trigger(&self, event: TriggerEvent) -> TriggerOutcome {
        let now = self.clock.now();
        let mut state = self.state.lock();

        // Upstream debounces too; this is the core's own guarantee.
        if let Some(last) = state.last_accepted {
            if now.saturating_sub(last) < self.config.cooldown {
                tracing::debug!(utterance = %event.utterance_text, "trigger within cooldown, ignored");
                return TriggerOutcome::CoolingDown;
            }
        }

        if state.running.is_some() && state.queued.is_some() {
            tracing::warn!(utterance = %event.utterance_text, "both export slots occupied, rejecting trigger");
            let _ = self.events.send(CaptureEvent::TriggerRejected);
            return TriggerOutcome::Busy;
        }

        let snapshot = CaptureSnapshot {
            video: self.video.snapshot(),
            audio: self.audio.snapshot(),
            taken_at: now,
        };

        let clip_id = Uuid::new_v4();
        state.last_accepted = Some(now);

        if state.running.is_none() {
            self.register_clip(clip_id, &event, ClipStatus::Exporting);
            let cancel = self.launch(clip_id, snapshot);
            state.running = Some(RunningJob { clip_id, cancel });
            let _ = self.events.send(CaptureEvent::TriggerAccepted { clip_id });
            tracing::info!(%clip_id, utterance = %event.utterance_text, "export job started");
            TriggerOutcome::Started(clip_id)
        } else {
            self.register_clip(clip_id, &event, ClipStatus::Queued);
            state.queued = Some(PendingJob { clip_id, snapshot });
            let _ = self.events.send(CaptureEvent::TriggerQueued { clip_id });
            tracing::info!(%clip_id, utterance = %event.utterance_text, "export job queued");
            TriggerOutcome::Queued(clip_id)
        }
    }

    /// Cancel the in-flight export, if any. Queued work is untouched and
    /// starts once the cancelled job finishes tearing down.
    pub fn cancel_active(&self) -> bool {
        let state = self.state.lock();
        match &state.running {
            Some(job) => {
                tracing::info!(clip_id = %job.clip_id, "cancelling active export");
                job.cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Whether an export job is currently running.
    pub fn is_exporting(&self) -> bool {
        self.state.lock().running.is_some()
    }

    fn register_clip(&self, clip_id: Uuid, event: &TriggerEvent, status: ClipStatus) {
        self.clips.lock().insert(
            clip_id,
            ClipRecord {
                id: clip_id,
                utterance: event.utterance_text.clone(),
                created_at: Utc::now(),
                status,
                artifact_path: None,
                result: None,
            },
        );
    }

    /// Spawn the export task for one snapshot; returns its cancel flag.
    fn launch(&self, clip_id: Uuid, snapshot: CaptureSnapshot) -> Arc<AtomicBool> {
        let muxer = Muxer::new(self.config.export.clone());
        let cancel = muxer.cancel_flag();

        let this = self.clone();
        tokio::spawn(async move {
            let sink_path = this
                .config
                .output_dir
                .join(format!("replay-{clip_id}.mov"));
            let factory = this.sink_factory.clone();
            let events = this.events.clone();

            let joined = tokio::task::spawn_blocking(move || {
                muxer.run(
                    &snapshot,
                    || factory(&sink_path),
                    |progress| {
                        let _ = events.send(CaptureEvent::ExportProgress { clip_id, progress });
                    },
                )
            })
            .await;

            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(ExportError::WriterUnavailable(format!(
                    "export task panicked: {e}"
                ))),
            };

            this.finish_job(clip_id, outcome);
        });

        cancel
    }

    /// Record a job's outcome and promote the queued trigger, if any.
    fn finish_job(&self, clip_id: Uuid, outcome: Result<ExportResult, ExportError>) {
        match &outcome {
            Ok(result) => {
                tracing::info!(%clip_id, path = %result.artifact_path.display(), "export completed");
                let mut clips = self.clips.lock();
                if let Some(record) = clips.get_mut(&clip_id) {
                    record.status = ClipStatus::Ready;
                    record.artifact_path = Some(result.artifact_path.clone());
                    record.result = Some(result.clone());
                }
                let _ = self.events.send(CaptureEvent::ExportCompleted {
                    clip_id,
                    result: result.clone(),
                });
            }
            Err(error) => {
                tracing::error!(%clip_id, %error, "export failed");
                if let Some(record) = self.clips.lock().get_mut(&clip_id) {
                    record.status = ClipStatus::Failed;
                }
                let _ = self.events.send(CaptureEvent::ExportFailed {
                    clip_id,
                    error: error.clone(),
                });
            }
        }

        // Free the running slot, then promote the queued job outside of any
        // registry locks.
        let next = {
            let mut state = self.state.lock();
            state.running = None;
            if let Some(pending) = state.queued.take() {
                if let Some(record) = self.clips.lock().get_mut(&pending.clip_id) {
                    record.status = ClipStatus::Exporting;
                }
                let cancel = self.launch(pending.clip_id, pending.snapshot);
                state.running = Some(RunningJob {
                    clip_id: pending.clip_id,
                    cancel,
                });
                Some(pending.clip_id)
            } else {
                None
            }
        };
        if let Some(promoted) = next {
            tracing::info!(clip_id = %promoted, "queued export promoted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DEFAULT_WINDOW;
    use crate::capture::frame::{PixelFormat, VideoFrame};
    use crate::export::sink::MemorySink;
    use crate::export::sink::MemorySinkHandle;

    fn test_frame(ms: u64) -> TimestampedVideoFrame {
        TimestampedVideoFrame {
            frame: VideoFrame {
                pixel_data: vec![0u8; 4 * 4 * 4],
                width: 4,
                height: 4,
                format: PixelFormat::Rgba,
                presentation_time: Duration::from_millis(ms),
            },
            host_time: Duration::from_millis(ms),
        }
    }

    fn test_windows(
        frames: usize,
    ) -> (
        Arc<RollingWindow<TimestampedVideoFrame>>,
        Arc<RollingWindow<TimestampedAudioChunk>>,
    ) {
        let video = Arc::new(RollingWindow::new(DEFAULT_WINDOW));
        for i in 0..frames {
            video.append(test_frame(i as u64 * 100));
        }
        (video, Arc::new(RollingWindow::new(DEFAULT_WINDOW)))
    }

    /// Factory that records every handle so tests can script the sinks it makes.
    fn recording_factory(
        stall_new: Arc<AtomicBool>,
    ) -> (Arc<SinkFactory>, Arc<Mutex<Vec<MemorySinkHandle>>>) {
        let handles: Arc<Mutex<Vec<MemorySinkHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = handles.clone();
        let factory: Arc<SinkFactory> = Arc::new(move |path: &Path| {
            let (sink, handle) = MemorySink::new(path);
            if stall_new.load(Ordering::Relaxed) {
                handle.stall_after(0);
            }
            recorded.lock().push(handle);
            Ok(Box::new(sink) as Box<dyn MediaSink>)
        });
        (factory, handles)
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn coordinator_with(
        frames: usize,
        stall_new: Arc<AtomicBool>,
    ) -> (TriggerCoordinator, Arc<Mutex<Vec<MemorySinkHandle>>>) {
        let clock = MonotonicClock::manual();
        let (video, audio) = test_windows(frames);
        let (factory, handles) = recording_factory(stall_new);
        let mut config = TriggerConfig::new("/tmp/replay-tests");
        config.cooldown = Duration::ZERO;
        let coordinator =
            TriggerCoordinator::with_sink_factory(clock, video, audio, config, factory);
        (coordinator, handles)
    }

    fn fire(coordinator: &TriggerCoordinator, text: &str) -> TriggerOutcome {
        coordinator.trigger(TriggerEvent {
            utterance_text: text.into(),
            trigger_time: coordinator_time(coordinator),
        })
    }

    fn coordinator_time(coordinator: &TriggerCoordinator) -> HostTime {
        coordinator.clock.now()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_starts_export_and_records_clip() {
        let (coordinator, _handles) = coordinator_with(3, Arc::new(AtomicBool::new(false)));

        let outcome = fire(&coordinator, "hey capture that");
        let clip_id = match outcome {
            TriggerOutcome::Started(id) => id,
            other => panic!("expected Started, got {other:?}"),
        };

        settle(|| {
            coordinator
                .clip(clip_id)
                .is_some_and(|c| c.status == ClipStatus::Ready)
        })
        .await;

        let record = coordinator.clip(clip_id).unwrap();
        assert_eq!(record.utterance, "hey capture that");
        assert!(record.artifact_path.is_some());
        let result = record.result.unwrap();
        assert_eq!(result.items_written, 3);
        assert_eq!(result.items_dropped, 0);
        assert!(!coordinator.is_exporting());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cooldown_ignores_rapid_triggers() {
        let clock = MonotonicClock::manual();
        let (video, audio) = test_windows(1);
        let (factory, _handles) = recording_factory(Arc::new(AtomicBool::new(false)));
        let coordinator = TriggerCoordinator::with_sink_factory(
            clock.clone(),
            video,
            audio,
            TriggerConfig::new("/tmp/replay-tests"),
            factory,
        );

        assert!(matches!(
            fire(&coordinator, "first"),
            TriggerOutcome::Started(_)
        ));
        assert_eq!(fire(&coordinator, "echo"), TriggerOutcome::CoolingDown);

        clock.advance(Duration::from_millis(1999));
        assert_eq!(fire(&coordinator, "still echo"), TriggerOutcome::CoolingDown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_third_trigger_rejected_while_busy() {
        let stall_new = Arc::new(AtomicBool::new(true));
        let (coordinator, handles) = coordinator_with(3, stall_new.clone());
        let mut events = coordinator.subscribe();

        let first = fire(&coordinator, "one");
        assert!(matches!(first, TriggerOutcome::Started(_)));
        // The stalled sink blocks the job after its first append.
        settle(|| handles.lock().first().is_some_and(|h| h.video_appended() == 1)).await;

        let second = fire(&coordinator, "two");
        let queued_id = match second {
            TriggerOutcome::Queued(id) => id,
            other => panic!("expected Queued, got {other:?}"),
        };
        assert_eq!(
            coordinator.clip(queued_id).unwrap().status,
            ClipStatus::Queued
        );

        assert_eq!(fire(&coordinator, "three"), TriggerOutcome::Busy);

        // Unblock: future sinks stay ready, the stalled one wakes up.
        stall_new.store(false, Ordering::Relaxed);
        handles.lock()[0].set_ready();

        settle(|| {
            coordinator
                .clip(queued_id)
                .is_some_and(|c| c.status == ClipStatus::Ready)
        })
        .await;

        let mut rejected = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CaptureEvent::TriggerRejected) {
                rejected = true;
            }
        }
        assert!(rejected, "busy trigger should emit a rejection event");
        assert_eq!(handles.lock().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queued_snapshot_taken_at_trigger_time() {
        let stall_new = Arc::new(AtomicBool::new(true));
        let (coordinator, handles) = coordinator_with(2, stall_new.clone());

        assert!(matches!(fire(&coordinator, "one"), TriggerOutcome::Started(_)));
        settle(|| handles.lock().first().is_some_and(|h| h.video_appended() == 1)).await;

        let queued_id = match fire(&coordinator, "two") {
            TriggerOutcome::Queued(id) => id,
            other => panic!("expected Queued, got {other:?}"),
        };

        // Frames appended after the queued trigger must not leak into its
        // snapshot.
        coordinator.video.append(test_frame(5_000));
        coordinator.video.append(test_frame(5_100));

        stall_new.store(false, Ordering::Relaxed);
        handles.lock()[0].set_ready();

        settle(|| {
            coordinator
                .clip(queued_id)
                .is_some_and(|c| c.status == ClipStatus::Ready)
        })
        .await;

        let result = coordinator.clip(queued_id).unwrap().result.unwrap();
        assert_eq!(result.items_written, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_active_fails_clip_and_discards_partials() {
        let stall_new = Arc::new(AtomicBool::new(true));
        let (coordinator, handles) = coordinator_with(3, stall_new.clone());

        let running_id = match fire(&coordinator, "one") {
            TriggerOutcome::Started(id) => id,
            other => panic!("expected Started, got {other:?}"),
        };
        settle(|| handles.lock().first().is_some_and(|h| h.video_appended() == 1)).await;

        assert!(coordinator.cancel_active());
        stall_new.store(false, Ordering::Relaxed);
        handles.lock()[0].set_ready();

        settle(|| {
            coordinator
                .clip(running_id)
                .is_some_and(|c| c.status == ClipStatus::Failed)
        })
        .await;
        assert!(handles.lock()[0].discarded());
        assert!(!coordinator.cancel_active());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_buffers_fail_with_no_content() {
        let (coordinator, handles) = coordinator_with(0, Arc::new(AtomicBool::new(false)));

        let clip_id = match fire(&coordinator, "nothing there") {
            TriggerOutcome::Started(id) => id,
            other => panic!("expected Started, got {other:?}"),
        };

        settle(|| {
            coordinator
                .clip(clip_id)
                .is_some_and(|c| c.status == ClipStatus::Failed)
        })
        .await;
        // NoContent is detected before the sink factory runs.
        assert!(handles.lock().is_empty());
    }
}

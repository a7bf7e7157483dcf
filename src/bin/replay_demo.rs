//! End-to-end demo: feed the rolling buffers from the synthetic source,
//! fire a trigger, and watch the export land as a MOV clip. Requires `ffmpeg`
//! on PATH.
//!
//! ```sh
//! cargo run --bin replay-demo -- ./out
//! ```

use anyhow::{Context, Result};
use replay_capture::{
    buffer::DEFAULT_WINDOW, CaptureEngine, CaptureEvent, MockSource, MonotonicClock, TriggerConfig,
    TriggerCoordinator, TriggerEvent,
};
use std::path::PathBuf;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    replay_capture::init_tracing();

    let output_dir: PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./replay-out".into())
        .into();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating output dir {}", output_dir.display()))?;

    let clock = MonotonicClock::new();
    let engine = CaptureEngine::start(
        Box::new(MockSource::default()),
        clock.clone(),
        DEFAULT_WINDOW,
    )
    .await;

    tracing::info!("capturing synthetic media for 5s before triggering");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let coordinator = TriggerCoordinator::new(
        clock.clone(),
        engine.video_buffer(),
        engine.audio_buffer(),
        TriggerConfig::new(&output_dir),
    );
    let mut events = coordinator.subscribe();

    let outcome = coordinator.trigger(TriggerEvent {
        utterance_text: "hey replay, save that".into(),
        trigger_time: clock.now(),
    });
    tracing::info!(?outcome, "trigger handled");

    loop {
        match events.recv().await.context("event channel closed")? {
            CaptureEvent::ExportProgress { progress, .. } => {
                tracing::info!("export {:.0}% done", progress.percent());
            }
            CaptureEvent::ExportCompleted { clip_id, result } => {
                tracing::info!(
                    path = %result.artifact_path.display(),
                    items = result.items_written,
                    dropped = result.items_dropped,
                    duration_ms = result.captured_duration.as_millis() as u64,
                    "export complete"
                );
                if let Some(record) = coordinator.clip(clip_id) {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                break;
            }
            CaptureEvent::ExportFailed { error, .. } => {
                anyhow::bail!("export failed: {error}");
            }
            other => tracing::debug!(?other, "event"),
        }
    }

    Ok(())
}

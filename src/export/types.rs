//! Export types and configuration
//!
//! This module defines the types used for export configuration, progress
//! tracking, results, and the closed error taxonomy callers see.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Target video dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Round each dimension up to the nearest multiple of 16.
    ///
    /// Hardware encoders reject unaligned dimensions, so this happens once
    /// before track configuration; everything downstream sees the aligned
    /// size.
    pub fn aligned(&self) -> Resolution {
        let align = |v: u32| v.div_ceil(16) * 16;
        Resolution {
            width: align(self.width),
            height: align(self.height),
        }
    }
}

/// Export configuration options.
///
/// All values pass through to the encoder unchanged except `resolution`,
/// which is aligned via [`Resolution::aligned`] during track configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    /// Target video dimensions (pre-alignment).
    pub resolution: Resolution,
    /// Output frame rate.
    pub frame_rate: u32,
    /// Video bitrate in bits/sec.
    pub video_bit_rate: u32,
    /// Audio sample rate in Hz.
    pub audio_sample_rate: u32,
    /// Audio channel count.
    pub audio_channels: u16,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
            frame_rate: 30,
            video_bit_rate: 4_000_000,
            audio_sample_rate: 16_000,
            audio_channels: 1,
        }
    }
}

/// Progress signal emitted while writing items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    /// Items written so far.
    pub items_written: u64,
    /// Total items in the snapshot.
    pub items_total: u64,
}

impl ExportProgress {
    /// Progress as a percentage (0.0 to 100.0).
    pub fn percent(&self) -> f32 {
        if self.items_total == 0 {
            return 0.0;
        }
        (self.items_written as f32 / self.items_total as f32) * 100.0
    }
}

/// Outcome of a completed export delivered to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    /// Path of the finished container artifact.
    pub artifact_path: PathBuf,
    /// Wall span of media captured in the snapshot.
    pub captured_duration: Duration,
    /// Items successfully appended.
    pub items_written: u64,
    /// Per-item failures (pixel conversion), skipped without aborting.
    pub items_dropped: u64,
}

/// Export failures, the only error values callers ever see.
///
/// Internal writer/library errors are translated into this set at the
/// exporter boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// The snapshot held no video; detected before any sink allocation.
    #[error("snapshot contains no video frames")]
    NoContent,

    /// The sink could not be created or became unusable.
    #[error("writer unavailable: {0}")]
    WriterUnavailable(String),

    /// The readiness wait exceeded its cumulative bound.
    #[error("writer not ready after {elapsed:?}")]
    WriteTimeout {
        /// Wall time spent waiting before giving up.
        elapsed: Duration,
    },

    /// The writer reported an error while draining and closing.
    #[error("finalize failed: {0}")]
    WriteFinalizeError(String),

    /// The job was cancelled externally.
    #[error("export cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_rounds_up_to_16() {
        let r = Resolution {
            width: 1279,
            height: 719,
        };
        assert_eq!(
            r.aligned(),
            Resolution {
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn test_aligned_resolution_unchanged() {
        let r = Resolution {
            width: 1280,
            height: 720,
        };
        assert_eq!(r.aligned(), r);
    }

    #[test]
    fn test_odd_resolution_alignment() {
        let r = Resolution {
            width: 1,
            height: 17,
        };
        assert_eq!(
            r.aligned(),
            Resolution {
                width: 16,
                height: 32
            }
        );
    }

    #[test]
    fn test_progress_percent() {
        let p = ExportProgress {
            items_written: 50,
            items_total: 200,
        };
        assert_eq!(p.percent(), 25.0);

        let empty = ExportProgress {
            items_written: 0,
            items_total: 0,
        };
        assert_eq!(empty.percent(), 0.0);
    }
}

//! Export job state machine
//!
//! One job wraps one snapshot and walks strictly forward through its
//! lifecycle. There is no automatic retry; a caller re-triggers from idle.
//! Folding lifecycle booleans into explicit phases means "starting" and
//! "cleaning up" can never both be true at once.

use crate::export::types::ExportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle phase of an export job.
///
/// `Preparing` covers sink allocation and dimension/format negotiation;
/// `Writing` covers the item loop; `Finalizing` covers drain and close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportPhase {
    Idle,
    Preparing,
    Writing,
    Finalizing,
    Completed,
    Failed,
}

impl ExportPhase {
    fn rank(&self) -> u8 {
        match self {
            ExportPhase::Idle => 0,
            ExportPhase::Preparing => 1,
            ExportPhase::Writing => 2,
            ExportPhase::Finalizing => 3,
            ExportPhase::Completed | ExportPhase::Failed => 4,
        }
    }

    /// Whether this phase ends the job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportPhase::Completed | ExportPhase::Failed)
    }
}

/// Rejected state-machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition from {from:?} to {to:?}")]
    Invalid { from: ExportPhase, to: ExportPhase },

    #[error("job already reached terminal phase {phase:?}")]
    AlreadyTerminal { phase: ExportPhase },
}

/// Tracks one job's phase and, on failure, the reason.
#[derive(Debug)]
pub struct ExportStateMachine {
    phase: ExportPhase,
    failure: Option<ExportError>,
}

impl ExportStateMachine {
    pub fn new() -> Self {
        Self {
            phase: ExportPhase::Idle,
            failure: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ExportPhase {
        self.phase
    }

    /// Failure reason, present exactly when the phase is `Failed`.
    pub fn failure(&self) -> Option<&ExportError> {
        self.failure.as_ref()
    }

    /// Advance to the next non-failure phase.
    ///
    /// Only single forward steps are accepted; skipping a phase or moving
    /// backwards is a programming error surfaced immediately.
    pub fn advance(&mut self, to: ExportPhase) -> Result<(), TransitionError> {
        if self.phase.is_terminal() {
            return Err(TransitionError::AlreadyTerminal { phase: self.phase });
        }
        if to == ExportPhase::Failed {
            return Err(TransitionError::Invalid {
                from: self.phase,
                to,
            });
        }
        if to.rank() != self.phase.rank() + 1 {
            return Err(TransitionError::Invalid {
                from: self.phase,
                to,
            });
        }
        tracing::debug!(from = ?self.phase, to = ?to, "export phase transition");
        self.phase = to;
        Ok(())
    }

    /// Terminate the job with a failure reason.
    ///
    /// Allowed from any non-terminal phase; failing an already terminal job
    /// is rejected so callers cannot mask the original outcome.
    pub fn fail(&mut self, reason: ExportError) -> Result<(), TransitionError> {
        if self.phase.is_terminal() {
            return Err(TransitionError::AlreadyTerminal { phase: self.phase });
        }
        tracing::warn!(from = ?self.phase, %reason, "export failed");
        self.phase = ExportPhase::Failed;
        self.failure = Some(reason);
        Ok(())
    }
}

impl Default for ExportStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

//! Process-wide loop policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::safety::CONSENSUS_SCORE_FLOOR;

/// Rejected policy values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("maxLoops must be at least 1")]
    NoRounds,
    #[error("tau must be in (0, 1], got {0}")]
    TauOutOfRange(f64),
    #[error("tau {tau} must be above the consensus score floor {floor}")]
    TauBelowFloor { tau: f64, floor: f64 },
    #[error("maxSeconds must be positive")]
    NoBudget,
    #[error("call timeout must be positive")]
    NoCallTimeout,
}

/// Bounds on a single deliberation loop. Read-only after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Round cap.
    pub max_loops: u32,
    /// Halt score threshold.
    pub tau: f64,
    /// Wall-clock budget, checked at the top of each round.
    pub max_seconds: u64,
    /// Forward a reached consensus to the dispatcher.
    pub allow_dispatch: bool,
    /// Bound on any single collaborator call.
    pub call_timeout_secs: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_loops: 3,
            tau: 0.92,
            max_seconds: 60,
            allow_dispatch: false,
            call_timeout_secs: 30,
        }
    }
}

impl Policy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_loops == 0 {
            return Err(PolicyError::NoRounds);
        }
        if !(self.tau > 0.0 && self.tau <= 1.0) {
            return Err(PolicyError::TauOutOfRange(self.tau));
        }
        if self.tau <= CONSENSUS_SCORE_FLOOR {
            return Err(PolicyError::TauBelowFloor {
                tau: self.tau,
                floor: CONSENSUS_SCORE_FLOOR,
            });
        }
        if self.max_seconds == 0 {
            return Err(PolicyError::NoBudget);
        }
        if self.call_timeout_secs == 0 {
            return Err(PolicyError::NoCallTimeout);
        }
        Ok(())
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.max_seconds)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

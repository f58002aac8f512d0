//! Loop error taxonomy with failure classification.
//!
//! | Kind          | Fatal to loop | Halt reason          |
//! |---------------|---------------|----------------------|
//! | Request       | no loop made  | none                 |
//! | Safety        | yes           | `safety_violation`   |
//! | Consensus     | yes           | `consensus_invalid`  |
//! | Collaborator  | yes           | `collaborator_error` |
//! | Timeout       | yes           | `timeout`            |
//! | Internal      | yes           | `collaborator_error` |
//!
//! Attestation and dispatch failures never surface here; they are
//! best-effort and only logged.

use std::fmt;

use thiserror::Error;

use crate::integrations::ModelError;
use crate::message::{Role, VoiceId};
use crate::policy::PolicyError;
use crate::safety::{ConsensusRejection, SafetyViolation};
use crate::state::{HaltReason, LoopId, TransitionError};

/// Coarse classification of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed start request or policy; surfaced to the caller.
    Request,
    /// A voice produced dangerous content.
    Safety,
    /// The synthesized consensus was refused.
    Consensus,
    /// A model call failed or timed out.
    Collaborator,
    /// The wall-clock budget ran out between rounds.
    Timeout,
    /// Broken engine invariant.
    Internal,
}

impl FailureKind {
    /// Halt reason recorded on the loop, if the error ends one.
    pub fn halt_reason(self) -> Option<HaltReason> {
        match self {
            Self::Request => None,
            Self::Safety => Some(HaltReason::SafetyViolation),
            Self::Consensus => Some(HaltReason::ConsensusInvalid),
            Self::Collaborator | Self::Internal => Some(HaltReason::CollaboratorError),
            Self::Timeout => Some(HaltReason::Timeout),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Safety => write!(f, "safety"),
            Self::Consensus => write!(f, "consensus"),
            Self::Collaborator => write!(f, "collaborator"),
            Self::Timeout => write!(f, "timeout"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid start request: {0}")]
    InvalidRequest(String),

    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("{role} validation failed: {source}")]
    Safety {
        role: Role,
        #[source]
        source: SafetyViolation,
    },

    #[error("consensus validation failed: {0}")]
    Consensus(#[from] ConsensusRejection),

    #[error("{role} call to {voice} failed: {source}")]
    Model {
        role: Role,
        voice: VoiceId,
        #[source]
        source: ModelError,
    },

    #[error("wall-clock budget of {budget_secs}s exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u128, budget_secs: u64 },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("loop id {0} already registered")]
    DuplicateLoop(LoopId),
}

impl BrokerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRequest(_) | Self::Policy(_) => FailureKind::Request,
            Self::Safety { .. } => FailureKind::Safety,
            Self::Consensus(_) => FailureKind::Consensus,
            Self::Model { .. } => FailureKind::Collaborator,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Transition(_) | Self::DuplicateLoop(_) => FailureKind::Internal,
        }
    }

    /// Short audit context naming where the failure happened.
    pub fn context(&self) -> String {
        match self {
            Self::Safety { role, .. } => format!("{}_validation", role),
            Self::Consensus(_) => "consensus_validation".to_string(),
            Self::Model { role, .. } => format!("{}_call", role),
            Self::Timeout { .. } => "wall_clock".to_string(),
            Self::InvalidRequest(_) | Self::Policy(_) => "request".to_string(),
            Self::Transition(_) | Self::DuplicateLoop(_) => "internal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::DangerCategory;

    #[test]
    fn test_kinds_map_to_halt_reasons() {
        let err = BrokerError::Safety {
            role: Role::Arbiter,
            source: SafetyViolation {
                category: DangerCategory::DestructiveShell,
                label: "rm -rf",
            },
        };
        assert_eq!(err.kind(), FailureKind::Safety);
        assert_eq!(err.kind().halt_reason(), Some(HaltReason::SafetyViolation));
        assert_eq!(err.context(), "arbiter_validation");
        assert!(err.to_string().starts_with("arbiter validation failed"));

        let err = BrokerError::Timeout {
            elapsed_ms: 1500,
            budget_secs: 1,
        };
        assert_eq!(err.kind().halt_reason(), Some(HaltReason::Timeout));

        let err = BrokerError::InvalidRequest("goal is empty".into());
        assert_eq!(err.kind().halt_reason(), None);
    }

    #[test]
    fn test_model_error_display() {
        let err = BrokerError::Model {
            role: Role::Critique,
            voice: VoiceId::OaaLlmB,
            source: ModelError::Timeout(30),
        };
        assert_eq!(
            err.to_string(),
            "critique call to oaa-llm-b failed: model call timed out after 30s"
        );
        assert_eq!(err.kind(), FailureKind::Collaborator);
    }

    #[test]
    fn test_policy_error_is_request_kind() {
        let err: BrokerError = PolicyError::NoRounds.into();
        assert_eq!(err.kind(), FailureKind::Request);
    }
}

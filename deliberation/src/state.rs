//! Loop state machine: status, halt reasons, consensus, and the per-loop record.
//!
//! ```text
//! Running ──(score ≥ tau | round cap)──▶ Halted   (consensus attached)
//!    │
//!    └──(timeout | safety | invalid consensus | collaborator)──▶ Failed
//! ```
//!
//! A loop leaves `Running` exactly once. Both terminal states are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Citation, ThoughtMessage, VoiceAssignment};

/// Identifier of a deliberation loop (`tb_` + 8 hex chars).
pub type LoopId = String;

/// Generate a fresh loop identifier.
pub fn new_loop_id() -> LoopId {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("tb_{}", &raw[..8])
}

/// Lifecycle status of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Halted,
    Failed,
}

impl LoopStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Halted => write!(f, "halted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a loop left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Score met the threshold.
    ConsensusReached,
    /// Round cap exhausted below the threshold. Still a halt, but a weaker one.
    MaxLoopsReached,
    /// Wall-clock budget exceeded between rounds.
    Timeout,
    /// A voice produced dangerous content.
    SafetyViolation,
    /// The synthesized consensus failed validation.
    ConsensusInvalid,
    /// A model call errored or timed out.
    CollaboratorError,
}

impl HaltReason {
    /// Terminal status this reason leads to.
    pub fn status(self) -> LoopStatus {
        match self {
            Self::ConsensusReached | Self::MaxLoopsReached => LoopStatus::Halted,
            Self::Timeout
            | Self::SafetyViolation
            | Self::ConsensusInvalid
            | Self::CollaboratorError => LoopStatus::Failed,
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsensusReached => write!(f, "consensus_reached"),
            Self::MaxLoopsReached => write!(f, "max_loops_reached"),
            Self::Timeout => write!(f, "timeout"),
            Self::SafetyViolation => write!(f, "safety_violation"),
            Self::ConsensusInvalid => write!(f, "consensus_invalid"),
            Self::CollaboratorError => write!(f, "collaborator_error"),
        }
    }
}

/// The validated synthesis produced when a loop halts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consensus {
    pub summary: String,
    pub spec_delta: String,
    /// Opaque test-case descriptors.
    pub tests_delta: Vec<serde_json::Value>,
    pub risk_notes: Vec<String>,
    pub citations: Vec<Citation>,
    pub score: f64,
}

impl Consensus {
    /// BLAKE3 hex digest of the canonical JSON form.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

/// Receipt returned by a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub pr_url: String,
    pub commit_sha: String,
}

/// Error for transitions the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} → {to}: {reason}")]
pub struct TransitionError {
    pub from: LoopStatus,
    pub to: LoopStatus,
    pub reason: String,
}

/// Per-deliberation state. Owned by the loop manager; everyone else sees clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    pub id: LoopId,
    /// Caller-supplied business identifier, carried but never interpreted.
    pub cycle: String,
    pub goal: String,
    pub voices: VoiceAssignment,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Number of recorded messages. Always equals `messages.len()`.
    pub step: u32,
    pub rounds_run: u32,
    pub messages: Vec<ThoughtMessage>,
    pub status: LoopStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<Consensus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attest_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_ref: Option<DispatchReceipt>,
}

impl LoopState {
    pub fn new(id: impl Into<LoopId>, cycle: &str, goal: &str, voices: VoiceAssignment) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            cycle: cycle.to_string(),
            goal: goal.to_string(),
            voices,
            started_at: now,
            last_updated_at: now,
            step: 0,
            rounds_run: 0,
            messages: Vec::new(),
            status: LoopStatus::Running,
            halt_reason: None,
            consensus: None,
            attest_ref: None,
            dispatch_ref: None,
        }
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    fn require_running(&self, to: LoopStatus, what: &str) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to,
                reason: format!("{} after loop ended", what),
            });
        }
        Ok(())
    }

    /// Append a validated message to the transcript.
    pub fn record(&mut self, message: ThoughtMessage) -> Result<(), TransitionError> {
        self.require_running(LoopStatus::Running, "record")?;
        self.messages.push(message);
        self.step += 1;
        self.touch();
        Ok(())
    }

    /// Mark the start of a new round.
    pub fn begin_round(&mut self) -> Result<u32, TransitionError> {
        self.require_running(LoopStatus::Running, "begin round")?;
        self.rounds_run += 1;
        self.touch();
        Ok(self.rounds_run)
    }

    /// `Running → Halted` with its consensus.
    pub fn halt(&mut self, consensus: Consensus, reason: HaltReason) -> Result<(), TransitionError> {
        self.require_running(LoopStatus::Halted, "halt")?;
        if reason.status() != LoopStatus::Halted {
            return Err(TransitionError {
                from: self.status,
                to: LoopStatus::Halted,
                reason: format!("{} is not a halting reason", reason),
            });
        }
        self.status = LoopStatus::Halted;
        self.halt_reason = Some(reason);
        self.consensus = Some(consensus);
        self.touch();
        Ok(())
    }

    /// `Running → Failed`. Never carries a consensus.
    pub fn fail(&mut self, reason: HaltReason) -> Result<(), TransitionError> {
        self.require_running(LoopStatus::Failed, "fail")?;
        if reason.status() != LoopStatus::Failed {
            return Err(TransitionError {
                from: self.status,
                to: LoopStatus::Failed,
                reason: format!("{} is not a failure reason", reason),
            });
        }
        self.status = LoopStatus::Failed;
        self.halt_reason = Some(reason);
        self.consensus = None;
        self.touch();
        Ok(())
    }

    /// Attach the ledger reference. Only meaningful on a halted loop.
    pub fn set_attest_ref(&mut self, attest_ref: String) -> Result<(), TransitionError> {
        if self.status != LoopStatus::Halted {
            return Err(TransitionError {
                from: self.status,
                to: self.status,
                reason: "attestation requires a halted loop".to_string(),
            });
        }
        self.attest_ref = Some(attest_ref);
        self.touch();
        Ok(())
    }

    /// Attach the dispatch receipt. Only meaningful on a halted loop.
    pub fn set_dispatch_ref(&mut self, receipt: DispatchReceipt) -> Result<(), TransitionError> {
        if self.status != LoopStatus::Halted {
            return Err(TransitionError {
                from: self.status,
                to: self.status,
                reason: "dispatch requires a halted loop".to_string(),
            });
        }
        self.dispatch_ref = Some(receipt);
        self.touch();
        Ok(())
    }

    /// Most recent arbiter message, if any.
    pub fn last_arbiter(&self) -> Option<&ThoughtMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::Arbiter)
    }

    /// Consensus score, if the loop halted.
    pub fn score(&self) -> Option<f64> {
        self.consensus.as_ref().map(|c| c.score)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.last_updated_at - self.started_at).num_milliseconds()
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] loop={} cycle={} rounds={} step={}",
            self.status, self.id, self.cycle, self.rounds_run, self.step
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Role, VoiceId};

    fn state() -> LoopState {
        LoopState::new("tb_test0001", "C-109", "ship it", VoiceAssignment::default())
    }

    fn consensus(score: f64) -> Consensus {
        Consensus {
            summary: "Adopt arbiter synthesis".to_string(),
            spec_delta: "delta".to_string(),
            tests_delta: vec![],
            risk_notes: vec![],
            citations: vec![Citation::new("/specs/a.md")],
            score,
        }
    }

    #[test]
    fn test_new_loop_id_shape() {
        let id = new_loop_id();
        assert!(id.starts_with("tb_"));
        assert_eq!(id.len(), 11);
        assert_ne!(id, new_loop_id());
    }

    #[test]
    fn test_record_keeps_step_in_sync() {
        let mut s = state();
        s.record(ThoughtMessage::new(Role::Hypothesis, VoiceId::OaaLlmA, "h"))
            .unwrap();
        s.record(ThoughtMessage::new(Role::Critique, VoiceId::OaaLlmB, "c"))
            .unwrap();
        assert_eq!(s.step as usize, s.messages.len());
        assert_eq!(s.step, 2);
    }

    #[test]
    fn test_halt_attaches_consensus() {
        let mut s = state();
        s.halt(consensus(0.95), HaltReason::ConsensusReached).unwrap();
        assert_eq!(s.status, LoopStatus::Halted);
        assert_eq!(s.score(), Some(0.95));
        assert_eq!(s.halt_reason, Some(HaltReason::ConsensusReached));
    }

    #[test]
    fn test_fail_has_no_consensus() {
        let mut s = state();
        s.fail(HaltReason::Timeout).unwrap();
        assert_eq!(s.status, LoopStatus::Failed);
        assert!(s.consensus.is_none());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut s = state();
        s.fail(HaltReason::SafetyViolation).unwrap();

        let err = s
            .halt(consensus(0.99), HaltReason::ConsensusReached)
            .unwrap_err();
        assert_eq!(err.from, LoopStatus::Failed);
        assert!(s.consensus.is_none());

        assert!(s
            .record(ThoughtMessage::new(Role::Arbiter, VoiceId::OaaLlmC, "late"))
            .is_err());
        assert!(s.begin_round().is_err());
    }

    #[test]
    fn test_reason_must_match_status() {
        let mut s = state();
        assert!(s.fail(HaltReason::ConsensusReached).is_err());
        assert!(s.halt(consensus(0.9), HaltReason::Timeout).is_err());
        assert_eq!(s.status, LoopStatus::Running);
    }

    #[test]
    fn test_attest_ref_requires_halt() {
        let mut s = state();
        assert!(s.set_attest_ref("ledger://x".to_string()).is_err());
        s.halt(consensus(0.95), HaltReason::ConsensusReached).unwrap();
        s.set_attest_ref("ledger://x".to_string()).unwrap();
        assert_eq!(s.attest_ref.as_deref(), Some("ledger://x"));
    }

    #[test]
    fn test_last_arbiter() {
        let mut s = state();
        assert!(s.last_arbiter().is_none());
        s.record(ThoughtMessage::new(Role::Arbiter, VoiceId::OaaLlmC, "first"))
            .unwrap();
        s.record(ThoughtMessage::new(Role::Hypothesis, VoiceId::OaaLlmA, "h"))
            .unwrap();
        s.record(ThoughtMessage::new(Role::Arbiter, VoiceId::OaaLlmC, "second"))
            .unwrap();
        assert_eq!(s.last_arbiter().unwrap().content, "second");
    }

    #[test]
    fn test_halt_reason_display_and_status() {
        assert_eq!(HaltReason::MaxLoopsReached.to_string(), "max_loops_reached");
        assert_eq!(HaltReason::Timeout.status(), LoopStatus::Failed);
        assert_eq!(HaltReason::ConsensusReached.status(), LoopStatus::Halted);
        let json = serde_json::to_string(&HaltReason::CollaboratorError).unwrap();
        assert_eq!(json, "\"collaborator_error\"");
    }

    #[test]
    fn test_consensus_digest_is_stable() {
        let a = consensus(0.95);
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), consensus(0.96).digest());
        assert_eq!(a.digest().len(), 64);
    }
}

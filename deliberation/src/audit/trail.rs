//! Audit trail projection of a loop's state.

use serde::{Deserialize, Serialize};

use crate::message::{Citation, Role, ThoughtMessage, VoiceId};
use crate::safety::SafetyGuard;
use crate::state::{DispatchReceipt, HaltReason, LoopId, LoopState, LoopStatus};

/// One transcript entry in the trail, content sanitized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailMessage {
    pub role: Role,
    pub from: VoiceId,
    pub score: Option<f64>,
    pub citations: Vec<Citation>,
    pub content: String,
}

/// The consensus as it appears in the trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailConsensus {
    pub score: f64,
    pub summary: String,
    pub citations: Vec<Citation>,
    pub risk_notes: Vec<String>,
}

/// Reconstructed history of a loop, suitable for external review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrail {
    pub loop_id: LoopId,
    pub cycle: String,
    pub status: LoopStatus,
    pub halt_reason: Option<HaltReason>,
    pub steps: u32,
    pub rounds_run: u32,
    pub duration_ms: i64,
    pub messages: Vec<TrailMessage>,
    pub consensus: Option<TrailConsensus>,
    pub attest_ref: Option<String>,
    pub dispatch_ref: Option<DispatchReceipt>,
}

impl AuditTrail {
    /// Project `state` into a trail. Every caller- or voice-supplied string
    /// (cycle, content, citations, summary, risk notes) goes through
    /// `sanitize_for_logging`.
    pub fn from_state(state: &LoopState, guard: &SafetyGuard) -> Self {
        Self {
            loop_id: state.id.clone(),
            cycle: guard.sanitize_for_logging(&state.cycle),
            status: state.status,
            halt_reason: state.halt_reason,
            steps: state.step,
            rounds_run: state.rounds_run,
            duration_ms: state.duration_ms(),
            messages: state
                .messages
                .iter()
                .map(|m| trail_message(m, guard))
                .collect(),
            consensus: state.consensus.as_ref().map(|c| TrailConsensus {
                score: c.score,
                summary: guard.sanitize_for_logging(&c.summary),
                citations: sanitize_citations(&c.citations, guard),
                risk_notes: c
                    .risk_notes
                    .iter()
                    .map(|n| guard.sanitize_for_logging(n))
                    .collect(),
            }),
            attest_ref: state.attest_ref.clone(),
            dispatch_ref: state.dispatch_ref.clone(),
        }
    }
}

fn trail_message(message: &ThoughtMessage, guard: &SafetyGuard) -> TrailMessage {
    TrailMessage {
        role: message.role,
        from: message.from,
        score: message.score,
        citations: sanitize_citations(&message.citations, guard),
        content: guard.sanitize_for_logging(&message.content),
    }
}

fn sanitize_citations(citations: &[Citation], guard: &SafetyGuard) -> Vec<Citation> {
    citations
        .iter()
        .map(|c| Citation {
            url: guard.sanitize_for_logging(&c.url),
            hash: c.hash.as_deref().map(|h| guard.sanitize_for_logging(h)),
        })
        .collect()
}

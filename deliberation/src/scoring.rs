//! ConsensusScorer: agreement score and halting rule.
//!
//! Only the most recent arbiter message is scored. Hypothesis and critique
//! messages shape the arbiter's context but never the number itself.

use serde::{Deserialize, Serialize};

use crate::message::ThoughtMessage;

/// Scoring constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusScorer {
    /// Base used when the arbiter reports no score of its own.
    pub default_base: f64,
    /// Added when the arbiter cites at least one source.
    pub citation_bonus: f64,
    /// Subtracted when the arbiter cites nothing.
    pub missing_citation_penalty: f64,
}

impl Default for ConsensusScorer {
    fn default() -> Self {
        Self {
            default_base: 0.9,
            citation_bonus: 0.02,
            missing_citation_penalty: 0.05,
        }
    }
}

impl ConsensusScorer {
    /// Score the transcript from its latest arbiter message, clamped to `[0, 1]`.
    ///
    /// A transcript with no arbiter scores from `default_base` with the
    /// missing-citation penalty applied.
    pub fn compute(&self, messages: &[ThoughtMessage]) -> f64 {
        let arbiter = messages.iter().rev().find(|m| m.role.is_scored());

        let base = arbiter.and_then(|m| m.score).unwrap_or(self.default_base);
        let adjustment = match arbiter {
            Some(m) if m.is_cited() => self.citation_bonus,
            _ => -self.missing_citation_penalty,
        };

        let score = base + adjustment;
        if score.is_nan() {
            return 0.0;
        }
        score.clamp(0.0, 1.0)
    }

    /// Halt once the score meets `tau` or the round cap is spent.
    ///
    /// Callers only ask after a full round, so at least one round always runs.
    pub fn should_halt(&self, score: f64, rounds_run: u32, tau: f64, max_loops: u32) -> bool {
        score >= tau || rounds_run >= max_loops
    }
}

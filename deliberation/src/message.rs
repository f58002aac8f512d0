//! Transcript vocabulary: roles, voices, citations, and thought messages.

use serde::{Deserialize, Serialize};

/// Role a voice plays within one round.
///
/// A round always produces exactly one message per role, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Proposes a patch plan for the goal.
    Hypothesis,
    /// Looks for risks, missing tests, and missing citations in the hypothesis.
    Critique,
    /// Synthesizes hypothesis and critique into a scored, cited decision.
    Arbiter,
}

impl Role {
    /// Whether this role contributes to the consensus score.
    pub fn is_scored(self) -> bool {
        matches!(self, Self::Arbiter)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hypothesis => write!(f, "hypothesis"),
            Self::Critique => write!(f, "critique"),
            Self::Arbiter => write!(f, "arbiter"),
        }
    }
}

/// One of the fixed model voices allowed to take part in a deliberation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoiceId {
    #[serde(rename = "oaa-llm-a")]
    OaaLlmA,
    #[serde(rename = "oaa-llm-b")]
    OaaLlmB,
    #[serde(rename = "oaa-llm-c")]
    OaaLlmC,
}

impl VoiceId {
    /// Every voice, in canonical order.
    pub const ALL: [VoiceId; 3] = [VoiceId::OaaLlmA, VoiceId::OaaLlmB, VoiceId::OaaLlmC];

    /// Wire identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OaaLlmA => "oaa-llm-a",
            Self::OaaLlmB => "oaa-llm-b",
            Self::OaaLlmC => "oaa-llm-c",
        }
    }

    /// Parse a wire identifier. Returns `None` for anything outside the fixed set.
    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == id)
    }
}

impl std::fmt::Display for VoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which voice plays which role in every round of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceAssignment {
    pub hypothesis: VoiceId,
    pub critique: VoiceId,
    pub arbiter: VoiceId,
}

impl VoiceAssignment {
    /// Fill the three roles by cycling over the requested voices in order.
    ///
    /// An empty request falls back to the canonical a/b/c assignment.
    pub fn from_voices(voices: &[VoiceId]) -> Self {
        if voices.is_empty() {
            return Self::default();
        }
        let pick = |i: usize| voices[i % voices.len()];
        Self {
            hypothesis: pick(0),
            critique: pick(1),
            arbiter: pick(2),
        }
    }

    /// Voice assigned to `role`.
    pub fn voice_for(&self, role: Role) -> VoiceId {
        match role {
            Role::Hypothesis => self.hypothesis,
            Role::Critique => self.critique,
            Role::Arbiter => self.arbiter,
        }
    }
}

impl Default for VoiceAssignment {
    fn default() -> Self {
        Self {
            hypothesis: VoiceId::OaaLlmA,
            critique: VoiceId::OaaLlmB,
            arbiter: VoiceId::OaaLlmC,
        }
    }
}

/// A reference supporting a message's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Citation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// One contribution to a deliberation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThoughtMessage {
    pub role: Role,
    pub from: VoiceId,
    /// Free text. Only SafetyGuard redaction may change it before it is recorded.
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Self-reported quality estimate in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Advisory hint from the voice; the scorer has the final say on halting.
    #[serde(
        default,
        rename = "continue",
        skip_serializing_if = "Option::is_none"
    )]
    pub continue_hint: Option<bool>,
}

impl ThoughtMessage {
    pub fn new(role: Role, from: VoiceId, content: impl Into<String>) -> Self {
        Self {
            role,
            from,
            content: content.into(),
            citations: Vec::new(),
            score: None,
            continue_hint: None,
        }
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = citations;
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Whether the message carries at least one citation.
    pub fn is_cited(&self) -> bool {
        !self.citations.is_empty()
    }
}

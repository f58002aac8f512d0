//! Collaborator contracts: model voices, ledger attestation, code dispatch.
//!
//! The engine only talks to these traits. Concrete HTTP adapters live in the
//! service crate; tests plug in scripted doubles.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Citation, Role, VoiceId};
use crate::state::{Consensus, DispatchReceipt, LoopId};

/// Errors from a model voice.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    RequestFailed(String),

    #[error("model response parse error: {0}")]
    ParseError(String),

    #[error("model voice {0} is not configured")]
    Unavailable(VoiceId),

    #[error("model call timed out after {0}s")]
    Timeout(u64),
}

/// Errors from the ledger attestor.
#[derive(Debug, Error)]
pub enum AttestError {
    #[error("ledger request failed: {0}")]
    RequestFailed(String),

    #[error("ledger_http_{0}")]
    Status(u16),

    #[error("ledger response carried no reference")]
    MissingReference,

    #[error("ledger call timed out after {0}s")]
    Timeout(u64),
}

/// Errors from the code-host dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch request failed: {0}")]
    RequestFailed(String),

    #[error("dispatch_http_{0}")]
    Status(u16),

    #[error("dispatch response parse error: {0}")]
    ParseError(String),

    #[error("dispatch call timed out after {0}s")]
    Timeout(u64),
}

/// What a voice returns for one role turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDraft {
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default, rename = "continue")]
    pub continue_hint: Option<bool>,
}

/// A model endpoint able to speak for any voice.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Produce `voice`'s contribution for `role` given the round context.
    async fn draft(&self, voice: VoiceId, role: Role, context: &str)
        -> Result<ModelDraft, ModelError>;
}

/// Proof of a reached consensus, as sent to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationPayload {
    #[serde(rename = "@type")]
    pub kind: String,
    pub cycle: String,
    pub loop_id: LoopId,
    pub score: f64,
    pub citations: Vec<Citation>,
    /// BLAKE3 hex digest of the consensus.
    pub digest: String,
}

impl AttestationPayload {
    pub const KIND: &'static str = "DeliberationProof";

    pub fn new(loop_id: &str, cycle: &str, consensus: &Consensus) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            cycle: cycle.to_string(),
            loop_id: loop_id.to_string(),
            score: consensus.score,
            citations: consensus.citations.clone(),
            digest: consensus.digest(),
        }
    }
}

/// Tamper-evident sealing of a consensus.
#[async_trait]
pub trait LedgerAttestor: Send + Sync {
    /// Returns an opaque reference to the attestation.
    async fn attest(&self, payload: &AttestationPayload) -> Result<String, AttestError>;
}

/// One file in a dispatched change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchFile {
    pub path: String,
    pub content: String,
}

/// A proposed change for the code host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub repo: String,
    pub branch: String,
    pub commit_message: String,
    pub files: Vec<DispatchFile>,
}

impl DispatchRequest {
    pub const SPEC_PATH: &'static str = "/.civic/change.spec.md";
    pub const TESTS_PATH: &'static str = "/.civic/change.tests.json";

    /// Build the change proposal for a halted loop's consensus.
    pub fn for_consensus(repo: &str, loop_id: &str, tau: f64, consensus: &Consensus) -> Self {
        let tests = serde_json::to_string_pretty(&consensus.tests_delta)
            .unwrap_or_else(|_| "[]".to_string());
        Self {
            repo: repo.to_string(),
            branch: format!("feature/{}", loop_id),
            commit_message: format!("feat: consensus {} (score>={})", loop_id, tau),
            files: vec![
                DispatchFile {
                    path: Self::SPEC_PATH.to_string(),
                    content: consensus.spec_delta.clone(),
                },
                DispatchFile {
                    path: Self::TESTS_PATH.to_string(),
                    content: tests,
                },
            ],
        }
    }
}

/// Forwards a reached consensus to a code-hosting system.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError>;
}

/// Outcome of a best-effort side call after a halt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort<T> {
    Done(T),
    Failed(String),
    Skipped,
}

/// Where dispatched changes land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub repo: String,
}

/// The collaborators a loop manager drives.
#[derive(Clone)]
pub struct Integrations {
    pub model: Arc<dyn ModelClient>,
    pub ledger: Option<Arc<dyn LedgerAttestor>>,
    pub dispatcher: Option<(Arc<dyn Dispatcher>, DispatchTarget)>,
}

impl Integrations {
    /// Model only: no attestation, no dispatch.
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            ledger: None,
            dispatcher: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerAttestor>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>, target: DispatchTarget) -> Self {
        self.dispatcher = Some((dispatcher, target));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consensus() -> Consensus {
        Consensus {
            summary: "Adopt arbiter synthesis for goal: g".to_string(),
            spec_delta: "## change".to_string(),
            tests_delta: vec![serde_json::json!({"name": "t", "source": "p", "expect": "pass"})],
            risk_notes: vec![],
            citations: vec![Citation::new("/specs/07.md").with_hash("sha256:abc123")],
            score: 0.95,
        }
    }

    #[test]
    fn test_attestation_payload_shape() {
        let payload = AttestationPayload::new("tb_00000001", "C-109", &consensus());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["@type"], "DeliberationProof");
        assert_eq!(json["loopId"], "tb_00000001");
        assert_eq!(json["cycle"], "C-109");
        assert_eq!(json["digest"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_dispatch_request_for_consensus() {
        let req = DispatchRequest::for_consensus("org/repo", "tb_00000001", 0.92, &consensus());
        assert_eq!(req.branch, "feature/tb_00000001");
        assert_eq!(req.commit_message, "feat: consensus tb_00000001 (score>=0.92)");
        assert_eq!(req.files[0].path, DispatchRequest::SPEC_PATH);
        assert_eq!(req.files[0].content, "## change");
        let tests: Vec<serde_json::Value> = serde_json::from_str(&req.files[1].content).unwrap();
        assert_eq!(tests.len(), 1);
    }

    #[test]
    fn test_draft_accepts_minimal_json() {
        let draft: ModelDraft = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(draft.content, "hi");
        assert!(draft.citations.is_empty());
        assert!(draft.score.is_none());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(AttestError::Status(503).to_string(), "ledger_http_503");
        assert_eq!(
            ModelError::Unavailable(VoiceId::OaaLlmB).to_string(),
            "model voice oaa-llm-b is not configured"
        );
    }
}

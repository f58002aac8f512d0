//! Bounded multi-voice deliberation engine.
//!
//! Three model voices take the hypothesis, critique and arbiter roles in
//! repeated rounds until the arbiter's adjusted score reaches a threshold or
//! the round cap is spent. Every message passes a safety gate before it is
//! recorded; a halted loop yields a validated [`Consensus`] that is then
//! attested to a ledger and optionally dispatched to a code host, both on a
//! best-effort basis.
//!
//! - [`message`]: roles, voices, citations, thought messages
//! - [`state`]: loop state machine (`Running → Halted | Failed`)
//! - [`policy`]: round cap, score threshold, budgets
//! - [`safety`]: danger patterns, secret redaction, consensus validity
//! - [`scoring`]: arbiter-based consensus score and halting rule
//! - [`audit`]: structured, level-gated audit log and audit trail
//! - [`integrations`]: ModelClient / LedgerAttestor / Dispatcher contracts
//! - [`registry`]: concurrent id → state store
//! - [`manager`]: the loop driver

pub mod audit;
pub mod error;
pub mod integrations;
pub mod manager;
pub mod message;
pub mod policy;
pub mod registry;
pub mod safety;
pub mod scoring;
pub mod state;

pub use audit::{AuditEvent, AuditLevel, AuditLogger, AuditRecord, AuditTrail, SharedAuditLogger};
pub use error::{BrokerError, FailureKind};
pub use integrations::{
    AttestError, AttestationPayload, BestEffort, DispatchError, DispatchFile, DispatchRequest,
    DispatchTarget, Dispatcher, Integrations, LedgerAttestor, ModelClient, ModelDraft, ModelError,
};
pub use manager::{LoopManager, StartRequest};
pub use message::{Citation, Role, ThoughtMessage, VoiceAssignment, VoiceId};
pub use policy::{Policy, PolicyError};
pub use registry::{LoopRegistry, LoopSummary};
pub use safety::{ConsensusRejection, SafetyGuard, SafetyViolation};
pub use scoring::ConsensusScorer;
pub use state::{Consensus, DispatchReceipt, HaltReason, LoopId, LoopState, LoopStatus};

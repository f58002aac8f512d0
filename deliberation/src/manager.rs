//! LoopManager: drives a deliberation from start to a terminal state.
//!
//! One call to [`LoopManager::start`] owns one loop for its whole lifetime:
//!
//! 1. Register a fresh `Running` state and log `loop_start`.
//! 2. Per round: check the wall-clock budget, then hypothesis → critique →
//!    arbiter, each call bounded by the per-call timeout and each message
//!    gated by the SafetyGuard before it is recorded.
//! 3. Score the transcript; halt at `tau` or at the round cap.
//! 4. On halt: validate the synthesized consensus, then best-effort
//!    attestation and (if allowed) dispatch.
//!
//! Any error inside a round fails the loop; no consensus survives a failure.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditLogger, SharedAuditLogger};
use crate::error::{BrokerError, FailureKind};
use crate::integrations::{
    AttestError, AttestationPayload, BestEffort, DispatchError, DispatchRequest, Integrations,
    ModelError,
};
use crate::message::{Role, ThoughtMessage, VoiceAssignment, VoiceId};
use crate::policy::Policy;
use crate::registry::{LoopRegistry, LoopSummary};
use crate::safety::{truncate_chars, SafetyGuard};
use crate::scoring::ConsensusScorer;
use crate::state::{new_loop_id, Consensus, DispatchReceipt, HaltReason, LoopState};

const SUMMARY_CHARS: usize = 200;
const RISK_NOTE_CHARS: usize = 280;
const ATTESTATION_CAVEAT: &str =
    "attestation is best-effort: a missing attestRef means the ledger did not seal this consensus";

/// Parameters of one deliberation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub cycle: String,
    pub proposal_ref: String,
    #[serde(default)]
    pub spec_ref: Option<String>,
    #[serde(default)]
    pub tests_ref: Option<String>,
    pub goal: String,
    /// Requested voices, in the order they fill the roles.
    #[serde(default)]
    pub voices: Vec<VoiceId>,
}

impl StartRequest {
    pub fn new(cycle: &str, proposal_ref: &str, goal: &str) -> Self {
        Self {
            cycle: cycle.to_string(),
            proposal_ref: proposal_ref.to_string(),
            spec_ref: None,
            tests_ref: None,
            goal: goal.to_string(),
            voices: VoiceId::ALL.to_vec(),
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        for (field, value) in [
            ("cycle", &self.cycle),
            ("proposalRef", &self.proposal_ref),
            ("goal", &self.goal),
        ] {
            if value.trim().is_empty() {
                return Err(BrokerError::InvalidRequest(format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }

    /// Hypothesis context, carrying the previous arbiter synthesis from round 2 on.
    pub fn hypothesis_context(&self, previous: Option<&ThoughtMessage>) -> String {
        let mut context = format!(
            "goal={} proposalRef={} specRef={} testsRef={}",
            self.goal,
            self.proposal_ref,
            self.spec_ref.as_deref().unwrap_or(""),
            self.tests_ref.as_deref().unwrap_or(""),
        );
        if let Some(previous) = previous {
            context.push_str("\nprevious arbiter synthesis:\n");
            context.push_str(&previous.content);
        }
        context
    }
}

/// What a completed set of rounds settled on.
struct Verdict {
    consensus: Consensus,
    reason: HaltReason,
    score: f64,
}

pub struct LoopManager {
    policy: Policy,
    integrations: Integrations,
    registry: Arc<LoopRegistry>,
    audit: SharedAuditLogger,
    guard: SafetyGuard,
    scorer: ConsensusScorer,
}

impl LoopManager {
    /// Manager with its own registry and an info-level audit logger.
    pub fn new(policy: Policy, integrations: Integrations) -> Result<Self, BrokerError> {
        Self::with_parts(
            policy,
            integrations,
            Arc::new(LoopRegistry::new()),
            AuditLogger::default().shared(),
        )
    }

    /// Manager over an existing registry and audit logger.
    pub fn with_parts(
        policy: Policy,
        integrations: Integrations,
        registry: Arc<LoopRegistry>,
        audit: SharedAuditLogger,
    ) -> Result<Self, BrokerError> {
        policy.validate()?;
        Ok(Self {
            policy,
            integrations,
            registry,
            audit,
            guard: SafetyGuard::default(),
            scorer: ConsensusScorer::default(),
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<LoopRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &SharedAuditLogger {
        &self.audit
    }

    /// Snapshot of a loop.
    pub fn get(&self, id: &str) -> Option<LoopState> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<LoopSummary> {
        self.registry.list()
    }

    /// Run a deliberation to its terminal state and return the final snapshot.
    ///
    /// Loop failures are reported through the returned state, not as errors.
    /// `Err` means the request was rejected before a loop existed, or an
    /// engine invariant broke.
    pub async fn start(&self, request: StartRequest) -> Result<LoopState, BrokerError> {
        request.validate()?;

        let voices = VoiceAssignment::from_voices(&request.voices);
        let mut state = LoopState::new(new_loop_id(), &request.cycle, &request.goal, voices);
        if !self.registry.insert(state.clone()) {
            return Err(BrokerError::DuplicateLoop(state.id));
        }
        self.audit.log_loop_start(&state.id, &state.cycle, &state.goal);
        info!(loop_id = %state.id, cycle = %state.cycle, "Deliberation started");

        let outcome = match self.deliberate(&mut state, &request).await {
            Ok(verdict) => self.conclude(&mut state, verdict).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            self.abort(&mut state, err)?;
        }

        info!("{}", state.status_line());
        Ok(state)
    }

    async fn deliberate(
        &self,
        state: &mut LoopState,
        request: &StartRequest,
    ) -> Result<Verdict, BrokerError> {
        let started = Instant::now();
        let budget = self.policy.budget();

        loop {
            let elapsed = started.elapsed();
            if elapsed > budget {
                return Err(BrokerError::Timeout {
                    elapsed_ms: elapsed.as_millis(),
                    budget_secs: self.policy.max_seconds,
                });
            }

            let round = state.begin_round()?;
            self.registry.update(state);
            debug!(loop_id = %state.id, round, "Round started");

            let context = request.hypothesis_context(state.last_arbiter());
            let hypothesis = self.turn(state, Role::Hypothesis, &context).await?;
            let critique = self.turn(state, Role::Critique, &hypothesis.content).await?;
            let context = format!("{}\n{}", hypothesis.content, critique.content);
            let arbiter = self.turn(state, Role::Arbiter, &context).await?;

            let score = self.scorer.compute(&state.messages);
            debug!(loop_id = %state.id, round, score, tau = self.policy.tau, "Round scored");

            if self
                .scorer
                .should_halt(score, state.rounds_run, self.policy.tau, self.policy.max_loops)
            {
                let reason = if score >= self.policy.tau {
                    HaltReason::ConsensusReached
                } else {
                    HaltReason::MaxLoopsReached
                };
                let consensus = synthesize(request, &critique, &arbiter, score);
                self.guard.validate_consensus(&consensus)?;
                return Ok(Verdict {
                    consensus,
                    reason,
                    score,
                });
            }
        }
    }

    /// One role turn: model call, safety gate, record.
    async fn turn(
        &self,
        state: &mut LoopState,
        role: Role,
        context: &str,
    ) -> Result<ThoughtMessage, BrokerError> {
        let voice = state.voices.voice_for(role);
        let call = self.integrations.model.draft(voice, role, context);
        let draft = match tokio::time::timeout(self.policy.call_timeout(), call).await {
            Ok(Ok(draft)) => draft,
            Ok(Err(source)) => return Err(BrokerError::Model { role, voice, source }),
            Err(_) => {
                return Err(BrokerError::Model {
                    role,
                    voice,
                    source: ModelError::Timeout(self.policy.call_timeout_secs),
                })
            }
        };

        let mut message = ThoughtMessage {
            role,
            from: voice,
            content: draft.content,
            citations: draft.citations,
            score: draft.score,
            continue_hint: draft.continue_hint,
        };
        self.guard
            .validate_message(&mut message)
            .map_err(|source| BrokerError::Safety { role, source })?;

        state.record(message.clone())?;
        self.audit.log_message(&state.id, &message, state.step);
        self.registry.update(state);
        Ok(message)
    }

    async fn conclude(&self, state: &mut LoopState, verdict: Verdict) -> Result<(), BrokerError> {
        let Verdict {
            consensus,
            reason,
            score,
        } = verdict;

        self.audit.log_consensus(&state.id, &consensus);
        state.halt(consensus, reason)?;
        self.audit.log_loop_halt(state, reason, score);
        self.registry.update(state);
        info!(loop_id = %state.id, %reason, score, rounds = state.rounds_run, "Deliberation halted");

        if let BestEffort::Done(attest_ref) = self.attest(state).await {
            state.set_attest_ref(attest_ref)?;
            self.registry.update(state);
        }

        if let BestEffort::Done(receipt) = self.dispatch(state).await {
            state.set_dispatch_ref(receipt)?;
            self.registry.update(state);
        }
        Ok(())
    }

    /// Fail the loop for `err`. Logged before the registry sees the new status.
    fn abort(&self, state: &mut LoopState, err: BrokerError) -> Result<(), BrokerError> {
        let kind = err.kind();
        if kind != FailureKind::Timeout {
            self.audit.log_error(&state.id, &err, &err.context());
        }
        warn!(loop_id = %state.id, kind = %kind, error = %err, "Deliberation failed");

        if state.status.is_terminal() {
            self.registry.update(state);
            return Err(err);
        }

        let reason = kind
            .halt_reason()
            .unwrap_or(HaltReason::CollaboratorError);
        state.fail(reason)?;
        self.audit.log_loop_halt(state, reason, 0.0);
        self.registry.update(state);

        if kind == FailureKind::Internal {
            return Err(err);
        }
        Ok(())
    }

    async fn attest(&self, state: &LoopState) -> BestEffort<String> {
        let (Some(ledger), Some(consensus)) = (&self.integrations.ledger, &state.consensus) else {
            debug!(loop_id = %state.id, "No ledger configured, attestation skipped");
            return BestEffort::Skipped;
        };

        let payload = AttestationPayload::new(&state.id, &state.cycle, consensus);
        let result = match tokio::time::timeout(self.policy.call_timeout(), ledger.attest(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(AttestError::Timeout(self.policy.call_timeout_secs)),
        };
        let result = result.and_then(|r| {
            if r.trim().is_empty() {
                Err(AttestError::MissingReference)
            } else {
                Ok(r)
            }
        });

        match result {
            Ok(attest_ref) => {
                self.audit.log_attestation(&state.id, Ok(&attest_ref));
                BestEffort::Done(attest_ref)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(loop_id = %state.id, error = %reason, "Attestation failed");
                self.audit.log_attestation(&state.id, Err(&reason));
                BestEffort::Failed(reason)
            }
        }
    }

    async fn dispatch(&self, state: &LoopState) -> BestEffort<DispatchReceipt> {
        if !self.policy.allow_dispatch {
            return BestEffort::Skipped;
        }
        let (Some((dispatcher, target)), Some(consensus)) =
            (&self.integrations.dispatcher, &state.consensus)
        else {
            debug!(loop_id = %state.id, "No dispatcher configured, dispatch skipped");
            return BestEffort::Skipped;
        };

        let request =
            DispatchRequest::for_consensus(&target.repo, &state.id, self.policy.tau, consensus);
        let result =
            match tokio::time::timeout(self.policy.call_timeout(), dispatcher.dispatch(&request)).await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Timeout(self.policy.call_timeout_secs)),
            };

        match result {
            Ok(receipt) => {
                self.audit
                    .log_dispatch(&state.id, &request.repo, &request.branch, Ok(&receipt.pr_url));
                BestEffort::Done(receipt)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(loop_id = %state.id, error = %reason, "Dispatch failed");
                self.audit
                    .log_dispatch(&state.id, &request.repo, &request.branch, Err(&reason));
                BestEffort::Failed(reason)
            }
        }
    }
}

/// Assemble the consensus from the final round.
fn synthesize(
    request: &StartRequest,
    critique: &ThoughtMessage,
    arbiter: &ThoughtMessage,
    score: f64,
) -> Consensus {
    let mut tests_delta = vec![serde_json::json!({
        "name": "proposal",
        "source": request.proposal_ref,
        "expect": "pass",
    })];
    if let Some(tests_ref) = &request.tests_ref {
        tests_delta.push(serde_json::json!({
            "name": "tests",
            "source": tests_ref,
            "expect": "pass",
        }));
    }

    Consensus {
        summary: truncate_chars(
            &format!("Adopt arbiter synthesis for goal: {}", request.goal),
            SUMMARY_CHARS,
        ),
        spec_delta: arbiter.content.clone(),
        tests_delta,
        risk_notes: vec![
            truncate_chars(&critique.content, RISK_NOTE_CHARS),
            ATTESTATION_CAVEAT.to_string(),
        ],
        citations: arbiter.citations.clone(),
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{ModelClient, ModelDraft};
    use crate::message::Citation;
    use crate::state::LoopStatus;
    use async_trait::async_trait;

    struct FixedVoices {
        arbiter_score: f64,
    }

    #[async_trait]
    impl ModelClient for FixedVoices {
        async fn draft(
            &self,
            _voice: VoiceId,
            role: Role,
            context: &str,
        ) -> Result<ModelDraft, ModelError> {
            let mut draft = ModelDraft {
                content: format!("{} on [{}]", role, context.lines().next().unwrap_or("")),
                ..Default::default()
            };
            if role == Role::Arbiter {
                draft.score = Some(self.arbiter_score);
                draft.citations = vec![Citation::new("/specs/07.md")];
            }
            Ok(draft)
        }
    }

    fn manager(arbiter_score: f64) -> LoopManager {
        LoopManager::new(
            Policy::default(),
            Integrations::new(Arc::new(FixedVoices { arbiter_score })),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_policy() {
        let policy = Policy {
            max_loops: 0,
            ..Default::default()
        };
        let result = LoopManager::new(
            policy,
            Integrations::new(Arc::new(FixedVoices { arbiter_score: 0.9 })),
        );
        assert!(matches!(result, Err(BrokerError::Policy(_))));
    }

    #[test]
    fn test_hypothesis_context() {
        let mut req = StartRequest::new("C-1", "prop.md", "ship");
        req.tests_ref = Some("tests.json".to_string());
        assert_eq!(
            req.hypothesis_context(None),
            "goal=ship proposalRef=prop.md specRef= testsRef=tests.json"
        );
        let prev = ThoughtMessage::new(Role::Arbiter, VoiceId::OaaLlmC, "keep it small");
        assert!(req.hypothesis_context(Some(&prev)).ends_with("keep it small"));
    }

    #[tokio::test]
    async fn test_empty_goal_rejected_without_loop() {
        let m = manager(0.93);
        let err = m.start(StartRequest::new("C-1", "prop.md", "  ")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Request);
        assert!(m.registry().is_empty());
    }

    #[tokio::test]
    async fn test_halts_first_round_above_tau() {
        let m = manager(0.93);
        let state = m.start(StartRequest::new("C-1", "prop.md", "ship")).await.unwrap();
        assert_eq!(state.status, LoopStatus::Halted);
        assert_eq!(state.halt_reason, Some(HaltReason::ConsensusReached));
        assert_eq!(state.rounds_run, 1);
        assert_eq!(state.step, 3);
        let consensus = state.consensus.as_ref().unwrap();
        assert!((consensus.score - 0.95).abs() < 1e-9);
        assert_eq!(consensus.summary, "Adopt arbiter synthesis for goal: ship");
        assert!(state.attest_ref.is_none());
        assert_eq!(m.get(&state.id).unwrap().status, LoopStatus::Halted);
    }

    #[tokio::test]
    async fn test_round_cap_halts_weaker() {
        let m = manager(0.7);
        let state = m.start(StartRequest::new("C-1", "prop.md", "ship")).await.unwrap();
        assert_eq!(state.status, LoopStatus::Halted);
        assert_eq!(state.halt_reason, Some(HaltReason::MaxLoopsReached));
        assert_eq!(state.rounds_run, 3);
        assert_eq!(state.messages.len(), 9);
        assert!((state.score().unwrap() - 0.72).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_round_cap_below_floor_fails() {
        let m = manager(0.3);
        let state = m.start(StartRequest::new("C-1", "prop.md", "ship")).await.unwrap();
        assert_eq!(state.status, LoopStatus::Failed);
        assert_eq!(state.halt_reason, Some(HaltReason::ConsensusInvalid));
        assert!(state.consensus.is_none());
    }

    #[test]
    fn test_synthesize_fields() {
        let mut req = StartRequest::new("C-1", "prop.md", "ship");
        req.tests_ref = Some("t.json".to_string());
        let critique = ThoughtMessage::new(Role::Critique, VoiceId::OaaLlmB, "watch migrations");
        let arbiter = ThoughtMessage::new(Role::Arbiter, VoiceId::OaaLlmC, "do X")
            .with_citations(vec![Citation::new("/a")]);
        let c = synthesize(&req, &critique, &arbiter, 0.95);
        assert_eq!(c.spec_delta, "do X");
        assert_eq!(c.tests_delta.len(), 2);
        assert_eq!(c.tests_delta[1]["source"], "t.json");
        assert_eq!(c.risk_notes[0], "watch migrations");
        assert_eq!(c.citations.len(), 1);
    }
}

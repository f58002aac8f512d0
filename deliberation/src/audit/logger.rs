//! Level-gated audit logger.
//!
//! Emitted events go three places: a `tracing` event under the `audit`
//! target, a bounded in-memory history, and a broadcast channel for live
//! subscribers. Events below the configured floor go nowhere.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;

use super::events::{AuditEvent, AuditLevel, AuditRecord};
use super::trail::AuditTrail;
use crate::message::ThoughtMessage;
use crate::safety::{truncate_chars, SafetyGuard};
use crate::state::{Consensus, HaltReason, LoopState};

/// Broadcast channel capacity.
const CHANNEL_CAPACITY: usize = 256;

/// Default number of records kept in memory.
const DEFAULT_HISTORY: usize = 4096;

const GOAL_PREVIEW_CHARS: usize = 100;
const SUMMARY_PREVIEW_CHARS: usize = 200;

/// Shared reference to an AuditLogger.
pub type SharedAuditLogger = Arc<AuditLogger>;

pub struct AuditLogger {
    floor: AtomicU8,
    guard: SafetyGuard,
    history: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
    sender: broadcast::Sender<AuditRecord>,
}

impl AuditLogger {
    pub fn new(floor: AuditLevel) -> Self {
        Self::with_capacity(floor, DEFAULT_HISTORY)
    }

    /// Logger that keeps at most `capacity` records in memory.
    pub fn with_capacity(floor: AuditLevel, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            floor: AtomicU8::new(floor as u8),
            guard: SafetyGuard::default(),
            history: Mutex::new(VecDeque::new()),
            capacity,
            sender,
        }
    }

    pub fn shared(self) -> SharedAuditLogger {
        Arc::new(self)
    }

    pub fn level(&self) -> AuditLevel {
        AuditLevel::from_u8(self.floor.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: AuditLevel) {
        self.floor.store(level as u8, Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }

    /// Every retained record, oldest first.
    pub fn history(&self) -> Vec<AuditRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    /// Retained records for one loop, oldest first.
    pub fn records_for(&self, loop_id: &str) -> Vec<AuditRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .filter(|r| r.event.loop_id() == loop_id)
            .cloned()
            .collect()
    }

    /// Emit an event if it clears the level floor.
    ///
    /// Returns whether the event was emitted.
    pub fn emit(&self, event: AuditEvent) -> bool {
        let level = event.level();
        if level < self.level() {
            return false;
        }

        let record = AuditRecord {
            level,
            timestamp: Utc::now(),
            event,
        };
        trace_record(&record);

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        // No subscribers is fine.
        let _ = self.sender.send(record);
        true
    }

    pub fn log_loop_start(&self, loop_id: &str, cycle: &str, goal: &str) {
        let goal = truncate_chars(&self.guard.sanitize_for_logging(goal), GOAL_PREVIEW_CHARS);
        self.emit(AuditEvent::LoopStart {
            loop_id: loop_id.to_string(),
            cycle: self.guard.sanitize_for_logging(cycle),
            goal,
        });
    }

    pub fn log_message(&self, loop_id: &str, message: &ThoughtMessage, step: u32) {
        self.emit(AuditEvent::MessageGenerated {
            loop_id: loop_id.to_string(),
            step,
            role: message.role,
            from: message.from,
            content: self.guard.sanitize_for_logging(&message.content),
            score: message.score,
            citations: message.citations.len(),
        });
    }

    pub fn log_consensus(&self, loop_id: &str, consensus: &Consensus) {
        let summary = truncate_chars(
            &self.guard.sanitize_for_logging(&consensus.summary),
            SUMMARY_PREVIEW_CHARS,
        );
        self.emit(AuditEvent::ConsensusReached {
            loop_id: loop_id.to_string(),
            score: consensus.score,
            summary,
            citations: consensus.citations.len(),
            risk_notes: consensus.risk_notes.len(),
        });
    }

    pub fn log_loop_halt(&self, state: &LoopState, reason: HaltReason, final_score: f64) {
        self.emit(AuditEvent::LoopHalted {
            loop_id: state.id.clone(),
            reason,
            final_score,
            rounds: state.rounds_run,
            duration_ms: state.duration_ms(),
        });
    }

    pub fn log_error(&self, loop_id: &str, error: &dyn std::error::Error, context: &str) {
        self.emit(AuditEvent::LoopError {
            loop_id: loop_id.to_string(),
            error: self.guard.sanitize_for_logging(&error.to_string()),
            context: context.to_string(),
        });
    }

    pub fn log_attestation(&self, loop_id: &str, outcome: Result<&str, &str>) {
        let (success, attest_ref, error) = match outcome {
            Ok(r) => (true, Some(r.to_string()), None),
            Err(e) => (false, None, Some(self.guard.sanitize_for_logging(e))),
        };
        self.emit(AuditEvent::LedgerAttestation {
            loop_id: loop_id.to_string(),
            success,
            attest_ref,
            error,
        });
    }

    pub fn log_dispatch(&self, loop_id: &str, repo: &str, branch: &str, outcome: Result<&str, &str>) {
        let (success, pr_url, error) = match outcome {
            Ok(url) => (true, Some(url.to_string()), None),
            Err(e) => (false, None, Some(self.guard.sanitize_for_logging(e))),
        };
        self.emit(AuditEvent::CodeDispatch {
            loop_id: loop_id.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            success,
            pr_url,
            error,
        });
    }

    /// Reconstruct the audit trail for `state`. Pure projection of the state.
    pub fn generate_audit_trail(&self, state: &LoopState) -> AuditTrail {
        AuditTrail::from_state(state, &self.guard)
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(AuditLevel::Info)
    }
}

fn trace_record(record: &AuditRecord) {
    let payload = serde_json::to_string(&record.event).unwrap_or_default();
    let name = record.event.name();
    let loop_id = record.event.loop_id();
    match record.level {
        AuditLevel::Debug => {
            tracing::debug!(target: "audit", event = name, loop_id, %payload)
        }
        AuditLevel::Info => {
            tracing::info!(target: "audit", event = name, loop_id, %payload)
        }
        AuditLevel::Warn => {
            tracing::warn!(target: "audit", event = name, loop_id, %payload)
        }
        AuditLevel::Error => {
            tracing::error!(target: "audit", event = name, loop_id, %payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Role, VoiceId};
    use crate::safety::{REDACTION_MARKER, TRUNCATION_MARKER};

    #[derive(Debug)]
    struct Boom(&'static str);

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn test_floor_gates_debug() {
        let logger = AuditLogger::new(AuditLevel::Info);
        let msg = ThoughtMessage::new(Role::Hypothesis, VoiceId::OaaLlmA, "plan");
        logger.log_message("tb_1", &msg, 1);
        assert!(logger.history().is_empty());

        logger.set_level(AuditLevel::Debug);
        logger.log_message("tb_1", &msg, 1);
        assert_eq!(logger.history().len(), 1);
        assert_eq!(logger.history()[0].event.name(), "message_generated");
    }

    #[test]
    fn test_error_floor_drops_info() {
        let logger = AuditLogger::new(AuditLevel::Error);
        logger.log_loop_start("tb_1", "C-1", "goal");
        logger.log_error("tb_1", &Boom("bad"), "round 1");
        let history = logger.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event.name(), "loop_error");
    }

    #[test]
    fn test_message_content_redacted() {
        let logger = AuditLogger::new(AuditLevel::Debug);
        let msg = ThoughtMessage::new(
            Role::Critique,
            VoiceId::OaaLlmB,
            r#"set token = "abc" before deploy"#,
        );
        logger.log_message("tb_1", &msg, 2);
        let json = serde_json::to_string(&logger.history()).unwrap();
        assert!(!json.contains("\"abc\""));
        assert!(json.contains(REDACTION_MARKER));
    }

    #[test]
    fn test_goal_preview_truncated() {
        let logger = AuditLogger::new(AuditLevel::Info);
        logger.log_loop_start("tb_1", "C-1", &"goal ".repeat(60));
        match &logger.history()[0].event {
            AuditEvent::LoopStart { goal, .. } => {
                assert!(goal.ends_with(TRUNCATION_MARKER));
                assert_eq!(goal.chars().count(), 100 + TRUNCATION_MARKER.chars().count());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_history_bounded() {
        let logger = AuditLogger::with_capacity(AuditLevel::Info, 2);
        for i in 0..5 {
            logger.log_loop_start(&format!("tb_{}", i), "C", "g");
        }
        let history = logger.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event.loop_id(), "tb_3");
        assert_eq!(logger.records_for("tb_4").len(), 1);
        assert!(logger.records_for("tb_0").is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_records() {
        let logger = AuditLogger::new(AuditLevel::Info);
        let mut rx = logger.subscribe();
        logger.log_attestation("tb_1", Err("ledger_http_503"));
        let record = rx.recv().await.unwrap();
        assert_eq!(record.level, AuditLevel::Warn);
        assert_eq!(record.event.name(), "ledger_attestation");
    }
}

//! Audit event vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Role, VoiceId};
use crate::state::{HaltReason, LoopId};

/// Severity of an audit event. Ordered: `Debug < Info < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl AuditLevel {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for AuditLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown audit level '{}'", other)),
        }
    }
}

/// Everything the audit log records about a loop.
///
/// Free-text fields are sanitized by the logger before an event is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    LoopStart {
        loop_id: LoopId,
        cycle: String,
        goal: String,
    },
    MessageGenerated {
        loop_id: LoopId,
        step: u32,
        role: Role,
        from: VoiceId,
        content: String,
        score: Option<f64>,
        citations: usize,
    },
    ConsensusReached {
        loop_id: LoopId,
        score: f64,
        summary: String,
        citations: usize,
        risk_notes: usize,
    },
    LoopHalted {
        loop_id: LoopId,
        reason: HaltReason,
        final_score: f64,
        rounds: u32,
        duration_ms: i64,
    },
    LoopError {
        loop_id: LoopId,
        error: String,
        context: String,
    },
    LedgerAttestation {
        loop_id: LoopId,
        success: bool,
        attest_ref: Option<String>,
        error: Option<String>,
    },
    CodeDispatch {
        loop_id: LoopId,
        repo: String,
        branch: String,
        success: bool,
        pr_url: Option<String>,
        error: Option<String>,
    },
}

impl AuditEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoopStart { .. } => "loop_start",
            Self::MessageGenerated { .. } => "message_generated",
            Self::ConsensusReached { .. } => "consensus_reached",
            Self::LoopHalted { .. } => "loop_halted",
            Self::LoopError { .. } => "loop_error",
            Self::LedgerAttestation { .. } => "ledger_attestation",
            Self::CodeDispatch { .. } => "code_dispatch",
        }
    }

    /// Loop the event belongs to.
    pub fn loop_id(&self) -> &str {
        match self {
            Self::LoopStart { loop_id, .. }
            | Self::MessageGenerated { loop_id, .. }
            | Self::ConsensusReached { loop_id, .. }
            | Self::LoopHalted { loop_id, .. }
            | Self::LoopError { loop_id, .. }
            | Self::LedgerAttestation { loop_id, .. }
            | Self::CodeDispatch { loop_id, .. } => loop_id,
        }
    }

    /// Severity the event is emitted at.
    pub fn level(&self) -> AuditLevel {
        match self {
            Self::MessageGenerated { .. } => AuditLevel::Debug,
            Self::LoopStart { .. } | Self::ConsensusReached { .. } | Self::LoopHalted { .. } => {
                AuditLevel::Info
            }
            Self::LedgerAttestation { success, .. } | Self::CodeDispatch { success, .. } => {
                if *success {
                    AuditLevel::Info
                } else {
                    AuditLevel::Warn
                }
            }
            Self::LoopError { .. } => AuditLevel::Error,
        }
    }
}

/// An emitted event with its level and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub level: AuditLevel,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(AuditLevel::Debug < AuditLevel::Info);
        assert!(AuditLevel::Warn < AuditLevel::Error);
        assert_eq!(AuditLevel::from_u8(AuditLevel::Warn as u8), AuditLevel::Warn);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("DEBUG".parse::<AuditLevel>(), Ok(AuditLevel::Debug));
        assert_eq!("warning".parse::<AuditLevel>(), Ok(AuditLevel::Warn));
        assert!("verbose".parse::<AuditLevel>().is_err());
    }

    #[test]
    fn test_record_flattens_event_tag() {
        let record = AuditRecord {
            level: AuditLevel::Error,
            timestamp: Utc::now(),
            event: AuditEvent::LoopError {
                loop_id: "tb_1".to_string(),
                error: "boom".to_string(),
                context: "round 1".to_string(),
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "loop_error");
        assert_eq!(json["level"], "error");
        assert_eq!(json["loop_id"], "tb_1");
    }

    #[test]
    fn test_side_effect_failures_warn() {
        let ok = AuditEvent::LedgerAttestation {
            loop_id: "tb_1".to_string(),
            success: true,
            attest_ref: Some("ledger://1".to_string()),
            error: None,
        };
        let failed = AuditEvent::CodeDispatch {
            loop_id: "tb_1".to_string(),
            repo: "org/repo".to_string(),
            branch: "feature/tb_1".to_string(),
            success: false,
            pr_url: None,
            error: Some("503".to_string()),
        };
        assert_eq!(ok.level(), AuditLevel::Info);
        assert_eq!(failed.level(), AuditLevel::Warn);
        assert_eq!(failed.name(), "code_dispatch");
        assert_eq!(failed.loop_id(), "tb_1");
    }
}

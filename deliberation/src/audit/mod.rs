//! Structured audit log for deliberation loops.
//!
//! - [`events`]: the event vocabulary and severity levels
//! - [`logger`]: level-gated emission, history, live subscription
//! - [`trail`]: per-loop audit trail reconstructed from state

pub mod events;
pub mod logger;
pub mod trail;

pub use events::{AuditEvent, AuditLevel, AuditRecord};
pub use logger::{AuditLogger, SharedAuditLogger};
pub use trail::{AuditTrail, TrailConsensus, TrailMessage};

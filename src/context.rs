//! Per-call session context
//!
//! The session id travels as an argument into every recorder and migrator call
//! and is attached to a tracing span, instead of living in process-wide state.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into() }
    }

    /// Span carrying the session id for one core operation.
    pub fn span(&self, operation: &'static str) -> tracing::Span {
        tracing::info_span!("ledger", op = operation, session = %self.session_id)
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.session_id)
    }
}

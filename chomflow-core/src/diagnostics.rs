//! Diagnostic reporting for failures that have no caller to return to.

use std::error::Error;

/// Line-oriented sink for errors and notices raised inside flow tasks.
///
/// Implementations must not block and must not panic.
pub trait DiagnosticSink: Send + Sync {
    /// Reports a failure of `flow` during `phase`.
    fn error(&self, flow: &str, phase: &str, error: &dyn Error);

    /// Reports a notice about `flow`.
    fn info(&self, flow: &str, message: &str);
}

/// Default sink, forwarding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn error(&self, flow: &str, phase: &str, error: &dyn Error) {
        tracing::error!(flow, phase, "chomflow error: {}", error);
    }

    fn info(&self, flow: &str, message: &str) {
        tracing::info!(flow, "{}", message);
    }
}

//! Core error types.

use thiserror::Error;

/// Error returned by user callbacks (enter, ready, exit, periodic, events).
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Broad classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown states, running flows, bad cadences. Aborts the call.
    Configuration,
    /// A transaction call made in the wrong lifecycle state.
    Protocol,
    /// A user callback failed.
    Callback,
    /// The runtime environment is missing or torn down.
    Runtime,
}

/// Errors from the flow engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("initial state not found: {state}")]
    InitialStateNotFound { state: String },

    #[error("state not found: {state}")]
    UnknownState { state: String },

    #[error("flow is running: {flow}")]
    FlowRunning { flow: String },

    #[error("invalid cadence '{cadence}': {reason}")]
    InvalidCadence { cadence: String, reason: String },

    #[error("context is committing")]
    Committing,

    #[error("context transaction has already started")]
    TransactionOpen,

    #[error("context transaction is not started")]
    NoTransaction,

    #[error("flow isn't running: {flow}")]
    NotRunning { flow: String },

    #[error("flow already stopped")]
    AlreadyStopped,

    #[error("flow has a next state, parent or child staged")]
    StopConflict,

    #[error("context is root: {flow}")]
    RootContext { flow: String },

    #[error("event is already registered: {name}")]
    EventRegistered { name: String },

    #[error("transaction aborted: {0}")]
    Aborted(#[source] CallbackError),

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("machine has been dropped")]
    MachineDropped,

    #[error("flow has been dropped: {flow}")]
    FlowDropped { flow: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns the broad kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InitialStateNotFound { .. }
            | CoreError::UnknownState { .. }
            | CoreError::FlowRunning { .. }
            | CoreError::InvalidCadence { .. } => ErrorKind::Configuration,
            CoreError::Committing
            | CoreError::TransactionOpen
            | CoreError::NoTransaction
            | CoreError::NotRunning { .. }
            | CoreError::AlreadyStopped
            | CoreError::StopConflict
            | CoreError::RootContext { .. }
            | CoreError::EventRegistered { .. } => ErrorKind::Protocol,
            CoreError::Aborted(_) => ErrorKind::Callback,
            CoreError::NoRuntime
            | CoreError::MachineDropped
            | CoreError::FlowDropped { .. }
            | CoreError::Json(_) => ErrorKind::Runtime,
        }
    }

    /// Returns whether the call was rejected by the transaction protocol.
    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InitialStateNotFound { .. } => "INITIAL_STATE_NOT_FOUND",
            CoreError::UnknownState { .. } => "STATE_NOT_FOUND",
            CoreError::FlowRunning { .. } => "FLOW_RUNNING",
            CoreError::InvalidCadence { .. } => "BAD_CADENCE",
            CoreError::Committing => "COMMITTING",
            CoreError::TransactionOpen => "TRANSACTION_OPEN",
            CoreError::NoTransaction => "NO_TRANSACTION",
            CoreError::NotRunning { .. } => "NOT_RUNNING",
            CoreError::AlreadyStopped => "ALREADY_STOPPED",
            CoreError::StopConflict => "STOP_CONFLICT",
            CoreError::RootContext { .. } => "ROOT_CONTEXT",
            CoreError::EventRegistered { .. } => "EVENT_REGISTERED",
            CoreError::Aborted(_) => "ABORTED",
            CoreError::NoRuntime => "NO_RUNTIME",
            CoreError::MachineDropped => "MACHINE_DROPPED",
            CoreError::FlowDropped { .. } => "FLOW_DROPPED",
            CoreError::Json(_) => "JSON_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CoreError::UnknownState {
                state: "x".to_string()
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert!(CoreError::StopConflict.is_protocol());
        assert!(!CoreError::NoRuntime.is_protocol());
        assert_eq!(
            CoreError::Aborted("boom".into()).kind(),
            ErrorKind::Callback
        );
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::RootContext {
            flow: "main".to_string(),
        };
        assert_eq!(err.to_string(), "context is root: main");
        assert_eq!(err.error_code(), "ROOT_CONTEXT");
    }
}

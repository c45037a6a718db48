//! Error types for Conduit
//!
//! Every layer reports through this one enum so the CLI can tell a
//! user-initiated abort apart from a genuine fault.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Conduit error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Terminal session
    // ========================================================================
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Failed to start session: {0}")]
    SessionStart(String),

    #[error("Terminal mode error: {0}")]
    TerminalMode(String),

    #[error("Agent '{agent}' failed: {message}")]
    AgentExecution { agent: String, message: String },

    #[error("Workflow cancelled")]
    WorkflowCancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    // ========================================================================
    // Subagent routing
    // ========================================================================
    #[error("No candidate agent: {0}")]
    NoCandidate(String),

    #[error("Registration conflict: {0}")]
    RegistrationConflict(String),

    // ========================================================================
    // General
    // ========================================================================
    #[error("Task error: {0}")]
    Task(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // External conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether the error is a user-initiated abort rather than a fault
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::WorkflowCancelled)
    }

    /// Whether a failed agent attempt may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::AgentExecution { .. } | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Whether the message is meant to be shown to the user as-is
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable(_)
                | Error::NotFound(_)
                | Error::InvalidInput(_)
                | Error::Validation(_)
                | Error::NoCandidate(_)
                | Error::RegistrationConflict(_)
                | Error::WorkflowCancelled
        )
    }

    /// Agent execution error helper
    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Error::AgentExecution {
            agent: agent.into(),
            message: message.into(),
        }
    }
}

//! Interactive agent sessions
//!
//! An agent CLI runs attached to a PTY while the user keeps the real
//! terminal. Output is relayed to the user and watched for the agent's input
//! prompt; once it shows up the computed prompt is typed in. Ctrl-C goes to
//! the agent unless pressed often enough to abort the workflow.

pub mod bridge;
pub mod input;
pub mod interrupt;
pub mod readiness;
pub mod terminal;

pub use bridge::{BridgeConfig, TerminalBridge};
pub use input::{InputReader, InputSource};
pub use interrupt::{InterruptAction, InterruptEscalator, INTERRUPT_BYTE};
pub use readiness::{
    InjectionPhase, InjectionState, PromptInjector, ReadinessDetector, ReadinessRule,
};
pub use terminal::TerminalGuard;

use async_trait::async_trait;
use conduit_foundation::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One agent run
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub agent_id: String,
    pub provider: String,
    pub model: Option<String>,
    /// Fully resolved prompt to type once the agent is ready
    pub prompt: String,
    /// Session is torn down and reported as timed out after this long
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
}

impl SessionRequest {
    pub fn new(
        agent_id: impl Into<String>,
        provider: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            provider: provider.into(),
            model: None,
            prompt: prompt.into(),
            timeout: None,
            working_dir: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a session that ran to completion ended
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub exit_code: u32,
    pub duration: Duration,
    /// Whether the prompt was typed and submitted
    pub prompt_submitted: bool,
}

/// Runs one agent to completion.
///
/// Errors: `WorkflowCancelled` when `cancel` fires (run-wide abort),
/// `Timeout` when `request.timeout` elapses, `AgentExecution` when the agent
/// exits unsuccessfully, `SessionStart`/`TerminalMode`/`ProviderUnavailable`/
/// `Config` when the session cannot start.
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn run(&self, request: SessionRequest, cancel: CancellationToken)
        -> Result<SessionOutcome>;
}

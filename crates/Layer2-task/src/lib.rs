//! # conduit-task
//!
//! Agent execution for Conduit.
//!
//! ## Features
//!
//! - Provider descriptors for the supported agent CLIs
//! - Interactive PTY sessions with readiness detection and prompt injection
//! - Ctrl-C escalation from "interrupt the agent" to "abort the workflow"
//! - Sub-agent registry, scoring router and parallel delegation

pub mod provider;
pub mod session;
pub mod subagent;

// Providers
pub use provider::{
    BatchInvocation, CommandResolver, CommandSpec, ProviderDescriptor, ProviderRegistry,
    PROVIDER_CLAUDE, PROVIDER_GEMINI, PROVIDER_MOCK,
};

// Sessions
pub use session::{
    AgentSession, BridgeConfig, InputReader, InputSource, InterruptAction, InterruptEscalator, SessionOutcome,
    SessionRequest, TerminalBridge, TerminalGuard,
};

// Sub-agents
pub use subagent::{
    DelegationStrategy, ProcessRunner, RouterStats, SubAgent, SubAgentManager, SubAgentResult,
    SubAgentRouter, SubAgentRunner, SubAgentStatus, SubAgentTask, TaskExecution, REQUIRES_PREFIX,
};

//! # conduit-workflow
//!
//! Multi-agent workflows for Conduit.
//!
//! A workflow is an ordered list of agents. The [`Sequencer`] runs them one
//! at a time through an [`AgentSession`](conduit_task::AgentSession), feeding
//! each agent the outputs and handoff notes of the agents before it.

pub mod delegate;
pub mod model;
pub mod sequencer;
pub mod state;
pub mod template;

pub use delegate::TaskDelegator;
pub use model::{Agent, AgentSettings, Variable, Workflow, WorkflowSettings};
pub use sequencer::{Sequencer, VariablePrompter};
pub use state::{
    AgentState, AgentStatus, ErrorKind, ExecutionError, ExecutionState, WorkflowStatus,
};
pub use template::{extract_variables, resolve};

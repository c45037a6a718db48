//! Sub-agent delegation
//!
//! Delegate agents are registered by name, scored by the router against
//! incoming tasks, and executed through a [`SubAgentRunner`]. The router
//! learns from every finished task.

pub mod manager;
pub mod router;
pub mod runner;
pub mod types;

pub use manager::{SubAgentManager, UNROUTED};
pub use router::{RouterStats, SubAgentRouter};
pub use runner::{ProcessRunner, SubAgentRunner};
pub use types::{
    DelegationStrategy, SubAgent, SubAgentResult, SubAgentStatus, SubAgentTask, TaskExecution,
    REQUIRES_PREFIX,
};

//! Execution state of one workflow run

use chrono::{DateTime, Utc};
use conduit_foundation::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Per-agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Completed,
    Failed,
    Aborted,
    /// Condition evaluated false
    Skipped,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Kind of failure recorded for an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderUnavailable,
    SessionStart,
    TerminalMode,
    AgentExecution,
    Timeout,
    Cancelled,
    Delegation,
    Other,
}

impl From<&Error> for ErrorKind {
    fn from(error: &Error) -> Self {
        match error {
            Error::ProviderUnavailable(_) => Self::ProviderUnavailable,
            Error::SessionStart(_) => Self::SessionStart,
            Error::TerminalMode(_) => Self::TerminalMode,
            Error::AgentExecution { .. } | Error::Io(_) => Self::AgentExecution,
            Error::Timeout(_) => Self::Timeout,
            Error::WorkflowCancelled => Self::Cancelled,
            Error::NoCandidate(_) | Error::RegistrationConflict(_) => Self::Delegation,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub agent_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn new(agent_id: impl Into<String>, error: &Error) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind: ErrorKind::from(error),
            message: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    status: AgentStatus,
    /// Sessions started, retries included
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<ExecutionError>,
}

impl AgentState {
    pub fn start(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Running,
            attempts: 0,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// Move to a terminal status. Returns false if already terminal.
    pub fn finish(&mut self, status: AgentStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        true
    }
}

/// One workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    status: WorkflowStatus,
    pub current_agent: Option<String>,
    /// Variable values as resolved so far
    pub variables: HashMap<String, String>,
    pub agents: HashMap<String, AgentState>,
    /// Output file per agent that declared one
    pub outputs: HashMap<String, PathBuf>,
    /// One line per completed agent, in order
    pub handoffs: Vec<String>,
    pub output_dir: PathBuf,
    pub errors: Vec<ExecutionError>,
}

impl ExecutionState {
    pub fn new(
        workflow_name: impl Into<String>,
        variables: HashMap<String, String>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            workflow_id: uuid::Uuid::new_v4().to_string(),
            workflow_name: workflow_name.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: WorkflowStatus::Running,
            current_agent: None,
            variables,
            agents: HashMap::new(),
            outputs: HashMap::new(),
            handoffs: Vec::new(),
            output_dir,
            errors: Vec::new(),
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    /// End the run. Returns false if it already ended.
    pub fn finish(&mut self, status: WorkflowStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.current_agent = None;
        self.ended_at = Some(Utc::now());
        true
    }

    pub fn begin_agent(&mut self, agent_id: &str) {
        self.current_agent = Some(agent_id.to_string());
        self.agents
            .insert(agent_id.to_string(), AgentState::start(agent_id));
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.get(agent_id).map(|a| a.status())
    }

    /// Record a failure against the agent and the run
    pub fn record_error(&mut self, agent_id: &str, error: &Error) {
        let record = ExecutionError::new(agent_id, error);
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.error = Some(record.clone());
        }
        self.errors.push(record);
    }

    pub fn finish_agent(&mut self, agent_id: &str, status: AgentStatus) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.finish(status);
        }
    }

    /// Agents that finished successfully
    pub fn completed_count(&self) -> usize {
        self.agents
            .values()
            .filter(|a| a.status() == AgentStatus::Completed)
            .count()
    }
}

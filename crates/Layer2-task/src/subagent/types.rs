//! Sub-agent type definitions

use chrono::{DateTime, Utc};
use conduit_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Constraint prefix declaring a hard capability requirement
pub const REQUIRES_PREFIX: &str = "requires:";

/// How a sub-agent is picked for work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStrategy {
    /// The router picks the best scoring agent
    #[default]
    Automatic,
    /// Only used when named
    Explicit,
    /// Volunteers for any task it can handle
    Proactive,
}

impl std::str::FromStr for DelegationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "automatic" | "auto" => Ok(Self::Automatic),
            "explicit" => Ok(Self::Explicit),
            "proactive" => Ok(Self::Proactive),
            other => Err(Error::InvalidInput(format!(
                "unknown delegation strategy '{}'",
                other
            ))),
        }
    }
}

/// A registered delegate agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubAgent {
    /// Unique name in the registry
    pub name: String,

    /// Provider the agent runs on
    pub provider: String,

    /// Model override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Capability tags
    pub capabilities: Vec<String>,

    pub strategy: DelegationStrategy,

    /// Higher is preferred
    pub priority: i32,

    /// Keywords matched against task text
    #[serde(alias = "context")]
    pub context_patterns: Vec<String>,

    /// Agent is fine running alongside others
    pub parallel: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Free-form provider settings
    pub settings: HashMap<String, serde_json::Value>,
}

impl SubAgent {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_context_patterns(mut self, patterns: &[&str]) -> Self {
        self.context_patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: DelegationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Self-check run on registration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("sub-agent name is required".to_string()));
        }
        if self.provider.trim().is_empty() {
            return Err(Error::Validation(format!(
                "sub-agent '{}' has no provider",
                self.name
            )));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::Validation(format!(
                "sub-agent '{}' declares an empty capability",
                self.name
            )));
        }
        Ok(())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    /// All hard requirements of the task are declared capabilities
    pub fn can_handle(&self, task: &SubAgentTask) -> bool {
        task.required_capabilities()
            .all(|required| self.has_capability(required))
    }
}

/// Unit of delegated work
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubAgentTask {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Payload handed to the agent
    pub input: String,
    pub priority: i32,
    pub context: HashMap<String, serde_json::Value>,
    pub constraints: Vec<String>,
    pub variables: HashMap<String, String>,
}

impl SubAgentTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Assign an id if the caller left it empty
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
    }

    /// Capabilities named by `requires:<capability>` constraints
    pub fn required_capabilities(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().filter_map(|c| {
            let c = c.trim();
            c.get(..REQUIRES_PREFIX.len())
                .filter(|prefix| prefix.eq_ignore_ascii_case(REQUIRES_PREFIX))
                .map(|_| c[REQUIRES_PREFIX.len()..].trim())
                .filter(|cap| !cap.is_empty())
        })
    }

    /// Provider named in the `preferred_provider` context entry
    pub fn preferred_provider(&self) -> Option<&str> {
        self.context.get("preferred_provider").and_then(|v| v.as_str())
    }

    /// Text the agent should work on
    pub fn prompt(&self) -> String {
        let mut prompt = self.description.clone();
        if !self.input.is_empty() {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(&self.input);
        }
        prompt
    }
}

/// Lifecycle status of a delegated task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubAgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubAgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SubAgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Result of one delegated task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub task_id: String,
    pub agent_name: String,
    pub status: SubAgentStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SubAgentResult {
    /// Failed result for a task that never ran on an agent
    pub fn failed(task_id: impl Into<String>, agent_name: impl Into<String>, error: &Error) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            agent_name: agent_name.into(),
            status: SubAgentStatus::Failed,
            output: String::new(),
            error: Some(error.to_string()),
            start_time: now,
            end_time: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SubAgentStatus::Completed
    }

    pub fn duration(&self) -> std::time::Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }
}

/// A task bound to the agent executing it
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task: SubAgentTask,
    pub agent: String,
    status: SubAgentStatus,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub result: Option<SubAgentResult>,
}

impl TaskExecution {
    pub fn new(task: SubAgentTask, agent: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            task,
            agent: agent.into(),
            status: SubAgentStatus::Running,
            started_at: Utc::now(),
            cancel,
            result: None,
        }
    }

    pub fn status(&self) -> SubAgentStatus {
        self.status
    }

    /// Move to `status`; ignored once terminal
    pub fn transition(&mut self, status: SubAgentStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    /// Store the final result. A cancelled execution keeps its status and
    /// the stored result is rewritten to match it.
    pub fn complete(&mut self, mut result: SubAgentResult) -> SubAgentResult {
        self.transition(result.status);
        if result.status != self.status {
            result.status = self.status;
            if result.error.is_none() {
                result.error = Some(self.status.to_string());
            }
        }
        self.result = Some(result.clone());
        result
    }
}

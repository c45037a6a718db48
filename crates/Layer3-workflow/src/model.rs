//! Workflow definition model
//!
//! These types mirror the YAML/JSON workflow files. Loaders call
//! [`Workflow::normalize`] and [`Workflow::validate`] before handing a
//! workflow to the sequencer.

use conduit_foundation::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Workflow
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    pub name: String,

    /// Slash-command alias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    pub variables: Vec<Variable>,

    /// Executed strictly in this order
    pub agents: Vec<Agent>,

    pub settings: WorkflowSettings,

    pub metadata: HashMap<String, serde_json::Value>,
}

impl Workflow {
    /// Parse a workflow from YAML (JSON is valid YAML)
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut workflow: Workflow = serde_yaml::from_str(text)?;
        workflow.normalize();
        workflow.validate()?;
        Ok(workflow)
    }

    /// Load, normalize and validate a workflow file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read workflow {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Fill in generated ids, display names and implicit dependencies
    pub fn normalize(&mut self) {
        let mut previous: Option<String> = None;
        for (index, agent) in self.agents.iter_mut().enumerate() {
            if agent.id.trim().is_empty() {
                agent.id = format!("agent-{}", index + 1);
            }
            if agent.name.trim().is_empty() {
                agent.name = agent.id.clone();
            }
            if agent.depends_on.is_empty() {
                if let Some(prev) = &previous {
                    agent.depends_on.push(prev.clone());
                }
            }
            previous = Some(agent.id.clone());
        }
    }

    /// Reject definitions the sequencer cannot run
    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(Error::Validation(format!(
                "workflow '{}' has no agents",
                self.name
            )));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(Error::Validation("agent without id".to_string()));
            }
            if agent.provider.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "agent '{}' has no provider",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::Validation(format!("duplicate agent id '{}'", agent.id)));
            }
        }

        let order: HashMap<&str, usize> = self
            .agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.as_str(), i))
            .collect();
        for (index, agent) in self.agents.iter().enumerate() {
            for dep in &agent.depends_on {
                match order.get(dep.as_str()) {
                    None => {
                        return Err(Error::Validation(format!(
                            "agent '{}' depends on unknown agent '{}'",
                            agent.id, dep
                        )))
                    }
                    Some(&dep_index) if dep_index >= index => {
                        return Err(Error::Validation(format!(
                            "agent '{}' depends on '{}', which does not run before it",
                            agent.id, dep
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        let mut names: HashSet<&str> = HashSet::new();
        for variable in &self.variables {
            if variable.name.trim().is_empty() {
                return Err(Error::Validation("variable without name".to_string()));
            }
            if !names.insert(variable.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate variable '{}'",
                    variable.name
                )));
            }
        }

        Ok(())
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Declared defaults overlaid with caller-supplied values
    pub fn initial_variables(&self, supplied: &HashMap<String, String>) -> HashMap<String, String> {
        let mut values: HashMap<String, String> = self
            .variables
            .iter()
            .filter_map(|v| v.default_value().map(|d| (v.name.clone(), d)))
            .collect();
        values.extend(supplied.iter().map(|(k, v)| (k.clone(), v.clone())));
        values
    }
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Agent {
    /// Unique within the workflow; generated when absent
    pub id: String,

    pub name: String,

    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Prompt template
    pub prompt: String,

    /// Extra named inputs, appended to the prompt after resolution
    pub input: HashMap<String, serde_json::Value>,

    /// Output filename, relative to the workflow output directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(alias = "dependsOn", deserialize_with = "one_or_many")]
    pub depends_on: Vec<String>,

    /// Agent is skipped when this resolves to a false-like value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    pub settings: AgentSettings,

    pub on_success: Vec<String>,

    pub on_failure: Vec<String>,
}

impl Agent {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Per-agent settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Seconds before the session is torn down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Extra attempts after a retryable failure
    pub retry_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_mode: Option<String>,

    pub tools: Vec<String>,

    pub mcp_servers: Vec<String>,

    /// File (relative to the output directory) that must exist once the agent ends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_file: Option<String>,

    /// `false` disables operator re-prompting for this agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive: Option<bool>,

    #[serde(alias = "continueOnError")]
    pub continue_on_error: bool,

    /// Route the step through the sub-agent manager instead of a session
    pub delegate: bool,

    /// Sub-agent to use when delegating; the router decides when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subagent: Option<String>,
}

impl AgentSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive.unwrap_or(true)
    }
}

// ============================================================================
// Variables and settings
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Variable {
    pub name: String,

    pub description: String,

    /// Type tag, informational
    #[serde(rename = "type")]
    pub kind: String,

    pub required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    /// Never re-prompted
    pub internal: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Default rendered as text; `null` counts as absent
    pub fn default_value(&self) -> Option<String> {
        match self.default.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Accepted for compatibility; agents always run in order
    pub parallel: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,

    /// `false` keeps going after a failing agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_on_error: Option<bool>,

    /// Output directory template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl WorkflowSettings {
    pub fn stops_on_error(&self) -> bool {
        self.stop_on_error.unwrap_or(true)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) if s.trim().is_empty() => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
        None => Vec::new(),
    })
}

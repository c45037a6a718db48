//! Sub-agent runners - how a delegated task actually executes

use crate::provider::ProviderRegistry;
use crate::subagent::types::{SubAgent, SubAgentTask};
use async_trait::async_trait;
use conduit_foundation::{Error, Result};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Executes one task on one agent and returns its textual output
#[async_trait]
pub trait SubAgentRunner: Send + Sync {
    async fn run(
        &self,
        agent: &SubAgent,
        task: &SubAgentTask,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Runs the provider CLI once in batch mode and captures stdout
pub struct ProcessRunner {
    providers: Arc<ProviderRegistry>,
}

impl ProcessRunner {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self { providers }
    }

    fn prompt_for(agent: &SubAgent, task: &SubAgentTask) -> String {
        match &agent.system_prompt {
            Some(system) if !system.trim().is_empty() => {
                format!("{}\n\n{}", system.trim(), task.prompt())
            }
            _ => task.prompt(),
        }
    }
}

#[async_trait]
impl SubAgentRunner for ProcessRunner {
    async fn run(
        &self,
        agent: &SubAgent,
        task: &SubAgentTask,
        cancel: CancellationToken,
    ) -> Result<String> {
        let descriptor = self.providers.get(&agent.provider)?;
        let prompt = Self::prompt_for(agent, task);
        let spec = descriptor.batch_command(&prompt, agent.model.as_deref())?;
        info!(agent = %agent.name, task = %task.id, program = %spec.program, "running sub-agent");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::agent(&agent.name, format!("failed to spawn '{}': {}", spec.program, e)))?;

        // Dropping the output future kills the child
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(agent = %agent.name, task = %task.id, "sub-agent cancelled");
                return Err(Error::Task(format!("task '{}' cancelled", task.id)));
            }
            output = child.wait_with_output() => output?,
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::agent(
                &agent.name,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ))
        }
    }
}

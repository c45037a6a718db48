//! Workflow Sequencer - runs a workflow's agents one after another
//!
//! For every agent: optionally re-prompt the operator for the variables its
//! prompt uses, resolve the prompt, prepend the workflow context for later
//! agents, run the agent in a session (or hand it to a sub-agent), then record
//! its output path and a handoff line. Only one agent runs at a time.

use crate::delegate::TaskDelegator;
use crate::model::{Agent, Variable, Workflow};
use crate::state::{AgentStatus, ExecutionState, WorkflowStatus};
use crate::template::{extract_variables, is_truthy, output_reference, resolve, resolve_variables};
use async_trait::async_trait;
use conduit_foundation::{Error, Result};
use conduit_task::{AgentSession, SessionRequest, SubAgentTask};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `wait_for_file` waits when the agent has no timeout
pub const DEFAULT_FILE_WAIT: Duration = Duration::from_secs(30);

const FILE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Asks the operator to confirm or override a variable before a step
#[async_trait]
pub trait VariablePrompter: Send + Sync {
    /// `Ok(None)` keeps `current`
    async fn prompt(&self, variable: &Variable, current: Option<&str>) -> Result<Option<String>>;
}

/// Everything a prompt is built from
struct PromptContext<'a> {
    workflow: &'a Workflow,
    index: usize,
    variables: &'a HashMap<String, String>,
    outputs: &'a HashMap<String, PathBuf>,
    handoffs: &'a [String],
}

/// Workflow Sequencer
pub struct Sequencer {
    session: Arc<dyn AgentSession>,
    prompter: Option<Arc<dyn VariablePrompter>>,
    delegator: Option<Arc<dyn TaskDelegator>>,
    cancel: CancellationToken,
    working_dir: PathBuf,
    state: Arc<Mutex<Option<ExecutionState>>>,
}

impl Sequencer {
    pub fn new(session: Arc<dyn AgentSession>, cancel: CancellationToken) -> Self {
        Self {
            session,
            prompter: None,
            delegator: None,
            cancel,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            state: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn VariablePrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn TaskDelegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    /// Base for relative output directories and the agents' working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Snapshot of the current or last run
    pub fn state(&self) -> Option<ExecutionState> {
        self.state.lock().clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut ExecutionState) -> R) -> Option<R> {
        self.state.lock().as_mut().map(f)
    }

    /// Run every agent of `workflow` in order
    pub async fn execute(
        &self,
        workflow: &Workflow,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        let mut workflow = workflow.clone();
        workflow.normalize();
        workflow.validate()?;

        if workflow.settings.parallel {
            warn!(workflow = %workflow.name, "parallel execution is not supported, running agents in order");
        }

        let mut vars = workflow.initial_variables(&variables);
        let filled = self.fill_required(&workflow, &mut vars).await;
        if let Err(e) = &filled {
            if !e.is_cancellation() {
                return filled;
            }
        }

        let output_dir = self.resolve_output_dir(&workflow, &vars);
        *self.state.lock() = Some(ExecutionState::new(
            workflow.name.clone(),
            vars.clone(),
            output_dir.clone(),
        ));
        if filled.is_err() {
            info!(workflow = %workflow.name, "cancelled while asking for variables");
            self.update(|s| s.finish(WorkflowStatus::Aborted));
            return Err(Error::WorkflowCancelled);
        }
        info!(
            workflow = %workflow.name,
            agents = workflow.agents.len(),
            output_dir = %output_dir.display(),
            "starting workflow"
        );

        for (index, agent) in workflow.agents.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.update(|s| s.finish(WorkflowStatus::Aborted));
                return Err(Error::WorkflowCancelled);
            }
            self.run_step(&workflow, index, agent, &mut vars, &output_dir)
                .await?;
        }

        self.update(|s| s.finish(WorkflowStatus::Completed));
        info!(workflow = %workflow.name, "workflow completed");
        Ok(())
    }

    async fn run_step(
        &self,
        workflow: &Workflow,
        index: usize,
        agent: &Agent,
        vars: &mut HashMap<String, String>,
        output_dir: &Path,
    ) -> Result<()> {
        let (outputs, handoffs) = self
            .update(|s| (s.outputs.clone(), s.handoffs.clone()))
            .unwrap_or_default();

        if let Some(condition) = &agent.condition {
            let resolved = resolve(condition, vars, &outputs);
            if !is_truthy(&resolved) {
                info!(agent = %agent.id, condition = %condition, "condition not met, skipping agent");
                self.update(|s| {
                    s.begin_agent(&agent.id);
                    s.finish_agent(&agent.id, AgentStatus::Skipped);
                });
                return Ok(());
            }
        }

        if agent.settings.is_interactive() {
            if let Err(e) = self.confirm_variables(workflow, agent, vars).await {
                info!(agent = %agent.id, "cancelled while asking for variables");
                self.update(|s| s.finish(WorkflowStatus::Aborted));
                return Err(e);
            }
        }
        let snapshot = vars.clone();
        self.update(|s| {
            s.variables = snapshot;
            s.begin_agent(&agent.id);
        });

        let output_path = agent
            .output
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .map(|o| output_dir.join(resolve_variables(o, vars)));

        let ctx = PromptContext {
            workflow,
            index,
            variables: vars,
            outputs: &outputs,
            handoffs: &handoffs,
        };
        let instructed_output = output_path.as_deref().filter(|_| !agent.settings.delegate);
        let prompt = compose_prompt(&ctx, agent, instructed_output);

        info!(
            agent = %agent.id,
            provider = %agent.provider,
            step = index + 1,
            of = workflow.agents.len(),
            "running agent"
        );
        let outcome = self
            .run_with_retries(agent, &prompt, vars, output_path.as_deref(), output_dir)
            .await;

        match outcome {
            Ok(()) => {
                let handoff = format!("Agent {} ({}) completed", agent.display_name(), agent.provider);
                self.update(|s| {
                    s.finish_agent(&agent.id, AgentStatus::Completed);
                    if let Some(path) = &output_path {
                        s.outputs.insert(agent.id.clone(), path.clone());
                    }
                    s.handoffs.push(handoff);
                });
                if !agent.on_success.is_empty() {
                    debug!(agent = %agent.id, actions = ?agent.on_success, "on_success actions");
                }
                Ok(())
            }
            Err(e) if e.is_cancellation() => {
                info!(agent = %agent.id, "workflow interrupted");
                self.update(|s| {
                    s.record_error(&agent.id, &e);
                    s.finish_agent(&agent.id, AgentStatus::Aborted);
                    s.finish(WorkflowStatus::Aborted);
                });
                Err(e)
            }
            Err(e) => {
                error!(agent = %agent.id, "agent failed: {}", e);
                self.update(|s| {
                    s.record_error(&agent.id, &e);
                    s.finish_agent(&agent.id, AgentStatus::Failed);
                });
                if !agent.on_failure.is_empty() {
                    debug!(agent = %agent.id, actions = ?agent.on_failure, "on_failure actions");
                }

                if agent.settings.continue_on_error || !workflow.settings.stops_on_error() {
                    warn!(agent = %agent.id, "continuing after failure");
                    return Ok(());
                }
                self.update(|s| s.finish(WorkflowStatus::Failed));
                Err(e)
            }
        }
    }

    async fn run_with_retries(
        &self,
        agent: &Agent,
        prompt: &str,
        vars: &HashMap<String, String>,
        output_path: Option<&Path>,
        output_dir: &Path,
    ) -> Result<()> {
        if let Some(parent) = output_path.and_then(Path::parent) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let retries = agent.settings.retry_count;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.update(|s| {
                if let Some(state) = s.agents.get_mut(&agent.id) {
                    state.attempts = attempt;
                }
            });

            match self
                .run_agent(agent, prompt, vars, output_path, output_dir, attempt)
                .await
            {
                Err(e) if e.is_retryable() && attempt <= retries && !self.cancel.is_cancelled() => {
                    warn!(agent = %agent.id, attempt, "agent failed, retrying: {}", e);
                }
                other => return other,
            }
        }
    }

    async fn run_agent(
        &self,
        agent: &Agent,
        prompt: &str,
        vars: &HashMap<String, String>,
        output_path: Option<&Path>,
        output_dir: &Path,
        attempt: u32,
    ) -> Result<()> {
        if agent.settings.delegate {
            self.delegate_agent(agent, prompt, vars, output_path, attempt)
                .await?;
        } else {
            let request = SessionRequest {
                agent_id: agent.id.clone(),
                provider: agent.provider.clone(),
                model: agent.model.clone(),
                prompt: prompt.to_string(),
                timeout: agent.settings.timeout(),
                working_dir: Some(self.working_dir.clone()),
            };
            let outcome = self.session.run(request, self.cancel.clone()).await?;
            debug!(
                agent = %agent.id,
                exit_code = outcome.exit_code,
                prompt_submitted = outcome.prompt_submitted,
                duration = ?outcome.duration,
                "session finished"
            );
        }

        if let Some(file) = agent.settings.wait_for_file.as_deref() {
            let path = output_dir.join(resolve_variables(file, vars));
            self.wait_for_file(agent, &path).await?;
        }
        Ok(())
    }

    async fn delegate_agent(
        &self,
        agent: &Agent,
        prompt: &str,
        vars: &HashMap<String, String>,
        output_path: Option<&Path>,
        attempt: u32,
    ) -> Result<()> {
        let delegator = self.delegator.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "agent '{}' delegates but no sub-agent manager is configured",
                agent.id
            ))
        })?;

        let run_id = self.update(|s| s.workflow_id.clone()).unwrap_or_default();
        let mut task = SubAgentTask::new(prompt)
            .with_id(format!("{}-{}-{}", run_id, agent.id, attempt))
            .with_name(agent.display_name())
            .with_context("preferred_provider", serde_json::json!(agent.provider));
        task.variables = vars.clone();

        let result = match delegator
            .delegate_task(self.cancel.clone(), task, agent.settings.subagent.as_deref())
            .await
        {
            Ok(result) => result,
            Err(_) if self.cancel.is_cancelled() => return Err(Error::WorkflowCancelled),
            Err(e) => return Err(e),
        };
        info!(agent = %agent.id, subagent = %result.agent_name, "delegated step finished");

        if !result.is_success() {
            return Err(Error::agent(
                &agent.id,
                result
                    .error
                    .unwrap_or_else(|| format!("sub-agent ended {}", result.status)),
            ));
        }
        if let Some(path) = output_path {
            tokio::fs::write(path, &result.output).await?;
        }
        Ok(())
    }

    async fn wait_for_file(&self, agent: &Agent, path: &Path) -> Result<()> {
        let deadline = Instant::now() + agent.settings.timeout().unwrap_or(DEFAULT_FILE_WAIT);
        loop {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::agent(
                    &agent.id,
                    format!("expected file {} was not written", path.display()),
                ));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::WorkflowCancelled),
                _ = tokio::time::sleep(FILE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Required variables without a value are asked for up front
    async fn fill_required(
        &self,
        workflow: &Workflow,
        vars: &mut HashMap<String, String>,
    ) -> Result<()> {
        for variable in workflow.variables.iter().filter(|v| v.required) {
            if vars.contains_key(&variable.name) {
                continue;
            }
            let answer = match (&self.prompter, variable.internal) {
                (Some(prompter), false) => self.ask(prompter.as_ref(), variable, None).await?,
                _ => None,
            };
            match answer {
                Some(value) => {
                    vars.insert(variable.name.clone(), value);
                }
                None => {
                    return Err(Error::Validation(format!(
                        "missing required variable '{}'",
                        variable.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Prompt for one variable; the run token interrupts the wait
    async fn ask(
        &self,
        prompter: &dyn VariablePrompter,
        variable: &Variable,
        current: Option<&str>,
    ) -> Result<Option<String>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::WorkflowCancelled),
            answer = prompter.prompt(variable, current) => answer,
        }
    }

    /// Offer each non-internal variable the agent's prompt uses.
    /// Only cancellation is an error.
    async fn confirm_variables(
        &self,
        workflow: &Workflow,
        agent: &Agent,
        vars: &mut HashMap<String, String>,
    ) -> Result<()> {
        let Some(prompter) = &self.prompter else {
            return Ok(());
        };

        for name in extract_variables(&agent.prompt) {
            let Some(variable) = workflow.variable(&name).filter(|v| !v.internal) else {
                continue;
            };
            let current = vars.get(&name).cloned();
            match self.ask(prompter.as_ref(), variable, current.as_deref()).await {
                Ok(Some(value)) => {
                    debug!(variable = %name, "variable overridden");
                    vars.insert(name, value);
                }
                Ok(None) => {}
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => warn!(variable = %name, "variable prompt failed, keeping value: {}", e),
            }
        }
        Ok(())
    }

    fn resolve_output_dir(&self, workflow: &Workflow, vars: &HashMap<String, String>) -> PathBuf {
        let Some(template) = workflow
            .settings
            .output_dir
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        else {
            return self.working_dir.clone();
        };

        let mut values = vars.clone();
        values
            .entry("workflow".to_string())
            .or_insert_with(|| workflow.name.clone());
        values
            .entry("timestamp".to_string())
            .or_insert_with(|| chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());

        let path = PathBuf::from(resolve_variables(template, &values));
        if path.is_absolute() {
            path
        } else {
            self.working_dir.join(path)
        }
    }
}

/// Resolved prompt, with the workflow context block for every agent but the first
fn compose_prompt(ctx: &PromptContext<'_>, agent: &Agent, output_path: Option<&Path>) -> String {
    let mut body = resolve(&agent.prompt, ctx.variables, ctx.outputs);

    if !agent.input.is_empty() {
        let mut keys: Vec<&String> = agent.input.keys().collect();
        keys.sort();
        body.push_str("\n\nInput:");
        for key in keys {
            let value = match &agent.input[key] {
                serde_json::Value::String(s) => resolve(s, ctx.variables, ctx.outputs),
                other => other.to_string(),
            };
            body.push_str(&format!("\n- {}: {}", key, value));
        }
    }

    if let Some(path) = output_path {
        body.push_str(&format!("\n\nWrite your final output to: {}", path.display()));
    }

    if ctx.index == 0 {
        return body;
    }

    let mut prompt = String::from("=== Workflow Context ===\n");
    prompt.push_str(&format!(
        "Workflow: {}\nStep {} of {}\n",
        ctx.workflow.name,
        ctx.index + 1,
        ctx.workflow.agents.len()
    ));
    if !ctx.handoffs.is_empty() {
        prompt.push_str("Previous agents:\n");
        for line in ctx.handoffs {
            prompt.push_str(&format!("- {}\n", line));
        }
    }
    if !ctx.outputs.is_empty() {
        prompt.push_str("Outputs from previous agents are available via @ references:\n");
        let mut ids: Vec<&String> = ctx.outputs.keys().collect();
        ids.sort();
        for id in ids {
            prompt.push_str(&format!("- {}: {}\n", id, output_reference(&ctx.outputs[id])));
        }
    }
    prompt.push_str("========================\n\n");
    prompt.push_str(&body);
    prompt
}

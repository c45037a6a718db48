//! Sub-agent manager - registry, delegation and task lifecycle

use crate::provider::ProviderRegistry;
use crate::subagent::router::SubAgentRouter;
use crate::subagent::runner::{ProcessRunner, SubAgentRunner};
use crate::subagent::types::{
    DelegationStrategy, SubAgent, SubAgentResult, SubAgentStatus, SubAgentTask, TaskExecution,
};
use chrono::Utc;
use conduit_foundation::{Error, Result, RouterWeights};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result group for tasks no agent could take
pub const UNROUTED: &str = "unrouted";

/// Sub-agent manager
pub struct SubAgentManager {
    /// Registered agents in registration order
    agents: RwLock<Vec<SubAgent>>,

    /// Executions by task id
    tasks: RwLock<HashMap<String, TaskExecution>>,

    router: SubAgentRouter,

    runner: Arc<dyn SubAgentRunner>,
}

impl SubAgentManager {
    pub fn new(router: SubAgentRouter, runner: Arc<dyn SubAgentRunner>) -> Self {
        Self {
            agents: RwLock::new(Vec::new()),
            tasks: RwLock::new(HashMap::new()),
            router,
            runner,
        }
    }

    /// Manager that runs agents through their provider CLIs
    pub fn with_providers(providers: Arc<ProviderRegistry>, weights: RouterWeights) -> Self {
        Self::new(
            SubAgentRouter::new(weights),
            Arc::new(ProcessRunner::new(providers)),
        )
    }

    pub fn router(&self) -> &SubAgentRouter {
        &self.router
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub async fn register(&self, agent: SubAgent) -> Result<()> {
        agent.validate()?;

        let mut agents = self.agents.write().await;
        if agents.iter().any(|a| a.name == agent.name) {
            return Err(Error::RegistrationConflict(format!(
                "sub-agent '{}' is already registered",
                agent.name
            )));
        }
        info!(agent = %agent.name, provider = %agent.provider, "registered sub-agent");
        agents.push(agent);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<SubAgent> {
        let mut agents = self.agents.write().await;
        let index = agents
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| Error::NotFound(format!("sub-agent '{}'", name)))?;
        debug!(agent = %name, "unregistered sub-agent");
        Ok(agents.remove(index))
    }

    pub async fn get(&self, name: &str) -> Option<SubAgent> {
        self.agents.read().await.iter().find(|a| a.name == name).cloned()
    }

    pub async fn list(&self) -> Vec<SubAgent> {
        self.agents.read().await.clone()
    }

    /// Agents declaring every one of `capabilities`
    pub async fn find(&self, capabilities: &[&str]) -> Vec<SubAgent> {
        self.agents
            .read()
            .await
            .iter()
            .filter(|a| capabilities.iter().all(|c| a.has_capability(c)))
            .cloned()
            .collect()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run `task` on the named agent
    pub async fn execute(
        &self,
        ctx: CancellationToken,
        task: SubAgentTask,
        agent_name: &str,
    ) -> Result<SubAgentResult> {
        let agent = self
            .get(agent_name)
            .await
            .ok_or_else(|| Error::NotFound(format!("sub-agent '{}'", agent_name)))?;
        self.run_on(ctx, task, agent).await
    }

    /// Let the router pick the agent
    pub async fn delegate(&self, ctx: CancellationToken, task: SubAgentTask) -> Result<SubAgentResult> {
        self.delegate_with_strategy(ctx, task, DelegationStrategy::Automatic)
            .await
    }

    pub async fn delegate_with_strategy(
        &self,
        ctx: CancellationToken,
        task: SubAgentTask,
        strategy: DelegationStrategy,
    ) -> Result<SubAgentResult> {
        let agent = self.select(&task, strategy).await?;
        self.run_on(ctx, task, agent).await
    }

    async fn select(&self, task: &SubAgentTask, strategy: DelegationStrategy) -> Result<SubAgent> {
        let agents = self.agents.read().await;
        match strategy {
            DelegationStrategy::Automatic => self.router.route(task, &agents).cloned(),
            DelegationStrategy::Explicit => Err(Error::NoCandidate(
                "explicit delegation requires an agent name".to_string(),
            )),
            DelegationStrategy::Proactive => agents
                .iter()
                .find(|a| a.strategy == DelegationStrategy::Proactive && a.can_handle(task))
                .cloned()
                .ok_or_else(|| {
                    Error::NoCandidate("no proactive agent can handle the task".to_string())
                }),
        }
    }

    /// Delegate every task concurrently. One result per task, in input
    /// order; failures become failed results.
    pub async fn execute_parallel(
        &self,
        ctx: CancellationToken,
        tasks: Vec<SubAgentTask>,
    ) -> Vec<SubAgentResult> {
        let runs = tasks.into_iter().map(|mut task| {
            task.ensure_id();
            let ctx = ctx.clone();
            async move {
                match self.select(&task, DelegationStrategy::Automatic).await {
                    Ok(agent) => self.settle(ctx, task, agent).await,
                    Err(e) => SubAgentResult::failed(&task.id, "", &e),
                }
            }
        });
        join_all(runs).await
    }

    /// Route each task, then run each provider's group concurrently
    pub async fn coordinate_across_providers(
        &self,
        ctx: CancellationToken,
        tasks: Vec<SubAgentTask>,
    ) -> HashMap<String, Vec<SubAgentResult>> {
        let mut groups: HashMap<String, Vec<(SubAgentTask, SubAgent)>> = HashMap::new();
        let mut unrouted = Vec::new();
        {
            let agents = self.agents.read().await;
            for mut task in tasks {
                task.ensure_id();
                match self.router.route(&task, &agents) {
                    Ok(agent) => groups
                        .entry(agent.provider.clone())
                        .or_default()
                        .push((task, agent.clone())),
                    Err(e) => {
                        warn!(task = %task.id, "could not route task: {}", e);
                        unrouted.push(SubAgentResult::failed(&task.id, "", &e));
                    }
                }
            }
        }

        let runs = groups.into_iter().map(|(provider, group)| {
            let ctx = ctx.clone();
            async move {
                debug!(provider = %provider, tasks = group.len(), "running provider group");
                let results = join_all(group.into_iter().map(|(task, agent)| {
                    let ctx = ctx.clone();
                    async move { self.settle(ctx, task, agent).await }
                }))
                .await;
                (provider, results)
            }
        });

        let mut results: HashMap<String, Vec<SubAgentResult>> = join_all(runs).await.into_iter().collect();
        if !unrouted.is_empty() {
            results.insert(UNROUTED.to_string(), unrouted);
        }
        results
    }

    async fn run_on(
        &self,
        ctx: CancellationToken,
        task: SubAgentTask,
        agent: SubAgent,
    ) -> Result<SubAgentResult> {
        match self.run_tracked(ctx, task, agent).await? {
            (result, None) => Ok(result),
            (_, Some(e)) => Err(e),
        }
    }

    /// Run on `agent`, always yielding a result for this attempt
    async fn settle(&self, ctx: CancellationToken, task: SubAgentTask, agent: SubAgent) -> SubAgentResult {
        let task_id = task.id.clone();
        let agent_name = agent.name.clone();
        match self.run_tracked(ctx, task, agent).await {
            Ok((result, _)) => result,
            Err(e) => SubAgentResult::failed(task_id, agent_name, &e),
        }
    }

    /// Track and run one attempt. The outer error means the task never
    /// started; otherwise the recorded result comes back with the runner's
    /// error, if any.
    async fn run_tracked(
        &self,
        ctx: CancellationToken,
        mut task: SubAgentTask,
        agent: SubAgent,
    ) -> Result<(SubAgentResult, Option<Error>)> {
        task.ensure_id();
        let cancel = ctx.child_token();

        {
            let mut tasks = self.tasks.write().await;
            if tasks.get(&task.id).is_some_and(|e| !e.status().is_terminal()) {
                return Err(Error::InvalidInput(format!(
                    "task '{}' is already running",
                    task.id
                )));
            }
            tasks.insert(
                task.id.clone(),
                TaskExecution::new(task.clone(), agent.name.clone(), cancel.clone()),
            );
        }

        info!(task = %task.id, agent = %agent.name, "executing task");
        let start_time = Utc::now();
        let outcome = self.runner.run(&agent, &task, cancel.clone()).await;
        let end_time = Utc::now();

        let (status, output, error) = match &outcome {
            Ok(output) => (SubAgentStatus::Completed, output.clone(), None),
            Err(_) if cancel.is_cancelled() => (
                SubAgentStatus::Cancelled,
                String::new(),
                Some("cancelled".to_string()),
            ),
            Err(e) => (SubAgentStatus::Failed, String::new(), Some(e.to_string())),
        };
        let result = SubAgentResult {
            task_id: task.id.clone(),
            agent_name: agent.name.clone(),
            status,
            output,
            error,
            start_time,
            end_time,
        };

        let result = match self.tasks.write().await.get_mut(&task.id) {
            Some(execution) => execution.complete(result),
            None => result,
        };
        self.router.learn(&task, &agent, &result);
        info!(task = %task.id, agent = %agent.name, status = %result.status, "task finished");

        let error = match outcome {
            Ok(_) if result.status == SubAgentStatus::Cancelled => {
                Some(Error::Task(format!("task '{}' was cancelled", task.id)))
            }
            Ok(_) => None,
            Err(e) => Some(e),
        };
        Ok((result, error))
    }

    // ========================================================================
    // Task lifecycle
    // ========================================================================

    /// Signal a running task to stop
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let execution = tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("task '{}'", task_id)))?;

        if execution.transition(SubAgentStatus::Cancelled) {
            info!(task = %task_id, "cancelling task");
            execution.cancel.cancel();
        }
        Ok(())
    }

    pub async fn get_status(&self, task_id: &str) -> Result<SubAgentStatus> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|e| e.status())
            .ok_or_else(|| Error::NotFound(format!("task '{}'", task_id)))
    }

    /// Result of a task; `None` while it is still running
    pub async fn get_results(&self, task_id: &str) -> Result<Option<SubAgentResult>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .map(|e| e.result.clone())
            .ok_or_else(|| Error::NotFound(format!("task '{}'", task_id)))
    }

    /// Executions not yet in a terminal state, oldest first
    pub async fn list_active_tasks(&self) -> Vec<TaskExecution> {
        let mut active: Vec<TaskExecution> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|e| !e.status().is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|e| e.started_at);
        active
    }

    /// Forget a finished task
    pub async fn cleanup_task(&self, task_id: &str) -> Result<TaskExecution> {
        let mut tasks = self.tasks.write().await;
        match tasks.get(task_id) {
            None => Err(Error::NotFound(format!("task '{}'", task_id))),
            Some(e) if !e.status().is_terminal() || e.result.is_none() => Err(Error::InvalidInput(
                format!("task '{}' is still running", task_id),
            )),
            Some(_) => tasks
                .remove(task_id)
                .ok_or_else(|| Error::NotFound(format!("task '{}'", task_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Echoes the task; input "fail" fails, input "block" waits for cancel
    struct FakeRunner;

    #[async_trait]
    impl SubAgentRunner for FakeRunner {
        async fn run(
            &self,
            agent: &SubAgent,
            task: &SubAgentTask,
            cancel: CancellationToken,
        ) -> Result<String> {
            match task.input.as_str() {
                "fail" => Err(Error::agent(&agent.name, "boom")),
                "block" => {
                    cancel.cancelled().await;
                    Err(Error::Task("cancelled".into()))
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(format!("{}:{}", agent.name, task.description))
                }
            }
        }
    }

    fn manager() -> Arc<SubAgentManager> {
        Arc::new(SubAgentManager::new(
            SubAgentRouter::default(),
            Arc::new(FakeRunner),
        ))
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let m = manager();
        m.register(SubAgent::new("a", "claude")).await.unwrap();
        let err = m.register(SubAgent::new("a", "gemini")).await.unwrap_err();
        assert!(matches!(err, Error::RegistrationConflict(_)));

        let err = m.register(SubAgent::new("", "gemini")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(m.list().await.len(), 1);
        assert_eq!(m.get("a").await.unwrap().provider, "claude");
    }

    #[tokio::test]
    async fn test_registry_queries() {
        let m = manager();
        m.register(SubAgent::new("a", "claude").with_capabilities(&["rust", "review"]))
            .await
            .unwrap();
        m.register(SubAgent::new("b", "gemini").with_capabilities(&["rust"]))
            .await
            .unwrap();

        let names: Vec<_> = m.list().await.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(m.find(&["rust"]).await.len(), 2);
        assert_eq!(m.find(&["rust", "review"]).await[0].name, "a");

        m.unregister("a").await.unwrap();
        assert!(m.get("a").await.is_none());
        assert!(matches!(m.unregister("a").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_execute_unknown_agent() {
        let m = manager();
        let err = m
            .execute(CancellationToken::new(), SubAgentTask::new("x"), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_records_result_and_stats() {
        let m = manager();
        m.register(SubAgent::new("a", "claude")).await.unwrap();

        let task = SubAgentTask::new("hello").with_id("t1");
        let result = m.execute(CancellationToken::new(), task, "a").await.unwrap();
        assert_eq!(result.output, "a:hello");
        assert_eq!(m.get_status("t1").await.unwrap(), SubAgentStatus::Completed);
        assert_eq!(m.router().get_stats()["a"].tasks, 1);

        let failing = SubAgentTask::new("x").with_id("t2").with_input("fail");
        assert!(m.execute(CancellationToken::new(), failing, "a").await.is_err());
        let stored = m.get_results("t2").await.unwrap().unwrap();
        assert_eq!(stored.status, SubAgentStatus::Failed);
        assert_eq!(m.router().get_stats()["a"].failures, 1);
    }

    #[tokio::test]
    async fn test_delegate_strategies() {
        let m = manager();
        m.register(SubAgent::new("auto", "claude")).await.unwrap();
        m.register(SubAgent::new("eager", "gemini").with_strategy(DelegationStrategy::Proactive))
            .await
            .unwrap();

        let ctx = CancellationToken::new();
        let explicit = m
            .delegate_with_strategy(ctx.clone(), SubAgentTask::new("x"), DelegationStrategy::Explicit)
            .await;
        assert!(matches!(explicit, Err(Error::NoCandidate(_))));

        let proactive = m
            .delegate_with_strategy(ctx.clone(), SubAgentTask::new("x"), DelegationStrategy::Proactive)
            .await
            .unwrap();
        assert_eq!(proactive.agent_name, "eager");

        let automatic = m.delegate(ctx, SubAgentTask::new("x")).await.unwrap();
        assert_eq!(automatic.agent_name, "auto");
    }

    #[tokio::test]
    async fn test_delegate_with_empty_registry() {
        let m = manager();
        let err = m
            .delegate(CancellationToken::new(), SubAgentTask::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCandidate(_)));
    }

    #[tokio::test]
    async fn test_execute_parallel_keeps_order_and_failures() {
        let m = manager();
        m.register(SubAgent::new("a", "claude")).await.unwrap();

        let tasks = vec![
            SubAgentTask::new("one"),
            SubAgentTask::new("two").with_input("fail"),
            SubAgentTask::new("three"),
        ];
        let results = m.execute_parallel(CancellationToken::new(), tasks).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].output, "a:one");
        assert_eq!(results[1].status, SubAgentStatus::Failed);
        assert_eq!(results[1].agent_name, "a");
        assert_eq!(results[2].output, "a:three");
    }

    #[tokio::test]
    async fn test_rerun_of_same_id_reports_fresh_failure() {
        let m = manager();
        m.register(SubAgent::new("a", "claude")).await.unwrap();

        let first = m
            .execute_parallel(CancellationToken::new(), vec![SubAgentTask::new("first").with_id("t1")])
            .await;
        assert_eq!(first[0].status, SubAgentStatus::Completed);
        assert_eq!(first[0].output, "a:first");

        m.unregister("a").await.unwrap();
        let second = m
            .execute_parallel(CancellationToken::new(), vec![SubAgentTask::new("second").with_id("t1")])
            .await;
        assert_eq!(second[0].task_id, "t1");
        assert_eq!(second[0].status, SubAgentStatus::Failed);
        assert!(second[0].output.is_empty());
        assert!(second[0].error.as_deref().unwrap_or_default().contains("no agents available"));
    }

    #[tokio::test]
    async fn test_coordinate_groups_by_provider() {
        let m = manager();
        m.register(SubAgent::new("c", "claude").with_capabilities(&["review"]))
            .await
            .unwrap();
        m.register(SubAgent::new("g", "gemini").with_capabilities(&["research"]))
            .await
            .unwrap();

        let tasks = vec![
            SubAgentTask::new("review the diff"),
            SubAgentTask::new("research options"),
            SubAgentTask::new("x").with_constraint("requires:gpu"),
        ];
        let grouped = m.coordinate_across_providers(CancellationToken::new(), tasks).await;

        assert_eq!(grouped["claude"][0].agent_name, "c");
        assert_eq!(grouped["gemini"][0].agent_name, "g");
        assert_eq!(grouped[UNROUTED][0].status, SubAgentStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_and_cleanup_lifecycle() {
        let m = manager();
        m.register(SubAgent::new("a", "claude")).await.unwrap();

        let runner = Arc::clone(&m);
        let handle = tokio::spawn(async move {
            let task = SubAgentTask::new("wait").with_id("slow").with_input("block");
            runner.execute(CancellationToken::new(), task, "a").await
        });

        while m.list_active_tasks().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(matches!(m.cleanup_task("slow").await, Err(Error::InvalidInput(_))));

        m.cancel_task("slow").await.unwrap();
        assert!(handle.await.unwrap().is_err());
        assert_eq!(m.get_status("slow").await.unwrap(), SubAgentStatus::Cancelled);
        assert!(m.list_active_tasks().await.is_empty());

        m.cleanup_task("slow").await.unwrap();
        assert!(matches!(m.get_status("slow").await, Err(Error::NotFound(_))));
        assert!(matches!(m.cancel_task("slow").await, Err(Error::NotFound(_))));
    }
}

//! Sequencer tests against a scripted session
//!
//! `cargo test -p conduit-workflow --test sequencer_test`

use async_trait::async_trait;
use chrono::Utc;
use conduit_foundation::{Error, Result};
use conduit_task::{
    AgentSession, SessionOutcome, SessionRequest, SubAgentResult, SubAgentStatus, SubAgentTask,
};
use conduit_workflow::{
    Agent, AgentStatus, Sequencer, TaskDelegator, Variable, VariablePrompter, Workflow,
    WorkflowStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    FailOnce,
    Interrupt,
}

#[derive(Default)]
struct ScriptedSession {
    behaviors: HashMap<String, Behavior>,
    requests: Mutex<Vec<SessionRequest>>,
    calls: Mutex<HashMap<String, u32>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedSession {
    fn with(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .iter()
                .map(|(id, b)| (id.to_string(), *b))
                .collect(),
            ..Default::default()
        })
    }

    fn ran(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.agent_id.clone()).collect()
    }

    fn prompt_of(&self, agent: &str) -> String {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.agent_id == agent)
            .map(|r| r.prompt.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn run(&self, request: SessionRequest, cancel: CancellationToken) -> Result<SessionOutcome> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let agent = request.agent_id.clone();
        self.requests.lock().push(request);
        let call = {
            let mut calls = self.calls.lock();
            let n = calls.entry(agent.clone()).or_insert(0);
            *n += 1;
            *n
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        let behavior = self.behaviors.get(&agent).copied().unwrap_or(Behavior::Succeed);
        let result = match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(Error::agent(&agent, "exited with code 1")),
            Behavior::FailOnce if call == 1 => Err(Error::agent(&agent, "flaky")),
            Behavior::FailOnce => Ok(()),
            Behavior::Interrupt => {
                cancel.cancel();
                Err(Error::WorkflowCancelled)
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result.map(|_| SessionOutcome {
            exit_code: 0,
            duration: Duration::from_millis(5),
            prompt_submitted: true,
        })
    }
}

fn workflow(agents: Vec<Agent>) -> Workflow {
    Workflow {
        name: "test-flow".into(),
        agents,
        ..Default::default()
    }
}

fn sequencer(session: Arc<ScriptedSession>, dir: &std::path::Path) -> Sequencer {
    Sequencer::new(session, CancellationToken::new()).with_working_dir(dir)
}

#[tokio::test]
async fn test_agents_run_strictly_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[]);
    let seq = sequencer(session.clone(), dir.path());

    let w = workflow(vec![
        Agent::new("a", "mock", "one"),
        Agent::new("b", "mock", "two"),
        Agent::new("c", "mock", "three"),
    ]);
    seq.execute(&w, HashMap::new()).await.unwrap();

    assert_eq!(session.ran(), vec!["a", "b", "c"]);
    assert_eq!(session.max_active.load(Ordering::SeqCst), 1);

    let state = seq.state().unwrap();
    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert_eq!(state.handoffs.len(), 3);
    assert_eq!(state.handoffs[0], "Agent a (mock) completed");
    assert!(state.outputs.is_empty());
}

#[tokio::test]
async fn test_handoff_reference_points_at_output() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[]);
    let seq = sequencer(session.clone(), dir.path());

    let mut w = workflow(vec![
        Agent::new("agent1", "claude", "Plan {{topic}}").with_output("plan.md"),
        Agent::new("agent2", "gemini", "Build {{agent1.output}}"),
    ]);
    w.settings.output_dir = Some("runs/{{workflow}}".into());

    let vars = HashMap::from([("topic".to_string(), "cache".to_string())]);
    seq.execute(&w, vars).await.unwrap();

    let out = dir.path().join("runs/test-flow/plan.md");
    assert!(session.prompt_of("agent1").starts_with("Plan cache"));
    assert!(session
        .prompt_of("agent1")
        .ends_with(&format!("Write your final output to: {}", out.display())));

    let second = session.prompt_of("agent2");
    assert!(second.starts_with("=== Workflow Context ==="));
    assert!(second.ends_with(&format!("Build @{}", out.display())));

    let state = seq.state().unwrap();
    assert_eq!(state.outputs["agent1"], out);
    assert!(dir.path().join("runs/test-flow").is_dir());
}

#[tokio::test]
async fn test_failure_stops_run() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[("b", Behavior::Fail)]);
    let seq = sequencer(session.clone(), dir.path());

    let w = workflow(vec![
        Agent::new("a", "mock", "x"),
        Agent::new("b", "mock", "y"),
        Agent::new("c", "mock", "z"),
    ]);
    let err = seq.execute(&w, HashMap::new()).await.unwrap_err();

    assert!(matches!(err, Error::AgentExecution { ref agent, .. } if agent == "b"));
    assert_eq!(session.ran(), vec!["a", "b"]);
    let state = seq.state().unwrap();
    assert_eq!(state.status(), WorkflowStatus::Failed);
    assert_eq!(state.agent_status("b"), Some(AgentStatus::Failed));
    assert_eq!(state.errors.len(), 1);
}

#[tokio::test]
async fn test_continue_on_error_keeps_going() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[("b", Behavior::Fail)]);
    let seq = sequencer(session.clone(), dir.path());

    let mut failing = Agent::new("b", "mock", "y");
    failing.settings.continue_on_error = true;
    let w = workflow(vec![
        Agent::new("a", "mock", "x"),
        failing,
        Agent::new("c", "mock", "z"),
    ]);
    seq.execute(&w, HashMap::new()).await.unwrap();

    assert_eq!(session.ran(), vec!["a", "b", "c"]);
    let state = seq.state().unwrap();
    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.handoffs.len(), 2);
}

#[tokio::test]
async fn test_interrupt_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[("b", Behavior::Interrupt)]);
    let seq = sequencer(session.clone(), dir.path());

    let mut tolerant = Agent::new("b", "mock", "y");
    tolerant.settings.continue_on_error = true;
    let w = workflow(vec![
        Agent::new("a", "mock", "x"),
        tolerant,
        Agent::new("c", "mock", "z"),
    ]);
    let err = seq.execute(&w, HashMap::new()).await.unwrap_err();

    assert!(err.is_cancellation());
    assert!(seq.cancel_token().is_cancelled());
    assert_eq!(session.ran(), vec!["a", "b"]);
    let state = seq.state().unwrap();
    assert_eq!(state.status(), WorkflowStatus::Aborted);
    assert_eq!(state.agent_status("b"), Some(AgentStatus::Aborted));
}

#[tokio::test]
async fn test_retry_after_retryable_failure() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[("a", Behavior::FailOnce)]);
    let seq = sequencer(session.clone(), dir.path());

    let mut flaky = Agent::new("a", "mock", "x");
    flaky.settings.retry_count = 1;
    flaky.settings.timeout = Some(30);
    seq.execute(&workflow(vec![flaky]), HashMap::new()).await.unwrap();

    let state = seq.state().unwrap();
    assert_eq!(state.agents["a"].attempts, 2);
    assert_eq!(state.agent_status("a"), Some(AgentStatus::Completed));
    assert_eq!(
        session.requests.lock()[0].timeout,
        Some(Duration::from_secs(30))
    );
}

struct Answers(HashMap<String, String>, Mutex<Vec<String>>);

#[async_trait]
impl VariablePrompter for Answers {
    async fn prompt(&self, variable: &Variable, _current: Option<&str>) -> Result<Option<String>> {
        self.1.lock().push(variable.name.clone());
        Ok(self.0.get(&variable.name).cloned())
    }
}

#[tokio::test]
async fn test_prompter_overrides_non_internal_variables() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[]);
    let answers = Arc::new(Answers(
        HashMap::from([("feature".to_string(), "billing".to_string())]),
        Mutex::new(Vec::new()),
    ));
    let seq = sequencer(session.clone(), dir.path()).with_prompter(answers.clone());

    let mut w = workflow(vec![Agent::new("a", "mock", "Build {{feature}} in {{env}}")]);
    let mut env = Variable::new("env");
    env.default = Some(serde_json::json!("staging"));
    env.internal = true;
    w.variables = vec![Variable::new("feature"), env];

    let vars = HashMap::from([("feature".to_string(), "search".to_string())]);
    seq.execute(&w, vars).await.unwrap();

    assert_eq!(session.prompt_of("a"), "Build billing in staging");
    assert_eq!(*answers.1.lock(), vec!["feature".to_string()]);
    assert_eq!(seq.state().unwrap().variables["feature"], "billing");
}

/// Never answers
struct Silent;

#[async_trait]
impl VariablePrompter for Silent {
    async fn prompt(&self, _variable: &Variable, _current: Option<&str>) -> Result<Option<String>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cancel_while_confirming_variables_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[]);
    let seq = sequencer(session.clone(), dir.path()).with_prompter(Arc::new(Silent));

    let mut w = workflow(vec![Agent::new("a", "mock", "Build {{feature}}")]);
    w.variables = vec![Variable::new("feature")];

    let cancel = seq.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let vars = HashMap::from([("feature".to_string(), "search".to_string())]);
    let outcome = tokio::time::timeout(Duration::from_secs(2), seq.execute(&w, vars))
        .await
        .expect("execute must return once cancelled");

    assert!(matches!(outcome, Err(Error::WorkflowCancelled)));
    assert!(session.ran().is_empty());
    assert_eq!(seq.state().unwrap().status(), WorkflowStatus::Aborted);
}

#[tokio::test]
async fn test_cancel_while_asking_required_variable() {
    let dir = tempfile::tempdir().unwrap();
    let seq = sequencer(ScriptedSession::with(&[]), dir.path()).with_prompter(Arc::new(Silent));

    let mut w = workflow(vec![Agent::new("a", "mock", "{{feature}}")]);
    let mut feature = Variable::new("feature");
    feature.required = true;
    w.variables = vec![feature];

    seq.cancel_token().cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), seq.execute(&w, HashMap::new()))
        .await
        .expect("execute must return once cancelled");

    assert!(matches!(outcome, Err(Error::WorkflowCancelled)));
    assert_eq!(seq.state().unwrap().status(), WorkflowStatus::Aborted);
}

#[tokio::test]
async fn test_missing_required_variable() {
    let dir = tempfile::tempdir().unwrap();
    let seq = sequencer(ScriptedSession::with(&[]), dir.path());

    let mut w = workflow(vec![Agent::new("a", "mock", "{{feature}}")]);
    let mut feature = Variable::new("feature");
    feature.required = true;
    w.variables = vec![feature];

    let err = seq.execute(&w, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_false_condition_skips_agent() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[]);
    let seq = sequencer(session.clone(), dir.path());

    let mut optional = Agent::new("docs", "mock", "write docs");
    optional.condition = Some("{{with_docs}}".into());
    let w = workflow(vec![Agent::new("a", "mock", "x"), optional]);

    seq.execute(&w, HashMap::from([("with_docs".to_string(), "no".to_string())]))
        .await
        .unwrap();

    assert_eq!(session.ran(), vec!["a"]);
    assert_eq!(seq.state().unwrap().agent_status("docs"), Some(AgentStatus::Skipped));
}

struct EchoDelegator;

#[async_trait]
impl TaskDelegator for EchoDelegator {
    async fn delegate_task(
        &self,
        _ctx: CancellationToken,
        task: SubAgentTask,
        agent: Option<&str>,
    ) -> Result<SubAgentResult> {
        Ok(SubAgentResult {
            task_id: task.id.clone(),
            agent_name: agent.unwrap_or("router-pick").to_string(),
            status: SubAgentStatus::Completed,
            output: format!("done: {}", task.description),
            error: None,
            start_time: Utc::now(),
            end_time: Utc::now(),
        })
    }
}

#[tokio::test]
async fn test_delegated_step_writes_output() {
    let dir = tempfile::tempdir().unwrap();
    let session = ScriptedSession::with(&[]);
    let seq = sequencer(session.clone(), dir.path()).with_delegator(Arc::new(EchoDelegator));

    let mut delegated = Agent::new("review", "claude", "review it").with_output("review.txt");
    delegated.settings.delegate = true;
    delegated.settings.subagent = Some("reviewer".into());
    seq.execute(&workflow(vec![delegated]), HashMap::new()).await.unwrap();

    assert!(session.ran().is_empty());
    let written = std::fs::read_to_string(dir.path().join("review.txt")).unwrap();
    assert_eq!(written, "done: review it");
}

#[tokio::test]
async fn test_delegation_without_manager_fails() {
    let dir = tempfile::tempdir().unwrap();
    let seq = sequencer(ScriptedSession::with(&[]), dir.path());

    let mut delegated = Agent::new("review", "claude", "review it");
    delegated.settings.delegate = true;
    let err = seq
        .execute(&workflow(vec![delegated]), HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

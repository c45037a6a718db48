//! Sub-agent router - scores agents for a task and learns from outcomes

use crate::subagent::types::{SubAgent, SubAgentResult, SubAgentStatus, SubAgentTask, REQUIRES_PREFIX};
use conduit_foundation::{Error, Result, RouterWeights};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Words in a task's name or description that count as capability hints
const CAPABILITY_VOCABULARY: &[&str] = &[
    "analysis",
    "api",
    "architecture",
    "backend",
    "code",
    "coding",
    "database",
    "debug",
    "debugging",
    "deploy",
    "design",
    "docs",
    "documentation",
    "frontend",
    "implementation",
    "optimization",
    "performance",
    "planning",
    "refactor",
    "refactoring",
    "research",
    "review",
    "security",
    "testing",
    "tests",
    "ui",
];

/// Per-agent execution statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterStats {
    pub tasks: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub avg_duration: Duration,
}

impl RouterStats {
    pub fn success_rate(&self) -> f64 {
        if self.tasks == 0 {
            0.0
        } else {
            self.successes as f64 / self.tasks as f64
        }
    }
}

/// Sub-agent router
#[derive(Debug, Default)]
pub struct SubAgentRouter {
    weights: RouterWeights,
    stats: RwLock<HashMap<String, RouterStats>>,
}

impl SubAgentRouter {
    pub fn new(weights: RouterWeights) -> Self {
        Self {
            weights,
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn weights(&self) -> &RouterWeights {
        &self.weights
    }

    /// Suitability of `agent` for `task`; 0 when it cannot handle it
    pub fn score(&self, task: &SubAgentTask, agent: &SubAgent) -> f64 {
        if !agent.can_handle(task) {
            return 0.0;
        }

        let w = &self.weights;
        let mut score = agent.priority as f64 * w.priority;
        score += context_match(task, agent) * w.context_match;
        score += capability_match(task, agent) * w.capability_match;

        if let Some(stats) = self.stats.read().get(&agent.name) {
            if stats.tasks > 0 {
                score += stats.success_rate() * w.success_rate;
                let avg_secs = stats.avg_duration.as_secs_f64();
                let speed = if avg_secs > 0.0 { (1.0 / avg_secs).min(1.0) } else { 1.0 };
                score += speed * w.latency;
            }
        }

        if let Some(preferred) = task.preferred_provider() {
            if preferred.eq_ignore_ascii_case(&agent.provider) {
                score += w.preferred_provider;
            }
        }

        if agent.parallel && task.priority > w.parallel_priority_threshold {
            score += w.parallel;
        }

        score
    }

    /// Highest scoring capable agent; ties go to the earliest candidate
    pub fn route<'a>(&self, task: &SubAgentTask, agents: &'a [SubAgent]) -> Result<&'a SubAgent> {
        if agents.is_empty() {
            return Err(Error::NoCandidate("no agents available".to_string()));
        }

        let mut best: Option<(&SubAgent, f64)> = None;
        for agent in agents.iter().filter(|a| a.can_handle(task)) {
            let score = self.score(task, agent);
            debug!(agent = %agent.name, score, "scored candidate");
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((agent, score));
            }
        }

        best.map(|(agent, _)| agent).ok_or_else(|| {
            Error::NoCandidate(format!(
                "no capable agents for task '{}'",
                display_name(task)
            ))
        })
    }

    /// Fold a finished task into the agent's statistics
    pub fn learn(&self, _task: &SubAgentTask, agent: &SubAgent, result: &SubAgentResult) {
        let mut stats = self.stats.write();
        let entry = stats.entry(agent.name.clone()).or_default();

        entry.tasks += 1;
        match result.status {
            SubAgentStatus::Completed => entry.successes += 1,
            SubAgentStatus::Failed | SubAgentStatus::Cancelled => entry.failures += 1,
            SubAgentStatus::Pending | SubAgentStatus::Running => {}
        }
        entry.total_duration += result.duration();
        entry.avg_duration = entry.total_duration / entry.tasks as u32;
    }

    /// Snapshot of all statistics
    pub fn get_stats(&self) -> HashMap<String, RouterStats> {
        self.stats.read().clone()
    }
}

fn display_name(task: &SubAgentTask) -> &str {
    if task.name.is_empty() {
        &task.id
    } else {
        &task.name
    }
}

/// Text the context patterns are matched against
fn task_text(task: &SubAgentTask) -> String {
    let mut text = format!("{} {}", task.name, task.description);
    for value in task.context.values() {
        text.push(' ');
        match value {
            serde_json::Value::String(s) => text.push_str(s),
            other => text.push_str(&other.to_string()),
        }
    }
    text.to_lowercase()
}

/// Fraction of the agent's context patterns found in the task
fn context_match(task: &SubAgentTask, agent: &SubAgent) -> f64 {
    if agent.context_patterns.is_empty() {
        return 0.0;
    }
    let text = task_text(task);
    let hits = agent
        .context_patterns
        .iter()
        .filter(|p| text.contains(&p.to_lowercase()))
        .count();
    hits as f64 / agent.context_patterns.len() as f64
}

/// Capability-like keywords inferred from the task
fn capability_keywords(task: &SubAgentTask) -> HashSet<String> {
    let mut keywords = HashSet::new();

    for constraint in &task.constraints {
        let constraint = constraint.trim().to_lowercase();
        let keyword = constraint
            .strip_prefix(REQUIRES_PREFIX)
            .unwrap_or(&constraint)
            .trim();
        if !keyword.is_empty() {
            keywords.insert(keyword.to_string());
        }
    }

    let text = format!("{} {}", task.name, task.description).to_lowercase();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if CAPABILITY_VOCABULARY.contains(&word) {
            keywords.insert(word.to_string());
        }
    }

    keywords
}

/// Fraction of inferred keywords the agent declares
fn capability_match(task: &SubAgentTask, agent: &SubAgent) -> f64 {
    let keywords = capability_keywords(task);
    if keywords.is_empty() {
        return 0.0;
    }
    let hits = keywords.iter().filter(|k| agent.has_capability(k)).count();
    hits as f64 / keywords.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result_after(secs: i64, status: SubAgentStatus) -> SubAgentResult {
        let end = Utc::now();
        SubAgentResult {
            task_id: "t".into(),
            agent_name: "a".into(),
            status,
            output: String::new(),
            error: None,
            start_time: end - chrono::Duration::seconds(secs),
            end_time: end,
        }
    }

    #[test]
    fn test_score_zero_when_cannot_handle() {
        let router = SubAgentRouter::default();
        let agent = SubAgent::new("a", "claude").with_priority(10);
        let task = SubAgentTask::new("x").with_constraint("requires:gpu");
        assert_eq!(router.score(&task, &agent), 0.0);
    }

    #[test]
    fn test_score_components() {
        let router = SubAgentRouter::default();
        let agent = SubAgent::new("a", "claude")
            .with_priority(2)
            .with_capabilities(&["review"])
            .with_context_patterns(&["pull request", "lint"]);
        let task = SubAgentTask::new("review this pull request")
            .with_context("preferred_provider", serde_json::json!("claude"));

        let w = RouterWeights::default();
        let expected = 2.0 * w.priority + 0.5 * w.context_match + 1.0 * w.capability_match
            + w.preferred_provider;
        assert!((router.score(&task, &agent) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_parallel_bonus_needs_high_priority() {
        let router = SubAgentRouter::default();
        let agent = SubAgent::new("a", "claude").with_parallel(true);

        let low = SubAgentTask::new("x").with_priority(5);
        let high = SubAgentTask::new("x").with_priority(6);
        let bonus = router.score(&high, &agent) - router.score(&low, &agent);
        assert!((bonus - RouterWeights::default().parallel).abs() < 1e-9);
    }

    #[test]
    fn test_route_errors_are_distinct() {
        let router = SubAgentRouter::default();
        let task = SubAgentTask::new("x").with_constraint("requires:go");

        let empty = router.route(&task, &[]).unwrap_err().to_string();
        assert!(empty.contains("no agents available"));

        let agents = vec![SubAgent::new("a", "claude").with_capabilities(&["rust"])];
        let none = router.route(&task, &agents).unwrap_err().to_string();
        assert!(none.contains("no capable agents"));
    }

    #[test]
    fn test_route_picks_highest_then_first() {
        let router = SubAgentRouter::default();
        let agents = vec![
            SubAgent::new("first", "claude"),
            SubAgent::new("second", "gemini"),
            SubAgent::new("third", "claude").with_capabilities(&["testing"]),
        ];

        let task = SubAgentTask::new("write testing harness");
        assert_eq!(router.route(&task, &agents).unwrap().name, "third");

        let plain = SubAgentTask::new("hello");
        assert_eq!(router.route(&plain, &agents).unwrap().name, "first");
    }

    #[test]
    fn test_learn_uses_arithmetic_mean() {
        let router = SubAgentRouter::default();
        let agent = SubAgent::new("a", "claude");
        let task = SubAgentTask::new("x");

        router.learn(&task, &agent, &result_after(2, SubAgentStatus::Completed));
        router.learn(&task, &agent, &result_after(4, SubAgentStatus::Failed));

        let stats = router.get_stats();
        let a = &stats["a"];
        assert_eq!(a.tasks, 2);
        assert_eq!(a.successes, 1);
        assert_eq!(a.failures, 1);
        assert_eq!(a.avg_duration.as_secs(), 3);
        assert!((a.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_history_adds_bonus() {
        let router = SubAgentRouter::default();
        let agent = SubAgent::new("a", "claude");
        let task = SubAgentTask::new("x");
        let before = router.score(&task, &agent);

        router.learn(&task, &agent, &result_after(1, SubAgentStatus::Completed));
        let w = RouterWeights::default();
        let after = router.score(&task, &agent);
        assert!((after - before - (w.success_rate + w.latency)).abs() < 1e-6);
    }
}

//! Subcommands

use crate::prompter::LinePrompter;
use anyhow::Context;
use conduit_foundation::ConduitConfig;
use conduit_task::{
    BridgeConfig, DelegationStrategy, InputSource, InterruptEscalator, ProviderRegistry, SubAgent,
    SubAgentManager, SubAgentTask, TerminalBridge, REQUIRES_PREFIX,
};
use conduit_workflow::{extract_variables, Sequencer, Workflow};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code for runs stopped by the user
const EXIT_INTERRUPTED: u8 = 130;

/// `KEY=VALUE`
pub fn parse_var(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' in '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Sub-agent file: a list, or a map with an `agents` list
#[derive(Deserialize)]
#[serde(untagged)]
enum AgentFile {
    List(Vec<SubAgent>),
    Wrapped { agents: Vec<SubAgent> },
}

pub fn load_agents(path: &Path) -> anyhow::Result<Vec<SubAgent>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: AgentFile = serde_yaml::from_str(&text)
        .with_context(|| format!("invalid sub-agent definitions in {}", path.display()))?;
    Ok(match file {
        AgentFile::List(agents) | AgentFile::Wrapped { agents } => agents,
    })
}

fn provider_registry(config: &ConduitConfig) -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::with_defaults().with_overrides(&config.providers))
}

async fn build_manager(
    config: &ConduitConfig,
    providers: Arc<ProviderRegistry>,
    agents: Option<&Path>,
) -> anyhow::Result<Arc<SubAgentManager>> {
    let manager = SubAgentManager::with_providers(providers, config.router.clone());
    if let Some(path) = agents {
        for agent in load_agents(path)? {
            manager.register(agent).await?;
        }
    }
    Ok(Arc::new(manager))
}

/// Cancel `token` on Ctrl-C (outside raw mode) or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("termination signal received");
        token.cancel();
    });
}

// ============================================================================
// run
// ============================================================================

pub async fn run_workflow(
    config: &ConduitConfig,
    path: &Path,
    vars: Vec<(String, String)>,
    no_prompt: bool,
    agents: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let workflow = Workflow::load(path)?;
    let providers = provider_registry(config);
    let manager = build_manager(config, Arc::clone(&providers), agents).await?;

    let interactive = std::io::stdin().is_terminal();
    let mut bridge_config = BridgeConfig::from_settings(&config.session);
    if interactive {
        bridge_config = bridge_config.interactive();
    }

    let input = InputSource::stdin();
    let bridge = TerminalBridge::new(providers, input.clone(), bridge_config)
        .with_escalator(Arc::new(InterruptEscalator::from_settings(&config.interrupt)));

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut sequencer = Sequencer::new(Arc::new(bridge), cancel).with_delegator(manager);
    if interactive && !no_prompt {
        sequencer = sequencer.with_prompter(Arc::new(LinePrompter::new(input)));
    }

    println!("▶ {} ({} agents)", workflow.name, workflow.agents.len());
    let vars: HashMap<String, String> = vars.into_iter().collect();
    let outcome = sequencer.execute(&workflow, vars).await;
    let state = sequencer.state();

    match outcome {
        Ok(()) => {
            if let Some(state) = &state {
                println!(
                    "\n✓ Workflow completed ({}/{} agents)",
                    state.completed_count(),
                    workflow.agents.len()
                );
                for agent in &workflow.agents {
                    let status = state
                        .agent_status(&agent.id)
                        .map(|s| format!("{:?}", s).to_lowercase())
                        .unwrap_or_else(|| "not run".to_string());
                    match state.outputs.get(&agent.id) {
                        Some(out) => println!("  {:<20} {:<10} {}", agent.id, status, out.display()),
                        None => println!("  {:<20} {}", agent.id, status),
                    }
                }
                if !state.errors.is_empty() {
                    println!("  {} agent(s) failed and were skipped over", state.errors.len());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_cancellation() => {
            println!("\ninterrupted");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(e) => {
            let agent = state
                .as_ref()
                .and_then(|s| s.errors.last())
                .map(|err| err.agent_id.clone());
            match agent {
                Some(agent) => eprintln!("\n✗ Workflow failed at agent '{}': {}", agent, e),
                None => eprintln!("\n✗ Workflow failed: {}", e),
            }
            if !e.is_user_facing() {
                eprintln!("  details: {}", config.logging.log_file().display());
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

// ============================================================================
// delegate
// ============================================================================

pub struct DelegateRequest {
    pub description: String,
    pub agents: PathBuf,
    pub agent: Option<String>,
    pub strategy: String,
    pub priority: i32,
    pub requires: Vec<String>,
}

pub async fn delegate(config: &ConduitConfig, request: DelegateRequest) -> anyhow::Result<ExitCode> {
    let strategy: DelegationStrategy = request.strategy.parse()?;
    let manager = build_manager(config, provider_registry(config), Some(&request.agents)).await?;

    let mut task = SubAgentTask::new(request.description).with_priority(request.priority);
    for capability in &request.requires {
        task = task.with_constraint(format!("{}{}", REQUIRES_PREFIX, capability));
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = match &request.agent {
        Some(name) => manager.execute(cancel.clone(), task, name).await,
        None => manager.delegate_with_strategy(cancel.clone(), task, strategy).await,
    };

    match result {
        Ok(result) => {
            println!("{}", result.output);
            eprintln!(
                "✓ {} in {:.1}s",
                result.agent_name,
                result.duration().as_secs_f64()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(_) if cancel.is_cancelled() => {
            println!("interrupted");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

// ============================================================================
// agents / validate
// ============================================================================

pub fn list_agents(path: &Path) -> anyhow::Result<ExitCode> {
    let agents = load_agents(path)?;
    if agents.is_empty() {
        println!("No sub-agents defined.");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<20} {:<10} {:<11} {:<8} CAPABILITIES",
        "NAME", "PROVIDER", "STRATEGY", "PRIORITY"
    );
    println!("{}", "-".repeat(72));
    for agent in &agents {
        let marker = match agent.validate() {
            Ok(()) => "",
            Err(_) => " (invalid)",
        };
        println!(
            "{:<20} {:<10} {:<11} {:<8} {}{}",
            agent.name,
            agent.provider,
            format!("{:?}", agent.strategy).to_lowercase(),
            agent.priority,
            agent.capabilities.join(", "),
            marker
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let workflow = match Workflow::load(path) {
        Ok(workflow) => workflow,
        Err(e) => {
            eprintln!("✗ {}: {}", path.display(), e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!(
        "✓ {}: {} agents, {} variables",
        workflow.name,
        workflow.agents.len(),
        workflow.variables.len()
    );
    for warning in unresolved_placeholders(&workflow) {
        println!("  warning: {}", warning);
    }
    Ok(ExitCode::SUCCESS)
}

/// Placeholders that nothing in the workflow will fill
fn unresolved_placeholders(workflow: &Workflow) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut earlier_outputs: Vec<&str> = Vec::new();

    for agent in &workflow.agents {
        for name in extract_variables(&agent.prompt) {
            let known = match name.strip_suffix(".output") {
                Some(id) => earlier_outputs.contains(&id),
                None => workflow.variable(&name).is_some(),
            };
            if !known {
                warnings.push(format!("agent '{}' references {{{{{}}}}}", agent.id, name));
            }
        }
        if agent.output.is_some() {
            earlier_outputs.push(agent.id.as_str());
        }
    }
    warnings
}

//! Conduit CLI - Main entry point

mod cli;
mod prompter;

use clap::{Parser, Subcommand};
use conduit_foundation::ConduitConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Conduit - drive interactive agent CLIs through multi-step workflows
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a workflow
    Run {
        /// Workflow definition (YAML or JSON)
        workflow: PathBuf,

        /// Variable value, repeatable
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = cli::parse_var)]
        vars: Vec<(String, String)>,

        /// Never ask to confirm variables
        #[arg(long)]
        no_prompt: bool,

        /// Sub-agent definitions for delegated steps
        #[arg(long)]
        agents: Option<PathBuf>,
    },
    /// Delegate a one-off task to a sub-agent
    Delegate {
        /// What the task is about
        description: String,

        /// Sub-agent definitions (YAML or JSON)
        #[arg(long)]
        agents: PathBuf,

        /// Run on this agent instead of routing
        #[arg(long)]
        agent: Option<String>,

        /// automatic, explicit or proactive
        #[arg(long, default_value = "automatic")]
        strategy: String,

        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        /// Required capability, repeatable
        #[arg(long = "require", value_name = "CAPABILITY")]
        requires: Vec<String>,
    },
    /// List sub-agents in a definition file
    Agents {
        file: PathBuf,
    },
    /// Check a workflow definition
    Validate {
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = ConduitConfig::load().unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config: {}", e);
        ConduitConfig::default()
    });

    init_logging(&config, args.debug);
    tracing::debug!("configuration loaded");

    match args.command {
        Command::Run {
            workflow,
            vars,
            no_prompt,
            agents,
        } => cli::run_workflow(&config, &workflow, vars, no_prompt, agents.as_deref()).await,
        Command::Delegate {
            description,
            agents,
            agent,
            strategy,
            priority,
            requires,
        } => {
            let request = cli::DelegateRequest {
                description,
                agents,
                agent,
                strategy,
                priority,
                requires,
            };
            cli::delegate(&config, request).await
        }
        Command::Agents { file } => cli::list_agents(&file),
        Command::Validate { workflow } => cli::validate(&workflow),
    }
}

/// Logs go to a file: agents own the terminal while a session runs
fn init_logging(config: &ConduitConfig, debug: bool) {
    let log_level = if debug {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };

    let path = config.logging.log_file();
    let writer = match open_log_file(&path) {
        Ok(file) => BoxMakeWriter::new(std::sync::Mutex::new(file)),
        Err(e) => {
            eprintln!("Warning: cannot open log file {}: {}", path.display(), e);
            BoxMakeWriter::new(std::io::sink)
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
}

fn open_log_file(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

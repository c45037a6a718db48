//! Provider descriptors
//!
//! One descriptor per agent CLI: how to find its binary, how to run it
//! non-interactively, and how to tell that its input prompt has rendered.
//! The Terminal Bridge, Readiness Detector and subagent runner all look a
//! provider up here once instead of branching on its name.

use crate::session::ReadinessRule;
use conduit_foundation::{Error, ProviderSettings, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Built-in provider ids
pub const PROVIDER_CLAUDE: &str = "claude";
pub const PROVIDER_GEMINI: &str = "gemini";
pub const PROVIDER_MOCK: &str = "mock";

/// Glyphs drawn around the input box of the agent TUIs
const INPUT_BOX_GLYPHS: &[&str] = &["│ >", "│ ❯"];

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How the interactive command is located
#[derive(Debug, Clone)]
pub enum CommandResolver {
    /// Binary looked up on `PATH`, with an optional fallback command
    Binary {
        name: String,
        fallback: Option<CommandSpec>,
    },
    /// Command used as-is
    Fixed(CommandSpec),
}

impl CommandResolver {
    fn resolve(&self, provider: &str) -> Result<CommandSpec> {
        match self {
            Self::Fixed(spec) => Ok(spec.clone()),
            Self::Binary { name, fallback } => {
                if let Ok(path) = which::which(name) {
                    return Ok(CommandSpec::new(path.to_string_lossy()));
                }
                if let Some(fallback) = fallback {
                    if which::which(&fallback.program).is_ok() {
                        debug!(provider, fallback = %fallback, "binary not found, using fallback");
                        return Ok(fallback.clone());
                    }
                }
                Err(Error::ProviderUnavailable(format!(
                    "'{}' not found on PATH (provider '{}')",
                    name, provider
                )))
            }
        }
    }
}

/// How a prompt is passed for a one-shot, non-interactive run
#[derive(Debug, Clone)]
pub enum BatchInvocation {
    /// Interactive binary plus `<flag> <prompt>`
    PromptFlag(String),
    /// Separate command with the prompt appended as last argument
    Command(CommandSpec),
}

/// Everything Conduit knows about one agent CLI
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub command: CommandResolver,
    /// Flag placed before the model name, if the CLI takes one
    pub model_flag: Option<String>,
    pub batch: BatchInvocation,
    pub readiness: ReadinessRule,
    /// Wait after readiness before the first keystroke
    pub settle_delay: Duration,
    /// Wait between typed characters
    pub keystroke_delay: Duration,
}

impl ProviderDescriptor {
    pub fn claude() -> Self {
        Self {
            id: PROVIDER_CLAUDE.to_string(),
            command: CommandResolver::Binary {
                name: "claude".to_string(),
                fallback: Some(CommandSpec::new("npx").arg("claude-code")),
            },
            model_flag: Some("--model".to_string()),
            batch: BatchInvocation::PromptFlag("-p".to_string()),
            readiness: ReadinessRule::glyphs(INPUT_BOX_GLYPHS),
            settle_delay: Duration::from_millis(800),
            keystroke_delay: Duration::from_millis(5),
        }
    }

    pub fn gemini() -> Self {
        Self {
            id: PROVIDER_GEMINI.to_string(),
            command: CommandResolver::Binary {
                name: "gemini".to_string(),
                fallback: None,
            },
            model_flag: Some("-m".to_string()),
            batch: BatchInvocation::PromptFlag("-p".to_string()),
            readiness: ReadinessRule::stripped_glyphs(INPUT_BOX_GLYPHS),
            settle_delay: Duration::from_millis(1500),
            keystroke_delay: Duration::from_millis(10),
        }
    }

    /// Echo pass-through used by tests and dry runs
    pub fn mock() -> Self {
        Self {
            id: PROVIDER_MOCK.to_string(),
            command: CommandResolver::Fixed(
                CommandSpec::new("sh")
                    .arg("-c")
                    .arg("printf 'mock> '; exec cat"),
            ),
            model_flag: None,
            batch: BatchInvocation::Command(CommandSpec::new("echo")),
            readiness: ReadinessRule::glyphs(&["mock>"]),
            settle_delay: Duration::ZERO,
            keystroke_delay: Duration::from_millis(1),
        }
    }

    /// Command that starts the interactive session
    pub fn interactive_command(&self, model: Option<&str>) -> Result<CommandSpec> {
        let mut spec = self.command.resolve(&self.id)?;
        self.push_model(&mut spec, model);
        Ok(spec)
    }

    /// Command that runs `prompt` once and prints the answer
    pub fn batch_command(&self, prompt: &str, model: Option<&str>) -> Result<CommandSpec> {
        match &self.batch {
            BatchInvocation::PromptFlag(flag) => {
                let mut spec = self.command.resolve(&self.id)?;
                self.push_model(&mut spec, model);
                Ok(spec.arg(flag.clone()).arg(prompt))
            }
            BatchInvocation::Command(spec) => Ok(spec.clone().arg(prompt)),
        }
    }

    fn push_model(&self, spec: &mut CommandSpec, model: Option<&str>) {
        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            if !model.is_empty() {
                spec.args.push(flag.clone());
                spec.args.push(model.to_string());
            }
        }
    }

    /// Apply a config override
    pub fn apply(&mut self, settings: &ProviderSettings) {
        if let Some(ms) = settings.settle_delay_ms {
            self.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.keystroke_delay_ms {
            self.keystroke_delay = Duration::from_millis(ms);
        }
        if let Some(command) = &settings.command {
            self.command =
                CommandResolver::Fixed(CommandSpec::new(command).args(settings.args.iter().cloned()));
        }
    }
}

/// Registry of provider descriptors keyed by id
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with `claude`, `gemini` and `mock`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ProviderDescriptor::claude());
        registry.register(ProviderDescriptor::gemini());
        registry.register(ProviderDescriptor::mock());
        registry
    }

    /// Apply config overrides; ids without a descriptor are ignored
    pub fn with_overrides(mut self, overrides: &HashMap<String, ProviderSettings>) -> Self {
        for (id, settings) in overrides {
            match self.providers.get_mut(id) {
                Some(descriptor) => descriptor.apply(settings),
                None => debug!(provider = %id, "override for unknown provider ignored"),
            }
        }
        self
    }

    /// Add or replace a descriptor
    pub fn register(&mut self, descriptor: ProviderDescriptor) {
        self.providers.insert(descriptor.id.clone(), descriptor);
    }

    /// Look a provider up; unknown ids are a configuration error
    pub fn get(&self, id: &str) -> Result<&ProviderDescriptor> {
        self.providers
            .get(id)
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown provider '{}' (known: {})",
                    id,
                    self.ids().join(", ")
                ))
            })
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

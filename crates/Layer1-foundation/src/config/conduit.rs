//! Conduit Config - merged global + project settings

use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Config file name in both stores
pub const CONDUIT_CONFIG_FILE: &str = "config.json";

/// Replace `target` when `other` differs from the default value
fn merge_field<T: PartialEq>(target: &mut T, other: T, default: T) {
    if other != default {
        *target = other;
    }
}

// ============================================================================
// Conduit Config
// ============================================================================

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConduitConfig {
    #[serde(default)]
    pub interrupt: InterruptSettings,

    #[serde(default)]
    pub session: SessionSettings,

    /// Per-provider overrides keyed by provider id
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,

    #[serde(default)]
    pub router: RouterWeights,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl ConduitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load global config, then merge the project config on top
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<ConduitConfig>(CONDUIT_CONFIG_FILE)? {
                debug!(path = %global.base_dir().display(), "merging global config");
                config.merge(global_config);
            }
        }

        if let Ok(project) = JsonStore::current_project() {
            if let Some(project_config) =
                project.load_optional::<ConduitConfig>(CONDUIT_CONFIG_FILE)?
            {
                debug!(path = %project.base_dir().display(), "merging project config");
                config.merge(project_config);
            }
        }

        Ok(config)
    }

    /// Load from a single store
    pub fn load_from(store: &JsonStore) -> Result<Self> {
        Ok(store
            .load_optional::<ConduitConfig>(CONDUIT_CONFIG_FILE)?
            .unwrap_or_default())
    }

    /// Merge another config into this one (`other` wins)
    pub fn merge(&mut self, other: ConduitConfig) {
        self.interrupt.merge(other.interrupt);
        self.session.merge(other.session);
        for (id, settings) in other.providers {
            self.providers
                .entry(id)
                .and_modify(|existing| existing.merge(settings.clone()))
                .or_insert(settings);
        }
        self.router.merge(other.router);
        self.logging.merge(other.logging);
    }
}

// ============================================================================
// Interrupt
// ============================================================================

/// Interrupt escalation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptSettings {
    /// Sliding window between consecutive interrupts
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Consecutive interrupts that abort the whole workflow
    #[serde(default = "default_abort_threshold")]
    pub abort_threshold: u32,
}

fn default_window_ms() -> u64 {
    1200
}

fn default_abort_threshold() -> u32 {
    3
}

impl Default for InterruptSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            abort_threshold: default_abort_threshold(),
        }
    }
}

impl InterruptSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn merge(&mut self, other: InterruptSettings) {
        merge_field(&mut self.window_ms, other.window_ms, default_window_ms());
        merge_field(
            &mut self.abort_threshold,
            other.abort_threshold,
            default_abort_threshold(),
        );
    }
}

// ============================================================================
// Session
// ============================================================================

/// Terminal session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    /// Fallback PTY rows when the real terminal size is unknown
    #[serde(default = "default_rows")]
    pub rows: u16,

    /// Fallback PTY columns
    #[serde(default = "default_cols")]
    pub cols: u16,

    /// Wait between interrupting the child and force-killing it
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Bytes of output kept for readiness detection
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,

    /// Pause between the last typed character and Enter
    #[serde(default = "default_submit_delay_ms")]
    pub submit_delay_ms: u64,
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    120
}

fn default_grace_period_ms() -> u64 {
    500
}

fn default_buffer_limit() -> usize {
    16 * 1024
}

fn default_submit_delay_ms() -> u64 {
    100
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            grace_period_ms: default_grace_period_ms(),
            buffer_limit: default_buffer_limit(),
            submit_delay_ms: default_submit_delay_ms(),
        }
    }
}

impl SessionSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_millis(self.submit_delay_ms)
    }

    fn merge(&mut self, other: SessionSettings) {
        merge_field(&mut self.rows, other.rows, default_rows());
        merge_field(&mut self.cols, other.cols, default_cols());
        merge_field(
            &mut self.grace_period_ms,
            other.grace_period_ms,
            default_grace_period_ms(),
        );
        merge_field(&mut self.buffer_limit, other.buffer_limit, default_buffer_limit());
        merge_field(
            &mut self.submit_delay_ms,
            other.submit_delay_ms,
            default_submit_delay_ms(),
        );
    }
}

// ============================================================================
// Provider overrides
// ============================================================================

/// Override for one provider descriptor; unset fields keep the built-in value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle_delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystroke_delay_ms: Option<u64>,

    /// Replace the interactive command entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl ProviderSettings {
    fn merge(&mut self, other: ProviderSettings) {
        if other.settle_delay_ms.is_some() {
            self.settle_delay_ms = other.settle_delay_ms;
        }
        if other.keystroke_delay_ms.is_some() {
            self.keystroke_delay_ms = other.keystroke_delay_ms;
        }
        if other.command.is_some() {
            self.command = other.command;
            self.args = other.args;
        }
    }
}

// ============================================================================
// Router weights
// ============================================================================

/// Weights used by the subagent router score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterWeights {
    #[serde(default = "default_priority_weight")]
    pub priority: f64,

    #[serde(default = "default_context_weight")]
    pub context_match: f64,

    #[serde(default = "default_capability_weight")]
    pub capability_match: f64,

    #[serde(default = "default_success_weight")]
    pub success_rate: f64,

    /// Weight of the inverse-latency bonus; the bonus never exceeds it
    #[serde(default = "default_latency_weight")]
    pub latency: f64,

    #[serde(default = "default_provider_bonus")]
    pub preferred_provider: f64,

    #[serde(default = "default_parallel_bonus")]
    pub parallel: f64,

    /// Task priority above which parallel-capable agents get the bonus
    #[serde(default = "default_parallel_threshold")]
    pub parallel_priority_threshold: i32,
}

fn default_priority_weight() -> f64 {
    0.1
}

fn default_context_weight() -> f64 {
    3.0
}

fn default_capability_weight() -> f64 {
    4.0
}

fn default_success_weight() -> f64 {
    2.0
}

fn default_latency_weight() -> f64 {
    1.0
}

fn default_provider_bonus() -> f64 {
    1.5
}

fn default_parallel_bonus() -> f64 {
    0.5
}

fn default_parallel_threshold() -> i32 {
    5
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            priority: default_priority_weight(),
            context_match: default_context_weight(),
            capability_match: default_capability_weight(),
            success_rate: default_success_weight(),
            latency: default_latency_weight(),
            preferred_provider: default_provider_bonus(),
            parallel: default_parallel_bonus(),
            parallel_priority_threshold: default_parallel_threshold(),
        }
    }
}

impl RouterWeights {
    fn merge(&mut self, other: RouterWeights) {
        merge_field(&mut self.priority, other.priority, default_priority_weight());
        merge_field(
            &mut self.context_match,
            other.context_match,
            default_context_weight(),
        );
        merge_field(
            &mut self.capability_match,
            other.capability_match,
            default_capability_weight(),
        );
        merge_field(&mut self.success_rate, other.success_rate, default_success_weight());
        merge_field(&mut self.latency, other.latency, default_latency_weight());
        merge_field(
            &mut self.preferred_provider,
            other.preferred_provider,
            default_provider_bonus(),
        );
        merge_field(&mut self.parallel, other.parallel, default_parallel_bonus());
        merge_field(
            &mut self.parallel_priority_threshold,
            other.parallel_priority_threshold,
            default_parallel_threshold(),
        );
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file; the terminal belongs to the agent while a session runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl LoggingSettings {
    /// Configured log file, or `<data_local_dir>/conduit/conduit.log`
    pub fn log_file(&self) -> PathBuf {
        self.file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("conduit")
                .join("conduit.log")
        })
    }

    fn merge(&mut self, other: LoggingSettings) {
        merge_field(&mut self.level, other.level, default_log_level());
        if other.file.is_some() {
            self.file = other.file;
        }
    }
}

//! Gridwarden configuration
//!
//! Loaded from TOML, then overridden from the environment (`GRIDWARDEN_*`,
//! with `.env` support). Every section has working defaults.

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Plan-driven engine settings
    pub engine: EngineConfig,

    /// Reactive loop settings
    pub reactive: ReactiveConfig,

    /// Validation settings
    pub validation: ValidationConfig,

    /// Ledger persistence settings
    pub ledger: LedgerConfig,

    /// Planner settings
    pub planner: PlannerConfig,
}

impl WardenConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine section
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set the reactive section
    pub fn with_reactive(mut self, reactive: ReactiveConfig) -> Self {
        self.reactive = reactive;
        self
    }

    /// Set the validation section
    pub fn with_validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| WardenError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Optional file, then `.env`, then `GRIDWARDEN_*` overrides, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "ignoring unreadable .env file");
            }
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GRIDWARDEN_*` overrides from a lookup function
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| WardenError::Config(format!("{} has an invalid value '{}'", key, raw)))
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parsed($key, raw)?;
                }
            };
        }

        override_field!("GRIDWARDEN_MAX_ITERATIONS", self.reactive.max_iterations);
        override_field!("GRIDWARDEN_TOOL_CALL_BUDGET", self.reactive.tool_call_budget);
        override_field!("GRIDWARDEN_MAX_REPLANS", self.engine.max_replan_attempts);
        override_field!("GRIDWARDEN_MAX_FIX_RETRIES", self.engine.max_fix_retries);
        override_field!("GRIDWARDEN_ROLLBACK_ON_FAILURE", self.engine.rollback_on_failure);
        override_field!("GRIDWARDEN_VALIDATION_ENABLED", self.validation.enabled);
        override_field!("GRIDWARDEN_BULK_DELETE_THRESHOLD", self.validation.bulk_delete_threshold);

        if let Some(dir) = lookup("GRIDWARDEN_LEDGER_DIR") {
            self.ledger.dir = Some(dir);
        }
        if let Some(url) = lookup("GRIDWARDEN_PLANNER_URL") {
            self.planner.base_url = url;
        }
        if let Some(model) = lookup("GRIDWARDEN_PLANNER_MODEL") {
            self.planner.model = model;
        }
        Ok(())
    }

    /// Reject settings the executors cannot work with
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.reactive.max_iterations == 0, "reactive.max_iterations must be at least 1"),
            (self.reactive.tool_call_budget == 0, "reactive.tool_call_budget must be at least 1"),
            (self.reactive.context_window == 0, "reactive.context_window must be at least 1"),
            (self.engine.max_tool_calls == 0, "engine.max_tool_calls must be at least 1"),
            (self.ledger.max_records == 0, "ledger.max_records must be at least 1"),
            (self.planner.timeout_secs == 0, "planner.timeout_secs must be at least 1"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(WardenError::Config(message.to_string())),
            None => Ok(()),
        }
    }
}

/// Plan-driven engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fix-and-retry attempts per step
    pub max_fix_retries: u32,

    /// Replans per task
    pub max_replan_attempts: u32,

    /// Roll back every applied operation when the task fails
    pub rollback_on_failure: bool,

    /// Read the first write's target before writing when the plan has no read
    pub forced_perception: bool,

    /// Hard cap on tool invocations per task
    pub max_tool_calls: u32,

    /// Characters of each completed step's output sent to the replanner
    pub replan_output_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fix_retries: 3,
            max_replan_attempts: 3,
            rollback_on_failure: true,
            forced_perception: true,
            max_tool_calls: 100,
            replan_output_chars: 500,
        }
    }
}

/// Reactive loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactiveConfig {
    /// Think/act/observe iterations
    pub max_iterations: u32,

    /// Tool invocations
    pub tool_call_budget: u32,

    /// Context entries kept (the request is pinned on top)
    pub context_window: usize,

    /// Characters kept per context entry
    pub entry_max_chars: usize,

    /// Non-actionable turns in a row before asking the user
    pub idle_threshold: u32,

    /// Tool failures in a row before giving up
    pub tool_failure_threshold: u32,

    /// Treat prose mentioning completion as a completion
    pub loose_text_completion: bool,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            tool_call_budget: 20,
            context_window: 20,
            entry_max_chars: 2000,
            idle_threshold: 3,
            tool_failure_threshold: 3,
            loose_text_completion: false,
        }
    }
}

/// Validation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Global switch
    pub enabled: bool,

    /// Rule ids to disable
    pub disabled_rules: Vec<String>,

    /// Rule ids downgraded from block to warn
    pub downgraded_rules: Vec<String>,

    /// Rows a single delete may remove without confirmation
    pub bulk_delete_threshold: u32,

    /// Occurrences of one message that fail the task
    pub max_identical_errors: u32,

    /// Validation failures in a row that fail the task
    pub max_consecutive_failures: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_rules: Vec::new(),
            downgraded_rules: Vec::new(),
            bulk_delete_threshold: 100,
            max_identical_errors: 2,
            max_consecutive_failures: 3,
        }
    }
}

/// Ledger persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory for file-backed ledgers; `None` disables persistence
    pub dir: Option<String>,

    /// Most recent records kept per task
    pub max_records: usize,

    /// Records older than this are dropped on load
    pub retention_hours: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_records: 200,
            retention_hours: 24 * 7,
        }
    }
}

/// Planner settings (used by HTTP gateways)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// OpenAI-compatible base URL
    pub base_url: String,

    /// Model name
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Request timeout
    pub timeout_secs: u64,

    /// Output token limit
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Consecutive failures that open the circuit breaker
    pub failure_threshold: u32,

    /// Seconds before an open breaker lets one request through
    pub reset_timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "GRIDWARDEN_API_KEY".to_string(),
            timeout_secs: 60,
            max_tokens: 2048,
            temperature: 0.0,
            failure_threshold: 3,
            reset_timeout_secs: 30,
        }
    }
}

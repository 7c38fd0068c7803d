//! Error types for Gridwarden Core
//!
//! Every failure the engine can observe is one variant of [`WardenError`].
//! Tool handlers and planner gateways talk `anyhow` at their trait boundary;
//! the engine folds those into this taxonomy before deciding what to do.

use thiserror::Error;

/// Result type alias for Gridwarden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Main error type for Gridwarden operations
#[derive(Error, Debug)]
pub enum WardenError {
    /// No tool is registered under the requested name
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// A tool returned an error or panicked
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecutionFailure {
        /// Tool name
        tool: String,
        /// Normalized error message
        message: String,
    },

    /// A block-severity validation rule failed
    #[error("Validation blocked by '{rule_id}': {message}")]
    ValidationBlock {
        /// Rule identifier
        rule_id: String,
        /// Rule message
        message: String,
    },

    /// A warn-severity validation rule failed
    #[error("Validation warning from '{rule_id}': {message}")]
    ValidationWarn {
        /// Rule identifier
        rule_id: String,
        /// Rule message
        message: String,
    },

    /// The planner response could not be parsed, even after repair
    #[error("Planner response could not be parsed: {0}")]
    PlannerParseFailure(String),

    /// The planner gateway itself failed (transport, provider, breaker)
    #[error("Planner unavailable: {0}")]
    PlannerUnavailable(String),

    /// A hard iteration or tool-call budget was exhausted
    #[error("Budget exceeded: {kind} limit of {limit} reached")]
    BudgetExceeded {
        /// Which budget ran out
        kind: BudgetKind,
        /// Configured limit
        limit: u32,
    },

    /// The replanner gave up
    #[error("Could not recover after {attempts} replan attempts")]
    ReplanExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Some operations could not be reversed
    #[error("Rollback partially failed for {failed} operation(s): {details:?}")]
    RollbackPartialFailure {
        /// Number of operations that could not be reversed
        failed: usize,
        /// One message per failure
        details: Vec<String>,
    },

    /// Structurally invalid plan
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Invalid parameters or arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The external resource rejected a read or write
    #[error("Resource error: {0}")]
    Resource(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        /// Added context
        context: String,
        /// Wrapped error
        source: Box<WardenError>,
    },
}

/// Budget families enforced by the executors
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    /// Reactive-loop iterations
    Iterations,
    /// Tool invocations
    ToolCalls,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetKind::Iterations => write!(f, "iteration"),
            BudgetKind::ToolCalls => write!(f, "tool-call"),
        }
    }
}

impl WardenError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Terminal errors end the task; they are never retried
    pub fn is_terminal(&self) -> bool {
        match self {
            WardenError::BudgetExceeded { .. } | WardenError::ReplanExhausted { .. } => true,
            WardenError::WithContext { source, .. } => source.is_terminal(),
            _ => false,
        }
    }

    /// Stable short name used in failure reports and logs
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::ToolNotFound(_) => "tool_not_found",
            WardenError::ToolExecutionFailure { .. } => "tool_execution_failure",
            WardenError::ValidationBlock { .. } => "validation_block",
            WardenError::ValidationWarn { .. } => "validation_warn",
            WardenError::PlannerParseFailure(_) => "planner_parse_failure",
            WardenError::PlannerUnavailable(_) => "planner_unavailable",
            WardenError::BudgetExceeded { .. } => "budget_exceeded",
            WardenError::ReplanExhausted { .. } => "replan_exhausted",
            WardenError::RollbackPartialFailure { .. } => "rollback_partial_failure",
            WardenError::InvalidPlan(_) => "invalid_plan",
            WardenError::InvalidInput(_) => "invalid_input",
            WardenError::Resource(_) => "resource",
            WardenError::Config(_) => "config",
            WardenError::Serialization(_) => "serialization",
            WardenError::Io(_) => "io",
            WardenError::WithContext { source, .. } => source.kind(),
        }
    }
}

impl From<toml::de::Error> for WardenError {
    fn from(e: toml::de::Error) -> Self {
        WardenError::Config(e.to_string())
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let err = WardenError::ToolNotFound("write_range".to_string());
        let err = err.context("Failed to invoke step 3");

        assert!(err.to_string().contains("Failed to invoke step 3"));
        assert_eq!(err.kind(), "tool_not_found");
    }

    #[test]
    fn test_result_ext() {
        let result: Result<()> = Err(WardenError::InvalidInput("empty range".into()));
        let result = result.with_context(|| "Parsing step parameters".to_string());

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Parsing step parameters"));
    }

    #[test]
    fn test_terminal_errors() {
        let budget = WardenError::BudgetExceeded {
            kind: BudgetKind::ToolCalls,
            limit: 20,
        };
        assert!(budget.is_terminal());
        assert!(budget.context("reactive loop").is_terminal());
        assert!(WardenError::ReplanExhausted { attempts: 3 }.is_terminal());
        assert!(!WardenError::PlannerParseFailure("eof".into()).is_terminal());
    }
}

//! Tool contract
//!
//! Tools are independent implementations of one interface, looked up by name.
//! Each tool describes itself with [`ToolMetadata`] so the engine can decide
//! whether to snapshot, how to verify a write, and what to fall back to.

mod registry;

pub use registry::{ToolInvoker, ToolRegistry};

use crate::resource::{CellRange, RegionRef};
use crate::types::{param_str, Params};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized result of a tool invocation. Never mutated after return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    /// Whether the tool reports success
    pub success: bool,
    /// Human-readable output
    pub output: String,
    /// Structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolInvocationResult {
    /// Successful result with text output
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
            error: None,
        }
    }

    /// Successful result with structured data
    pub fn ok_with_data(output: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(output)
        }
    }

    /// Failed result
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: String::new(),
            data: None,
            error: Some(error),
        }
    }

    /// Error text, or a placeholder when the tool gave none
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "tool reported failure without a message".to_string())
    }
}

/// What a tool does to the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEffect {
    /// No side effects
    Read,
    /// Mutates content
    Write,
    /// Removes content or structure
    Destructive,
}

impl ToolEffect {
    /// Whether the effect mutates the resource
    pub fn is_mutating(&self) -> bool {
        !matches!(self, ToolEffect::Read)
    }
}

/// Which parameters name the region a tool touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSpec {
    /// No addressable target
    None,
    /// A range inside a sheet
    Range {
        /// Parameter holding the sheet name
        sheet_param: &'static str,
        /// Parameter holding the A1 range
        range_param: &'static str,
    },
    /// A whole sheet
    Sheet {
        /// Parameter holding the sheet name
        sheet_param: &'static str,
    },
}

/// Resolved target of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Range target
    Region(RegionRef),
    /// Sheet target
    Sheet(String),
}

impl Target {
    /// Sheet the target lives on
    pub fn sheet(&self) -> &str {
        match self {
            Target::Region(region) => &region.sheet,
            Target::Sheet(sheet) => sheet,
        }
    }
}

impl TargetSpec {
    /// Resolve against concrete parameters; `None` if parameters are missing or malformed
    pub fn resolve(&self, params: &Params) -> Option<Target> {
        match self {
            TargetSpec::None => None,
            TargetSpec::Range {
                sheet_param,
                range_param,
            } => {
                let sheet = param_str(params, sheet_param)?;
                let range = CellRange::parse(param_str(params, range_param)?).ok()?;
                Some(Target::Region(RegionRef::new(sheet, range)))
            }
            TargetSpec::Sheet { sheet_param } => {
                param_str(params, sheet_param).map(|s| Target::Sheet(s.to_string()))
            }
        }
    }
}

/// How the engine confirms a write is observable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyKind {
    /// Trust the tool
    None,
    /// Re-read values equal the matrix in this parameter
    ValuesMatch {
        /// Parameter holding the values matrix
        values_param: &'static str,
    },
    /// Every target cell carries a formula
    FormulaPresent,
    /// Every target cell is empty
    Cleared,
    /// Target state differs from the pre-write snapshot
    Changed,
    /// The target sheet exists
    SheetExists,
}

/// A tool call expressed as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name
    pub tool: String,
    /// Parameters
    pub input: Params,
}

impl ToolCall {
    /// Create a call
    pub fn new(tool: impl Into<String>, input: Params) -> Self {
        Self {
            tool: tool.into(),
            input,
        }
    }
}

/// Degraded alternative for the same intent
#[derive(Debug, Clone, Copy)]
pub struct AlternateTool {
    /// Alternate tool name
    pub tool: &'static str,
    /// Adapt the original parameters for the alternate tool
    pub adapt: fn(&Params) -> Option<Params>,
}

/// Builds the inverse call for a mutating tool from its input
pub type CompensationBuilder = fn(&Params) -> Option<ToolCall>;

/// Self-description of a tool
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    /// Unique tool name
    pub name: String,
    /// One-line description (shown to the planner)
    pub description: String,
    /// Side-effect class
    pub effect: ToolEffect,
    /// Target parameters
    pub target: TargetSpec,
    /// Post-write verification
    pub verify: VerifyKind,
    /// Degraded fallback
    pub alternate: Option<AlternateTool>,
    /// Inverse call used when no snapshot can be captured
    pub compensation: Option<CompensationBuilder>,
}

impl ToolMetadata {
    /// Read-only tool with no target
    pub fn read(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            effect: ToolEffect::Read,
            target: TargetSpec::None,
            verify: VerifyKind::None,
            alternate: None,
            compensation: None,
        }
    }

    /// Mutating tool with no target
    pub fn write(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            effect: ToolEffect::Write,
            ..Self::read(name, description)
        }
    }

    /// Set the effect
    pub fn with_effect(mut self, effect: ToolEffect) -> Self {
        self.effect = effect;
        self
    }

    /// Set the target
    pub fn with_target(mut self, target: TargetSpec) -> Self {
        self.target = target;
        self
    }

    /// Set the verification kind
    pub fn with_verify(mut self, verify: VerifyKind) -> Self {
        self.verify = verify;
        self
    }

    /// Set the alternate tool
    pub fn with_alternate(mut self, alternate: AlternateTool) -> Self {
        self.alternate = Some(alternate);
        self
    }

    /// Set the compensation builder
    pub fn with_compensation(mut self, builder: CompensationBuilder) -> Self {
        self.compensation = Some(builder);
        self
    }

    /// Whether the tool mutates the resource
    pub fn is_mutating(&self) -> bool {
        self.effect.is_mutating()
    }
}

/// A named operation against the resource.
///
/// Returning `Err` (or panicking) is treated exactly like returning a result
/// with `success = false`; the invoker normalizes all three.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Self-description
    fn metadata(&self) -> ToolMetadata;

    /// Perform the operation
    async fn execute(&self, input: &Params) -> anyhow::Result<ToolInvocationResult>;
}

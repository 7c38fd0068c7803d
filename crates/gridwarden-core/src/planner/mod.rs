//! Planner gateway
//!
//! The planner is an external text-in/text-out service. This module defines the
//! gateway contract, a scripted gateway for tests and offline runs, and the
//! lenient parsers that turn planner text into plans and next-step decisions.

pub mod repair;

use crate::error::{Result, WardenError};
use crate::plan::{ExecutionPlan, PlanStep};
use crate::tool::{ToolEffect, ToolMetadata};
use crate::types::{params_from, Params};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

pub use repair::{lenient_json, Repair};

/// Requested response shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Machine-readable JSON
    Json,
    /// Free text
    Text,
}

/// One planner call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerRequest {
    /// User-side message
    pub message: String,
    /// System prompt
    pub system_prompt: String,
    /// Expected response shape
    pub response_format: ResponseFormat,
}

impl PlannerRequest {
    /// JSON-format request
    pub fn json(system_prompt: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            system_prompt: system_prompt.into(),
            response_format: ResponseFormat::Json,
        }
    }
}

/// Planner answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerResponse {
    /// Raw text
    pub message: String,
    /// The provider stopped because of its output limit
    #[serde(default)]
    pub truncated: bool,
}

impl PlannerResponse {
    /// Complete response
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            truncated: false,
        }
    }
}

/// Text-in/text-out planner service
#[async_trait]
pub trait PlannerGateway: Send + Sync {
    /// Send one request
    async fn complete(&self, request: PlannerRequest) -> anyhow::Result<PlannerResponse>;
}

/// Gateway replaying canned responses in order
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    responses: Mutex<VecDeque<PlannerResponse>>,
    requests: Mutex<Vec<PlannerRequest>>,
}

impl ScriptedPlanner {
    /// Planner that answers with these texts, in order
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(PlannerResponse::new).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue another response
    pub fn push(&self, response: impl Into<String>) {
        self.responses.lock().push_back(PlannerResponse::new(response));
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<PlannerRequest> {
        self.requests.lock().clone()
    }

    /// Responses not yet consumed
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl PlannerGateway for ScriptedPlanner {
    async fn complete(&self, request: PlannerRequest) -> anyhow::Result<PlannerResponse> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted planner has no responses left"))
    }
}

/// Wire shape of a plan step; camelCase with snake_case aliases
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    order: Option<Value>,
    #[serde(default, alias = "tool")]
    action: Option<String>,
    #[serde(default, alias = "input", alias = "params")]
    parameters: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "is_write_operation")]
    is_write_operation: bool,
    #[serde(default, alias = "success_condition")]
    success_condition: Option<String>,
    #[serde(default, alias = "depends_on")]
    depends_on: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    steps: Vec<Value>,
    #[serde(default, alias = "success_conditions")]
    success_conditions: Vec<String>,
    #[serde(default, alias = "completion_message")]
    completion_message: Option<String>,
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(format!("step-{}", n)),
        _ => None,
    }
}

/// Result of a lenient plan parse
#[derive(Debug, Clone)]
pub struct ParsedPlan {
    /// The plan
    pub plan: ExecutionPlan,
    /// Repairs applied to the text
    pub repairs: Vec<Repair>,
    /// Descriptions of steps dropped for lacking an action
    pub dropped: Vec<String>,
}

/// Parse planner text into a plan.
///
/// Steps are sorted by their declared order. Steps without an action are
/// dropped. Numeric ids and dependencies are mapped to `step-N`.
pub fn parse_plan(text: &str) -> Result<ParsedPlan> {
    let (value, repairs) = lenient_json(text).map_err(WardenError::PlannerParseFailure)?;
    for repair in &repairs {
        tracing::info!(repair = %repair, "planner output needed repair");
    }
    let raw: RawPlan = serde_json::from_value(value)
        .map_err(|e| WardenError::PlannerParseFailure(format!("not a plan object: {}", e)))?;

    let mut dropped = Vec::new();
    let mut indexed: Vec<(u32, usize, PlanStep)> = Vec::new();
    for (position, raw_step) in raw.steps.into_iter().enumerate() {
        let parsed: RawStep = serde_json::from_value(raw_step.clone()).unwrap_or_default();
        let action = match parsed.action.as_deref().map(str::trim) {
            Some(action) if !action.is_empty() => action.to_string(),
            _ => {
                let what = parsed
                    .description
                    .clone()
                    .unwrap_or_else(|| raw_step.to_string());
                tracing::warn!(step = %what, "dropping planner step without an action");
                dropped.push(what);
                continue;
            }
        };
        let order = parsed
            .order
            .as_ref()
            .and_then(|o| match o {
                Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(position as u32 + 1);
        let mut step = PlanStep::new(
            order,
            action,
            parsed.parameters.map(params_from).unwrap_or_default(),
        );
        if let Some(id) = parsed.id.as_ref().and_then(id_text) {
            step.id = id;
        }
        step.description = parsed.description.unwrap_or_default();
        step.is_write_operation = parsed.is_write_operation;
        step.success_condition = parsed.success_condition;
        step.depends_on = parsed.depends_on.iter().filter_map(id_text).collect();
        indexed.push((order, position, step));
    }
    indexed.sort_by_key(|(order, position, _)| (*order, *position));

    let mut plan = ExecutionPlan {
        intent: raw.intent.unwrap_or_default(),
        steps: indexed.into_iter().map(|(_, _, step)| step).collect(),
        success_conditions: raw.success_conditions,
        completion_message: raw.completion_message.unwrap_or_default(),
    };
    plan.renumber();

    Ok(ParsedPlan {
        plan,
        repairs,
        dropped,
    })
}

/// Next move proposed to the reactive loop
#[derive(Debug, Clone, PartialEq)]
pub enum NextDecision {
    /// Invoke a tool
    ToolCall {
        /// Tool name
        tool: String,
        /// Parameters
        input: Params,
    },
    /// Say something without finishing
    Respond(String),
    /// The request is satisfied
    Complete(String),
    /// Ask the user
    AskUser(String),
}

/// Parse a reactive-loop turn; `None` when nothing actionable was found
pub fn parse_decision(text: &str) -> Option<NextDecision> {
    let (value, repairs) = lenient_json(text).ok()?;
    if !repairs.is_empty() {
        tracing::debug!(repairs = repairs.len(), "reactive turn needed repair");
    }
    let obj = value.as_object()?;
    let text_of = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    };
    let tool = text_of(&["tool", "tool_name", "toolName"]);
    let action = text_of(&["action", "type"]).map(|a| a.to_lowercase());

    match action.as_deref() {
        Some("complete") | Some("done") | Some("finish") => Some(NextDecision::Complete(
            text_of(&["message", "summary"]).unwrap_or_default(),
        )),
        Some("respond") | Some("message") => {
            text_of(&["message", "text"]).map(NextDecision::Respond)
        }
        Some("ask_user") | Some("clarify") => {
            text_of(&["question", "message"]).map(NextDecision::AskUser)
        }
        _ => {
            let tool = tool.or_else(|| action.clone().filter(|a| a != "tool_call"))?;
            let input = ["input", "parameters", "params", "arguments"]
                .iter()
                .find_map(|k| obj.get(*k).cloned())
                .map(params_from)
                .unwrap_or_default();
            Some(NextDecision::ToolCall { tool, input })
        }
    }
}

fn catalog_lines(catalog: &[ToolMetadata]) -> String {
    catalog
        .iter()
        .map(|t| {
            format!(
                "- {} [{}]: {}",
                t.name,
                match t.effect {
                    ToolEffect::Read => "read",
                    ToolEffect::Write => "write",
                    ToolEffect::Destructive => "destructive",
                },
                t.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// System prompt asking for a whole plan
pub fn plan_prompt(catalog: &[ToolMetadata]) -> String {
    format!(
        "You plan operations on a spreadsheet. Available tools:\n{}\n\n\
         Answer with JSON only: {{\"intent\": string, \"steps\": [{{\"id\": string, \"order\": number, \
         \"action\": tool, \"parameters\": object, \"description\": string, \"isWriteOperation\": bool, \
         \"successCondition\": string, \"dependsOn\": [id]}}], \"completionMessage\": string}}",
        catalog_lines(catalog)
    )
}

/// System prompt asking for one next move
pub fn step_prompt(catalog: &[ToolMetadata]) -> String {
    format!(
        "You operate a spreadsheet one action at a time. Available tools:\n{}\n\n\
         Answer with JSON only, one of: {{\"action\": \"tool_call\", \"tool\": name, \"input\": object}}, \
         {{\"action\": \"respond\", \"message\": text}}, {{\"action\": \"ask_user\", \"question\": text}}, \
         {{\"action\": \"complete\", \"message\": summary}}",
        catalog_lines(catalog)
    )
}

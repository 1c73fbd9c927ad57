//! Callback tool catalogue and dispatch
//!
//! Tool failures never become RPC errors. They come back as a result with
//! `isError: true` and a message the agent can act on, so it can fix its
//! expression and call again.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::rpc::RpcError;
use super::state::ServerState;
use crate::eval;
use crate::metrics::{EVAL_DURATION, RATE_LIMITED_TOTAL, TOOL_CALLS_TOTAL};
use crate::protocol::Mode;

pub const TOOL_EVAL: &str = "eval";
pub const TOOL_SET_RESULT: &str = "set_result";
pub const TOOL_FAIL_IMPLEMENTATION: &str = "fail_implementation";

const RETRY_HINT: &str = "Please fix the errors and call set_result again with a valid function.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Payload of a `tools/call` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text".to_string(),
                text: text.into(),
            }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// All text content joined by newlines
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Tools offered to the agent in the given mode
pub fn tool_definitions(mode: Mode) -> Vec<ToolDefinition> {
    let mut tools = vec![ToolDefinition {
        name: TOOL_EVAL.to_string(),
        description: "Evaluates an expression against the live host context and returns its value. \
            Context entries are available by name and through `context`. Registered host functions \
            can be called, `print(...)` output is captured and returned, and `set(name, value)` \
            updates a context entry."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "function": {
                    "type": "string",
                    "description": "Expression to evaluate, e.g. \"context['someVar']\" or \"len(items)\""
                }
            },
            "required": ["function"]
        }),
    }];

    if mode == Mode::Implement {
        tools.push(ToolDefinition {
            name: TOOL_SET_RESULT.to_string(),
            description: "Sets the final result of the implementation. This tool MUST be called with \
                your completed implementation before finishing. The expression's value is validated \
                against the expected schema; on a validation error, fix it and call again."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "function": {
                        "type": "string",
                        "description": "Expression producing the result, e.g. \"lambda context: {sorted: sort(context.input_array, true)}\""
                    }
                },
                "required": ["function"]
            }),
        });
        tools.push(ToolDefinition {
            name: TOOL_FAIL_IMPLEMENTATION.to_string(),
            description: "Call this tool if you cannot fulfill the implementation request. Provide a \
                clear reason; the caller receives it as the invocation's error."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Clear explanation of why the implementation cannot be completed"
                    }
                },
                "required": ["reason"]
            }),
        });
    }

    tools
}

/// Run one tool call
///
/// Only malformed arguments produce an `Err`; everything else, including
/// unknown tools, is a [`ToolResult`].
pub async fn call_tool(state: &ServerState, name: &str, arguments: &Value) -> Result<ToolResult, RpcError> {
    let known = matches!(name, TOOL_EVAL | TOOL_SET_RESULT | TOOL_FAIL_IMPLEMENTATION);
    let label = if known { name } else { "unknown" };

    if let Err(limited) = state.limiter().check() {
        RATE_LIMITED_TOTAL.inc();
        TOOL_CALLS_TOTAL.with_label_values(&[label, "rate_limited"]).inc();
        warn!(invocation_id = %state.invocation_id(), tool = name, "Callback rate limited");
        return Ok(ToolResult::error(format!("Error: {}", limited)));
    }

    let result = match name {
        TOOL_EVAL => run_eval(state, required_str(arguments, "function")?).await,
        TOOL_SET_RESULT if state.mode() == Mode::Implement => {
            run_set_result(state, required_str(arguments, "function")?).await
        }
        TOOL_FAIL_IMPLEMENTATION if state.mode() == Mode::Implement => {
            let reason = arguments
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("No reason provided");
            run_fail(state, reason)
        }
        TOOL_SET_RESULT | TOOL_FAIL_IMPLEMENTATION => ToolResult::error(format!(
            "Error: {} tool not available (not in implement mode)",
            name
        )),
        other => ToolResult::error(format!("Unknown tool: {}", other)),
    };

    let outcome = if result.is_error { "error" } else { "ok" };
    TOOL_CALLS_TOTAL.with_label_values(&[label, outcome]).inc();
    info!(
        invocation_id = %state.invocation_id(),
        tool = name,
        is_error = result.is_error,
        "Callback tool call"
    );

    Ok(result)
}

fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("missing string argument `{}`", key)))
}

async fn evaluate_locked(
    state: &ServerState,
    tool: &str,
    source: &str,
) -> Result<eval::Evaluation, eval::EvalError> {
    let started = Instant::now();
    let mut table = state.table().lock().await;
    let outcome = eval::evaluate(source, &mut table).await;
    drop(table);
    EVAL_DURATION
        .with_label_values(&[tool])
        .observe(started.elapsed().as_secs_f64());
    debug!(tool, source, ok = outcome.is_ok(), "Evaluated callback expression");
    outcome
}

async fn run_eval(state: &ServerState, source: &str) -> ToolResult {
    match evaluate_locked(state, TOOL_EVAL, source).await {
        Ok(evaluation) => {
            let mut body = json!({ "result": evaluation.value });
            if !evaluation.output.is_empty() {
                body["capturedOutput"] = Value::String(evaluation.output);
            }
            let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
            ToolResult::text(text)
        }
        Err(e) => ToolResult::error(format!("Error during eval: {}", e)),
    }
}

async fn run_set_result(state: &ServerState, source: &str) -> ToolResult {
    if state.outcome().is_decided() {
        return ToolResult::error(
            "Error: the outcome of this invocation was already recorded; this call was ignored.",
        );
    }
    let Some(validator) = state.validator().cloned() else {
        return ToolResult::error("Error: no result schema is configured for this invocation");
    };

    let evaluation = match evaluate_locked(state, TOOL_SET_RESULT, source).await {
        Ok(evaluation) => evaluation,
        Err(e) => return ToolResult::error(format!("Error: {}\n\n{}", e, RETRY_HINT)),
    };

    let validated = match validator.validate(&evaluation.value) {
        Ok(validated) => validated,
        Err(e) => {
            info!(invocation_id = %state.invocation_id(), error = %e, "Result rejected by schema");
            return ToolResult::error(format!("Error: {}\n\n{}", e, RETRY_HINT));
        }
    };

    if state.record_result(validated) {
        info!(invocation_id = %state.invocation_id(), "Result recorded");
        ToolResult::text("Result set successfully and validated against schema.")
    } else {
        ToolResult::error("Error: the outcome of this invocation was already recorded; this call was ignored.")
    }
}

fn run_fail(state: &ServerState, reason: &str) -> ToolResult {
    if state.record_failure(reason) {
        info!(invocation_id = %state.invocation_id(), reason, "Implementation failure recorded");
        ToolResult::text(format!("Implementation failure recorded: {}", reason))
    } else {
        ToolResult::error("Error: a result was already set for this invocation; the failure was not recorded.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{serialize_context, Context};
    use crate::schema::JsonSchemaValidator;
    use crate::server::state::ResultSlot;
    use std::sync::Arc;

    fn implement_state() -> ServerState {
        let context = Context::new().with_value("input_array", &vec![3, 1, 2]);
        let (table, _) = serialize_context(&context);
        let schema = json!({
            "type": "object",
            "properties": {"sorted": {"type": "array", "items": {"type": "integer"}}},
            "required": ["sorted"]
        });
        ServerState::new("inv-test", Mode::Implement, table)
            .with_validator(Arc::new(JsonSchemaValidator::new(schema)))
    }

    #[test]
    fn test_catalogue_by_mode() {
        let names = |mode| {
            tool_definitions(mode)
                .into_iter()
                .map(|t| t.name)
                .collect::<Vec<_>>()
        };
        assert_eq!(names(Mode::Investigate), vec!["eval"]);
        assert_eq!(names(Mode::Implement), vec!["eval", "set_result", "fail_implementation"]);
    }

    #[tokio::test]
    async fn test_eval_reports_value_and_output() {
        let state = implement_state();
        let result = call_tool(&state, "eval", &json!({"function": "print('n'); len(input_array)"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        let body: Value = serde_json::from_str(&result.joined_text()).unwrap();
        assert_eq!(body["result"], 3);
        assert_eq!(body["capturedOutput"], "n\n");
    }

    #[tokio::test]
    async fn test_eval_error_is_payload() {
        let state = implement_state();
        let result = call_tool(&state, "eval", &json!({"function": "missing + 1"}))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.joined_text().starts_with("Error during eval:"));
    }

    #[tokio::test]
    async fn test_set_result_validates_then_sticks() {
        let state = implement_state();

        let bad = call_tool(&state, "set_result", &json!({"function": "{sorted: 'nope'}"}))
            .await
            .unwrap();
        assert!(bad.is_error);
        assert!(bad.joined_text().contains("call set_result again"));
        assert_eq!(state.outcome(), ResultSlot::Empty);

        let good = call_tool(
            &state,
            "set_result",
            &json!({"function": "lambda context: {sorted: sort(context.input_array, true)}"}),
        )
        .await
        .unwrap();
        assert!(!good.is_error, "{}", good.joined_text());
        assert_eq!(state.outcome(), ResultSlot::Set(json!({"sorted": [3, 2, 1]})));

        let late = call_tool(&state, "fail_implementation", &json!({"reason": "changed my mind"}))
            .await
            .unwrap();
        assert!(late.is_error);
        assert_eq!(state.outcome(), ResultSlot::Set(json!({"sorted": [3, 2, 1]})));
    }

    #[tokio::test]
    async fn test_set_result_enforces_length_constraints() {
        let schema = json!({
            "type": "object",
            "properties": {
                "sorted": {"type": "array", "minItems": 1, "items": {"type": "integer"}},
                "label": {"type": "string", "minLength": 3}
            },
            "required": ["sorted", "label"]
        });
        let state = ServerState::new("inv-test", Mode::Implement, Default::default())
            .with_validator(Arc::new(JsonSchemaValidator::new(schema)));

        let short = call_tool(&state, "set_result", &json!({"function": "{sorted: [1], label: ''}"}))
            .await
            .unwrap();
        assert!(short.is_error);
        assert!(short.joined_text().contains("$.label"));

        let empty = call_tool(&state, "set_result", &json!({"function": "{sorted: [], label: 'abc'}"}))
            .await
            .unwrap();
        assert!(empty.is_error);
        assert_eq!(state.outcome(), ResultSlot::Empty);

        let ok = call_tool(&state, "set_result", &json!({"function": "{sorted: [1], label: 'abc'}"}))
            .await
            .unwrap();
        assert!(!ok.is_error, "{}", ok.joined_text());
    }

    #[tokio::test]
    async fn test_implement_tools_hidden_in_investigate() {
        let state = ServerState::new("inv", Mode::Investigate, Default::default());
        let result = call_tool(&state, "fail_implementation", &json!({"reason": "x"}))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.joined_text().contains("not in implement mode"));
        assert_eq!(state.outcome(), ResultSlot::Empty);
    }

    #[tokio::test]
    async fn test_missing_argument_is_invalid_params() {
        let state = implement_state();
        let err = call_tool(&state, "eval", &json!({})).await.unwrap_err();
        assert_eq!(err.code, crate::server::rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_rate_limited_call() {
        let state = implement_state().with_rate_limit(1, 0.001);
        let first = call_tool(&state, "eval", &json!({"function": "1"})).await.unwrap();
        assert!(!first.is_error);
        let second = call_tool(&state, "eval", &json!({"function": "1"})).await.unwrap();
        assert!(second.is_error);
        assert!(second.joined_text().contains("retry after"));
    }
}

//! End-to-end invocation tests
//!
//! Each test runs a whole invocation against the `mock_agent` binary: real
//! callback server, real child process, real status stream.

use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use agentbridge::{
    Bridge, BridgeConfig, CapturedError, Context, InvocationError, ResultHandle, StatusMessage,
};

#[derive(Debug)]
struct ZeroDivisionError;

impl fmt::Display for ZeroDivisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "division by zero")
    }
}

impl std::error::Error for ZeroDivisionError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
struct SortResult {
    sorted: Vec<i64>,
}

fn bridge(scenario: &str) -> Bridge {
    Bridge::new(
        BridgeConfig::default()
            .with_agent(env!("CARGO_BIN_EXE_mock_agent"))
            .with_env("MOCK_AGENT_SCENARIO", scenario)
            .with_timeout(Duration::from_secs(30)),
    )
}

fn sort_context() -> Context {
    Context::new().with_value("input_array", &vec![64, 34, 25, 12, 22, 11, 90])
}

fn kinds<T>(handle: &ResultHandle<T>) -> Vec<&'static str>
where
    T: Clone + Send + Sync + 'static,
{
    handle.events().iter().map(StatusMessage::kind).collect()
}

/// Scenario A: an investigation with an error in context yields analysis text
#[tokio::test]
async fn test_investigate_error_yields_analysis() {
    let context = Context::new()
        .with_value("x", &5)
        .with_value("y", &0)
        .with("error", CapturedError::capture(&ZeroDivisionError));

    let handle = bridge("investigate").investigate(context, None).await.unwrap();
    let analysis = handle.clone().await.unwrap();

    assert!(!analysis.trim().is_empty());
    assert!(analysis.contains("x is 5"));
    assert!(analysis.contains("y is 0"));
    assert!(analysis.contains("division by zero"));
    assert!(analysis.contains("Message: division by zero"));

    let summary = handle.summary().await.unwrap();
    assert_eq!(summary.turns, 2);
    assert_eq!(summary.tool_calls_count, 3);
}

/// Scenario A, failure branch: a nonzero exit surfaces as "exit code"
#[tokio::test]
async fn test_agent_crash_reports_exit_code() {
    let context = Context::new().with_value("x", &5).with_value("y", &0);
    let handle = bridge("crash").investigate(context, None).await.unwrap();

    let err = handle.result().await.unwrap_err();
    assert_eq!(err, InvocationError::AgentExited { code: 3 });
    assert!(err.to_string().contains("exit code"));
    assert!(kinds(&handle).contains(&"log"));
}

/// Scenario B: implement resolves to the validated, typed result
#[tokio::test]
async fn test_implement_sorts_descending() {
    let handle = bridge("sort")
        .implement::<SortResult>("sort descending", sort_context(), None)
        .await
        .unwrap();

    let result = handle.await.unwrap();
    assert_eq!(
        result,
        SortResult {
            sorted: vec![90, 64, 34, 25, 22, 12, 11]
        }
    );
}

/// A rejected set_result can be retried with a corrected expression
#[tokio::test]
async fn test_implement_retry_after_validation_error() {
    let handle = bridge("retry")
        .implement::<SortResult>("sort descending", sort_context(), None)
        .await
        .unwrap();

    let result = handle.result().await.unwrap();
    assert_eq!(result.sorted, vec![90, 64, 34, 25, 22, 12, 11]);

    let previews: Vec<String> = handle
        .events()
        .into_iter()
        .filter_map(|event| match event {
            StatusMessage::ToolResult(m) => Some(m.result_preview),
            _ => None,
        })
        .collect();
    assert_eq!(previews.len(), 2);
    assert!(previews[0].contains("call set_result again"));
    assert!(previews[1].contains("Result set successfully"));
}

/// Scenario C: fail_implementation surfaces the agent's reason
#[tokio::test]
async fn test_fail_implementation_reason() {
    let handle = bridge("fail")
        .implement::<SortResult>("sort descending", Context::new(), None)
        .await
        .unwrap();

    let err = handle.result().await.unwrap_err();
    assert!(matches!(err, InvocationError::ImplementationFailed(_)));
    assert!(err.to_string().contains("no data provided"));
}

/// An agent that never calls set_result fails the invocation
#[tokio::test]
async fn test_result_not_set() {
    let handle = bridge("silent")
        .implement::<SortResult>("sort descending", sort_context(), None)
        .await
        .unwrap();

    assert_eq!(handle.result().await.unwrap_err(), InvocationError::ResultNotSet);
    assert_eq!(handle.summary().await.unwrap_err(), InvocationError::NoSummary);
}

/// Scenario D: a late subscriber still sees server_started, then everything in order
#[tokio::test]
async fn test_status_stream_replays_from_start() {
    let context = Context::new().with_value("x", &5).with_value("y", &0);
    let handle = bridge("investigate").investigate(context, None).await.unwrap();

    // server_started is recorded before the handle is returned
    assert_eq!(kinds(&handle).first(), Some(&"server_started"));

    handle.result().await.unwrap();
    let streamed: Vec<&'static str> = handle
        .status_stream()
        .map(|event| event.kind())
        .collect()
        .await;
    assert_eq!(
        streamed,
        vec![
            "server_started",
            "log",
            "turn",
            "tool_call",
            "tool_result",
            "tool_call",
            "tool_result",
            "turn",
            "summary",
        ]
    );
}

/// A subscriber attached while the agent runs sees the same events as a late one
#[tokio::test]
async fn test_live_subscriber_matches_log() {
    let context = Context::new().with_value("x", &5).with_value("y", &0);
    let handle = bridge("investigate").investigate(context, None).await.unwrap();

    let live = tokio::spawn({
        let handle = handle.clone();
        async move { handle.status_stream().collect::<Vec<_>>().await }
    });
    handle.result().await.unwrap();

    let live = live.await.unwrap();
    assert_eq!(live, handle.events());
}

/// Non-JSON status lines are dropped; unrecognised JSON objects are kept
#[tokio::test]
async fn test_garbage_status_lines_are_dropped() {
    let handle = bridge("garbage").investigate(Context::new(), None).await.unwrap();

    assert_eq!(handle.result().await.unwrap(), "done");
    assert_eq!(kinds(&handle), vec!["server_started", "log", "other", "log", "summary"]);

    // The summary line carries nulls and still counts as a summary
    let summary = handle.summary().await.unwrap();
    assert_eq!(summary.finish_reason, "");
    assert_eq!(summary.cost, 0.0);
}

/// The callback port is released once the invocation resolves
#[tokio::test]
async fn test_port_released_after_completion() {
    let handle = bridge("silent").investigate(Context::new(), None).await.unwrap();
    handle.result().await.unwrap();

    let url = match handle.events().first() {
        Some(StatusMessage::ServerStarted(m)) => m.url.clone(),
        other => panic!("expected server_started, got {:?}", other),
    };
    let addr = url
        .trim_start_matches("http://")
        .trim_end_matches("/mcp")
        .to_string();
    assert!(tokio::net::TcpListener::bind(addr.as_str()).await.is_ok());
}

/// Cancelling kills the agent and fails the handle
#[tokio::test]
async fn test_cancel_stops_agent() {
    let handle = bridge("slow").investigate(Context::new(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .expect("cancelled invocation resolves promptly");
    assert_eq!(outcome.unwrap_err(), InvocationError::Cancelled);
    assert!(handle.is_done());
}

/// A configured timeout fails the invocation
#[tokio::test]
async fn test_timeout() {
    let bridge = Bridge::new(
        BridgeConfig::default()
            .with_agent(env!("CARGO_BIN_EXE_mock_agent"))
            .with_env("MOCK_AGENT_SCENARIO", "slow")
            .with_timeout(Duration::from_millis(300)),
    );
    let handle = bridge.investigate(Context::new(), None).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .expect("timed out invocation resolves promptly");
    assert!(matches!(outcome, Err(InvocationError::TimedOut(_))));
}

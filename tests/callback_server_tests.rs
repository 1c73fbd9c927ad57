//! Callback server tests over real HTTP
//!
//! The server is started on an ephemeral port and driven with the same
//! `CallbackClient` an agent would use.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use agentbridge::client::{CallbackClient, ClientError};
use agentbridge::context::{serialize_context, Context, ContextCallable};
use agentbridge::protocol::Mode;
use agentbridge::schema::JsonSchemaValidator;
use agentbridge::server::{CallbackServer, ResultSlot, ServerState};

fn sort_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"sorted": {"type": "array", "items": {"type": "integer"}}},
        "required": ["sorted"]
    })
}

async fn start(mode: Mode, context: Context) -> CallbackServer {
    let (table, _) = serialize_context(&context);
    let mut state = ServerState::new("inv-http", mode, table);
    if mode == Mode::Implement {
        state = state.with_validator(Arc::new(JsonSchemaValidator::new(sort_schema())));
    }
    CallbackServer::start("127.0.0.1", 0, Arc::new(state))
        .await
        .expect("callback server starts")
}

fn payload(text: &str) -> Value {
    serde_json::from_str(text).expect("eval result is JSON")
}

/// Test that the tool catalogue depends on the mode
#[tokio::test]
async fn test_list_tools_by_mode() {
    let server = start(Mode::Investigate, Context::new()).await;
    let client = CallbackClient::new(server.url());
    let names: Vec<String> = client.list_tools().await.unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["eval"]);
    server.close().await;

    let server = start(Mode::Implement, Context::new()).await;
    let client = CallbackClient::new(server.url());
    let names: Vec<String> = client.list_tools().await.unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["eval", "set_result", "fail_implementation"]);
    server.close().await;
}

/// Test that eval reads live values and calls sync and async host functions
#[tokio::test]
async fn test_eval_reads_and_calls_host() {
    let context = Context::new()
        .with_value("user", &json!({"name": "ada", "roles": ["admin", "dev"]}))
        .with(
            "double",
            ContextCallable::new(|args| {
                let n = args.first().and_then(Value::as_i64).ok_or("double() takes a number")?;
                Ok(Value::from(n * 2))
            }),
        )
        .with(
            "lookup",
            ContextCallable::new_async(|args| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, String>(json!({"id": args.first().cloned().unwrap_or(Value::Null)}))
            }),
        );
    let server = start(Mode::Investigate, context).await;
    let client = CallbackClient::new(server.url());

    let result = client.eval("context['user']['roles'][-1]").await.unwrap();
    assert!(!result.is_error);
    assert_eq!(payload(&result.joined_text())["result"], "dev");

    let result = client.eval("double(21)").await.unwrap();
    assert_eq!(payload(&result.joined_text())["result"], 42);

    let result = client.eval("lookup(7).id").await.unwrap();
    assert_eq!(payload(&result.joined_text())["result"], 7);

    server.close().await;
}

/// Test that set() changes are visible to later calls
#[tokio::test]
async fn test_eval_mutations_persist() {
    let server = start(Mode::Investigate, Context::new().with_value("retries", &1)).await;
    let client = CallbackClient::new(server.url());

    let result = client.eval("set('retries', retries + 2); print('bumped'); retries").await.unwrap();
    let body = payload(&result.joined_text());
    assert_eq!(body["result"], 3);
    assert_eq!(body["capturedOutput"], "bumped\n");

    let result = client.eval("retries").await.unwrap();
    assert_eq!(payload(&result.joined_text())["result"], 3);

    server.close().await;
}

/// Test that eval failures come back as tool errors, not transport errors
#[tokio::test]
async fn test_eval_error_is_tool_payload() {
    let server = start(Mode::Investigate, Context::new().with_value("x", &5)).await;
    let client = CallbackClient::new(server.url());

    let result = client.eval("x / 0").await.unwrap();
    assert!(result.is_error);
    assert!(result.joined_text().contains("Error during eval: division by zero"));

    let result = client.eval("x +").await.unwrap();
    assert!(result.is_error);
    assert!(result.joined_text().contains("syntax error"));

    server.close().await;
}

/// Test that the first decision wins between set_result and fail_implementation
#[tokio::test]
async fn test_result_slot_is_monotone() {
    let server = start(Mode::Implement, Context::new().with_value("input_array", &vec![1, 3, 2])).await;
    let client = CallbackClient::new(server.url());

    let ok = client.set_result("{sorted: sort(input_array, true)}").await.unwrap();
    assert!(!ok.is_error);
    assert_eq!(ok.joined_text(), "Result set successfully and validated against schema.");

    let again = client.set_result("{sorted: []}").await.unwrap();
    assert!(again.is_error);
    let fail = client.fail_implementation("too late").await.unwrap();
    assert!(fail.is_error);

    assert_eq!(server.outcome(), ResultSlot::Set(json!({"sorted": [3, 2, 1]})));
    server.close().await;
}

/// Test that concurrent set_result and fail_implementation cannot both win
#[tokio::test]
async fn test_concurrent_decisions_single_winner() {
    let server = start(Mode::Implement, Context::new().with_value("input_array", &vec![2, 1])).await;
    let client = Arc::new(CallbackClient::new(server.url()));

    let set = tokio::spawn({
        let client = client.clone();
        async move { client.set_result("{sorted: input_array}").await }
    });
    let fail = tokio::spawn({
        let client = client.clone();
        async move { client.fail_implementation("gave up").await }
    });
    let set = set.await.unwrap().unwrap();
    let fail = fail.await.unwrap().unwrap();

    assert!(set.is_error != fail.is_error, "exactly one call wins");
    match server.outcome() {
        ResultSlot::Set(value) => {
            assert!(!set.is_error);
            assert_eq!(value, json!({"sorted": [2, 1]}));
        }
        ResultSlot::Failed(reason) => {
            assert!(!fail.is_error);
            assert_eq!(reason, "gave up");
        }
        ResultSlot::Empty => panic!("no decision recorded"),
    }
    server.close().await;
}

/// Test that unknown methods are RPC errors
#[tokio::test]
async fn test_unknown_method() {
    let server = start(Mode::Investigate, Context::new()).await;
    let url = server.url().to_string();

    let response: Value = reqwest::Client::new()
        .post(&url)
        .json(&json!({"jsonrpc": "2.0", "id": 9, "method": "prompts/list"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["id"], 9);
    assert_eq!(response["error"]["code"], -32601);

    server.close().await;
}

/// Test the health endpoint
#[tokio::test]
async fn test_health() {
    let server = start(Mode::Implement, Context::new()).await;
    let health_url = server.url().replace("/mcp", "/health");

    let body: Value = reqwest::get(&health_url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["invocationId"], "inv-http");
    assert_eq!(body["mode"], "implement");

    server.close().await;
}

/// Test that a closed server refuses connections
#[tokio::test]
async fn test_closed_server_refuses() {
    let server = start(Mode::Investigate, Context::new()).await;
    let client = CallbackClient::new(server.url());
    server.close().await;

    let err = client.eval("1").await.unwrap_err();
    assert!(matches!(err, ClientError::Http(_)));
}

/// Test that dropping the guard also releases the port
#[tokio::test]
async fn test_drop_releases_port() {
    let server = start(Mode::Investigate, Context::new()).await;
    let addr = server.local_addr();
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tokio::net::TcpListener::bind(addr).await.is_ok());
}

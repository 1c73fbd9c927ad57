//! Per-invocation callback server
//!
//! The agent reaches back into the host over this endpoint:
//!
//! ```text
//! agent ── POST /mcp {"method":"tools/call","params":{"name":"eval",...}} ──►
//!        ┌──────────────────────────────────────────────┐
//!        │ CallbackServer (127.0.0.1, ephemeral port)   │
//!        │   rate limit → tool dispatch → ServerState   │
//!        │     eval ─────────► ContextTable (locked)    │
//!        │     set_result ───► schema → ResultSlot      │
//!        │     fail_impl ────► ResultSlot               │
//!        └──────────────────────────────────────────────┘
//! ```
//!
//! One server is started per invocation and torn down when its
//! [`CallbackServer`] guard is closed or dropped.

pub mod rpc;
pub mod state;
pub mod tools;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use rpc::{RpcError, RpcRequest, RpcResponse, INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR};
pub use state::{ResultSlot, ServerState};
pub use tools::{tool_definitions, ToolContent, ToolDefinition, ToolResult};

/// Path of the RPC endpoint
pub const MCP_PATH: &str = "/mcp";

/// Protocol revision reported by `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// How long `close` waits for in-flight requests before aborting
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ServerError {
    /// The listener could not be bound
    Bind { addr: String, source: std::io::Error },
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => write!(f, "Failed to bind callback server on {}: {}", addr, source),
            ServerError::Io(e) => write!(f, "Callback server IO error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CallbackServer
// ═══════════════════════════════════════════════════════════════════════════
// Owns the listening task. Dropping the guard stops accepting connections and
// releases the port, so every exit path of an invocation tears it down.
//
// USAGE:
//   let server = CallbackServer::start("127.0.0.1", 0, state).await?;
//   spawn_agent(server.url());
//   ...
//   let outcome = server.outcome();
//   server.close().await;
// ═══════════════════════════════════════════════════════════════════════════

pub struct CallbackServer {
    url: String,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind `host:port` (port 0 for an ephemeral port) and start serving
    pub async fn start(host: &str, port: u16, state: Arc<ServerState>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: format!("{}:{}", host, port),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let url = format!("http://{}{}", local_addr, MCP_PATH);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state.clone());
        let span = info_span!(
            "callback_server",
            invocation_id = %state.invocation_id(),
            %local_addr,
            otel.name = "callback_server"
        );
        let task = tokio::spawn(
            async move {
                let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                });
                if let Err(e) = server.await {
                    warn!(error = %e, "Callback server stopped with error");
                }
                debug!("Callback server stopped");
            }
            .instrument(span),
        );

        info!(
            invocation_id = %state.invocation_id(),
            mode = %state.mode(),
            url = %url,
            "Callback server listening"
        );

        Ok(Self {
            url,
            local_addr,
            state,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// URL handed to the agent, e.g. `http://127.0.0.1:41234/mcp`
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn outcome(&self) -> ResultSlot {
        self.state.outcome()
    }

    /// Stop accepting, let in-flight requests finish, release the port
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!(url = %self.url, "Callback server did not drain in time, aborting");
                task.abort();
            }
        }
        info!(url = %self.url, "Callback server closed");
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Routes for one invocation
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(MCP_PATH, post(handle_rpc))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "invocationId": state.invocation_id(),
        "mode": state.mode(),
    }))
}

#[derive(Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

async fn handle_rpc(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            let error = RpcError::new(PARSE_ERROR, format!("Parse error: {}", e));
            return Json(RpcResponse::failure(Value::Null, error)).into_response();
        }
    };
    let request: RpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            let error = RpcError::new(INVALID_REQUEST, format!("Invalid request: {}", e));
            return Json(RpcResponse::failure(Value::Null, error)).into_response();
        }
    };

    if request.is_notification() {
        debug!(method = %request.method, "Notification received");
        return StatusCode::ACCEPTED.into_response();
    }

    let span = info_span!(
        "callback_request",
        invocation_id = %state.invocation_id(),
        method = %request.method,
        otel.name = "callback_request"
    );
    let id = request.id.clone().unwrap_or(Value::Null);
    let response = match dispatch(&state, &request).instrument(span).await {
        Ok(result) => RpcResponse::success(id, result),
        Err(error) => RpcResponse::failure(id, error),
    };
    Json(response).into_response()
}

async fn dispatch(state: &ServerState, request: &RpcRequest) -> Result<Value, RpcError> {
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "agentbridge", "version": env!("CARGO_PKG_VERSION") },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_definitions(state.mode()) })),
        "tools/call" => {
            let params: CallParams = serde_json::from_value(request.params.clone())
                .map_err(|e| RpcError::invalid_params(format!("Invalid tools/call params: {}", e)))?;
            let result = tools::call_tool(state, &params.name, &params.arguments).await?;
            serde_json::to_value(result).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

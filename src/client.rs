//! Agent-side helpers
//!
//! [`CallbackClient`] speaks the callback server's RPC envelope and
//! [`StatusEmitter`] writes status lines in the format the host parses.
//! Agents written in Rust (and the test agent in `src/bin/mock_agent.rs`) use
//! them instead of hand-building JSON.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use crate::protocol::{
    now_timestamp, StatusMessage, Summary, ToolCallMessage, ToolResultMessage, TurnMessage,
};
use crate::server::rpc::{RpcError, RpcRequest, RpcResponse};
use crate::server::{ToolDefinition, ToolResult};

#[derive(Debug)]
pub enum ClientError {
    /// Transport failure or non-2xx status
    Http(reqwest::Error),
    /// The server answered with an RPC error
    Rpc(RpcError),
    /// The result did not have the expected shape
    Decode(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Http(e) => write!(f, "Callback request failed: {}", e),
            ClientError::Rpc(e) => write!(f, "Callback server error: {}", e),
            ClientError::Decode(msg) => write!(f, "Unexpected callback response: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(e)
    }
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        ClientError::Rpc(e)
    }
}

/// Client for one invocation's callback URL
pub struct CallbackClient {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl CallbackClient {
    /// `url` is the `callbackUrl` from the invocation request
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&RpcRequest::new(id, method, params))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.into_result()?)
    }

    pub async fn initialize(&self) -> Result<Value, ClientError> {
        self.request("initialize", json!({ "clientInfo": { "name": "agentbridge-client" } }))
            .await
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ClientError> {
        let result = self.request("tools/list", json!({})).await?;
        serde_json::from_value(result["tools"].clone()).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult, ClientError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        serde_json::from_value(result).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub async fn eval(&self, expression: &str) -> Result<ToolResult, ClientError> {
        self.call_tool("eval", json!({ "function": expression })).await
    }

    pub async fn set_result(&self, expression: &str) -> Result<ToolResult, ClientError> {
        self.call_tool("set_result", json!({ "function": expression })).await
    }

    pub async fn fail_implementation(&self, reason: &str) -> Result<ToolResult, ClientError> {
        self.call_tool("fail_implementation", json!({ "reason": reason }))
            .await
    }
}

/// Writes newline-delimited status JSON
pub struct StatusEmitter<W> {
    writer: W,
}

impl StatusEmitter<io::Stderr> {
    /// Emitter on the process's stderr, where the host reads status
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write> StatusEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one message as a single line and flush
    pub fn emit(&mut self, message: &StatusMessage) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    pub fn log(&mut self, message: impl Into<String>) -> io::Result<()> {
        self.emit(&StatusMessage::log(message))
    }

    pub fn turn(&mut self, turn_number: u32, stop_reason: Option<&str>) -> io::Result<()> {
        self.emit(&StatusMessage::Turn(TurnMessage {
            turn_number,
            stop_reason: stop_reason.map(String::from),
            timestamp: now_timestamp(),
        }))
    }

    pub fn tool_call(&mut self, tool_name: &str, input: Value) -> io::Result<()> {
        self.emit(&StatusMessage::ToolCall(ToolCallMessage {
            tool_name: tool_name.to_string(),
            input,
            timestamp: now_timestamp(),
        }))
    }

    /// The preview is cut to 200 characters
    pub fn tool_result(&mut self, tool_name: &str, result: &str) -> io::Result<()> {
        self.emit(&StatusMessage::ToolResult(ToolResultMessage {
            tool_name: tool_name.to_string(),
            result_preview: result.chars().take(200).collect(),
            timestamp: now_timestamp(),
        }))
    }

    pub fn summary(&mut self, summary: Summary) -> io::Result<()> {
        let summary = Summary {
            timestamp: if summary.timestamp.is_empty() {
                now_timestamp()
            } else {
                summary.timestamp
            },
            ..summary
        };
        self.emit(&StatusMessage::Summary(summary))
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

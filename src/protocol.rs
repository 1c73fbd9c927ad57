//! Wire types shared between the host and the agent process
//!
//! The host writes one [`InvocationRequest`] to the agent's stdin. The agent
//! writes newline-delimited [`StatusMessage`] objects to stderr and its final
//! text to stdout.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Which kind of work the agent is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Diagnose an error and answer with free text
    Investigate,
    /// Produce a structured result that matches a schema
    Implement,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Investigate => "investigate",
            Mode::Implement => "implement",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location in the call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    pub function_name: String,
}

/// Metadata describing one context variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub name: String,
    #[serde(rename = "type", alias = "runtimeType")]
    pub runtime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The single JSON object written to the agent's stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub mode: Mode,
    pub callback_url: String,
    pub call_stack: Vec<StackFrame>,
    pub context: Vec<ContextEntry>,
    pub timestamp: String,
    pub pid: u32,
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

/// Free-form log line from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
}

/// Emitted by the host once the callback server is listening
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStartedMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
}

/// A completed model turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub turn_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
}

/// The agent invoked one of its tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
}

/// A tool call returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub result_preview: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
}

/// Final summary statistics for an invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Summary {
    #[serde(deserialize_with = "null_as_default")]
    pub turns: u32,
    #[serde(deserialize_with = "null_as_default")]
    pub cost: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub finish_reason: String,
    #[serde(deserialize_with = "null_as_default")]
    pub input_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub output_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub total_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub reasoning_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub cached_input_tokens: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub tool_calls_count: u32,
    #[serde(deserialize_with = "null_as_default")]
    pub warnings: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: String,
}

/// One structured progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    Log(LogMessage),
    ServerStarted(ServerStartedMessage),
    Turn(TurnMessage),
    ToolCall(ToolCallMessage),
    ToolResult(ToolResultMessage),
    Summary(Summary),
    /// A JSON object with an unknown or ill-typed shape, kept as received.
    /// Never serialized back to the wire.
    #[serde(skip)]
    Other(Map<String, Value>),
}

impl StatusMessage {
    /// The wire tag of this message (`"log"`, `"summary"`, ...)
    pub fn kind(&self) -> &'static str {
        match self {
            StatusMessage::Log(_) => "log",
            StatusMessage::ServerStarted(_) => "server_started",
            StatusMessage::Turn(_) => "turn",
            StatusMessage::ToolCall(_) => "tool_call",
            StatusMessage::ToolResult(_) => "tool_result",
            StatusMessage::Summary(_) => "summary",
            StatusMessage::Other(_) => "other",
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            StatusMessage::Log(m) => &m.timestamp,
            StatusMessage::ServerStarted(m) => &m.timestamp,
            StatusMessage::Turn(m) => &m.timestamp,
            StatusMessage::ToolCall(m) => &m.timestamp,
            StatusMessage::ToolResult(m) => &m.timestamp,
            StatusMessage::Summary(m) => &m.timestamp,
            StatusMessage::Other(m) => m.get("timestamp").and_then(Value::as_str).unwrap_or(""),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        StatusMessage::Log(LogMessage {
            message: message.into(),
            timestamp: now_timestamp(),
        })
    }

    pub fn server_started(url: impl Into<String>) -> Self {
        StatusMessage::ServerStarted(ServerStartedMessage {
            url: url.into(),
            timestamp: now_timestamp(),
        })
    }

    /// Parse one status line
    ///
    /// Blank lines and lines that are not a JSON object yield `None`. An
    /// object that does not fit a known message becomes [`StatusMessage::Other`].
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Value::Object(object) = serde_json::from_str::<Value>(line).ok()? else {
            return None;
        };
        match serde_json::from_value(Value::Object(object.clone())) {
            Ok(message) => Some(message),
            Err(_) => Some(StatusMessage::Other(object)),
        }
    }
}

/// `null` and absent fields both read as the type's default
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Current UTC time as an RFC 3339 string with a `Z` suffix
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

//! Host values that can be handed to an invocation

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::stack;

/// Result of calling a host function from the callback server
pub type CallResult = Result<Value, String>;

type HostFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, CallResult> + Send + Sync>;

/// An error captured for diagnosis
///
/// Rust errors do not carry a trace, so the backtrace is taken at the point
/// the error is captured.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedError {
    type_name: String,
    message: String,
    trace: Option<String>,
}

impl CapturedError {
    /// Capture an error together with its source chain and a backtrace
    pub fn capture<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self {
            type_name: short_type_name(std::any::type_name::<E>()),
            message: error_chain(error),
            trace: Some(std::backtrace::Backtrace::force_capture().to_string()),
        }
    }

    /// Capture a boxed error whose concrete type is unknown
    pub fn capture_dyn(error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            type_name: "Error".to_string(),
            message: error_chain(error),
            trace: Some(std::backtrace::Backtrace::force_capture().to_string()),
        }
    }

    /// Build an error record by hand, without a trace
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// Attach backtrace text (in `Backtrace` display format)
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Raw backtrace text, if one was captured
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    /// The trace restricted to application frames, formatted for reading
    pub fn formatted_trace(&self) -> Option<String> {
        let frames = stack::extract_call_stack(Some(self), 0);
        if self.trace.is_none() || frames.is_empty() {
            return None;
        }
        Some(stack::format_frames(&frames))
    }

    /// JSON view used when an expression reads this value
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "type": self.type_name,
            "message": self.message,
            "trace": self.formatted_trace(),
        })
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for CapturedError {}

/// A host function the agent may call from an expression
#[derive(Clone)]
pub struct ContextCallable {
    func: HostFn,
}

impl ContextCallable {
    /// Wrap a synchronous function
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> CallResult + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self {
            func: Arc::new(move |args| {
                let result = func(args);
                async move { result }.boxed()
            }),
        }
    }

    /// Wrap an asynchronous function
    pub fn new_async<F, Fut>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |args| func(args).boxed()),
        }
    }

    pub async fn call(&self, args: Vec<Value>) -> CallResult {
        (self.func)(args).await
    }
}

impl fmt::Debug for ContextCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextCallable")
    }
}

/// A live host value
#[derive(Debug, Clone)]
pub enum ContextValue {
    /// Plain data
    Data(Value),
    /// An error to diagnose
    Error(CapturedError),
    /// A host function
    Callable(ContextCallable),
    /// A value that could not be represented as data; keeps its type name
    Opaque(String),
}

impl ContextValue {
    /// Convert any serializable value; values that fail to serialize become opaque
    pub fn data<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => ContextValue::Data(v),
            Err(_) => ContextValue::Opaque(short_type_name(std::any::type_name::<T>())),
        }
    }

    /// Runtime type label sent to the agent
    pub fn runtime_type(&self) -> String {
        match self {
            ContextValue::Data(v) => json_type_name(v).to_string(),
            ContextValue::Error(e) => e.type_name().to_string(),
            ContextValue::Callable(_) => "function".to_string(),
            ContextValue::Opaque(_) => "object".to_string(),
        }
    }

    /// JSON view of the value for expressions
    pub fn to_json(&self) -> Value {
        match self {
            ContextValue::Data(v) => v.clone(),
            ContextValue::Error(e) => e.to_json(),
            ContextValue::Callable(_) => Value::String("<function>".to_string()),
            ContextValue::Opaque(name) => Value::String(format!("<{}>", name)),
        }
    }
}

impl From<Value> for ContextValue {
    fn from(value: Value) -> Self {
        ContextValue::Data(value)
    }
}

impl From<CapturedError> for ContextValue {
    fn from(error: CapturedError) -> Self {
        ContextValue::Error(error)
    }
}

impl From<ContextCallable> for ContextValue {
    fn from(callable: ContextCallable) -> Self {
        ContextValue::Callable(callable)
    }
}

/// A context value with an optional description for the agent
#[derive(Debug, Clone)]
pub struct ContextItem {
    pub value: ContextValue,
    pub description: Option<String>,
}

impl ContextItem {
    pub fn new(value: impl Into<ContextValue>) -> Self {
        Self {
            value: value.into(),
            description: None,
        }
    }

    pub fn described(value: impl Into<ContextValue>, description: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            description: Some(description.into()),
        }
    }
}

impl From<ContextValue> for ContextItem {
    fn from(value: ContextValue) -> Self {
        ContextItem::new(value)
    }
}

impl From<Value> for ContextItem {
    fn from(value: Value) -> Self {
        ContextItem::new(value)
    }
}

impl From<CapturedError> for ContextItem {
    fn from(error: CapturedError) -> Self {
        ContextItem::new(error)
    }
}

impl From<ContextCallable> for ContextItem {
    fn from(callable: ContextCallable) -> Self {
        ContextItem::new(callable)
    }
}

/// JSON type label for a data value
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `alloc::string::String` -> `String`, `my::Wrapper<my::Inner>` -> `Wrapper`
fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Message of an error followed by its `source()` chain
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(&format!("\ncaused by: {}", cause));
        source = cause.source();
    }
    message
}

//! agentbridge - hand host problems to an external agent process
//!
//! A host application gives an agent an error to diagnose or a task to
//! implement against a schema. The agent runs as a separate process, sees
//! only metadata about host values, and calls back over a local endpoint to
//! inspect live state through a restricted expression language.
//!
//! # Modules
//!
//! - `agent` - invocation orchestration and the agent subprocess
//! - `context` - host values and their wire metadata
//! - `stack` - call stack extraction from backtraces
//! - `server` - per-invocation callback server (JSON-RPC over HTTP)
//! - `eval` - the expression language callbacks are written in
//! - `schema` - result validation against JSON schemas
//! - `handle` - the awaitable result handle and its status stream
//! - `client` - agent-side callback client and status emitter
//! - `security` - child process hardening and callback rate limiting
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - console and OpenTelemetry tracing setup
//!
//! # Quick Start
//!
//! ```ignore
//! use agentbridge::{Bridge, BridgeConfig, CapturedError, Context};
//!
//! let bridge = Bridge::new(BridgeConfig::from_env()?);
//! let context = Context::new()
//!     .with_value("x", &5)
//!     .with_value("y", &0)
//!     .with("error", CapturedError::capture(&err));
//!
//! let handle = bridge.investigate(context, None).await?;
//! let analysis = handle.await?;
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod context;
pub mod eval;
pub mod handle;
pub mod metrics;
pub mod protocol;
pub mod schema;
pub mod security;
pub mod server;
pub mod stack;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{implement, investigate, Bridge, InvocationError};
pub use config::{BridgeConfig, ConfigError};
pub use context::{CapturedError, Context, ContextCallable, ContextItem, ContextValue};
pub use handle::ResultHandle;
pub use protocol::{Mode, StackFrame, StatusMessage, Summary};
pub use schema::{JsonSchemaValidator, SchemaValidator, TypedSchema, ValidationError};

//! Running the external agent
//!
//! # Architecture
//!
//! ```text
//! Bridge::investigate / implement
//!        │  serialize_context + call stack
//!        ▼
//! CallbackServer::start ──► callback URL
//!        │
//!        ▼
//! AgentProcessClient::spawn ── stdin: InvocationRequest JSON
//!        │
//!        ├── stderr: status lines ──► ResultHandle events (live)
//!        ├── stdout: final text
//!        │        ▲
//!        │        └── agent ⇄ POST /mcp (eval, set_result, fail_implementation)
//!        ▼
//! exit ──► ResultSlot + exit code ──► CallbackServer::close ──► ResultHandle resolves
//! ```

pub mod controller;
pub mod process;

pub use controller::{implement, investigate, Bridge, InvocationError};
pub use process::{AgentCommand, AgentOutput, AgentProcessClient, ProcessError, RunningAgent};

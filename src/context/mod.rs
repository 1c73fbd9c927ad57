//! Host context handed to an invocation
//!
//! A [`Context`] holds named host values. Before the agent starts, it is split
//! in two by [`serialize_context`]:
//!
//! ```text
//! Context ──┬──► ContextTable      (live values, stays in the host,
//! │         │                       read and mutated by callback tools)
//! │         └──► Vec<ContextEntry> (name + type + description,
//! │                                 the only part the agent receives)
//! ```
//!
//! Error values are special: their message and filtered backtrace are folded
//! into the entry description so the agent can start diagnosing without a
//! single callback.

pub mod serializer;
pub mod value;

pub use serializer::{serialize_context, Context, ContextTable};
pub use value::{json_type_name, CallResult, CapturedError, ContextCallable, ContextItem, ContextValue};

/// Name of the context entry treated as the invocation's primary error
pub const PRIMARY_ERROR_KEY: &str = "error";

impl Context {
    /// The entry named `error`, if it holds an error value
    pub fn primary_error(&self) -> Option<&CapturedError> {
        match self.get(PRIMARY_ERROR_KEY).map(|item| &item.value) {
            Some(ContextValue::Error(error)) => Some(error),
            _ => None,
        }
    }
}

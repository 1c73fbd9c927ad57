//! Per-invocation state shared by the callback handlers

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::context::ContextTable;
use crate::protocol::Mode;
use crate::schema::SchemaValidator;
use crate::security::RateLimiter;

/// What the agent has reported so far in implement mode
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSlot {
    Empty,
    /// A validated result from `set_result`
    Set(Value),
    /// A reason from `fail_implementation`
    Failed(String),
}

impl ResultSlot {
    pub fn is_decided(&self) -> bool {
        !matches!(self, ResultSlot::Empty)
    }
}

pub struct ServerState {
    invocation_id: String,
    mode: Mode,
    /// Held for the whole of a tool call, so callbacks run one at a time
    table: AsyncMutex<ContextTable>,
    validator: Option<Arc<dyn SchemaValidator>>,
    slot: Mutex<ResultSlot>,
    limiter: RateLimiter,
}

impl ServerState {
    pub fn new(invocation_id: impl Into<String>, mode: Mode, table: ContextTable) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            mode,
            table: AsyncMutex::new(table),
            validator: None,
            slot: Mutex::new(ResultSlot::Empty),
            limiter: RateLimiter::with_defaults(),
        }
    }

    /// Schema that `set_result` values are validated against
    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_rate_limit(mut self, burst: u64, per_sec: f64) -> Self {
        self.limiter = RateLimiter::new(burst, per_sec);
        self
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn validator(&self) -> Option<&Arc<dyn SchemaValidator>> {
        self.validator.as_ref()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub(crate) fn table(&self) -> &AsyncMutex<ContextTable> {
        &self.table
    }

    /// Current result slot
    pub fn outcome(&self) -> ResultSlot {
        self.lock_slot().clone()
    }

    /// Store a validated result. Returns false if the slot was already decided.
    pub fn record_result(&self, value: Value) -> bool {
        self.decide(ResultSlot::Set(value))
    }

    /// Store a failure reason. Returns false if the slot was already decided.
    pub fn record_failure(&self, reason: impl Into<String>) -> bool {
        self.decide(ResultSlot::Failed(reason.into()))
    }

    fn decide(&self, next: ResultSlot) -> bool {
        let mut slot = self.lock_slot();
        if slot.is_decided() {
            return false;
        }
        *slot = next;
        true
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, ResultSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_decision_wins() {
        let state = ServerState::new("inv", Mode::Implement, ContextTable::default());
        assert_eq!(state.outcome(), ResultSlot::Empty);

        assert!(state.record_result(json!({"sorted": [2, 1]})));
        assert!(!state.record_failure("too late"));
        assert!(!state.record_result(json!({"sorted": []})));
        assert_eq!(state.outcome(), ResultSlot::Set(json!({"sorted": [2, 1]})));
    }

    #[test]
    fn test_failure_is_sticky() {
        let state = ServerState::new("inv", Mode::Implement, ContextTable::default());
        assert!(state.record_failure("no data provided"));
        assert!(!state.record_result(json!(1)));
        assert_eq!(state.outcome(), ResultSlot::Failed("no data provided".to_string()));
    }
}

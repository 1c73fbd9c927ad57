//! Prometheus metrics for invocations and callback traffic
//!
//! All metrics live in the default registry; [`encode_metrics`] renders them
//! in the text exposition format for whatever endpoint the host application
//! already serves.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter, CounterVec, Encoder,
    Gauge, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Invocation Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished invocations.
    ///
    /// Labels:
    /// - mode: "investigate" or "implement"
    /// - outcome: "ok", "agent_exited", "implementation_failed", "result_not_set",
    ///   "cancelled", "timed_out", "setup_failed", ...
    pub static ref INVOCATIONS_TOTAL: CounterVec = register_counter_vec!(
        "agentbridge_invocations_total",
        "Finished agent invocations by mode and outcome",
        &["mode", "outcome"]
    ).expect("failed to register INVOCATIONS_TOTAL metric");

    /// Invocations currently running.
    pub static ref INVOCATIONS_IN_FLIGHT: Gauge = register_gauge!(
        "agentbridge_invocations_in_flight",
        "Agent invocations currently running"
    ).expect("failed to register INVOCATIONS_IN_FLIGHT metric");

    /// Wall time from invocation start to terminal state.
    pub static ref INVOCATION_DURATION: HistogramVec = register_histogram_vec!(
        "agentbridge_invocation_duration_seconds",
        "Time from invocation start to terminal state",
        &["mode"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).expect("failed to register INVOCATION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Callback Server Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Callback tool calls.
    ///
    /// Labels:
    /// - tool: "eval", "set_result", "fail_implementation", or "unknown"
    /// - outcome: "ok" or "error"
    pub static ref TOOL_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "agentbridge_tool_calls_total",
        "Callback tool calls by tool and outcome",
        &["tool", "outcome"]
    ).expect("failed to register TOOL_CALLS_TOTAL metric");

    /// Time spent evaluating one callback expression.
    pub static ref EVAL_DURATION: HistogramVec = register_histogram_vec!(
        "agentbridge_eval_duration_seconds",
        "Time spent evaluating one callback expression",
        &["tool"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).expect("failed to register EVAL_DURATION metric");

    /// Callback requests refused by the rate limiter.
    pub static ref RATE_LIMITED_TOTAL: Counter = register_counter!(
        "agentbridge_rate_limited_total",
        "Callback tool calls refused by the rate limiter"
    ).expect("failed to register RATE_LIMITED_TOTAL metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Status Stream Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Status events received from agents, by event type.
    pub static ref STATUS_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "agentbridge_status_events_total",
        "Status events received from agent processes",
        &["type"]
    ).expect("failed to register STATUS_EVENTS_TOTAL metric");

    /// Non-blank status lines that were not valid status JSON.
    pub static ref MALFORMED_STATUS_LINES: Counter = register_counter!(
        "agentbridge_malformed_status_lines_total",
        "Status lines dropped because they were not valid status JSON"
    ).expect("failed to register MALFORMED_STATUS_LINES metric");
}

/// Render the default registry in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

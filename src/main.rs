//! agentbridge demo
//!
//! Hands a failing computation to the configured agent and prints its status
//! events and analysis as they arrive.
//!
//! ```text
//! AGENTBRIDGE_AGENT_BIN=target/debug/mock_agent cargo run
//! ```

use std::fmt;

use tokio_stream::StreamExt;
use tracing::info;

use agentbridge::{Bridge, BridgeConfig, CapturedError, Context, ContextCallable, ContextItem, StatusMessage};

#[derive(Debug)]
struct DivisionByZero {
    numerator: i64,
}

impl fmt::Display for DivisionByZero {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt to divide {} by zero", self.numerator)
    }
}

impl std::error::Error for DivisionByZero {}

fn divide(x: i64, y: i64) -> Result<i64, DivisionByZero> {
    if y == 0 {
        return Err(DivisionByZero { numerator: x });
    }
    Ok(x / y)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    agentbridge::tracing::init_console_tracing()?;

    let config = BridgeConfig::from_env()?;
    if let Err(e) = config.require_credentials() {
        // The mock agent needs no credential; a real one does
        tracing::warn!(error = %e, "Agent credential missing");
    }

    let (x, y) = (5, 0);
    let error = match divide(x, y) {
        Ok(value) => {
            println!("{} / {} = {}, nothing to investigate", x, y, value);
            return Ok(());
        }
        Err(e) => CapturedError::capture(&e),
    };

    let context = Context::new()
        .with_value("x", &x)
        .with_value("y", &y)
        .with("error", ContextItem::described(error, "Raised while computing x / y"))
        .with(
            "divide",
            ContextItem::described(
                ContextCallable::new(|args| {
                    let x = args.first().and_then(|v| v.as_i64()).ok_or("divide(x, y) takes integers")?;
                    let y = args.get(1).and_then(|v| v.as_i64()).ok_or("divide(x, y) takes integers")?;
                    divide(x, y).map(Into::into).map_err(|e| e.to_string())
                }),
                "The function that failed",
            ),
        );

    let bridge = Bridge::new(config);
    let handle = bridge.investigate(context, None).await?;
    info!(invocation_id = %handle.invocation_id(), "Investigation started");

    let mut events = Box::pin(handle.status_stream());
    while let Some(event) = events.next().await {
        match &event {
            StatusMessage::Log(m) => println!("[LOG] {}", m.message),
            StatusMessage::ServerStarted(m) => println!("[SERVER] {}", m.url),
            StatusMessage::Turn(m) => println!("[TURN] #{}", m.turn_number),
            StatusMessage::ToolCall(m) => println!("[TOOL] {} {}", m.tool_name, m.input),
            StatusMessage::ToolResult(m) => println!("[TOOL] {} -> {}", m.tool_name, m.result_preview),
            StatusMessage::Summary(s) => println!(
                "[SUMMARY] {} turns, {} tool calls, {} tokens",
                s.turns, s.tool_calls_count, s.total_tokens
            ),
            StatusMessage::Other(m) => println!("[STATUS] {}", serde_json::Value::Object(m.clone())),
        }
    }

    match handle.result().await {
        Ok(analysis) => println!("\n{}", analysis.trim_end()),
        Err(e) => {
            eprintln!("Investigation failed: {}", e);
            agentbridge::tracing::shutdown_tracing();
            std::process::exit(1);
        }
    }

    Ok(())
}

//! Scripted stand-in for the external agent
//!
//! Honours the agent contract (request on stdin, status lines on stderr,
//! final text on stdout) and follows a fixed script chosen by
//! `MOCK_AGENT_SCENARIO`:
//!
//! ```text
//! investigate  inspect context over eval, print an analysis   (default, investigate mode)
//! sort         set_result with input_array sorted descending  (default, implement mode)
//! retry        set_result with a bad value first, then a good one
//! fail         fail_implementation("no data provided")
//! crash        log a line and exit 3
//! silent       read the request and exit 0 without doing anything
//! garbage      mix non-JSON lines and loosely typed objects into the status stream
//! slow         sleep for a minute (cancellation and timeout tests)
//! ```

use std::io::Read;
use std::process::ExitCode;
use std::time::Duration;

use serde_json::{json, Value};

use agentbridge::client::{CallbackClient, StatusEmitter};
use agentbridge::protocol::{InvocationRequest, Mode, Summary};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("mock_agent: cannot read request: {}", e);
        return ExitCode::from(2);
    }
    let request: InvocationRequest = match serde_json::from_str(&input) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("mock_agent: bad request: {}", e);
            return ExitCode::from(2);
        }
    };

    let scenario = std::env::var("MOCK_AGENT_SCENARIO").unwrap_or_else(|_| match request.mode {
        Mode::Investigate => "investigate".to_string(),
        Mode::Implement => "sort".to_string(),
    });

    match run(&scenario, &request).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("mock_agent: {} failed: {}", scenario, e);
            ExitCode::from(1)
        }
    }
}

async fn run(scenario: &str, request: &InvocationRequest) -> Result<u8, BoxError> {
    let mut status = StatusEmitter::stderr();
    let client = CallbackClient::new(&request.callback_url);

    match scenario {
        "investigate" => {
            status.log(format!("investigating {} context entries", request.context.len()))?;
            client.initialize().await?;
            let tools = client.list_tools().await?;
            status.turn(1, Some("tool_use"))?;

            let x = call_eval(&mut status, &client, "context['x']").await?;
            let y = call_eval(&mut status, &client, "y").await?;
            let failure = client.eval("x / y").await?;
            status.turn(2, Some("end_turn"))?;

            let error_entry = request
                .context
                .iter()
                .find(|entry| entry.name == "error")
                .and_then(|entry| entry.description.clone())
                .unwrap_or_default();
            println!(
                "Analysis: x is {} and y is {}; evaluating x / y fails ({}). {}",
                x["result"],
                y["result"],
                failure.joined_text(),
                error_entry.lines().next().unwrap_or_default()
            );
            println!("Tools offered: {}", tools.len());

            status.summary(summary(2, 3))?;
            Ok(0)
        }
        "sort" => {
            status.turn(1, Some("tool_use"))?;
            let result = client
                .set_result("lambda context: {sorted: sort(context['input_array'], true)}")
                .await?;
            status.tool_result("set_result", &result.joined_text())?;
            if result.is_error {
                return Err(result.joined_text().into());
            }
            status.summary(summary(1, 1))?;
            Ok(0)
        }
        "retry" => {
            let first = client.set_result("{sorted: 'not a list'}").await?;
            status.tool_result("set_result", &first.joined_text())?;
            if !first.is_error {
                return Err("invalid result was accepted".into());
            }
            let second = client
                .set_result("{sorted: sort(input_array, true)}")
                .await?;
            status.tool_result("set_result", &second.joined_text())?;
            status.summary(summary(2, 2))?;
            Ok(if second.is_error { 1 } else { 0 })
        }
        "fail" => {
            let result = client.fail_implementation("no data provided").await?;
            status.tool_result("fail_implementation", &result.joined_text())?;
            status.summary(summary(1, 1))?;
            Ok(0)
        }
        "crash" => {
            status.log("about to crash")?;
            println!("partial output");
            Ok(3)
        }
        "silent" => Ok(0),
        "garbage" => {
            eprintln!("this is not json");
            status.log("first")?;
            eprintln!("{{\"type\": \"unknown_kind\"}}");
            eprintln!();
            status.log("second")?;
            eprintln!("{{broken");
            eprintln!("{{\"type\": \"summary\", \"finishReason\": null, \"cost\": null}}");
            print!("done");
            Ok(0)
        }
        "slow" => {
            status.log("sleeping")?;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(0)
        }
        other => Err(format!("unknown scenario {:?}", other).into()),
    }
}

async fn call_eval(
    status: &mut StatusEmitter<std::io::Stderr>,
    client: &CallbackClient,
    expression: &str,
) -> Result<Value, BoxError> {
    status.tool_call("eval", json!({ "function": expression }))?;
    let result = client.eval(expression).await?;
    status.tool_result("eval", &result.joined_text())?;
    if result.is_error {
        return Err(result.joined_text().into());
    }
    Ok(serde_json::from_str(&result.joined_text())?)
}

fn summary(turns: u32, tool_calls: u32) -> Summary {
    Summary {
        turns,
        cost: 0.0,
        finish_reason: "end_turn".to_string(),
        input_tokens: 100,
        output_tokens: 20,
        total_tokens: 120,
        tool_calls_count: tool_calls,
        ..Summary::default()
    }
}

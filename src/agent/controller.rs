//! Invocation orchestration
//!
//! The Bridge turns one `investigate` or `implement` call into a running
//! invocation and hands back a [`ResultHandle`] straight away. Everything
//! after spawn happens on a task of its own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::process::{AgentCommand, AgentProcessClient, ProcessError, RunningAgent};
use crate::config::{BridgeConfig, ConfigError};
use crate::context::{serialize_context, Context};
use crate::handle::{self, HandleWriter, ResultHandle};
use crate::metrics::{INVOCATIONS_IN_FLIGHT, INVOCATIONS_TOTAL, INVOCATION_DURATION};
use crate::protocol::{now_timestamp, InvocationRequest, Mode, StatusMessage};
use crate::schema::{SchemaValidator, TypedSchema};
use crate::server::{CallbackServer, ResultSlot, ServerError, ServerState};
use crate::stack;

/// Terminal error of an invocation
///
/// Clone, so every holder of a handle sees the same error.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationError {
    /// The callback server or the agent could not be started
    Setup(String),
    /// The agent exited with a nonzero code
    AgentExited { code: i32 },
    /// The agent called `fail_implementation`
    ImplementationFailed(String),
    /// The agent exited without calling `set_result`
    ResultNotSet,
    /// The recorded result could not be turned into the requested type
    InvalidResult(String),
    Cancelled,
    TimedOut(Duration),
    /// The invocation ended without a summary event
    NoSummary,
}

impl InvocationError {
    /// Label used for the outcome metric
    pub fn outcome_label(&self) -> &'static str {
        match self {
            InvocationError::Setup(_) => "setup_failed",
            InvocationError::AgentExited { .. } => "agent_exited",
            InvocationError::ImplementationFailed(_) => "implementation_failed",
            InvocationError::ResultNotSet => "result_not_set",
            InvocationError::InvalidResult(_) => "invalid_result",
            InvocationError::Cancelled => "cancelled",
            InvocationError::TimedOut(_) => "timed_out",
            InvocationError::NoSummary => "no_summary",
        }
    }
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationError::Setup(msg) => write!(f, "Invocation setup failed: {}", msg),
            InvocationError::AgentExited { code } => {
                write!(f, "Agent process exited with exit code {}", code)
            }
            InvocationError::ImplementationFailed(reason) => {
                write!(f, "Implementation failed: {}", reason)
            }
            InvocationError::ResultNotSet => write!(f, "Result was not set by agent"),
            InvocationError::InvalidResult(msg) => write!(f, "Result could not be decoded: {}", msg),
            InvocationError::Cancelled => write!(f, "Invocation was cancelled"),
            InvocationError::TimedOut(after) => write!(f, "Invocation timed out after {:?}", after),
            InvocationError::NoSummary => write!(f, "Invocation ended without a summary"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<ServerError> for InvocationError {
    fn from(e: ServerError) -> Self {
        InvocationError::Setup(e.to_string())
    }
}

impl From<ProcessError> for InvocationError {
    fn from(e: ProcessError) -> Self {
        InvocationError::Setup(e.to_string())
    }
}

impl From<ConfigError> for InvocationError {
    fn from(e: ConfigError) -> Self {
        InvocationError::Setup(e.to_string())
    }
}

/// What an agent run produced, before conversion to the handle's type
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    /// Investigate: the agent's stdout
    Text(String),
    /// Implement: the validated value from `set_result`
    Value(Value),
}

/// Decide the outcome once the agent has exited
///
/// A recorded failure reason wins over everything, then a nonzero exit,
/// then the mode's own result.
fn resolve_outcome(mode: Mode, exit_code: i32, stdout: String, slot: ResultSlot) -> Result<Resolved, InvocationError> {
    if let ResultSlot::Failed(reason) = slot {
        return Err(InvocationError::ImplementationFailed(reason));
    }
    if exit_code != 0 {
        return Err(InvocationError::AgentExited { code: exit_code });
    }
    match (mode, slot) {
        (Mode::Investigate, _) => Ok(Resolved::Text(stdout)),
        (Mode::Implement, ResultSlot::Set(value)) => Ok(Resolved::Value(value)),
        (Mode::Implement, _) => Err(InvocationError::ResultNotSet),
    }
}

/// Inputs of one invocation
struct Launch {
    mode: Mode,
    context: Context,
    extra_instructions: Option<String>,
    prompt: Option<String>,
    validator: Option<Arc<dyn SchemaValidator>>,
}

/// Starts invocations against one agent configuration
#[derive(Debug, Clone, Default)]
pub struct Bridge {
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Bridge configured from `AGENTBRIDGE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(BridgeConfig::from_env()?))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Ask the agent to diagnose the situation described by `context`
    ///
    /// If `context` holds an error under the key `error`, its backtrace is
    /// sent as the call stack; otherwise the caller's stack is.
    pub async fn investigate(
        &self,
        context: Context,
        extra_instructions: Option<&str>,
    ) -> Result<ResultHandle<String>, InvocationError> {
        let launch = Launch {
            mode: Mode::Investigate,
            context,
            extra_instructions: extra_instructions.map(String::from),
            prompt: None,
            validator: None,
        };
        self.launch(launch, |resolved| match resolved {
            Resolved::Text(text) => Ok(text),
            Resolved::Value(value) => Ok(value.to_string()),
        })
        .await
    }

    /// Ask the agent to produce a `T` for `prompt`
    ///
    /// The JSON schema of `T` is sent to the agent and every `set_result`
    /// value is checked against it before it is accepted.
    pub async fn implement<T>(
        &self,
        prompt: &str,
        context: Context,
        extra_instructions: Option<&str>,
    ) -> Result<ResultHandle<T>, InvocationError>
    where
        T: JsonSchema + DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
    {
        let schema = Arc::new(TypedSchema::<T>::new());
        let validator: Arc<dyn SchemaValidator> = schema.clone();
        let launch = Launch {
            mode: Mode::Implement,
            context,
            extra_instructions: extra_instructions.map(String::from),
            prompt: Some(prompt.to_string()),
            validator: Some(validator),
        };
        self.launch(launch, move |resolved| match resolved {
            Resolved::Value(value) => schema
                .decode(value)
                .map_err(|e| InvocationError::InvalidResult(e.to_string())),
            Resolved::Text(_) => Err(InvocationError::ResultNotSet),
        })
        .await
    }

    /// Like [`implement`](Self::implement) with a caller-supplied validator
    pub async fn implement_with(
        &self,
        prompt: &str,
        context: Context,
        validator: Arc<dyn SchemaValidator>,
        extra_instructions: Option<&str>,
    ) -> Result<ResultHandle<Value>, InvocationError> {
        let launch = Launch {
            mode: Mode::Implement,
            context,
            extra_instructions: extra_instructions.map(String::from),
            prompt: Some(prompt.to_string()),
            validator: Some(validator),
        };
        self.launch(launch, |resolved| match resolved {
            Resolved::Value(value) => Ok(value),
            Resolved::Text(_) => Err(InvocationError::ResultNotSet),
        })
        .await
    }

    /// Start the server and the agent, then hand the rest to a task
    ///
    /// Bind and spawn failures are returned here; no handle exists yet.
    async fn launch<T, D>(&self, launch: Launch, decode: D) -> Result<ResultHandle<T>, InvocationError>
    where
        T: Clone + Send + Sync + 'static,
        D: FnOnce(Resolved) -> Result<T, InvocationError> + Send + 'static,
    {
        // Before the first await, so the live stack still shows the caller
        let call_stack = match launch.context.primary_error().filter(|e| e.trace().is_some()) {
            Some(error) => stack::extract_call_stack(Some(error), 0),
            None => stack::caller_frames(self.config.skip_frames),
        };

        let invocation_id = Uuid::now_v7().to_string();
        let mode = launch.mode;
        let (table, entries) = serialize_context(&launch.context);
        info!(
            invocation_id = %invocation_id,
            mode = %mode,
            context_entries = entries.len(),
            stack_frames = call_stack.len(),
            "Starting invocation"
        );

        let mut state = ServerState::new(invocation_id.clone(), mode, table)
            .with_rate_limit(self.config.rate_limit_burst, self.config.rate_limit_per_sec);
        if let Some(validator) = &launch.validator {
            state = state.with_validator(validator.clone());
        }

        let server = match CallbackServer::start(&self.config.host, self.config.port, Arc::new(state)).await {
            Ok(server) => server,
            Err(e) => return Err(setup_failed(mode, e.into())),
        };

        let request = InvocationRequest {
            mode,
            callback_url: server.url().to_string(),
            call_stack,
            context: entries,
            timestamp: now_timestamp(),
            pid: std::process::id(),
            invocation_id: invocation_id.clone(),
            extra_instructions: launch.extra_instructions,
            prompt: launch.prompt,
            schema: launch.validator.as_ref().map(|v| v.json_schema()),
        };

        let (writer, handle) = handle::channel::<T>(invocation_id.clone());
        writer.push_status(StatusMessage::server_started(server.url()));

        // On failure the server guard drops here and releases the port
        let agent = AgentProcessClient::new(AgentCommand::from_config(&self.config))
            .spawn(&request)
            .map_err(|e| setup_failed(mode, e.into()))?;

        INVOCATIONS_IN_FLIGHT.inc();
        let span = info_span!(
            "invocation",
            invocation_id = %invocation_id,
            mode = %mode,
            otel.name = "invocation"
        );
        let run = Run {
            mode,
            server,
            agent,
            writer,
            cancel: handle.cancel_signal(),
            timeout: self.config.timeout,
        };
        tokio::spawn(run.drive(decode).instrument(span));

        Ok(handle)
    }
}

fn setup_failed(mode: Mode, error: InvocationError) -> InvocationError {
    warn!(mode = %mode, error = %error, "Invocation setup failed");
    INVOCATIONS_TOTAL
        .with_label_values(&[mode.as_str(), error.outcome_label()])
        .inc();
    error
}

/// The part of an invocation that runs after spawn
struct Run<T> {
    mode: Mode,
    server: CallbackServer,
    agent: RunningAgent,
    writer: HandleWriter<T>,
    cancel: Arc<Notify>,
    timeout: Option<Duration>,
}

impl<T> Run<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn drive<D>(self, decode: D)
    where
        D: FnOnce(Resolved) -> Result<T, InvocationError>,
    {
        let Run {
            mode,
            server,
            agent,
            writer,
            cancel,
            timeout,
        } = self;
        let started = Instant::now();

        let finished = {
            let drain = agent.finish(|message| writer.push_status(message.clone()));
            let deadline = async {
                match timeout {
                    Some(after) => tokio::time::sleep(after).await,
                    None => std::future::pending().await,
                }
            };
            // Losing branches drop the drain, which kills the child
            tokio::select! {
                output = drain => output.map_err(InvocationError::from),
                _ = cancel.notified() => Err(InvocationError::Cancelled),
                _ = deadline => Err(InvocationError::TimedOut(timeout.unwrap_or_default())),
            }
        };

        let outcome = finished.and_then(|output| {
            resolve_outcome(mode, output.exit_code, output.stdout, server.outcome()).and_then(decode)
        });
        server.close().await;

        let label = match &outcome {
            Ok(_) => "ok",
            Err(e) => e.outcome_label(),
        };
        INVOCATIONS_TOTAL.with_label_values(&[mode.as_str(), label]).inc();
        INVOCATION_DURATION
            .with_label_values(&[mode.as_str()])
            .observe(started.elapsed().as_secs_f64());
        INVOCATIONS_IN_FLIGHT.dec();

        match &outcome {
            Ok(_) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "Invocation resolved"),
            Err(e) => warn!(error = %e, outcome = label, "Invocation failed"),
        }
        writer.resolve(outcome);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Free functions over an environment-configured Bridge
// ─────────────────────────────────────────────────────────────────────────────

/// [`Bridge::investigate`] with configuration from the environment
pub async fn investigate(
    context: Context,
    extra_instructions: Option<&str>,
) -> Result<ResultHandle<String>, InvocationError> {
    Bridge::from_env()?.investigate(context, extra_instructions).await
}

/// [`Bridge::implement`] with configuration from the environment
pub async fn implement<T>(
    prompt: &str,
    context: Context,
    extra_instructions: Option<&str>,
) -> Result<ResultHandle<T>, InvocationError>
where
    T: JsonSchema + DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    Bridge::from_env()?
        .implement(prompt, context, extra_instructions)
        .await
}

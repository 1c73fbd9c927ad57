//! Agent subprocess lifecycle
//!
//! Spawns the agent executable, writes the request to its stdin, drains
//! stdout and stderr at the same time, and waits for exit. stderr carries
//! newline-delimited status JSON; every line that parses is handed to the
//! caller as soon as it is read.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, ENV_INVOCATION_ID};
use crate::metrics::{MALFORMED_STATUS_LINES, STATUS_EVENTS_TOTAL};
use crate::protocol::{InvocationRequest, StatusMessage};
use crate::security::{CapabilityDropper, ChildHardening};

/// Error type for agent process operations
#[derive(Debug)]
pub enum ProcessError {
    /// The executable could not be started
    Spawn { program: String, source: io::Error },
    /// The request could not be serialized
    Encode(serde_json::Error),
    /// Reading from or waiting on the child failed
    Io(io::Error),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { program, source } => {
                write!(f, "Failed to spawn agent {}: {}", program, source)
            }
            ProcessError::Encode(e) => write!(f, "Failed to encode request: {}", e),
            ProcessError::Io(e) => write!(f, "Agent IO error: {}", e),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<io::Error> for ProcessError {
    fn from(e: io::Error) -> Self {
        ProcessError::Io(e)
    }
}

impl From<serde_json::Error> for ProcessError {
    fn from(e: serde_json::Error) -> Self {
        ProcessError::Encode(e)
    }
}

/// How to start the agent
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Applied in the child between fork and exec
    pub hardening: Option<ChildHardening>,
}

impl AgentCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            hardening: None,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            program: config.agent_program.clone(),
            args: config.agent_args.clone(),
            env: config.agent_env.clone(),
            hardening: config
                .harden_child
                .then(|| CapabilityDropper::with_agent_drops().prepare()),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Everything the agent produced
#[derive(Debug, Clone)]
pub struct AgentOutput {
    /// Exit code; a signal-terminated child reports 128 + signal
    pub exit_code: i32,
    pub stdout: String,
    /// Status events in the order they were written
    pub status: Vec<StatusMessage>,
}

impl AgentOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct AgentProcessClient {
    command: AgentCommand,
}

impl AgentProcessClient {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }

    /// Start the agent with `request` queued for its stdin
    ///
    /// Must be called within a tokio runtime. Nothing is written until
    /// [`RunningAgent::finish`] is awaited.
    pub fn spawn(&self, request: &InvocationRequest) -> Result<RunningAgent, ProcessError> {
        let payload = serde_json::to_vec(request)?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(&self.command.env)
            .env(ENV_INVOCATION_ID, &request.invocation_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(hardening) = self.command.hardening.clone() {
            // SAFETY: apply() only issues prctl calls, which are async-signal-safe
            unsafe {
                command.pre_exec(move || hardening.apply());
            }
        }

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.command.program.display().to_string(),
            source,
        })?;

        info!(
            invocation_id = %request.invocation_id,
            pid = child.id().unwrap_or_default(),
            program = %self.command.program.display(),
            hardened = self.command.hardening.is_some(),
            "Agent process spawned"
        );

        Ok(RunningAgent { child, payload })
    }

    /// Spawn, feed, drain and wait in one call
    pub async fn run<F>(&self, request: &InvocationRequest, on_status: F) -> Result<AgentOutput, ProcessError>
    where
        F: FnMut(&StatusMessage),
    {
        self.spawn(request)?.finish(on_status).await
    }
}

/// A spawned agent that has not been drained yet
///
/// Dropping it kills the child.
pub struct RunningAgent {
    child: Child,
    payload: Vec<u8>,
}

impl RunningAgent {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write the request, drain both output channels, and wait for exit
    ///
    /// The three pipe tasks run concurrently so a child blocked writing one
    /// channel can never stall the others.
    pub async fn finish<F>(mut self, on_status: F) -> Result<AgentOutput, ProcessError>
    where
        F: FnMut(&StatusMessage),
    {
        let stdin = take_pipe(self.child.stdin.take(), "stdin")?;
        let stdout = take_pipe(self.child.stdout.take(), "stdout")?;
        let stderr = take_pipe(self.child.stderr.take(), "stderr")?;

        let (written, stdout, status) = tokio::join!(
            write_request(stdin, std::mem::take(&mut self.payload)),
            read_all(stdout),
            read_status(stderr, on_status),
        );
        written?;
        let stdout = stdout?;
        let status = status?;

        let exit = self.child.wait().await?;
        let exit_code = exit_code(exit);
        info!(
            exit_code,
            stdout_bytes = stdout.len(),
            status_events = status.len(),
            "Agent process exited"
        );

        Ok(AgentOutput {
            exit_code,
            stdout,
            status,
        })
    }
}

fn take_pipe<P>(pipe: Option<P>, name: &str) -> Result<P, ProcessError> {
    pipe.ok_or_else(|| ProcessError::Io(io::Error::new(io::ErrorKind::Other, format!("agent {} was not piped", name))))
}

async fn write_request(mut stdin: ChildStdin, payload: Vec<u8>) -> io::Result<()> {
    let outcome = async {
        stdin.write_all(&payload).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await
    }
    .await;
    drop(stdin);
    match outcome {
        // An agent that exits without reading its input is judged by its exit code
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Agent closed stdin before reading the request");
            Ok(())
        }
        other => other,
    }
}

async fn read_all(mut stdout: ChildStdout) -> io::Result<String> {
    let mut buffer = Vec::new();
    stdout.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn read_status<F>(stderr: ChildStderr, mut on_status: F) -> io::Result<Vec<StatusMessage>>
where
    F: FnMut(&StatusMessage),
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let mut events = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        if text.trim().is_empty() {
            continue;
        }
        match StatusMessage::parse_line(&text) {
            Some(message) => {
                STATUS_EVENTS_TOTAL.with_label_values(&[message.kind()]).inc();
                on_status(&message);
                events.push(message);
            }
            None => {
                MALFORMED_STATUS_LINES.inc();
                debug!(line = %text.trim_end(), "Dropped non-status line from agent");
            }
        }
    }

    if events.is_empty() {
        warn!("Agent wrote no status events");
    }
    Ok(events)
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

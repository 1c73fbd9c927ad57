//! Invocation configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the agent executable
pub const ENV_AGENT_BIN: &str = "AGENTBRIDGE_AGENT_BIN";
/// Environment variable with extra agent arguments, whitespace separated
pub const ENV_AGENT_ARGS: &str = "AGENTBRIDGE_AGENT_ARGS";
/// Environment variable with the invocation timeout in seconds
pub const ENV_TIMEOUT_SECS: &str = "AGENTBRIDGE_TIMEOUT_SECS";
/// Environment variable the agent child receives its invocation id in
pub const ENV_INVOCATION_ID: &str = "AGENTBRIDGE_INVOCATION_ID";

/// Agent executable used when nothing else is configured
pub const DEFAULT_AGENT_BIN: &str = "agentbridge-agent";

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be used
    InvalidEnv { var: String, value: String, reason: String },
    /// The credential the agent needs for its model calls is not set
    MissingCredential(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidEnv { var, value, reason } => {
                write!(f, "Invalid value {:?} for {}: {}", value, var, reason)
            }
            ConfigError::MissingCredential(var) => {
                write!(f, "Missing credential: set {} before invoking the agent", var)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration shared by every invocation a [`Bridge`](crate::agent::Bridge) starts
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Agent executable
    pub agent_program: PathBuf,
    /// Arguments passed before anything else
    pub agent_args: Vec<String>,
    /// Extra environment for the agent child
    pub agent_env: HashMap<String, String>,
    /// Callback server bind host
    pub host: String,
    /// Callback server port; 0 picks an ephemeral port
    pub port: u16,
    /// Fail the invocation if it has not finished after this long
    pub timeout: Option<Duration>,
    /// Burst size of the callback rate limiter
    pub rate_limit_burst: u64,
    /// Sustained callback calls per second
    pub rate_limit_per_sec: f64,
    /// Drop capabilities and set a parent-death signal in the agent child (Linux)
    pub harden_child: bool,
    /// Environment variable holding the agent's upstream credential
    pub credential_var: String,
    /// Extra innermost frames to discard from a live call stack
    pub skip_frames: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            agent_program: PathBuf::from(DEFAULT_AGENT_BIN),
            agent_args: Vec::new(),
            agent_env: HashMap::new(),
            host: "127.0.0.1".to_string(),
            port: 0,
            timeout: None,
            rate_limit_burst: 30,
            rate_limit_per_sec: 5.0,
            harden_child: true,
            credential_var: "ANTHROPIC_API_KEY".to_string(),
            skip_frames: 0,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `AGENTBRIDGE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bin) = lookup(ENV_AGENT_BIN).filter(|v| !v.trim().is_empty()) {
            config.agent_program = PathBuf::from(bin);
        }
        if let Some(args) = lookup(ENV_AGENT_ARGS) {
            config.agent_args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            let secs: f64 = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_TIMEOUT_SECS.to_string(),
                value: raw.clone(),
                reason: "expected a number of seconds".to_string(),
            })?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigError::InvalidEnv {
                    var: ENV_TIMEOUT_SECS.to_string(),
                    value: raw,
                    reason: "must be positive".to_string(),
                });
            }
            config.timeout = Some(Duration::from_secs_f64(secs));
        }

        Ok(config)
    }

    pub fn with_agent(mut self, program: impl Into<PathBuf>) -> Self {
        self.agent_program = program.into();
        self
    }

    pub fn with_agent_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.agent_env.insert(key.into(), value.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rate_limit(mut self, burst: u64, per_sec: f64) -> Self {
        self.rate_limit_burst = burst;
        self.rate_limit_per_sec = per_sec;
        self
    }

    pub fn with_hardening(mut self, enabled: bool) -> Self {
        self.harden_child = enabled;
        self
    }

    pub fn with_skip_frames(mut self, skip_frames: usize) -> Self {
        self.skip_frames = skip_frames;
        self
    }

    /// Check that the agent's credential is available
    ///
    /// The agent reads it from its own environment, which is inherited from
    /// the host or set through [`with_env`](Self::with_env).
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        let in_config = self
            .agent_env
            .get(&self.credential_var)
            .map_or(false, |v| !v.is_empty());
        let in_process = std::env::var(&self.credential_var).map_or(false, |v| !v.is_empty());
        if in_config || in_process {
            Ok(())
        } else {
            Err(ConfigError::MissingCredential(self.credential_var.clone()))
        }
    }
}

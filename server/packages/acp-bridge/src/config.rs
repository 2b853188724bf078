use std::str::FromStr;
use std::time::Duration;

use acp_bridge_sandbox::SandboxConfig;
use thiserror::Error;

pub const ENV_REQUEST_TIMEOUT_MS: &str = "ACP_BRIDGE_REQUEST_TIMEOUT_MS";
pub const ENV_PERMISSION_TIMEOUT_MS: &str = "ACP_BRIDGE_PERMISSION_TIMEOUT_MS";
pub const ENV_PERMISSION_POLICY: &str = "ACP_BRIDGE_PERMISSION_POLICY";
pub const ENV_SANDBOX_MAX_STEPS: &str = "ACP_BRIDGE_SANDBOX_MAX_STEPS";
pub const ENV_SANDBOX_MAX_DURATION_MS: &str = "ACP_BRIDGE_SANDBOX_MAX_DURATION_MS";
pub const ENV_SANDBOX_MAX_OUTPUT_BYTES: &str = "ACP_BRIDGE_SANDBOX_MAX_OUTPUT_BYTES";
pub const ENV_TERMINAL_OUTPUT_LIMIT: &str = "ACP_BRIDGE_TERMINAL_OUTPUT_LIMIT";
pub const ENV_MAX_TURN_REQUESTS: &str = "ACP_BRIDGE_MAX_TURN_REQUESTS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {message}")]
    Invalid {
        key: String,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PermissionMode {
    /// Approve every request with its first option.
    Auto,
    /// Ask the client and wait for the user's decision.
    #[default]
    Interactive,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Interactive => "interactive",
        }
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "interactive" => Ok(Self::Interactive),
            other => Err(format!("expected `auto` or `interactive`, got `{other}`")),
        }
    }
}

/// Runtime settings shared by the agent, the client and headless runs.
///
/// Built from defaults, then environment variables, then CLI flags.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub request_timeout: Duration,
    pub permission_timeout: Duration,
    pub permission_mode: PermissionMode,
    pub sandbox: SandboxConfig,
    pub terminal_output_limit: usize,
    pub max_turn_requests: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            permission_timeout: Duration::from_secs(300),
            permission_mode: PermissionMode::default(),
            sandbox: SandboxConfig::default(),
            terminal_output_limit: 1024 * 1024,
            max_turn_requests: 16,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies every recognised variable that `lookup` returns.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_PERMISSION_TIMEOUT_MS)? {
            self.permission_timeout = Duration::from_millis(ms);
        }
        if let Some(mode) = parse_var::<PermissionMode, _>(&lookup, ENV_PERMISSION_POLICY)? {
            self.permission_mode = mode;
        }
        if let Some(steps) = parse_var::<u64, _>(&lookup, ENV_SANDBOX_MAX_STEPS)? {
            self.sandbox.max_steps = steps;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_SANDBOX_MAX_DURATION_MS)? {
            self.sandbox.max_duration_ms = ms;
        }
        if let Some(bytes) = parse_var::<usize, _>(&lookup, ENV_SANDBOX_MAX_OUTPUT_BYTES)? {
            self.sandbox.max_output_bytes = bytes;
        }
        if let Some(bytes) = parse_var::<usize, _>(&lookup, ENV_TERMINAL_OUTPUT_LIMIT)? {
            self.terminal_output_limit = bytes;
        }
        if let Some(count) = parse_var::<usize, _>(&lookup, ENV_MAX_TURN_REQUESTS)? {
            if count == 0 {
                return Err(ConfigError::Invalid {
                    key: ENV_MAX_TURN_REQUESTS.to_string(),
                    value: "0".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            self.max_turn_requests = count;
        }
        Ok(self)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            message: err.to_string(),
        })
}

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acp_bridge_error::SandboxError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::compiler::compile_module;
use crate::validate::validate;
use crate::value::{ExcKind, Exception, Interrupt, Value};
use crate::vm::{Exit, Limits, Vm};

/// Continuation tokens are unique across every runner in the process.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_token() -> u64 {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub max_steps: u64,
    pub max_duration_ms: u64,
    pub max_output_bytes: usize,
    pub max_call_depth: usize,
    pub allowed_modules: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            max_duration_ms: 30_000,
            max_output_bytes: 64 * 1024,
            max_call_depth: 100,
            allowed_modules: vec!["json".to_string()],
        }
    }
}

impl SandboxConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    fn limits(&self) -> Limits {
        Limits {
            max_steps: self.max_steps,
            max_duration: self.max_duration(),
            max_output_bytes: self.max_output_bytes,
            max_call_depth: self.max_call_depth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalParam {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
}

impl ExternalParam {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Json) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// A host function a script may call. Calling it suspends the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalFunction {
    pub name: String,
    pub params: Vec<ExternalParam>,
}

impl ExternalFunction {
    pub fn new(name: impl Into<String>, params: Vec<ExternalParam>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// `name(a, b=1)` as shown to the model.
    pub fn signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|param| match &param.default {
                Some(Json::Null) => format!("{}=None", param.name),
                Some(Json::Bool(true)) => format!("{}=True", param.name),
                Some(Json::Bool(false)) => format!("{}=False", param.name),
                Some(default) => format!("{}={default}", param.name),
                None => param.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({params})", self.name)
    }
}

/// The call a suspended script is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCall {
    pub function: String,
    pub arguments: Map<String, Json>,
    pub token: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerState {
    Running,
    Suspended(ExternalCall),
    Completed(Json),
    Failed(SandboxError),
    Cancelled,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_) | Self::Cancelled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended(_) => "suspended",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Cancels a runner from another task while it executes.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One script execution. The paused VM is the continuation: `resume` picks
/// up exactly where the pending external call was made.
pub struct ScriptRunner {
    vm: Vm,
    state: RunnerState,
    started: bool,
    issued: Vec<u64>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("state", &self.state)
            .field("steps", &self.vm.steps())
            .finish()
    }
}

impl ScriptRunner {
    /// Validates and compiles `source`. Nothing runs until [`ScriptRunner::run`].
    pub fn new(
        source: &str,
        externals: Vec<ExternalFunction>,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let module = validate(source, &config.allowed_modules)?;
        let code = compile_module(&module)?;
        let cancel = Arc::new(AtomicBool::new(false));
        tracing::debug!(
            externals = externals.len(),
            instructions = code.instructions.len(),
            "script compiled"
        );
        Ok(Self {
            vm: Vm::new(code, externals, config.limits(), cancel.clone()),
            state: RunnerState::Running,
            started: false,
            issued: Vec::new(),
            cancel,
        })
    }

    pub fn state(&self) -> &RunnerState {
        &self.state
    }

    pub fn pending(&self) -> Option<&ExternalCall> {
        match &self.state {
            RunnerState::Suspended(call) => Some(call),
            _ => None,
        }
    }

    pub fn output(&self) -> &str {
        self.vm.output()
    }

    pub fn output_truncated(&self) -> bool {
        self.vm.output_truncated()
    }

    pub fn steps(&self) -> u64 {
        self.vm.steps()
    }

    /// Wall time spent executing, excluding time suspended.
    pub fn elapsed(&self) -> Duration {
        self.vm.elapsed()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Starts execution. Later calls just report the current state.
    pub fn run(&mut self) -> RunnerState {
        if self.started {
            return self.state.clone();
        }
        self.started = true;
        if self.cancel.load(Ordering::SeqCst) {
            self.state = RunnerState::Cancelled;
            return self.state.clone();
        }
        tracing::debug!("script started");
        self.drive(None)
    }

    /// Delivers the outcome of the pending external call. An `Err` is raised
    /// inside the script as `ToolError`.
    pub fn resume(
        &mut self,
        token: u64,
        outcome: Result<Json, String>,
    ) -> Result<RunnerState, SandboxError> {
        let pending = match &self.state {
            RunnerState::Suspended(call) => call.token,
            RunnerState::Cancelled => return Err(SandboxError::InvalidContinuation { token }),
            _ if self.issued.contains(&token) => {
                return Err(SandboxError::InvalidContinuation { token })
            }
            _ => return Err(SandboxError::NotSuspended),
        };
        if pending != token {
            tracing::warn!(token, expected = pending, "rejected continuation token");
            return Err(SandboxError::InvalidContinuation { token });
        }
        if self.cancel.load(Ordering::SeqCst) {
            self.state = RunnerState::Cancelled;
            return Err(SandboxError::InvalidContinuation { token });
        }
        Ok(self.drive(Some(outcome)))
    }

    /// Moves any non-terminal runner to `Cancelled` and releases the pending token.
    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if !self.state.is_terminal() {
            if let Some(call) = self.pending() {
                tracing::debug!(token = call.token, "released continuation on cancel");
            }
            self.state = RunnerState::Cancelled;
        }
    }

    fn drive(&mut self, outcome: Option<Result<Json, String>>) -> RunnerState {
        self.state = RunnerState::Running;
        self.vm.start_clock();
        let result = match outcome {
            None => self.vm.execute(0),
            Some(Ok(value)) => {
                self.vm.resume_value(Value::from_json(&value));
                self.vm.execute(0)
            }
            Some(Err(message)) => {
                let error = Exception::new(ExcKind::ToolError, message);
                match self.vm.resume_error(error) {
                    Ok(()) => self.vm.execute(0),
                    Err(interrupt) => Err(interrupt),
                }
            }
        };
        self.vm.stop_clock();

        self.state = match result {
            Ok(Exit::Returned(value)) => match value.to_json() {
                Ok(json) => RunnerState::Completed(json),
                Err(interrupt) => self.failure(interrupt),
            },
            Ok(Exit::Suspended(call)) => {
                let token = next_token();
                self.issued.push(token);
                tracing::debug!(
                    function = %call.function,
                    token,
                    "script suspended on external call"
                );
                RunnerState::Suspended(ExternalCall {
                    function: call.function,
                    arguments: call.arguments,
                    token,
                })
            }
            Err(interrupt) => self.failure(interrupt),
        };

        match &self.state {
            RunnerState::Completed(_) => tracing::debug!(
                steps = self.vm.steps(),
                elapsed_ms = self.vm.elapsed().as_millis() as u64,
                "script completed"
            ),
            RunnerState::Failed(err) => tracing::debug!(error = %err, "script failed"),
            RunnerState::Cancelled => tracing::debug!("script cancelled"),
            _ => {}
        }
        self.state.clone()
    }

    fn failure(&self, interrupt: Interrupt) -> RunnerState {
        match interrupt {
            Interrupt::Raise(exc) => RunnerState::Failed(SandboxError::Runtime {
                kind: exc.kind.name().to_string(),
                message: exc.message.clone(),
                line: exc.line,
            }),
            Interrupt::Fatal(SandboxError::Cancelled) => RunnerState::Cancelled,
            Interrupt::Fatal(err) => RunnerState::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_renders_defaults() {
        let function = ExternalFunction::new(
            "read_file",
            vec![
                ExternalParam::required("path"),
                ExternalParam::optional("line", Json::Null),
                ExternalParam::optional("limit", Json::from(10)),
            ],
        );
        assert_eq!(function.signature(), "read_file(path, line=None, limit=10)");
    }

    #[test]
    fn config_deserializes_partial_overrides() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"maxSteps": 10}"#).unwrap_or_default();
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.allowed_modules, vec!["json".to_string()]);
    }

    #[test]
    fn tokens_are_unique() {
        let first = next_token();
        let second = next_token();
        assert!(second > first);
    }
}

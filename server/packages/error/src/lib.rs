use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_NOT_INITIALIZED: i64 = -32002;
pub const REQUEST_FAILED: i64 = -32000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    NotInitialized,
    RemoteError,
    NotFound,
    PermissionDenied,
    TerminalExited,
    UnknownTerminal,
    PathOutsideRoot,
    Timeout,
    Io,
    Unsupported,
    SandboxValidation,
    SandboxRuntime,
    SandboxBudgetExceeded,
    InvalidContinuation,
    Cancelled,
    TrackerViolation,
    SessionNotFound,
    Conflict,
    Internal,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::InvalidRequest => "invalid_request",
            Self::MethodNotFound => "method_not_found",
            Self::InvalidParams => "invalid_params",
            Self::NotInitialized => "not_initialized",
            Self::RemoteError => "remote_error",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::TerminalExited => "terminal_exited",
            Self::UnknownTerminal => "unknown_terminal",
            Self::PathOutsideRoot => "path_outside_root",
            Self::Timeout => "timeout",
            Self::Io => "io",
            Self::Unsupported => "unsupported",
            Self::SandboxValidation => "sandbox_validation",
            Self::SandboxRuntime => "sandbox_runtime",
            Self::SandboxBudgetExceeded => "sandbox_budget_exceeded",
            Self::InvalidContinuation => "invalid_continuation",
            Self::Cancelled => "cancelled",
            Self::TrackerViolation => "tracker_violation",
            Self::SessionNotFound => "session_not_found",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ParseError => "Parse Error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method Not Found",
            Self::InvalidParams => "Invalid Params",
            Self::NotInitialized => "Not Initialized",
            Self::RemoteError => "Remote Error",
            Self::NotFound => "Not Found",
            Self::PermissionDenied => "Permission Denied",
            Self::TerminalExited => "Terminal Exited",
            Self::UnknownTerminal => "Unknown Terminal",
            Self::PathOutsideRoot => "Path Outside Root",
            Self::Timeout => "Timeout",
            Self::Io => "I/O Error",
            Self::Unsupported => "Unsupported",
            Self::SandboxValidation => "Sandbox Validation Error",
            Self::SandboxRuntime => "Sandbox Runtime Error",
            Self::SandboxBudgetExceeded => "Sandbox Budget Exceeded",
            Self::InvalidContinuation => "Invalid Continuation",
            Self::Cancelled => "Cancelled",
            Self::TrackerViolation => "Tracker Violation",
            Self::SessionNotFound => "Session Not Found",
            Self::Conflict => "Conflict",
            Self::Internal => "Internal Error",
        }
    }

    /// JSON-RPC error code used when this error crosses the wire.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::ParseError => PARSE_ERROR,
            Self::InvalidRequest => INVALID_REQUEST,
            Self::MethodNotFound => METHOD_NOT_FOUND,
            Self::InvalidParams => INVALID_PARAMS,
            Self::NotInitialized => SERVER_NOT_INITIALIZED,
            Self::Internal => INTERNAL_ERROR,
            _ => REQUEST_FAILED,
        }
    }
}

/// JSON-RPC error object (`{code, message, data}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Recovers the `ErrorType` a peer attached under `data.type`, if any.
    pub fn error_type(&self) -> Option<ErrorType> {
        self.data
            .as_ref()
            .and_then(|data| data.get("type"))
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("parse error: {message}")]
    Parse { message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },
    #[error("connection not initialized; `initialize` must be called first")]
    NotInitialized,
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl ProtocolError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Parse { .. } => ErrorType::ParseError,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::MethodNotFound { .. } => ErrorType::MethodNotFound,
            Self::InvalidParams { .. } => ErrorType::InvalidParams,
            Self::NotInitialized => ErrorType::NotInitialized,
            Self::Remote { .. } => ErrorType::RemoteError,
        }
    }

    pub fn invalid_params(method: &str, err: impl std::fmt::Display) -> Self {
        Self::InvalidParams {
            method: method.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<RpcErrorObject> for ProtocolError {
    fn from(value: RpcErrorObject) -> Self {
        match value.code {
            METHOD_NOT_FOUND => {
                let method = value
                    .data
                    .as_ref()
                    .and_then(|data| data.get("details"))
                    .and_then(|details| details.get("method"))
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
                    .or_else(|| {
                        value
                            .message
                            .strip_prefix("method not found: ")
                            .map(ToOwned::to_owned)
                    })
                    .unwrap_or(value.message);
                Self::MethodNotFound { method }
            }
            SERVER_NOT_INITIALIZED => Self::NotInitialized,
            _ => Self::Remote {
                code: value.code,
                message: value.message,
                data: value.data,
            },
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },
    #[error("terminal {terminal_id} already exited")]
    TerminalExited { terminal_id: String },
    #[error("unknown terminal: {terminal_id}")]
    UnknownTerminal { terminal_id: String },
    #[error("path escapes workspace root: {path}")]
    PathOutsideRoot { path: String },
    #[error("timed out: {operation}")]
    Timeout { operation: String },
    #[error("io error: {message}")]
    Io { message: String },
    #[error("unsupported: {message}")]
    Unsupported { message: String },
    #[error("remote error: {message}")]
    Remote { message: String },
}

impl CapabilityError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::PermissionDenied { .. } => ErrorType::PermissionDenied,
            Self::TerminalExited { .. } => ErrorType::TerminalExited,
            Self::UnknownTerminal { .. } => ErrorType::UnknownTerminal,
            Self::PathOutsideRoot { .. } => ErrorType::PathOutsideRoot,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Io { .. } => ErrorType::Io,
            Self::Unsupported { .. } => ErrorType::Unsupported,
            Self::Remote { .. } => ErrorType::RemoteError,
        }
    }

    pub fn io(path: impl std::fmt::Display, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                message: format!("{path}: {err}"),
            },
            _ => Self::Io {
                message: format!("{path}: {err}"),
            },
        }
    }

    fn details(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::NotFound { path } | Self::PathOutsideRoot { path } => {
                map.insert("path".to_string(), Value::String(path.clone()));
            }
            Self::TerminalExited { terminal_id } | Self::UnknownTerminal { terminal_id } => {
                map.insert("terminalId".to_string(), Value::String(terminal_id.clone()));
            }
            Self::Timeout { operation } => {
                map.insert("operation".to_string(), Value::String(operation.clone()));
            }
            _ => {}
        }
        map
    }
}

impl From<ProtocolError> for CapabilityError {
    fn from(value: ProtocolError) -> Self {
        if let ProtocolError::Remote {
            data: Some(data), ..
        } = &value
        {
            if let Some(restored) = capability_error_from_data(data) {
                return restored;
            }
        }
        Self::Remote {
            message: value.to_string(),
        }
    }
}

fn capability_error_from_data(data: &Value) -> Option<CapabilityError> {
    let error_type: ErrorType = serde_json::from_value(data.get("type")?.clone()).ok()?;
    let message = data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let field = |key: &str| {
        data.get("details")
            .and_then(|details| details.get(key))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    };
    let restored = match error_type {
        ErrorType::NotFound => CapabilityError::NotFound {
            path: field("path").unwrap_or(message),
        },
        ErrorType::PathOutsideRoot => CapabilityError::PathOutsideRoot {
            path: field("path").unwrap_or(message),
        },
        ErrorType::PermissionDenied => CapabilityError::PermissionDenied { message },
        ErrorType::TerminalExited => CapabilityError::TerminalExited {
            terminal_id: field("terminalId").unwrap_or(message),
        },
        ErrorType::UnknownTerminal => CapabilityError::UnknownTerminal {
            terminal_id: field("terminalId").unwrap_or(message),
        },
        ErrorType::Timeout => CapabilityError::Timeout {
            operation: field("operation").unwrap_or(message),
        },
        ErrorType::Io => CapabilityError::Io { message },
        ErrorType::Unsupported => CapabilityError::Unsupported { message },
        _ => return None,
    };
    Some(restored)
}

/// A single allow-list violation found before a script runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Violation {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error("script rejected: {}", join_violations(.violations))]
    Validation { violations: Vec<Violation> },
    #[error("{kind} (line {line}): {message}")]
    Runtime {
        kind: String,
        message: String,
        line: usize,
    },
    #[error("budget exceeded: {reason}")]
    BudgetExceeded { reason: String },
    #[error("invalid continuation token {token}")]
    InvalidContinuation { token: u64 },
    #[error("script is not suspended")]
    NotSuspended,
    #[error("script cancelled")]
    Cancelled,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SandboxError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Validation { .. } => ErrorType::SandboxValidation,
            Self::Runtime { .. } => ErrorType::SandboxRuntime,
            Self::BudgetExceeded { .. } => ErrorType::SandboxBudgetExceeded,
            Self::InvalidContinuation { .. } | Self::NotSuspended => {
                ErrorType::InvalidContinuation
            }
            Self::Cancelled => ErrorType::Cancelled,
        }
    }

    /// Runtime and budget failures go back to the model as text so it can adapt.
    pub fn is_reportable_to_model(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::Runtime { .. } | Self::BudgetExceeded { .. }
        )
    }

    pub fn validation(line: usize, message: impl Into<String>) -> Self {
        Self::Validation {
            violations: vec![Violation {
                line,
                message: message.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("tool call {id} already started")]
    DuplicateStart { id: String },
    #[error("unknown tool call {id}")]
    UnknownToolCall { id: String },
    #[error("tool call {id} already reached terminal status {status}")]
    AlreadyTerminal { id: String, status: String },
    #[error("tool call {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },
    #[error("permission request already pending for tool call {id}")]
    PermissionPending { id: String },
}

impl TrackerError {
    pub fn tool_call_id(&self) -> &str {
        match self {
            Self::DuplicateStart { id }
            | Self::UnknownToolCall { id }
            | Self::AlreadyTerminal { id, .. }
            | Self::InvalidTransition { id, .. }
            | Self::PermissionPending { id } => id,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Protocol(err) => err.error_type(),
            Self::Capability(err) => err.error_type(),
            Self::Sandbox(err) => err.error_type(),
            Self::Tracker(_) => ErrorType::TrackerViolation,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    fn details(&self) -> Option<Value> {
        let map = match self {
            Self::Capability(err) => err.details(),
            Self::Protocol(ProtocolError::MethodNotFound { method }) => {
                let mut map = Map::new();
                map.insert("method".to_string(), Value::String(method.clone()));
                map
            }
            Self::Sandbox(SandboxError::Validation { violations }) => {
                let mut map = Map::new();
                map.insert(
                    "violations".to_string(),
                    serde_json::to_value(violations).unwrap_or(Value::Null),
                );
                map
            }
            Self::Sandbox(SandboxError::Runtime { kind, line, .. }) => {
                let mut map = Map::new();
                map.insert("kind".to_string(), Value::String(kind.clone()));
                map.insert("line".to_string(), Value::from(*line as u64));
                map
            }
            Self::Tracker(err) => {
                let mut map = Map::new();
                map.insert(
                    "toolCallId".to_string(),
                    Value::String(err.tool_call_id().to_string()),
                );
                map
            }
            Self::SessionNotFound { session_id } => {
                let mut map = Map::new();
                map.insert("sessionId".to_string(), Value::String(session_id.clone()));
                map
            }
            _ => Map::new(),
        };
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    pub fn to_rpc_error(&self) -> RpcErrorObject {
        let error_type = self.error_type();
        let message = self.to_string();
        let mut data = Map::new();
        data.insert(
            "type".to_string(),
            Value::String(error_type.as_str().to_string()),
        );
        data.insert(
            "title".to_string(),
            Value::String(error_type.title().to_string()),
        );
        data.insert("message".to_string(), Value::String(message.clone()));
        if let Some(details) = self.details() {
            data.insert("details".to_string(), details);
        }
        RpcErrorObject::new(error_type.rpc_code(), message).with_data(Value::Object(data))
    }
}

impl From<BridgeError> for RpcErrorObject {
    fn from(value: BridgeError) -> Self {
        value.to_rpc_error()
    }
}

impl From<&BridgeError> for RpcErrorObject {
    fn from(value: &BridgeError) -> Self {
        value.to_rpc_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_found_uses_standard_code() {
        let err = BridgeError::from(ProtocolError::MethodNotFound {
            method: "fs/delete".to_string(),
        });
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, METHOD_NOT_FOUND);
        assert_eq!(rpc.message, "method not found: fs/delete");
        assert_eq!(rpc.error_type(), Some(ErrorType::MethodNotFound));
        assert_eq!(
            rpc.data.as_ref().map(|data| &data["details"]["method"]),
            Some(&Value::String("fs/delete".to_string()))
        );

        let restored = ProtocolError::from(rpc);
        assert_eq!(
            restored,
            ProtocolError::MethodNotFound {
                method: "fs/delete".to_string()
            }
        );
    }

    #[test]
    fn capability_errors_survive_the_wire() {
        let original = CapabilityError::NotFound {
            path: "missing.txt".to_string(),
        };
        let rpc = BridgeError::from(original.clone()).to_rpc_error();
        assert_eq!(rpc.code, REQUEST_FAILED);

        let restored = CapabilityError::from(ProtocolError::from(rpc));
        assert_eq!(restored, original);
    }

    #[test]
    fn validation_error_lists_every_violation() {
        let err = SandboxError::Validation {
            violations: vec![
                Violation {
                    line: 1,
                    message: "import of module `os` is not allowed".to_string(),
                },
                Violation {
                    line: 3,
                    message: "class definitions are not allowed".to_string(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "script rejected: line 1: import of module `os` is not allowed; \
             line 3: class definitions are not allowed"
        );
        let rpc = BridgeError::from(err).to_rpc_error();
        let violations = &rpc.data.expect("data")["details"]["violations"];
        assert_eq!(violations.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn unknown_remote_errors_stay_opaque() {
        let rpc = RpcErrorObject::new(-32000, "boom");
        let err = CapabilityError::from(ProtocolError::from(rpc));
        assert!(matches!(err, CapabilityError::Remote { .. }));
    }
}

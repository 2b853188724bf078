//! The Agent side: serves `initialize`, `session/*` and drives a planner per prompt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use acp_bridge_error::{BridgeError, ProtocolError};
use acp_bridge_schema::methods::{INITIALIZE, SESSION_CANCEL, SESSION_NEW, SESSION_PROMPT};
use acp_bridge_schema::{
    negotiate_version, AgentCapabilities, CancelNotification, ClientCapabilities, ContentBlock,
    EmptyResponse, Implementation, InitializeRequest, InitializeResponse, NewSessionRequest,
    NewSessionResponse, PromptCapabilities, PromptRequest, PromptResponse, SessionId,
    SessionUpdate, StopReason,
};
use acp_bridge_wire::{parse_params, Connection, ConnectionOptions, MessageHandler};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};

use crate::capability::{RemoteCapabilities, SharedCapabilities};
use crate::code_mode::CodeModeOutcome;
use crate::config::BridgeConfig;
use crate::executor::{CancelSignal, ToolOutcome};
use crate::runtime::SessionRuntime;

pub const AGENT_NAME: &str = "acp-bridge";

/// What happened so far in the current prompt turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Replied(String),
    ToolResult { name: String, text: String, success: bool },
    CodeResult { text: String, success: bool },
}

#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: SessionId,
    pub prompt: String,
    /// Signatures of the callable functions, one per line.
    pub functions: String,
    pub events: Vec<TurnEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerStep {
    Reply(String),
    ToolCall { name: String, arguments: Map<String, Value> },
    CodeMode(String),
    Done,
}

/// Decides the next step of a prompt turn. A language model sits here in a
/// real deployment.
#[async_trait]
pub trait TurnPlanner: Send + Sync + 'static {
    async fn next_step(&self, context: &TurnContext) -> Result<PlannerStep, BridgeError>;
}

/// Follows directives embedded in the prompt: a fenced ```python block runs
/// as Code Mode, a `/tool name {json}` line runs one tool, anything else is
/// echoed back.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectivePlanner;

impl DirectivePlanner {
    fn first_step(prompt: &str) -> Result<PlannerStep, BridgeError> {
        if let Some(code) = fenced_code(prompt) {
            return Ok(PlannerStep::CodeMode(code));
        }
        if let Some(line) = prompt.lines().map(str::trim).find(|line| line.starts_with("/tool ")) {
            let rest = line["/tool ".len()..].trim();
            let (name, raw) = match rest.split_once(char::is_whitespace) {
                Some((name, raw)) => (name, raw.trim()),
                None => (rest, ""),
            };
            let arguments = if raw.is_empty() {
                Map::new()
            } else {
                match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(arguments)) => arguments,
                    _ => {
                        return Ok(PlannerStep::Reply(format!(
                            "`/tool {name}` expects a JSON object of arguments"
                        )))
                    }
                }
            };
            return Ok(PlannerStep::ToolCall {
                name: name.to_string(),
                arguments,
            });
        }
        Ok(PlannerStep::Reply(prompt.to_string()))
    }
}

#[async_trait]
impl TurnPlanner for DirectivePlanner {
    async fn next_step(&self, context: &TurnContext) -> Result<PlannerStep, BridgeError> {
        match context.events.last() {
            None => Self::first_step(&context.prompt),
            Some(TurnEvent::ToolResult { text, .. }) | Some(TurnEvent::CodeResult { text, .. }) => {
                Ok(PlannerStep::Reply(text.clone()))
            }
            Some(TurnEvent::Replied(_)) => Ok(PlannerStep::Done),
        }
    }
}

fn fenced_code(prompt: &str) -> Option<String> {
    let mut lines = prompt.lines();
    lines.find(|line| {
        let fence = line.trim();
        fence == "```python" || fence == "```py"
    })?;
    let body = lines
        .take_while(|line| line.trim() != "```")
        .collect::<Vec<_>>();
    Some(body.join("\n") + "\n")
}

struct AgentSession {
    runtime: SessionRuntime,
    turn: Mutex<()>,
    cancel: std::sync::Mutex<CancelSignal>,
}

impl AgentSession {
    fn cancel_signal(&self) -> CancelSignal {
        self.cancel
            .lock()
            .map(|signal| signal.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn reset_cancel(&self) -> CancelSignal {
        let signal = CancelSignal::new();
        match self.cancel.lock() {
            Ok(mut slot) => *slot = signal.clone(),
            Err(poisoned) => *poisoned.into_inner() = signal.clone(),
        }
        signal
    }
}

pub struct Agent {
    surface: SharedCapabilities,
    planner: Arc<dyn TurnPlanner>,
    config: BridgeConfig,
    client_capabilities: RwLock<ClientCapabilities>,
    sessions: RwLock<HashMap<SessionId, Arc<AgentSession>>>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("surface", &self.surface.kind())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(
        surface: SharedCapabilities,
        planner: Arc<dyn TurnPlanner>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            surface,
            planner,
            config,
            client_capabilities: RwLock::new(ClientCapabilities::default()),
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Serves the agent protocol on `reader`/`writer`, reaching the client's
    /// capabilities over the same connection.
    pub fn serve<R, W>(
        reader: R,
        writer: W,
        planner: Arc<dyn TurnPlanner>,
        config: BridgeConfig,
    ) -> Connection
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let options = ConnectionOptions {
            request_timeout: config.request_timeout,
            label: "agent".to_string(),
        };
        Connection::start(reader, writer, options, move |connection| {
            let surface = Arc::new(RemoteCapabilities::new(connection, config.permission_timeout));
            Arc::new(Agent::new(surface, planner, config))
        })
    }

    pub async fn initialize(&self, request: InitializeRequest) -> InitializeResponse {
        let protocol_version = negotiate_version(request.protocol_version);
        tracing::info!(
            requested = request.protocol_version,
            negotiated = protocol_version,
            client = ?request.client_info.as_ref().map(|info| info.name.as_str()),
            "initialize"
        );
        *self.client_capabilities.write().await = request.client_capabilities;
        InitializeResponse {
            protocol_version,
            agent_capabilities: AgentCapabilities {
                load_session: false,
                code_mode: true,
                prompt_capabilities: PromptCapabilities::default(),
            },
            agent_info: Some(Implementation::current(AGENT_NAME)),
        }
    }

    pub async fn new_session(&self, request: NewSessionRequest) -> NewSessionResponse {
        let session_id = SessionId::new(format!(
            "session_{}",
            self.next_session.fetch_add(1, Ordering::SeqCst)
        ));
        let capabilities = self.client_capabilities.read().await.clone();
        let runtime = SessionRuntime::start(
            session_id.clone(),
            self.surface.clone(),
            &self.config,
            &capabilities,
        )
        .await;
        let session = Arc::new(AgentSession {
            runtime,
            turn: Mutex::new(()),
            cancel: std::sync::Mutex::new(CancelSignal::new()),
        });
        self.sessions.write().await.insert(session_id.clone(), session);
        tracing::info!(session_id = %session_id, cwd = %request.cwd, "session created");
        NewSessionResponse { session_id }
    }

    async fn session(&self, session_id: &SessionId) -> Result<Arc<AgentSession>, BridgeError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| BridgeError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, BridgeError> {
        let session = self.session(&request.session_id).await?;
        let Ok(_turn) = session.turn.try_lock() else {
            return Err(BridgeError::Conflict {
                message: format!("session {} already has a prompt running", request.session_id),
            });
        };
        let cancel = session.reset_cancel();
        let runtime = &session.runtime;

        for block in &request.prompt {
            runtime
                .notifier
                .send(SessionUpdate::UserMessageChunk { content: block.clone() })
                .await;
        }

        let mut context = TurnContext {
            session_id: request.session_id.clone(),
            prompt: request.text(),
            functions: runtime.registry.describe(),
            events: Vec::new(),
        };
        let stop_reason = self.run_turn(runtime, &mut context, &cancel).await?;
        if stop_reason == StopReason::Cancelled {
            runtime.tracker.cancel_all().await;
        }
        tracing::info!(
            session_id = %request.session_id,
            steps = context.events.len(),
            stop_reason = ?stop_reason,
            "prompt finished"
        );
        Ok(PromptResponse { stop_reason })
    }

    async fn run_turn(
        &self,
        runtime: &SessionRuntime,
        context: &mut TurnContext,
        cancel: &CancelSignal,
    ) -> Result<StopReason, BridgeError> {
        for _ in 0..self.config.max_turn_requests {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            let step = self.planner.next_step(context).await?;
            tracing::debug!(session_id = %context.session_id, step = ?step, "planner step");
            match step {
                PlannerStep::Done => return Ok(StopReason::EndTurn),
                PlannerStep::Reply(text) => {
                    runtime.notifier.send(SessionUpdate::agent_text(text.clone())).await;
                    context.events.push(TurnEvent::Replied(text));
                }
                PlannerStep::ToolCall { name, arguments } => {
                    let outcome = runtime.executor.execute(&name, arguments, cancel).await?;
                    let (text, success) = match outcome {
                        ToolOutcome::Completed(Value::String(text)) => (text, true),
                        ToolOutcome::Completed(Value::Null) => (format!("{name} done"), true),
                        ToolOutcome::Completed(value) => (value.to_string(), true),
                        ToolOutcome::Failed(message) => {
                            (format!("{name} failed: {message}"), false)
                        }
                        ToolOutcome::Cancelled => return Ok(StopReason::Cancelled),
                    };
                    context.events.push(TurnEvent::ToolResult { name, text, success });
                }
                PlannerStep::CodeMode(code) => {
                    let report = runtime.code_mode.run(&code, cancel).await?;
                    if report.outcome == CodeModeOutcome::Cancelled {
                        return Ok(StopReason::Cancelled);
                    }
                    context.events.push(TurnEvent::CodeResult {
                        text: report.to_text(),
                        success: report.is_success(),
                    });
                }
            }
        }
        Ok(StopReason::MaxTurnRequests)
    }

    /// Stops the running turn. Terminal cleanup continues in the background.
    pub async fn cancel(&self, notification: CancelNotification) -> Result<(), BridgeError> {
        let session = self.session(&notification.session_id).await?;
        session.cancel_signal().cancel();
        tracing::info!(session_id = %notification.session_id, "session cancel requested");
        tokio::spawn(async move {
            session.runtime.teardown().await;
        });
        Ok(())
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|err| BridgeError::internal(err.to_string()))
}

#[async_trait]
impl MessageHandler for Agent {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        match method {
            INITIALIZE => {
                let request: InitializeRequest = parse_params(method, params)?;
                to_value(&self.initialize(request).await)
            }
            SESSION_NEW => {
                let request: NewSessionRequest = parse_params(method, params)?;
                to_value(&self.new_session(request).await)
            }
            SESSION_PROMPT => {
                let request: PromptRequest = parse_params(method, params)?;
                to_value(&self.prompt(request).await?)
            }
            SESSION_CANCEL => {
                let notification: CancelNotification = parse_params(method, params)?;
                self.cancel(notification).await?;
                to_value(&EmptyResponse {})
            }
            other => Err(ProtocolError::MethodNotFound {
                method: other.to_string(),
            }
            .into()),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        match method {
            SESSION_CANCEL => {
                let notification: CancelNotification = parse_params(method, params)?;
                self.cancel(notification).await
            }
            other => {
                tracing::debug!(method = other, "ignoring notification");
                Ok(())
            }
        }
    }
}

/// Text of a prompt as a single content block.
pub fn text_prompt(text: impl Into<String>) -> Vec<ContentBlock> {
    vec![ContentBlock::text(text)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(prompt: &str, events: Vec<TurnEvent>) -> TurnContext {
        TurnContext {
            session_id: SessionId::from("session_1"),
            prompt: prompt.to_string(),
            functions: String::new(),
            events,
        }
    }

    #[tokio::test]
    async fn planner_picks_code_block_first() {
        let prompt = "count it\n```python\nx = read_file(\"a.txt\")\nprint(x)\n```\nthanks";
        let step = DirectivePlanner.next_step(&context(prompt, Vec::new())).await.expect("step");
        assert_eq!(
            step,
            PlannerStep::CodeMode("x = read_file(\"a.txt\")\nprint(x)\n".to_string())
        );
    }

    #[tokio::test]
    async fn planner_parses_tool_directive() {
        let prompt = "please\n/tool read_file {\"path\": \"a.txt\"}";
        let step = DirectivePlanner.next_step(&context(prompt, Vec::new())).await.expect("step");
        assert_eq!(
            step,
            PlannerStep::ToolCall {
                name: "read_file".to_string(),
                arguments: json!({"path": "a.txt"}).as_object().cloned().unwrap_or_default(),
            }
        );

        let step = DirectivePlanner
            .next_step(&context("/tool read_file [1]", Vec::new()))
            .await
            .expect("step");
        assert!(matches!(step, PlannerStep::Reply(text) if text.contains("JSON object")));
    }

    #[tokio::test]
    async fn planner_replies_with_results_then_stops() {
        let events = vec![TurnEvent::CodeResult {
            text: "hello1\n".to_string(),
            success: true,
        }];
        let step = DirectivePlanner.next_step(&context("x", events)).await.expect("step");
        assert_eq!(step, PlannerStep::Reply("hello1\n".to_string()));

        let events = vec![TurnEvent::Replied("hi".to_string())];
        let step = DirectivePlanner.next_step(&context("hi", events)).await.expect("step");
        assert_eq!(step, PlannerStep::Done);

        let step = DirectivePlanner.next_step(&context("hi", Vec::new())).await.expect("step");
        assert_eq!(step, PlannerStep::Reply("hi".to_string()));
    }
}

//! The Client side: answers an Agent's capability requests from the local
//! machine and accumulates the session it reports.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use acp_bridge_error::{BridgeError, CapabilityError, ProtocolError};
use acp_bridge_schema::methods::{
    FS_READ_TEXT_FILE, FS_WRITE_TEXT_FILE, INITIALIZE, PERMISSION_REQUEST, SESSION_CANCEL,
    SESSION_NEW, SESSION_PROMPT, SESSION_UPDATE, TERMINAL_CREATE, TERMINAL_KILL, TERMINAL_OUTPUT,
    TERMINAL_RELEASE, TERMINAL_WAIT_FOR_EXIT, TOOLS_CALL, TOOLS_LIST,
};
use acp_bridge_schema::{
    CallToolRequest, CallToolResponse, CancelNotification, ClientCapabilities, ContentBlock,
    CreateTerminalRequest, CreateTerminalResponse, DiscoverToolsRequest, DiscoverToolsResponse,
    EmptyResponse, Implementation, InitializeRequest, InitializeResponse, NewSessionRequest,
    NewSessionResponse, PromptRequest, PromptResponse, ReadTextFileRequest, ReadTextFileResponse,
    RequestPermissionOutcome, RequestPermissionRequest, RequestPermissionResponse, Session,
    SessionId, SessionNotification, StopReason, TerminalRequest, WriteTextFileRequest,
    PROTOCOL_VERSION,
};
use acp_bridge_wire::{
    parse_params, spawn_connection, Connection, ConnectionOptions, LaunchSpec, MessageHandler,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::capability::{CapabilitySurface, LocalCapabilities};
use crate::session::SessionStore;

pub const CLIENT_NAME: &str = "acp-bridge-client";

const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How `permission/request` is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionPrompter {
    /// First option, as the local surface does.
    #[default]
    Auto,
    /// Ask on the terminal: options on stderr, choice read from stdin.
    Stdin,
}

impl PermissionPrompter {
    async fn decide(
        &self,
        local: &LocalCapabilities,
        request: RequestPermissionRequest,
    ) -> Result<RequestPermissionOutcome, CapabilityError> {
        match self {
            Self::Auto => local.request_permission(request).await,
            Self::Stdin => tokio::task::spawn_blocking(move || ask_on_terminal(&request))
                .await
                .map_err(|err| CapabilityError::Io {
                    message: format!("permission prompt failed: {err}"),
                })?,
        }
    }
}

fn ask_on_terminal(
    request: &RequestPermissionRequest,
) -> Result<RequestPermissionOutcome, CapabilityError> {
    let title = request
        .tool_call
        .title
        .clone()
        .unwrap_or_else(|| request.tool_call.tool_call_id.to_string());
    let mut stderr = std::io::stderr().lock();
    let io = |err: std::io::Error| CapabilityError::Io {
        message: err.to_string(),
    };
    writeln!(stderr, "Permission requested: {title}").map_err(io)?;
    for (index, option) in request.options.iter().enumerate() {
        writeln!(stderr, "  [{}] {}", index + 1, option.name).map_err(io)?;
    }
    write!(stderr, "Choice (empty to cancel): ").map_err(io)?;
    stderr.flush().map_err(io)?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer).map_err(io)?;
    let choice = answer
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|choice| choice.checked_sub(1))
        .and_then(|index| request.options.get(index));
    Ok(match choice {
        Some(option) => RequestPermissionOutcome::Selected {
            option_id: option.option_id.clone(),
        },
        None => RequestPermissionOutcome::Cancelled,
    })
}

/// Serves the client half of the protocol.
pub struct ClientHandler {
    local: Arc<LocalCapabilities>,
    prompter: PermissionPrompter,
    store: Arc<SessionStore>,
}

impl ClientHandler {
    pub fn new(
        local: Arc<LocalCapabilities>,
        prompter: PermissionPrompter,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            local,
            prompter,
            store,
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|err| BridgeError::internal(err.to_string()))
}

#[async_trait]
impl MessageHandler for ClientHandler {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let local = &self.local;
        match method {
            FS_READ_TEXT_FILE => {
                let request: ReadTextFileRequest = parse_params(method, params)?;
                let content = local
                    .read_text_file(&request.session_id, &request.path, request.line, request.limit)
                    .await?;
                to_value(&ReadTextFileResponse { content })
            }
            FS_WRITE_TEXT_FILE => {
                let request: WriteTextFileRequest = parse_params(method, params)?;
                local
                    .write_text_file(&request.session_id, &request.path, &request.content)
                    .await?;
                to_value(&EmptyResponse {})
            }
            TERMINAL_CREATE => {
                let request: CreateTerminalRequest = parse_params(method, params)?;
                let terminal_id = local.create_terminal(request).await?;
                to_value(&CreateTerminalResponse { terminal_id })
            }
            TERMINAL_OUTPUT => {
                let request: TerminalRequest = parse_params(method, params)?;
                to_value(&local.terminal_output(&request.session_id, &request.terminal_id).await?)
            }
            TERMINAL_WAIT_FOR_EXIT => {
                let request: TerminalRequest = parse_params(method, params)?;
                to_value(
                    &local
                        .wait_for_terminal_exit(&request.session_id, &request.terminal_id)
                        .await?,
                )
            }
            TERMINAL_KILL => {
                let request: TerminalRequest = parse_params(method, params)?;
                local.kill_terminal(&request.session_id, &request.terminal_id).await?;
                to_value(&EmptyResponse {})
            }
            TERMINAL_RELEASE => {
                let request: TerminalRequest = parse_params(method, params)?;
                local
                    .release_terminal(&request.session_id, &request.terminal_id)
                    .await?;
                to_value(&EmptyResponse {})
            }
            PERMISSION_REQUEST => {
                let request: RequestPermissionRequest = parse_params(method, params)?;
                let outcome = self.prompter.decide(local, request).await?;
                to_value(&RequestPermissionResponse { outcome })
            }
            TOOLS_LIST => {
                let request: DiscoverToolsRequest = parse_params(method, params)?;
                let tools = local.discover_tools(&request.session_id).await?;
                to_value(&DiscoverToolsResponse { tools })
            }
            TOOLS_CALL => {
                let request: CallToolRequest = parse_params(method, params)?;
                let output = local
                    .call_tool(&request.session_id, &request.name, request.arguments)
                    .await?;
                to_value(&CallToolResponse { output })
            }
            other => Err(ProtocolError::MethodNotFound {
                method: other.to_string(),
            }
            .into()),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        match method {
            SESSION_UPDATE => {
                let notification: SessionNotification = parse_params(method, params)?;
                self.store.apply(notification).await;
                Ok(())
            }
            other => {
                tracing::debug!(method = other, "ignoring notification");
                Ok(())
            }
        }
    }
}

/// A connection to an Agent plus the local state that serves it.
#[derive(Debug)]
pub struct BridgeClient {
    connection: Connection,
    store: Arc<SessionStore>,
    local: Arc<LocalCapabilities>,
    prompt_timeout: Duration,
}

impl BridgeClient {
    pub fn connect<R, W>(
        reader: R,
        writer: W,
        local: Arc<LocalCapabilities>,
        prompter: PermissionPrompter,
        options: ConnectionOptions,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let store = Arc::new(SessionStore::new());
        let handler = Arc::new(ClientHandler::new(local.clone(), prompter, store.clone()));
        let connection = Connection::start(reader, writer, options, move |_| handler);
        Self {
            connection,
            store,
            local,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
        }
    }

    /// Launches an Agent process and connects to its stdio.
    pub async fn spawn(
        launch: LaunchSpec,
        local: Arc<LocalCapabilities>,
        prompter: PermissionPrompter,
        options: ConnectionOptions,
    ) -> Result<Self, BridgeError> {
        let store = Arc::new(SessionStore::new());
        let handler = Arc::new(ClientHandler::new(local.clone(), prompter, store.clone()));
        let connection = spawn_connection(launch, options, move |_| handler).await?;
        Ok(Self {
            connection,
            store,
            local,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
        })
    }

    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn local(&self) -> &Arc<LocalCapabilities> {
        &self.local
    }

    pub async fn initialize(&self) -> Result<InitializeResponse, BridgeError> {
        let request = InitializeRequest {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: ClientCapabilities::full(),
            client_info: Some(Implementation::current(CLIENT_NAME)),
        };
        let response: InitializeResponse =
            self.connection.request_typed(INITIALIZE, &request).await?;
        tracing::info!(
            protocol_version = response.protocol_version,
            agent = ?response.agent_info.as_ref().map(|info| info.name.as_str()),
            code_mode = response.agent_capabilities.code_mode,
            "agent initialized"
        );
        Ok(response)
    }

    pub async fn new_session(&self, cwd: impl Into<String>) -> Result<SessionId, BridgeError> {
        let request = NewSessionRequest { cwd: cwd.into() };
        let response: NewSessionResponse =
            self.connection.request_typed(SESSION_NEW, &request).await?;
        Ok(response.session_id)
    }

    pub async fn prompt(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
    ) -> Result<StopReason, BridgeError> {
        let request = PromptRequest {
            session_id: session_id.clone(),
            prompt: vec![ContentBlock::text(text)],
        };
        let response: PromptResponse = self
            .connection
            .request_typed_with_timeout(SESSION_PROMPT, &request, self.prompt_timeout)
            .await?;
        Ok(response.stop_reason)
    }

    pub async fn cancel(&self, session_id: &SessionId) -> Result<(), BridgeError> {
        let notification = CancelNotification {
            session_id: session_id.clone(),
        };
        self.connection.notify(SESSION_CANCEL, &notification).await?;
        Ok(())
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> Option<Session> {
        self.store.snapshot(session_id).await
    }

    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_bridge_schema::{PermissionOption, ToolCallId, ToolCallUpdate};
    use serde_json::json;

    fn handler(dir: &std::path::Path) -> ClientHandler {
        let local = Arc::new(LocalCapabilities::new(dir).expect("local"));
        ClientHandler::new(local, PermissionPrompter::Auto, Arc::new(SessionStore::new()))
    }

    #[tokio::test]
    async fn serves_file_requests_from_the_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = handler(dir.path());
        handler
            .handle_request(
                FS_WRITE_TEXT_FILE,
                json!({"sessionId": "session_1", "path": "notes/a.txt", "content": "one\ntwo\n"}),
            )
            .await
            .expect("write");
        let response = handler
            .handle_request(
                FS_READ_TEXT_FILE,
                json!({"sessionId": "session_1", "path": "notes/a.txt", "line": 2}),
            )
            .await
            .expect("read");
        assert_eq!(response, json!({"content": "two\n"}));
    }

    #[tokio::test]
    async fn capability_errors_surface_as_rpc_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = handler(dir.path());
        let err = handler
            .handle_request(
                FS_READ_TEXT_FILE,
                json!({"sessionId": "session_1", "path": "../outside.txt"}),
            )
            .await
            .expect_err("escape");
        assert!(matches!(err, BridgeError::Capability(CapabilityError::PathOutsideRoot { .. })));

        let err = handler
            .handle_request("fs/delete", json!({}))
            .await
            .expect_err("unknown method");
        assert!(matches!(err, BridgeError::Protocol(ProtocolError::MethodNotFound { .. })));
    }

    #[tokio::test]
    async fn auto_prompter_selects_first_option() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = handler(dir.path());
        let request = RequestPermissionRequest {
            session_id: SessionId::from("session_1"),
            tool_call: ToolCallUpdate::new(ToolCallId::from("call_1")),
            options: PermissionOption::standard(),
        };
        let response = handler
            .handle_request(PERMISSION_REQUEST, serde_json::to_value(&request).expect("encode"))
            .await
            .expect("permission");
        insta::assert_json_snapshot!(response, @r###"
        {
          "outcome": {
            "optionId": "allow_once",
            "outcome": "selected"
          }
        }
        "###);
    }

    #[tokio::test]
    async fn session_updates_feed_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = handler(dir.path());
        handler
            .handle_notification(
                SESSION_UPDATE,
                json!({
                    "sessionId": "session_1",
                    "seq": 1,
                    "update": {
                        "sessionUpdate": "agent_message_chunk",
                        "content": {"type": "text", "text": "hi"}
                    }
                }),
            )
            .await
            .expect("notification");
        let session = handler
            .store
            .snapshot(&SessionId::from("session_1"))
            .await
            .expect("session");
        assert_eq!(session.last_seq, 1);
        assert_eq!(session.messages.len(), 1);
    }
}

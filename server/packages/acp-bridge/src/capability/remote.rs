use std::collections::{HashMap, HashSet};
use std::time::Duration;

use acp_bridge_error::{CapabilityError, METHOD_NOT_FOUND};
use acp_bridge_schema::methods::{
    FS_READ_TEXT_FILE, FS_WRITE_TEXT_FILE, PERMISSION_REQUEST, SESSION_UPDATE, TERMINAL_CREATE,
    TERMINAL_KILL, TERMINAL_OUTPUT, TERMINAL_RELEASE, TERMINAL_WAIT_FOR_EXIT, TOOLS_CALL,
    TOOLS_LIST,
};
use acp_bridge_schema::{
    CallToolRequest, CallToolResponse, CreateTerminalRequest, CreateTerminalResponse,
    DiscoverToolsRequest, DiscoverToolsResponse, EmptyResponse, ReadTextFileRequest,
    ReadTextFileResponse, RequestPermissionOutcome, RequestPermissionRequest,
    RequestPermissionResponse, SessionId, SessionNotification, TerminalExitStatus,
    TerminalOutputResponse, TerminalRequest, ToolDescriptor, WriteTextFileRequest,
};
use acp_bridge_wire::{Connection, WireError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::CapabilitySurface;

/// Forwards every operation to the client on the other end of `connection`.
#[derive(Debug)]
pub struct RemoteCapabilities {
    connection: Connection,
    permission_timeout: Duration,
    terminals: Mutex<HashMap<SessionId, HashSet<String>>>,
}

impl RemoteCapabilities {
    pub fn new(connection: Connection, permission_timeout: Duration) -> Self {
        Self {
            connection,
            permission_timeout,
            terminals: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn terminal_request(session_id: &SessionId, terminal_id: &str) -> TerminalRequest {
        TerminalRequest {
            session_id: session_id.clone(),
            terminal_id: terminal_id.to_string(),
        }
    }

    async fn forget_terminal(&self, session_id: &SessionId, terminal_id: &str) {
        let mut terminals = self.terminals.lock().await;
        if let Some(owned) = terminals.get_mut(session_id) {
            owned.remove(terminal_id);
            if owned.is_empty() {
                terminals.remove(session_id);
            }
        }
    }
}

#[async_trait]
impl CapabilitySurface for RemoteCapabilities {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn read_text_file(
        &self,
        session_id: &SessionId,
        path: &str,
        line: Option<u32>,
        limit: Option<u32>,
    ) -> Result<String, CapabilityError> {
        let request = ReadTextFileRequest {
            session_id: session_id.clone(),
            path: path.to_string(),
            line,
            limit,
        };
        let response: ReadTextFileResponse = self
            .connection
            .request_typed(FS_READ_TEXT_FILE, &request)
            .await?;
        Ok(response.content)
    }

    async fn write_text_file(
        &self,
        session_id: &SessionId,
        path: &str,
        content: &str,
    ) -> Result<(), CapabilityError> {
        let request = WriteTextFileRequest {
            session_id: session_id.clone(),
            path: path.to_string(),
            content: content.to_string(),
        };
        let _: EmptyResponse = self
            .connection
            .request_typed(FS_WRITE_TEXT_FILE, &request)
            .await?;
        Ok(())
    }

    async fn create_terminal(
        &self,
        request: CreateTerminalRequest,
    ) -> Result<String, CapabilityError> {
        let session_id = request.session_id.clone();
        let response: CreateTerminalResponse = self
            .connection
            .request_typed(TERMINAL_CREATE, &request)
            .await?;
        self.terminals
            .lock()
            .await
            .entry(session_id)
            .or_default()
            .insert(response.terminal_id.clone());
        Ok(response.terminal_id)
    }

    async fn terminal_output(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<TerminalOutputResponse, CapabilityError> {
        let request = Self::terminal_request(session_id, terminal_id);
        Ok(self.connection.request_typed(TERMINAL_OUTPUT, &request).await?)
    }

    async fn wait_for_terminal_exit(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<TerminalExitStatus, CapabilityError> {
        let request = Self::terminal_request(session_id, terminal_id);
        Ok(self
            .connection
            .request_typed(TERMINAL_WAIT_FOR_EXIT, &request)
            .await?)
    }

    async fn kill_terminal(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<(), CapabilityError> {
        let request = Self::terminal_request(session_id, terminal_id);
        let _: EmptyResponse = self.connection.request_typed(TERMINAL_KILL, &request).await?;
        Ok(())
    }

    async fn release_terminal(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<(), CapabilityError> {
        self.forget_terminal(session_id, terminal_id).await;
        let request = Self::terminal_request(session_id, terminal_id);
        let _: EmptyResponse = self
            .connection
            .request_typed(TERMINAL_RELEASE, &request)
            .await?;
        Ok(())
    }

    async fn request_permission(
        &self,
        request: RequestPermissionRequest,
    ) -> Result<RequestPermissionOutcome, CapabilityError> {
        let response: RequestPermissionResponse = self
            .connection
            .request_typed_with_timeout(PERMISSION_REQUEST, &request, self.permission_timeout)
            .await?;
        Ok(response.outcome)
    }

    async fn session_update(&self, notification: SessionNotification) {
        if let Err(err) = self.connection.notify(SESSION_UPDATE, &notification).await {
            tracing::warn!(
                session_id = %notification.session_id,
                update = notification.update.kind(),
                error = %err,
                "failed to deliver session update"
            );
        }
    }

    async fn discover_tools(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ToolDescriptor>, CapabilityError> {
        let request = DiscoverToolsRequest {
            session_id: session_id.clone(),
        };
        match self
            .connection
            .request_typed::<_, DiscoverToolsResponse>(TOOLS_LIST, &request)
            .await
        {
            Ok(response) => Ok(response.tools),
            Err(WireError::Rpc(error)) if error.code == METHOD_NOT_FOUND => {
                tracing::debug!("client offers no extra tools");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn call_tool(
        &self,
        session_id: &SessionId,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let request = CallToolRequest {
            session_id: session_id.clone(),
            name: name.to_string(),
            arguments,
        };
        let response: CallToolResponse = self.connection.request_typed(TOOLS_CALL, &request).await?;
        Ok(response.output)
    }

    async fn release_session(&self, session_id: &SessionId) {
        let owned = self.terminals.lock().await.remove(session_id).unwrap_or_default();
        for terminal_id in owned {
            let request = Self::terminal_request(session_id, &terminal_id);
            if let Err(err) = self
                .connection
                .request_typed::<_, EmptyResponse>(TERMINAL_RELEASE, &request)
                .await
            {
                tracing::warn!(
                    session_id = %session_id,
                    terminal_id = %terminal_id,
                    error = %err,
                    "failed to release terminal"
                );
            }
        }
    }
}

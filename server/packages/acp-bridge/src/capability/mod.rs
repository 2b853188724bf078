//! The operations a tool call may perform on the host.
//!
//! Tool logic is written against [`CapabilitySurface`] only. The agent talks to
//! a remote IDE through [`RemoteCapabilities`]; headless runs and the bundled
//! client use [`LocalCapabilities`].

mod local;
mod remote;

use std::sync::Arc;

use acp_bridge_error::CapabilityError;
use acp_bridge_schema::{
    CreateTerminalRequest, RequestPermissionOutcome, RequestPermissionRequest, SessionId,
    SessionNotification, TerminalExitStatus, TerminalOutputResponse, ToolDescriptor,
};
use async_trait::async_trait;
use serde_json::{Map, Value};

pub use local::{CommandStub, LocalCapabilities};
pub use remote::RemoteCapabilities;

#[async_trait]
pub trait CapabilitySurface: Send + Sync + 'static {
    /// `remote` or `local`, attached to log lines.
    fn kind(&self) -> &'static str;

    async fn read_text_file(
        &self,
        session_id: &SessionId,
        path: &str,
        line: Option<u32>,
        limit: Option<u32>,
    ) -> Result<String, CapabilityError>;

    async fn write_text_file(
        &self,
        session_id: &SessionId,
        path: &str,
        content: &str,
    ) -> Result<(), CapabilityError>;

    /// Returns the new terminal id.
    async fn create_terminal(
        &self,
        request: CreateTerminalRequest,
    ) -> Result<String, CapabilityError>;

    async fn terminal_output(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<TerminalOutputResponse, CapabilityError>;

    async fn wait_for_terminal_exit(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<TerminalExitStatus, CapabilityError>;

    async fn kill_terminal(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<(), CapabilityError>;

    async fn release_terminal(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<(), CapabilityError>;

    async fn request_permission(
        &self,
        request: RequestPermissionRequest,
    ) -> Result<RequestPermissionOutcome, CapabilityError>;

    /// Delivery failures are logged, never returned.
    async fn session_update(&self, notification: SessionNotification);

    /// Extra tools offered by the host. Empty when the host has none.
    async fn discover_tools(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ToolDescriptor>, CapabilityError>;

    async fn call_tool(
        &self,
        session_id: &SessionId,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, CapabilityError>;

    /// Kills and releases every terminal the session still owns.
    async fn release_session(&self, session_id: &SessionId);
}

pub type SharedCapabilities = Arc<dyn CapabilitySurface>;

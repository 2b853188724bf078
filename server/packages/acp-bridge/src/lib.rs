//! Capability bridge between ACP agents and clients.

pub mod agent;
pub mod capability;
pub mod cli;
pub mod client;
pub mod code_mode;
pub mod config;
pub mod executor;
pub mod permission;
pub mod runtime;
pub mod session;
pub mod toolset;
pub mod tracker;

pub use agent::{Agent, DirectivePlanner, PlannerStep, TurnContext, TurnEvent, TurnPlanner};
pub use capability::{
    CapabilitySurface, CommandStub, LocalCapabilities, RemoteCapabilities, SharedCapabilities,
};
pub use client::{BridgeClient, ClientHandler, PermissionPrompter};
pub use code_mode::{CodeModeHost, CodeModeOutcome, CodeModeReport};
pub use config::{BridgeConfig, ConfigError, PermissionMode};
pub use executor::{CancelSignal, ToolExecutor, ToolOutcome};
pub use permission::{
    AutoApprove, Interactive, PermissionBroker, PermissionOutcome, PermissionPolicy,
};
pub use runtime::SessionRuntime;
pub use session::{SessionAccumulator, SessionStore};
pub use toolset::{ExternalFunctionRegistry, ToolError};
pub use tracker::{SessionNotifier, ToolCallTracker};

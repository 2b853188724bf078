use std::sync::Arc;

use acp_bridge_schema::{ClientCapabilities, SessionId};

use crate::capability::SharedCapabilities;
use crate::code_mode::CodeModeHost;
use crate::config::BridgeConfig;
use crate::executor::ToolExecutor;
use crate::permission::{policy_for, PermissionBroker, PermissionPolicy};
use crate::toolset::ExternalFunctionRegistry;
use crate::tracker::{SessionNotifier, ToolCallTracker};

/// Everything one session needs to run tools, wired to one capability surface.
pub struct SessionRuntime {
    pub session_id: SessionId,
    pub surface: SharedCapabilities,
    pub notifier: SessionNotifier,
    pub tracker: Arc<ToolCallTracker>,
    pub broker: Arc<PermissionBroker>,
    pub registry: Arc<ExternalFunctionRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub code_mode: CodeModeHost,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("session_id", &self.session_id)
            .field("surface", &self.surface.kind())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl SessionRuntime {
    pub async fn start(
        session_id: SessionId,
        surface: SharedCapabilities,
        config: &BridgeConfig,
        capabilities: &ClientCapabilities,
    ) -> Self {
        let policy = policy_for(config.permission_mode, surface.clone(), config.permission_timeout);
        Self::with_policy(session_id, surface, config, capabilities, policy).await
    }

    pub async fn with_policy(
        session_id: SessionId,
        surface: SharedCapabilities,
        config: &BridgeConfig,
        capabilities: &ClientCapabilities,
        policy: Arc<dyn PermissionPolicy>,
    ) -> Self {
        let notifier = SessionNotifier::new(session_id.clone(), surface.clone());
        let tracker = Arc::new(ToolCallTracker::new(notifier.clone()));
        let broker = Arc::new(PermissionBroker::new(session_id.clone(), policy));
        let registry = Arc::new(
            ExternalFunctionRegistry::from_capabilities(
                surface.clone(),
                session_id.clone(),
                capabilities,
                config.terminal_output_limit,
            )
            .await,
        );
        let executor = Arc::new(ToolExecutor::new(
            tracker.clone(),
            broker.clone(),
            registry.clone(),
        ));
        let code_mode = CodeModeHost::new(executor.clone(), config.sandbox.clone());
        tracing::info!(
            session_id = %session_id,
            surface = surface.kind(),
            functions = registry.names().count(),
            "session runtime ready"
        );
        Self {
            session_id,
            surface,
            notifier,
            tracker,
            broker,
            registry,
            executor,
            code_mode,
        }
    }

    /// Cancels open tool calls and releases everything the surface holds for
    /// the session.
    pub async fn teardown(&self) {
        self.tracker.cancel_all().await;
        self.surface.release_session(&self.session_id).await;
    }
}

use std::sync::Arc;

use acp_bridge_error::BridgeError;
use acp_bridge_schema::{PermissionOption, ToolCallId, ToolCallUpdate, ToolKind};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::permission::{PermissionBroker, PermissionOutcome};
use crate::toolset::ExternalFunctionRegistry;
use crate::tracker::ToolCallTracker;

/// Session-wide cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelSignal::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

impl ToolOutcome {
    /// What a suspended script is resumed with.
    pub fn into_resume(self) -> Option<Result<Value, String>> {
        match self {
            Self::Completed(value) => Some(Ok(value)),
            Self::Failed(message) => Some(Err(message)),
            Self::Cancelled => None,
        }
    }
}

/// Runs one named function as one tracked tool call.
#[derive(Debug)]
pub struct ToolExecutor {
    tracker: Arc<ToolCallTracker>,
    broker: Arc<PermissionBroker>,
    registry: Arc<ExternalFunctionRegistry>,
}

impl ToolExecutor {
    pub fn new(
        tracker: Arc<ToolCallTracker>,
        broker: Arc<PermissionBroker>,
        registry: Arc<ExternalFunctionRegistry>,
    ) -> Self {
        Self {
            tracker,
            broker,
            registry,
        }
    }

    pub fn tracker(&self) -> &Arc<ToolCallTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<ExternalFunctionRegistry> {
        &self.registry
    }

    pub async fn execute(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        cancel: &CancelSignal,
    ) -> Result<ToolOutcome, BridgeError> {
        let descriptor = self.registry.get(name).cloned();
        let kind = descriptor.as_ref().map(|tool| tool.kind).unwrap_or(ToolKind::Other);
        let id = self
            .tracker
            .create(
                None,
                kind,
                self.registry.title(name, &arguments),
                self.registry.locations(name, &arguments),
                Some(Value::Object(arguments.clone())),
            )
            .await?;

        let Some(descriptor) = descriptor else {
            return self.failed(&id, format!("unknown function `{name}`"), cancel).await;
        };
        if cancel.is_cancelled() {
            return self.cancelled(&id).await;
        }

        if descriptor.requires_permission {
            let update = match self.tracker.get(&id).await {
                Some(call) => call.to_update(),
                None => ToolCallUpdate::new(id.clone()),
            };
            let decision = tokio::select! {
                decision = self.broker.request(update, name, PermissionOption::standard()) => {
                    decision
                }
                _ = cancel.cancelled() => return self.cancelled(&id).await,
            };
            match decision {
                Ok(PermissionOutcome::Allowed(_)) => {}
                Ok(PermissionOutcome::Denied) => {
                    return self.failed(&id, "permission denied".to_string(), cancel).await;
                }
                Ok(PermissionOutcome::Cancelled) => return self.cancelled(&id).await,
                Err(err) => return self.failed(&id, err.to_string(), cancel).await,
            }
        }

        if cancel.is_cancelled() {
            return self.cancelled(&id).await;
        }
        if let Err(err) = self.tracker.start(&id, None, None, None).await {
            if cancel.is_cancelled() {
                return Ok(ToolOutcome::Cancelled);
            }
            return Err(err.into());
        }
        let invoked = tokio::select! {
            invoked = self.registry.invoke(name, arguments) => invoked,
            _ = cancel.cancelled() => return self.cancelled(&id).await,
        };
        let (settled, outcome) = match invoked {
            Ok(output) => (
                self.tracker.complete(&id, output.clone()).await,
                ToolOutcome::Completed(output),
            ),
            Err(err) => {
                let message = err.to_string();
                tracing::info!(
                    tool_call_id = %id,
                    function = name,
                    error = %message,
                    "tool call failed"
                );
                (
                    self.tracker.fail(&id, message.clone()).await,
                    ToolOutcome::Failed(message),
                )
            }
        };
        match settled {
            Ok(()) => Ok(outcome),
            // the session cancel got to the call first
            Err(_) if cancel.is_cancelled() => Ok(ToolOutcome::Cancelled),
            Err(err) => Err(err.into()),
        }
    }

    /// Fails the call unless a session cancel has already settled it.
    async fn failed(
        &self,
        id: &ToolCallId,
        message: String,
        cancel: &CancelSignal,
    ) -> Result<ToolOutcome, BridgeError> {
        match self.tracker.fail(id, message.clone()).await {
            Ok(()) => Ok(ToolOutcome::Failed(message)),
            Err(_) if cancel.is_cancelled() => Ok(ToolOutcome::Cancelled),
            Err(err) => Err(err.into()),
        }
    }

    /// A session cancel may already have moved the call to `cancelled`.
    async fn cancelled(&self, id: &ToolCallId) -> Result<ToolOutcome, BridgeError> {
        self.tracker.cancel_if_open(id).await;
        Ok(ToolOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::capability::{CommandStub, LocalCapabilities, SharedCapabilities};
    use crate::permission::{AutoApprove, PermissionPolicy};
    use crate::tracker::SessionNotifier;
    use acp_bridge_error::CapabilityError;
    use acp_bridge_schema::{
        ClientCapabilities, RequestPermissionRequest, SessionId, SessionUpdate, ToolCallStatus,
    };
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        local: Arc<LocalCapabilities>,
        executor: ToolExecutor,
    }

    async fn fixture(setup: impl FnOnce(LocalCapabilities) -> LocalCapabilities) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), "hello").expect("write");
        let local = Arc::new(setup(LocalCapabilities::new(dir.path()).expect("local")));
        let surface: SharedCapabilities = local.clone();
        let session_id = SessionId::from("session_1");
        let tracker = Arc::new(ToolCallTracker::new(SessionNotifier::new(
            session_id.clone(),
            surface.clone(),
        )));
        let broker = Arc::new(PermissionBroker::new(session_id.clone(), Arc::new(AutoApprove)));
        let registry = Arc::new(
            ExternalFunctionRegistry::from_capabilities(
                surface,
                session_id,
                &ClientCapabilities::full(),
                1024,
            )
            .await,
        );
        Fixture {
            _dir: dir,
            local,
            executor: ToolExecutor::new(tracker, broker, registry),
        }
    }

    fn statuses(
        rx: &mut tokio::sync::broadcast::Receiver<acp_bridge_schema::SessionNotification>,
    ) -> Vec<ToolCallStatus> {
        let mut seen = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            match notification.update {
                SessionUpdate::ToolCall(call) => seen.push(call.status),
                SessionUpdate::ToolCallUpdate(update) => {
                    if let Some(status) = update.status {
                        seen.push(status);
                    }
                }
                _ => {}
            }
        }
        seen
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn completed_call_walks_the_full_lifecycle() {
        let fx = fixture(|local| local).await;
        let mut rx = fx.local.subscribe();
        let outcome = fx
            .executor
            .execute("read_file", args(json!({"path": "a.txt"})), &CancelSignal::new())
            .await
            .expect("execute");
        assert_eq!(outcome, ToolOutcome::Completed(json!("hello")));
        assert_eq!(
            statuses(&mut rx),
            vec![ToolCallStatus::Pending, ToolCallStatus::InProgress, ToolCallStatus::Completed]
        );
    }

    #[tokio::test]
    async fn capability_errors_fail_the_call() {
        let fx = fixture(|local| local).await;
        let mut rx = fx.local.subscribe();
        let outcome = fx
            .executor
            .execute("read_file", args(json!({"path": "../etc/passwd"})), &CancelSignal::new())
            .await
            .expect("execute");
        assert!(matches!(
            outcome,
            ToolOutcome::Failed(message) if message.contains("escapes workspace root")
        ));
        assert_eq!(statuses(&mut rx).last(), Some(&ToolCallStatus::Failed));
    }

    #[tokio::test]
    async fn unknown_function_is_tracked_and_failed() {
        let fx = fixture(|local| local).await;
        let outcome = fx
            .executor
            .execute("launch_rocket", Map::new(), &CancelSignal::new())
            .await
            .expect("execute");
        assert_eq!(outcome, ToolOutcome::Failed("unknown function `launch_rocket`".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelling_mid_flight_emits_one_cancelled_update() {
        let fx = fixture(|local| local).await;
        let mut rx = fx.local.subscribe();
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let outcome = fx
            .executor
            .execute("run_command", args(json!({"command": "sleep", "args": ["5"]})), &cancel)
            .await
            .expect("execute");
        assert_eq!(outcome, ToolOutcome::Cancelled);
        let seen = statuses(&mut rx);
        assert_eq!(
            seen,
            vec![ToolCallStatus::Pending, ToolCallStatus::InProgress, ToolCallStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn stubbed_command_runs_after_auto_approval() {
        let fx = fixture(|local| local.with_stub("wc -l a.txt", CommandStub::success("1"))).await;
        let outcome = fx
            .executor
            .execute(
                "run_command",
                args(json!({"command": "wc", "args": ["-l", "a.txt"]})),
                &CancelSignal::new(),
            )
            .await
            .expect("execute");
        assert_eq!(outcome, ToolOutcome::Completed(json!("1")));
        let calls = fx.executor.tracker().snapshot().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].title, "Run `wc -l a.txt`");
    }

    /// Cancels the session while the permission answer is still on its way back.
    struct CancelWhileAsking {
        cancel: CancelSignal,
        tracker: Arc<ToolCallTracker>,
    }

    #[async_trait::async_trait]
    impl PermissionPolicy for CancelWhileAsking {
        fn name(&self) -> &'static str {
            "cancel-while-asking"
        }

        async fn decide(
            &self,
            _request: &RequestPermissionRequest,
        ) -> Result<PermissionOutcome, CapabilityError> {
            self.cancel.cancel();
            self.tracker.cancel_all().await;
            Ok(PermissionOutcome::Allowed(0))
        }
    }

    #[tokio::test]
    async fn cancel_racing_an_approval_cancels_the_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = LocalCapabilities::new(dir.path())
            .expect("local")
            .with_stub("wc -l a.txt", CommandStub::success("1"));
        let surface: SharedCapabilities = Arc::new(local);
        let session_id = SessionId::from("session_1");
        let tracker = Arc::new(ToolCallTracker::new(SessionNotifier::new(
            session_id.clone(),
            surface.clone(),
        )));
        let cancel = CancelSignal::new();
        let policy = Arc::new(CancelWhileAsking {
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        });
        let broker = Arc::new(PermissionBroker::new(session_id.clone(), policy));
        let registry = Arc::new(
            ExternalFunctionRegistry::from_capabilities(
                surface,
                session_id,
                &ClientCapabilities::full(),
                1024,
            )
            .await,
        );
        let executor = ToolExecutor::new(tracker.clone(), broker, registry);

        let arguments = args(json!({"command": "wc", "args": ["-l", "a.txt"]}));
        let outcome = executor
            .execute("run_command", arguments, &cancel)
            .await
            .expect("a cancelled call is not an error");
        assert_eq!(outcome, ToolOutcome::Cancelled);
        let calls = tracker.snapshot().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ToolCallStatus::Cancelled);
    }
}

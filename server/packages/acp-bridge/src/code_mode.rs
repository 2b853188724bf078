//! Runs model-written scripts, resolving each external call as a tool call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use acp_bridge_error::{BridgeError, SandboxError};
use acp_bridge_sandbox::{RunnerState, SandboxConfig, ScriptRunner};
use acp_bridge_schema::{ToolCallId, ToolKind};
use serde_json::{json, Value};

use crate::executor::{CancelSignal, ToolExecutor};

pub const CODE_MODE_TITLE: &str = "Run code";

#[derive(Debug, Clone, PartialEq)]
pub enum CodeModeOutcome {
    Completed(Value),
    /// Validation, runtime and budget failures. The model gets these as text.
    Failed(SandboxError),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeModeReport {
    pub tool_call_id: ToolCallId,
    pub outcome: CodeModeOutcome,
    pub output: String,
    pub output_truncated: bool,
    pub external_calls: usize,
    pub steps: u64,
}

impl CodeModeReport {
    /// Tool result as shown to the model.
    pub fn to_text(&self) -> String {
        let mut text = self.output.clone();
        if self.output_truncated {
            text.push_str("[output truncated]\n");
        }
        match &self.outcome {
            CodeModeOutcome::Completed(Value::Null) => {}
            CodeModeOutcome::Completed(Value::String(value)) => {
                text.push_str(&format!("Result: {value}\n"));
            }
            CodeModeOutcome::Completed(value) => text.push_str(&format!("Result: {value}\n")),
            CodeModeOutcome::Failed(err) => text.push_str(&format!("Error: {err}\n")),
            CodeModeOutcome::Cancelled => text.push_str("Cancelled\n"),
        }
        text
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CodeModeOutcome::Completed(_))
    }

    fn without_output(tool_call_id: ToolCallId, outcome: CodeModeOutcome) -> Self {
        Self {
            tool_call_id,
            outcome,
            output: String::new(),
            output_truncated: false,
            external_calls: 0,
            steps: 0,
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One Code Mode execution per session at a time.
#[derive(Debug)]
pub struct CodeModeHost {
    executor: Arc<ToolExecutor>,
    config: SandboxConfig,
    running: AtomicBool,
}

type Step = (ScriptRunner, Result<RunnerState, SandboxError>);

impl CodeModeHost {
    pub fn new(executor: Arc<ToolExecutor>, config: SandboxConfig) -> Self {
        Self {
            executor,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn run(
        &self,
        code: &str,
        cancel: &CancelSignal,
    ) -> Result<CodeModeReport, BridgeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Conflict {
                message: "a code execution is already running in this session".to_string(),
            });
        }
        let _guard = RunningGuard(&self.running);
        let tracker = self.executor.tracker();

        let id = tracker
            .create(
                None,
                ToolKind::Execute,
                CODE_MODE_TITLE,
                Vec::new(),
                Some(json!({ "code": code })),
            )
            .await?;
        tracker.start(&id, None, None, None).await?;

        // Whatever stops the run early, the script's own call still has to settle.
        match self.drive(&id, code, cancel).await {
            Ok(report) => Ok(report),
            Err(_) if cancel.is_cancelled() => {
                tracker.cancel_if_open(&id).await;
                Ok(CodeModeReport::without_output(id, CodeModeOutcome::Cancelled))
            }
            Err(err) => {
                tracing::warn!(tool_call_id = %id, error = %err, "script run aborted");
                if let Err(settle) = tracker.fail(&id, err.to_string()).await {
                    tracing::debug!(
                        tool_call_id = %id,
                        error = %settle,
                        "script call already settled"
                    );
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        id: &ToolCallId,
        code: &str,
        cancel: &CancelSignal,
    ) -> Result<CodeModeReport, BridgeError> {
        let tracker = self.executor.tracker();
        let functions = self.executor.registry().external_functions();
        let runner = match ScriptRunner::new(code, functions, &self.config) {
            Ok(runner) => runner,
            Err(err) => {
                tracing::info!(tool_call_id = %id, error = %err, "script rejected");
                tracker.fail(id, err.to_string()).await?;
                let outcome = CodeModeOutcome::Failed(err);
                return Ok(CodeModeReport::without_output(id.clone(), outcome));
            }
        };

        let mut external_calls = 0;
        let mut reported = 0;
        let (mut runner, mut state) = step(runner, cancel, |runner| Ok(runner.run())).await?;
        let outcome = loop {
            let current = match state {
                Ok(current) => current,
                Err(_) if cancel.is_cancelled() => RunnerState::Cancelled,
                Err(err) => return Err(err.into()),
            };
            match current {
                RunnerState::Suspended(call) => {
                    external_calls += 1;
                    reported = self.report_progress(id, &runner, reported).await;
                    tracing::debug!(
                        tool_call_id = %id,
                        function = %call.function,
                        token = call.token,
                        "script suspended on external call"
                    );
                    let token = call.token;
                    let resolved = self
                        .executor
                        .execute(&call.function, call.arguments, cancel)
                        .await?;
                    match resolved.into_resume() {
                        Some(result) => {
                            let resume =
                                move |runner: &mut ScriptRunner| runner.resume(token, result);
                            (runner, state) = step(runner, cancel, resume).await?;
                        }
                        None => {
                            runner.cancel();
                            state = Ok(RunnerState::Cancelled);
                        }
                    }
                }
                RunnerState::Running => {
                    return Err(BridgeError::internal("script runner yielded while running"));
                }
                RunnerState::Completed(value) => break CodeModeOutcome::Completed(value),
                RunnerState::Failed(err) => break CodeModeOutcome::Failed(err),
                RunnerState::Cancelled => break CodeModeOutcome::Cancelled,
            }
        };

        let report = CodeModeReport {
            tool_call_id: id.clone(),
            outcome,
            output: runner.output().to_string(),
            output_truncated: runner.output_truncated(),
            external_calls,
            steps: runner.steps(),
        };
        tracing::info!(
            tool_call_id = %id,
            external_calls,
            steps = report.steps,
            elapsed_ms = runner.elapsed().as_millis() as u64,
            success = report.is_success(),
            "script finished"
        );

        let settled = match &report.outcome {
            CodeModeOutcome::Completed(_) => {
                tracker.complete(id, Value::String(report.to_text())).await
            }
            CodeModeOutcome::Failed(err) if err.is_reportable_to_model() => {
                tracker.fail(id, report.to_text()).await
            }
            CodeModeOutcome::Failed(err) => return Err(err.clone().into()),
            CodeModeOutcome::Cancelled => {
                tracker.cancel_if_open(id).await;
                Ok(())
            }
        };
        match settled {
            Ok(()) => Ok(report),
            Err(_) if cancel.is_cancelled() => Ok(CodeModeReport {
                outcome: CodeModeOutcome::Cancelled,
                ..report
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Streams output printed since the last suspension onto the script's tool call.
    async fn report_progress(
        &self,
        id: &ToolCallId,
        runner: &ScriptRunner,
        reported: usize,
    ) -> usize {
        let output = runner.output();
        if output.len() > reported {
            if let Err(err) = self.executor.tracker().progress(id, &output[reported..]).await {
                tracing::debug!(tool_call_id = %id, error = %err, "dropped script progress");
            }
        }
        output.len()
    }
}

/// Runs one runner step off the async threads; a session cancel trips the
/// runner's own cancel flag so the VM stops at its next instruction.
async fn step<F>(mut runner: ScriptRunner, cancel: &CancelSignal, f: F) -> Result<Step, BridgeError>
where
    F: FnOnce(&mut ScriptRunner) -> Result<RunnerState, SandboxError> + Send + 'static,
{
    let handle = runner.cancel_handle();
    let mut task = tokio::task::spawn_blocking(move || {
        let state = f(&mut runner);
        (runner, state)
    });
    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = cancel.cancelled() => {
            handle.cancel();
            task.await
        }
    };
    joined.map_err(|err| BridgeError::internal(format!("script task failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::capability::{CommandStub, LocalCapabilities, SharedCapabilities};
    use crate::permission::{AutoApprove, PermissionBroker, PermissionOutcome, PermissionPolicy};
    use crate::toolset::ExternalFunctionRegistry;
    use crate::tracker::{SessionNotifier, ToolCallTracker};
    use acp_bridge_error::CapabilityError;
    use acp_bridge_schema::{
        ClientCapabilities, RequestPermissionRequest, SessionId, ToolCallStatus,
    };

    type PolicyFactory = fn(Arc<ToolCallTracker>) -> Arc<dyn PermissionPolicy>;

    async fn host(dir: &std::path::Path, config: SandboxConfig) -> CodeModeHost {
        host_with(dir, config, |_| Arc::new(AutoApprove)).await
    }

    async fn host_with(
        dir: &std::path::Path,
        config: SandboxConfig,
        policy: PolicyFactory,
    ) -> CodeModeHost {
        let local = LocalCapabilities::new(dir)
            .expect("local")
            .with_stub("wc -l a.txt", CommandStub::success("1"));
        let surface: SharedCapabilities = Arc::new(local);
        let session_id = SessionId::from("session_1");
        let tracker = Arc::new(ToolCallTracker::new(SessionNotifier::new(
            session_id.clone(),
            surface.clone(),
        )));
        let broker = Arc::new(PermissionBroker::new(session_id.clone(), policy(tracker.clone())));
        let registry = Arc::new(
            ExternalFunctionRegistry::from_capabilities(
                surface,
                session_id,
                &ClientCapabilities::full(),
                1024,
            )
            .await,
        );
        CodeModeHost::new(Arc::new(ToolExecutor::new(tracker, broker, registry)), config)
    }

    #[tokio::test]
    async fn tool_errors_are_catchable_inside_the_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = host(dir.path(), SandboxConfig::default()).await;
        let code = r#"try:
    read_file("missing.txt")
except ToolError as e:
    print("caught")
"#;
        let report = host.run(code, &CancelSignal::new()).await.expect("run");
        assert!(report.is_success());
        assert_eq!(report.output, "caught\n");
        assert_eq!(report.external_calls, 1);

        let calls = host.executor.tracker().snapshot().await;
        let statuses: Vec<_> = calls.iter().map(|call| (call.title.clone(), call.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (CODE_MODE_TITLE.to_string(), ToolCallStatus::Completed),
                ("Read missing.txt".to_string(), ToolCallStatus::Failed),
            ]
        );
    }

    #[tokio::test]
    async fn validation_failure_runs_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = host(dir.path(), SandboxConfig::default()).await;
        let report = host
            .run("import os\nread_file(\"a.txt\")\n", &CancelSignal::new())
            .await
            .expect("run");
        assert!(matches!(report.outcome, CodeModeOutcome::Failed(SandboxError::Validation { .. })));
        assert_eq!(report.external_calls, 0);
        assert_eq!(host.executor.tracker().snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn budget_overrun_is_reported_as_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SandboxConfig {
            max_steps: 500,
            ..SandboxConfig::default()
        };
        let host = host(dir.path(), config).await;
        let report = host
            .run("while True:\n    pass\n", &CancelSignal::new())
            .await
            .expect("run");
        assert!(matches!(
            report.outcome,
            CodeModeOutcome::Failed(SandboxError::BudgetExceeded { .. })
        ));
        assert!(report.to_text().starts_with("Error: budget exceeded"));
        let calls = host.executor.tracker().snapshot().await;
        assert_eq!(calls[0].status, ToolCallStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_stops_a_spinning_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SandboxConfig {
            max_steps: u64::MAX,
            max_duration_ms: 60_000,
            ..SandboxConfig::default()
        };
        let host = host(dir.path(), config).await;
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let report = host.run("while True:\n    pass\n", &cancel).await.expect("run");
        assert_eq!(report.outcome, CodeModeOutcome::Cancelled);
        let calls = host.executor.tracker().snapshot().await;
        assert_eq!(calls[0].status, ToolCallStatus::Cancelled);
        assert!(!host.is_running());
    }

    /// Settles the nested call behind the executor's back, so starting it is rejected.
    struct SettleWhileAsking(Arc<ToolCallTracker>);

    #[async_trait::async_trait]
    impl PermissionPolicy for SettleWhileAsking {
        fn name(&self) -> &'static str {
            "settle-while-asking"
        }

        async fn decide(
            &self,
            request: &RequestPermissionRequest,
        ) -> Result<PermissionOutcome, CapabilityError> {
            let id = &request.tool_call.tool_call_id;
            self.0.fail(id, "settled elsewhere").await.ok();
            Ok(PermissionOutcome::Allowed(0))
        }
    }

    #[tokio::test]
    async fn aborted_run_still_settles_the_script_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = host_with(dir.path(), SandboxConfig::default(), |tracker| {
            Arc::new(SettleWhileAsking(tracker))
        })
        .await;
        let result = host
            .run("run_command(\"wc\", [\"-l\", \"a.txt\"])\n", &CancelSignal::new())
            .await;
        assert!(matches!(result, Err(BridgeError::Tracker(_))), "{result:?}");

        let calls = host.executor.tracker().snapshot().await;
        let statuses: Vec<_> = calls.iter().map(|call| (call.title.clone(), call.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (CODE_MODE_TITLE.to_string(), ToolCallStatus::Failed),
                ("Run `wc -l a.txt`".to_string(), ToolCallStatus::Failed),
            ]
        );
        assert!(!host.is_running());
    }
}

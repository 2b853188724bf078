use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acp_bridge_error::{BridgeError, CapabilityError, TrackerError};
use acp_bridge_schema::{
    PermissionOption, PermissionOptionKind, RequestPermissionOutcome, RequestPermissionRequest,
    SessionId, ToolCallId, ToolCallUpdate,
};
use async_trait::async_trait;

use crate::capability::SharedCapabilities;
use crate::config::PermissionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// Index into the offered options.
    Allowed(usize),
    Denied,
    Cancelled,
}

impl PermissionOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

#[async_trait]
pub trait PermissionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn decide(
        &self,
        request: &RequestPermissionRequest,
    ) -> Result<PermissionOutcome, CapabilityError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl PermissionPolicy for AutoApprove {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn decide(
        &self,
        request: &RequestPermissionRequest,
    ) -> Result<PermissionOutcome, CapabilityError> {
        if request.options.is_empty() {
            Ok(PermissionOutcome::Denied)
        } else {
            Ok(PermissionOutcome::Allowed(0))
        }
    }
}

/// Asks the user through the capability surface.
pub struct Interactive {
    surface: SharedCapabilities,
    timeout: Duration,
}

impl Interactive {
    pub fn new(surface: SharedCapabilities, timeout: Duration) -> Self {
        Self { surface, timeout }
    }
}

#[async_trait]
impl PermissionPolicy for Interactive {
    fn name(&self) -> &'static str {
        "interactive"
    }

    async fn decide(
        &self,
        request: &RequestPermissionRequest,
    ) -> Result<PermissionOutcome, CapabilityError> {
        let asked =
            tokio::time::timeout(self.timeout, self.surface.request_permission(request.clone()))
                .await;
        let outcome = match asked {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(CapabilityError::PermissionDenied { message })) => {
                tracing::debug!(reason = %message, "permission request refused by host");
                return Ok(PermissionOutcome::Denied);
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(CapabilityError::Timeout {
                    operation: "permission/request".to_string(),
                })
            }
        };
        match outcome {
            RequestPermissionOutcome::Cancelled => Ok(PermissionOutcome::Cancelled),
            RequestPermissionOutcome::Selected { option_id } => {
                let Some(index) = request
                    .options
                    .iter()
                    .position(|option| option.option_id == option_id)
                else {
                    return Err(CapabilityError::Remote {
                        message: format!("unknown permission option `{option_id}`"),
                    });
                };
                if request.options[index].kind.is_allow() {
                    Ok(PermissionOutcome::Allowed(index))
                } else {
                    Ok(PermissionOutcome::Denied)
                }
            }
        }
    }
}

pub fn policy_for(
    mode: PermissionMode,
    surface: SharedCapabilities,
    timeout: Duration,
) -> Arc<dyn PermissionPolicy> {
    match mode {
        PermissionMode::Auto => Arc::new(AutoApprove),
        PermissionMode::Interactive => Arc::new(Interactive::new(surface, timeout)),
    }
}

/// Per-session gate in front of a [`PermissionPolicy`].
///
/// One outstanding request per tool call. An `allow_always` answer is
/// remembered for the permission key it was given for.
pub struct PermissionBroker {
    session_id: SessionId,
    policy: Arc<dyn PermissionPolicy>,
    pending: Mutex<HashSet<ToolCallId>>,
    always: Mutex<HashMap<String, usize>>,
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker")
            .field("session_id", &self.session_id)
            .field("policy", &self.policy.name())
            .finish()
    }
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<ToolCallId>>,
    id: ToolCallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PermissionBroker {
    pub fn new(session_id: SessionId, policy: Arc<dyn PermissionPolicy>) -> Self {
        Self {
            session_id,
            policy,
            pending: Mutex::new(HashSet::new()),
            always: Mutex::new(HashMap::new()),
        }
    }

    pub async fn request(
        &self,
        tool_call: ToolCallUpdate,
        permission_key: &str,
        options: Vec<PermissionOption>,
    ) -> Result<PermissionOutcome, BridgeError> {
        let id = tool_call.tool_call_id.clone();
        if let Some(index) = lock(&self.always).get(permission_key).copied() {
            if index < options.len() {
                tracing::debug!(tool_call_id = %id, key = permission_key, "permission remembered");
                return Ok(PermissionOutcome::Allowed(index));
            }
        }

        if !lock(&self.pending).insert(id.clone()) {
            let err = TrackerError::PermissionPending { id: id.to_string() };
            tracing::error!(
                session_id = %self.session_id,
                error = %err,
                "rejected permission request"
            );
            return Err(err.into());
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        let request = RequestPermissionRequest {
            session_id: self.session_id.clone(),
            tool_call,
            options,
        };
        let outcome = self.policy.decide(&request).await?;
        if let PermissionOutcome::Allowed(index) = outcome {
            if request.options[index].kind == PermissionOptionKind::AllowAlways {
                lock(&self.always).insert(permission_key.to_string(), index);
            }
        }
        tracing::info!(
            session_id = %self.session_id,
            tool_call_id = %id,
            policy = self.policy.name(),
            outcome = ?outcome,
            "permission decided"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request_for(id: &str, options: Vec<PermissionOption>) -> RequestPermissionRequest {
        RequestPermissionRequest {
            session_id: SessionId::from("session_1"),
            tool_call: ToolCallUpdate::new(ToolCallId::from(id)),
            options,
        }
    }

    #[tokio::test]
    async fn auto_approve_picks_first_option_or_denies() {
        let outcome = AutoApprove
            .decide(&request_for("call_1", PermissionOption::standard()))
            .await
            .expect("decide");
        assert_eq!(outcome, PermissionOutcome::Allowed(0));
        let outcome = AutoApprove
            .decide(&request_for("call_1", Vec::new()))
            .await
            .expect("decide");
        assert_eq!(outcome, PermissionOutcome::Denied);
    }

    /// Always picks `option_id` and counts how often it was asked.
    struct Scripted {
        option_id: &'static str,
        asked: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl PermissionPolicy for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn decide(
            &self,
            request: &RequestPermissionRequest,
        ) -> Result<PermissionOutcome, CapabilityError> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let index = request
                .options
                .iter()
                .position(|option| option.option_id == self.option_id)
                .unwrap_or(0);
            if request.options[index].kind.is_allow() {
                Ok(PermissionOutcome::Allowed(index))
            } else {
                Ok(PermissionOutcome::Denied)
            }
        }
    }

    fn scripted(option_id: &'static str, delay: Duration) -> Arc<Scripted> {
        Arc::new(Scripted {
            option_id,
            asked: AtomicUsize::new(0),
            delay,
        })
    }

    #[tokio::test]
    async fn allow_always_is_remembered_per_key() {
        let policy = scripted("allow_always", Duration::ZERO);
        let broker = PermissionBroker::new(SessionId::from("session_1"), policy.clone());

        let first = broker
            .request(
                ToolCallUpdate::new("call_1".into()),
                "write_file",
                PermissionOption::standard(),
            )
            .await
            .expect("first");
        assert_eq!(first, PermissionOutcome::Allowed(1));
        let second = broker
            .request(
                ToolCallUpdate::new("call_2".into()),
                "write_file",
                PermissionOption::standard(),
            )
            .await
            .expect("second");
        assert_eq!(second, PermissionOutcome::Allowed(1));
        assert_eq!(policy.asked.load(Ordering::SeqCst), 1);

        broker
            .request(
                ToolCallUpdate::new("call_3".into()),
                "run_command",
                PermissionOption::standard(),
            )
            .await
            .expect("other key");
        assert_eq!(policy.asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn allow_once_is_not_remembered() {
        let policy = scripted("allow_once", Duration::ZERO);
        let broker = PermissionBroker::new(SessionId::from("session_1"), policy.clone());
        for id in ["call_1", "call_2"] {
            broker
                .request(ToolCallUpdate::new(id.into()), "write_file", PermissionOption::standard())
                .await
                .expect("request");
        }
        assert_eq!(policy.asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reject_maps_to_denied() {
        let broker = PermissionBroker::new(
            SessionId::from("session_1"),
            scripted("reject_once", Duration::ZERO),
        );
        let outcome = broker
            .request(
                ToolCallUpdate::new("call_1".into()),
                "write_file",
                PermissionOption::standard(),
            )
            .await
            .expect("request");
        assert_eq!(outcome, PermissionOutcome::Denied);
    }

    #[tokio::test]
    async fn concurrent_request_for_same_call_is_rejected() {
        let broker = Arc::new(PermissionBroker::new(
            SessionId::from("session_1"),
            scripted("allow_once", Duration::from_millis(200)),
        ));
        let first = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request(
                        ToolCallUpdate::new("call_1".into()),
                        "write_file",
                        PermissionOption::standard(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = broker
            .request(
                ToolCallUpdate::new("call_1".into()),
                "write_file",
                PermissionOption::standard(),
            )
            .await;
        assert!(matches!(
            second,
            Err(BridgeError::Tracker(TrackerError::PermissionPending { .. }))
        ));
        let first = first.await.expect("join").expect("first");
        assert_eq!(first, PermissionOutcome::Allowed(0));

        // The slot frees up once the first request is answered.
        broker
            .request(
                ToolCallUpdate::new("call_1".into()),
                "write_file",
                PermissionOption::standard(),
            )
            .await
            .expect("after first");
    }

    #[tokio::test]
    async fn interactive_maps_selected_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = Arc::new(crate::capability::LocalCapabilities::new(dir.path()).expect("local"));
        let policy = Interactive::new(local, Duration::from_secs(5));

        let outcome = policy
            .decide(&request_for("call_1", PermissionOption::standard()))
            .await
            .expect("decide");
        assert_eq!(outcome, PermissionOutcome::Allowed(0));

        let reject_first = vec![PermissionOption::new(
            "reject_once",
            "Reject",
            PermissionOptionKind::RejectOnce,
        )];
        let outcome = policy
            .decide(&request_for("call_2", reject_first))
            .await
            .expect("decide");
        assert_eq!(outcome, PermissionOutcome::Denied);

        let outcome = policy
            .decide(&request_for("call_3", Vec::new()))
            .await
            .expect("decide");
        assert_eq!(outcome, PermissionOutcome::Denied);
    }
}

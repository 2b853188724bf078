use std::collections::BTreeMap;
use std::sync::Arc;

use acp_bridge_error::TrackerError;
use acp_bridge_schema::{
    SessionId, SessionNotification, SessionUpdate, ToolCall, ToolCallContent, ToolCallId,
    ToolCallLocation, ToolCallStatus, ToolCallUpdate, ToolKind,
};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::capability::SharedCapabilities;

/// Stamps every update of one session with the next sequence number and hands
/// it to the capability surface. Sequence order is delivery order.
#[derive(Clone)]
pub struct SessionNotifier {
    session_id: SessionId,
    surface: SharedCapabilities,
    seq: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for SessionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNotifier")
            .field("session_id", &self.session_id)
            .field("surface", &self.surface.kind())
            .finish()
    }
}

impl SessionNotifier {
    pub fn new(session_id: SessionId, surface: SharedCapabilities) -> Self {
        Self {
            session_id,
            surface,
            seq: Arc::new(Mutex::new(0)),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn send(&self, update: SessionUpdate) {
        let mut seq = self.seq.lock().await;
        *seq += 1;
        let notification = SessionNotification {
            session_id: self.session_id.clone(),
            seq: Some(*seq),
            update,
        };
        self.surface.session_update(notification).await;
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    calls: BTreeMap<ToolCallId, ToolCall>,
    next_id: u64,
}

impl TrackerState {
    fn issue_id(&mut self) -> ToolCallId {
        loop {
            self.next_id += 1;
            let id = ToolCallId::new(format!("call_{}", self.next_id));
            if !self.calls.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Owns the tool calls of one session.
///
/// Every transition runs under the tracker lock and emits its notification
/// before the lock is released.
#[derive(Debug)]
pub struct ToolCallTracker {
    notifier: SessionNotifier,
    state: Mutex<TrackerState>,
}

impl ToolCallTracker {
    pub fn new(notifier: SessionNotifier) -> Self {
        Self {
            notifier,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.notifier.session_id()
    }

    /// Registers a pending call. A `None` id gets the next `call_<n>`.
    pub async fn create(
        &self,
        id: Option<ToolCallId>,
        kind: ToolKind,
        title: impl Into<String>,
        locations: Vec<ToolCallLocation>,
        raw_input: Option<Value>,
    ) -> Result<ToolCallId, TrackerError> {
        let mut state = self.state.lock().await;
        let id = match id {
            Some(id) if state.calls.contains_key(&id) => {
                return self.reject(TrackerError::DuplicateStart { id: id.to_string() });
            }
            Some(id) => id,
            None => state.issue_id(),
        };
        let mut call = ToolCall::new(id.clone(), kind, title);
        call.locations = locations;
        call.raw_input = raw_input;
        state.calls.insert(id.clone(), call.clone());
        tracing::debug!(
            session_id = %self.session_id(),
            tool_call_id = %id,
            kind = kind.as_str(),
            "tool call created"
        );
        self.notifier.send(SessionUpdate::ToolCall(call)).await;
        Ok(id)
    }

    /// Moves a call to `in_progress`, creating it first when the id is new.
    pub async fn start(
        &self,
        id: &ToolCallId,
        kind: Option<ToolKind>,
        title: Option<String>,
        locations: Option<Vec<ToolCallLocation>>,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.lock().await;
        if !state.calls.contains_key(id) {
            let mut call = ToolCall::new(
                id.clone(),
                kind.unwrap_or_default(),
                title.clone().unwrap_or_default(),
            );
            call.locations = locations.clone().unwrap_or_default();
            state.calls.insert(id.clone(), call.clone());
            self.notifier.send(SessionUpdate::ToolCall(call)).await;
        }

        let Some(call) = state.calls.get_mut(id) else {
            return self.reject(TrackerError::UnknownToolCall { id: id.to_string() });
        };
        match call.status {
            ToolCallStatus::Pending => {}
            ToolCallStatus::InProgress => {
                return self.reject(TrackerError::DuplicateStart { id: id.to_string() });
            }
            terminal => {
                return self.reject(TrackerError::AlreadyTerminal {
                    id: id.to_string(),
                    status: terminal.to_string(),
                });
            }
        }

        let mut update = ToolCallUpdate::new(id.clone()).status(ToolCallStatus::InProgress);
        update.kind = kind;
        update.title = title;
        update.locations = locations;
        call.apply_update(&update);
        self.notifier.send(SessionUpdate::ToolCallUpdate(update)).await;
        Ok(())
    }

    /// Appends partial output to a running call. The status does not change.
    pub async fn progress(
        &self,
        id: &ToolCallId,
        partial_output: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.lock().await;
        let call = match state.calls.get_mut(id) {
            Some(call) => call,
            None => return self.reject(TrackerError::UnknownToolCall { id: id.to_string() }),
        };
        match call.status {
            ToolCallStatus::InProgress => {}
            ToolCallStatus::Pending => {
                return self.reject(TrackerError::InvalidTransition {
                    id: id.to_string(),
                    from: ToolCallStatus::Pending.to_string(),
                    to: "progress".to_string(),
                });
            }
            terminal => {
                return self.reject(TrackerError::AlreadyTerminal {
                    id: id.to_string(),
                    status: terminal.to_string(),
                });
            }
        }
        call.content.push(ToolCallContent::text(partial_output));
        let update = ToolCallUpdate::new(id.clone()).content(call.content.clone());
        self.notifier.send(SessionUpdate::ToolCallUpdate(update)).await;
        Ok(())
    }

    pub async fn complete(&self, id: &ToolCallId, output: Value) -> Result<(), TrackerError> {
        let text = match &output {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let mut update = ToolCallUpdate::new(id.clone())
            .status(ToolCallStatus::Completed)
            .raw_output(output);
        if !text.is_empty() {
            update.content = Some(vec![ToolCallContent::text(text)]);
        }
        self.finish(id, update).await
    }

    pub async fn fail(
        &self,
        id: &ToolCallId,
        error: impl Into<String>,
    ) -> Result<(), TrackerError> {
        let error = error.into();
        let update = ToolCallUpdate::new(id.clone())
            .status(ToolCallStatus::Failed)
            .raw_output(serde_json::json!({ "error": error }))
            .content(vec![ToolCallContent::text(error)]);
        self.finish(id, update).await
    }

    pub async fn cancel(&self, id: &ToolCallId) -> Result<(), TrackerError> {
        let update = ToolCallUpdate::new(id.clone()).status(ToolCallStatus::Cancelled);
        self.finish(id, update).await
    }

    /// Cancels the call unless it already finished. Returns whether it was open.
    pub async fn cancel_if_open(&self, id: &ToolCallId) -> bool {
        let mut state = self.state.lock().await;
        let Some(call) = state.calls.get_mut(id) else {
            return false;
        };
        if call.status.is_terminal() {
            return false;
        }
        let update = ToolCallUpdate::new(id.clone()).status(ToolCallStatus::Cancelled);
        call.apply_update(&update);
        self.notifier.send(SessionUpdate::ToolCallUpdate(update)).await;
        true
    }

    /// Cancels every call that has not finished. Returns the affected ids.
    pub async fn cancel_all(&self) -> Vec<ToolCallId> {
        let mut state = self.state.lock().await;
        let mut cancelled = Vec::new();
        for (id, call) in state.calls.iter_mut() {
            if call.status.is_terminal() {
                continue;
            }
            let update = ToolCallUpdate::new(id.clone()).status(ToolCallStatus::Cancelled);
            call.apply_update(&update);
            self.notifier.send(SessionUpdate::ToolCallUpdate(update)).await;
            cancelled.push(id.clone());
        }
        if !cancelled.is_empty() {
            tracing::info!(
                session_id = %self.session_id(),
                count = cancelled.len(),
                "cancelled tool calls"
            );
        }
        cancelled
    }

    pub async fn forget(&self, id: &ToolCallId) {
        self.state.lock().await.calls.remove(id);
    }

    pub async fn get(&self, id: &ToolCallId) -> Option<ToolCall> {
        self.state.lock().await.calls.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<ToolCall> {
        self.state.lock().await.calls.values().cloned().collect()
    }

    async fn finish(&self, id: &ToolCallId, update: ToolCallUpdate) -> Result<(), TrackerError> {
        let next = update.status.unwrap_or_default();
        let mut state = self.state.lock().await;
        let Some(call) = state.calls.get_mut(id) else {
            return self.reject(TrackerError::UnknownToolCall { id: id.to_string() });
        };
        if call.status.is_terminal() {
            return self.reject(TrackerError::AlreadyTerminal {
                id: id.to_string(),
                status: call.status.to_string(),
            });
        }
        if !call.status.can_transition_to(next) {
            return self.reject(TrackerError::InvalidTransition {
                id: id.to_string(),
                from: call.status.to_string(),
                to: next.to_string(),
            });
        }
        call.apply_update(&update);
        tracing::debug!(
            session_id = %self.session_id(),
            tool_call_id = %id,
            status = %next,
            "tool call finished"
        );
        self.notifier.send(SessionUpdate::ToolCallUpdate(update)).await;
        Ok(())
    }

    fn reject<T>(&self, err: TrackerError) -> Result<T, TrackerError> {
        tracing::error!(
            session_id = %self.session_id(),
            error = %err,
            "rejected tool call transition"
        );
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::LocalCapabilities;
    use tokio::sync::broadcast;

    struct Harness {
        tracker: ToolCallTracker,
        updates: broadcast::Receiver<SessionNotification>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = Arc::new(LocalCapabilities::new(dir.path()).expect("local"));
        let updates = local.subscribe();
        let notifier = SessionNotifier::new(SessionId::from("session_1"), local);
        Harness {
            tracker: ToolCallTracker::new(notifier),
            updates,
            _dir: dir,
        }
    }

    fn drain(updates: &mut broadcast::Receiver<SessionNotification>) -> Vec<SessionNotification> {
        let mut seen = Vec::new();
        while let Ok(notification) = updates.try_recv() {
            seen.push(notification);
        }
        seen
    }

    fn statuses(notifications: &[SessionNotification], id: &str) -> Vec<ToolCallStatus> {
        notifications
            .iter()
            .filter_map(|notification| match &notification.update {
                SessionUpdate::ToolCall(call) if call.tool_call_id.as_str() == id => {
                    Some(call.status)
                }
                SessionUpdate::ToolCallUpdate(update) if update.tool_call_id.as_str() == id => {
                    update.status
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn lifecycle_emits_ordered_notifications() {
        let mut h = harness();
        let id = h
            .tracker
            .create(None, ToolKind::Read, "Read a.txt", vec![ToolCallLocation::path("a.txt")], None)
            .await
            .expect("create");
        assert_eq!(id.as_str(), "call_1");
        h.tracker.start(&id, None, None, None).await.expect("start");
        h.tracker.progress(&id, "partial").await.expect("progress");
        h.tracker
            .complete(&id, Value::String("hello".to_string()))
            .await
            .expect("complete");

        let seen = drain(&mut h.updates);
        assert_eq!(seen.len(), 4);
        let seqs: Vec<u64> = seen.iter().filter_map(|n| n.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(
            statuses(&seen, "call_1"),
            vec![
                ToolCallStatus::Pending,
                ToolCallStatus::InProgress,
                ToolCallStatus::Completed
            ]
        );

        let call = h.tracker.get(&id).await.expect("call");
        assert_eq!(call.status, ToolCallStatus::Completed);
        assert_eq!(call.raw_output, Some(Value::String("hello".to_string())));
    }

    #[tokio::test]
    async fn start_of_unknown_id_is_observed_as_pending_first() {
        let mut h = harness();
        let id = ToolCallId::from("external-7");
        h.tracker
            .start(&id, Some(ToolKind::Execute), Some("Run".to_string()), None)
            .await
            .expect("start");
        let seen = drain(&mut h.updates);
        assert_eq!(
            statuses(&seen, "external-7"),
            vec![ToolCallStatus::Pending, ToolCallStatus::InProgress]
        );
    }

    #[tokio::test]
    async fn duplicate_start_and_terminal_reentry_are_rejected() {
        let h = harness();
        let id = h
            .tracker
            .create(None, ToolKind::Other, "x", Vec::new(), None)
            .await
            .expect("create");
        h.tracker.start(&id, None, None, None).await.expect("start");
        assert!(matches!(
            h.tracker.start(&id, None, None, None).await,
            Err(TrackerError::DuplicateStart { .. })
        ));
        h.tracker.fail(&id, "boom").await.expect("fail");
        assert!(matches!(
            h.tracker.complete(&id, Value::Null).await,
            Err(TrackerError::AlreadyTerminal { .. })
        ));
        assert!(matches!(
            h.tracker.fail(&id, "again").await,
            Err(TrackerError::AlreadyTerminal { .. })
        ));
        assert!(matches!(
            h.tracker.create(Some(id.clone()), ToolKind::Other, "x", Vec::new(), None).await,
            Err(TrackerError::DuplicateStart { .. })
        ));
    }

    #[tokio::test]
    async fn pending_calls_cannot_complete_or_progress() {
        let h = harness();
        let id = h
            .tracker
            .create(None, ToolKind::Other, "x", Vec::new(), None)
            .await
            .expect("create");
        assert!(matches!(
            h.tracker.complete(&id, Value::Null).await,
            Err(TrackerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.tracker.progress(&id, "early").await,
            Err(TrackerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.tracker.cancel(&ToolCallId::from("nope")).await,
            Err(TrackerError::UnknownToolCall { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_emits_exactly_one_update() {
        let mut h = harness();
        let running = h
            .tracker
            .create(None, ToolKind::Execute, "run", Vec::new(), None)
            .await
            .expect("create");
        h.tracker.start(&running, None, None, None).await.expect("start");
        let done = h
            .tracker
            .create(None, ToolKind::Read, "read", Vec::new(), None)
            .await
            .expect("create");
        h.tracker.start(&done, None, None, None).await.expect("start");
        h.tracker.complete(&done, Value::Null).await.expect("complete");
        drain(&mut h.updates);

        let cancelled = h.tracker.cancel_all().await;
        assert_eq!(cancelled, vec![running.clone()]);
        assert!(h.tracker.progress(&running, "late").await.is_err());
        assert!(h.tracker.complete(&running, Value::Null).await.is_err());
        assert!(h.tracker.cancel(&running).await.is_err());

        let seen = drain(&mut h.updates);
        assert_eq!(statuses(&seen, running.as_str()), vec![ToolCallStatus::Cancelled]);
        assert!(statuses(&seen, done.as_str()).is_empty());
    }

    #[tokio::test]
    async fn cancel_if_open_skips_finished_calls() {
        let mut h = harness();
        let id = h
            .tracker
            .create(None, ToolKind::Execute, "run", Vec::new(), None)
            .await
            .expect("create");
        h.tracker.start(&id, None, None, None).await.expect("start");
        h.tracker.cancel_all().await;
        assert!(!h.tracker.cancel_if_open(&id).await);
        assert!(!h.tracker.cancel_if_open(&ToolCallId::from("nope")).await);

        let pending = h
            .tracker
            .create(None, ToolKind::Read, "read", Vec::new(), None)
            .await
            .expect("create");
        assert!(h.tracker.cancel_if_open(&pending).await);

        let seen = drain(&mut h.updates);
        assert_eq!(
            statuses(&seen, id.as_str()),
            vec![ToolCallStatus::Pending, ToolCallStatus::InProgress, ToolCallStatus::Cancelled]
        );
        assert_eq!(
            statuses(&seen, pending.as_str()),
            vec![ToolCallStatus::Pending, ToolCallStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn forget_is_idempotent() {
        let h = harness();
        let id = h
            .tracker
            .create(None, ToolKind::Other, "x", Vec::new(), None)
            .await
            .expect("create");
        h.tracker.forget(&id).await;
        h.tracker.forget(&id).await;
        assert!(h.tracker.get(&id).await.is_none());
        assert!(h.tracker.snapshot().await.is_empty());
        let next = h
            .tracker
            .create(None, ToolKind::Other, "y", Vec::new(), None)
            .await
            .expect("create");
        assert_eq!(next.as_str(), "call_2");
    }
}

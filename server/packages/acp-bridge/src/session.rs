//! Client-side view of a session, rebuilt from `session/update` notifications.

use std::collections::HashMap;

use acp_bridge_schema::{
    MessageChunk, MessageRole, PlanEntry, Session, SessionId, SessionNotification, SessionUpdate,
    ToolCall, ToolCallUpdate,
};
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

const UPDATE_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionAccumulator {
    session: Session,
}

impl SessionAccumulator {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session: Session::new(session_id),
        }
    }

    /// Resumes from a previously taken snapshot, e.g. after a reconnect.
    pub fn from_snapshot(session: Session) -> Self {
        Self { session }
    }

    pub fn snapshot(&self) -> Session {
        self.session.clone()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session.session_id
    }

    /// Returns false when the notification was already applied.
    pub fn apply(&mut self, notification: &SessionNotification) -> bool {
        if let Some(seq) = notification.seq {
            if seq <= self.session.last_seq {
                tracing::trace!(
                    session_id = %self.session.session_id,
                    seq,
                    last_seq = self.session.last_seq,
                    "skipping replayed update"
                );
                return false;
            }
            self.session.last_seq = seq;
        }

        match &notification.update {
            SessionUpdate::UserMessageChunk { content } => {
                self.push_chunk(MessageRole::User, content.clone())
            }
            SessionUpdate::AgentMessageChunk { content } => {
                self.push_chunk(MessageRole::Agent, content.clone())
            }
            SessionUpdate::AgentThoughtChunk { content } => {
                self.push_chunk(MessageRole::Thought, content.clone())
            }
            SessionUpdate::ToolCall(call) => self.upsert_call(call),
            SessionUpdate::ToolCallUpdate(update) => self.merge_update(update),
            SessionUpdate::Plan { entries, merge } => self.apply_plan(entries, *merge),
        }
        true
    }

    fn push_chunk(&mut self, role: MessageRole, content: acp_bridge_schema::ContentBlock) {
        self.session.messages.push(MessageChunk { role, content });
    }

    fn upsert_call(&mut self, call: &ToolCall) {
        match self.session.tool_calls.get_mut(&call.tool_call_id) {
            Some(existing) => {
                let status = existing.status;
                *existing = call.clone();
                if status.is_terminal() {
                    existing.status = status;
                }
            }
            None => {
                self.session
                    .tool_calls
                    .insert(call.tool_call_id.clone(), call.clone());
            }
        }
    }

    fn merge_update(&mut self, update: &ToolCallUpdate) {
        match self.session.tool_calls.get_mut(&update.tool_call_id) {
            Some(existing) => {
                let status = existing.status;
                existing.apply_update(update);
                if status.is_terminal() {
                    existing.status = status;
                }
            }
            None => {
                self.session
                    .tool_calls
                    .insert(update.tool_call_id.clone(), ToolCall::from_update(update));
            }
        }
    }

    fn apply_plan(&mut self, entries: &[PlanEntry], merge: bool) {
        if !merge {
            self.session.plan = entries.to_vec();
            return;
        }
        for entry in entries {
            match self
                .session
                .plan
                .iter_mut()
                .find(|existing| existing.identity() == entry.identity())
            {
                Some(existing) => *existing = entry.clone(),
                None => self.session.plan.push(entry.clone()),
            }
        }
    }
}

/// Accumulators for every session a client has seen.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SessionAccumulator>>,
    updates: broadcast::Sender<SessionNotification>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (updates, _rx) = broadcast::channel(UPDATE_CHANNEL_SIZE);
        Self {
            sessions: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub async fn apply(&self, notification: SessionNotification) -> bool {
        let applied = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(notification.session_id.clone())
                .or_insert_with(|| SessionAccumulator::new(notification.session_id.clone()))
                .apply(&notification)
        };
        if applied {
            let _ = self.updates.send(notification);
        }
        applied
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(SessionAccumulator::snapshot)
    }

    pub async fn insert_snapshot(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), SessionAccumulator::from_snapshot(session));
    }

    pub async fn remove(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .map(|accumulator| accumulator.snapshot())
    }

    /// Live stream of applied notifications. Lagged receivers skip ahead.
    pub fn subscribe(&self) -> impl Stream<Item = SessionNotification> + Send + 'static {
        BroadcastStream::new(self.updates.subscribe())
            .filter_map(|item| async move { item.ok() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_bridge_schema::{
        ContentBlock, PlanEntryStatus, ToolCallContent, ToolCallId, ToolCallStatus, ToolKind,
    };
    use insta::assert_json_snapshot;
    use serde_json::json;

    fn note(seq: Option<u64>, update: SessionUpdate) -> SessionNotification {
        SessionNotification {
            session_id: SessionId::from("session_1"),
            seq,
            update,
        }
    }

    fn status(id: &str, status: ToolCallStatus) -> SessionUpdate {
        SessionUpdate::ToolCallUpdate(ToolCallUpdate::new(ToolCallId::from(id)).status(status))
    }

    fn stream() -> Vec<SessionNotification> {
        vec![
            note(
                Some(1),
                SessionUpdate::UserMessageChunk {
                    content: ContentBlock::text("read a.txt"),
                },
            ),
            note(
                Some(2),
                SessionUpdate::ToolCall(ToolCall::new(
                    ToolCallId::from("call_1"),
                    ToolKind::Read,
                    "read_file",
                )),
            ),
            note(Some(3), status("call_1", ToolCallStatus::InProgress)),
            note(
                Some(4),
                SessionUpdate::ToolCallUpdate(
                    ToolCallUpdate::new(ToolCallId::from("call_1"))
                        .status(ToolCallStatus::Completed)
                        .content(vec![ToolCallContent::text("hello")])
                        .raw_output(json!("hello")),
                ),
            ),
            note(Some(5), SessionUpdate::agent_text("a.txt says ")),
            note(Some(6), SessionUpdate::agent_text("hello")),
        ]
    }

    #[test]
    fn folds_a_turn_into_a_snapshot() {
        let mut acc = SessionAccumulator::new(SessionId::from("session_1"));
        for notification in stream() {
            assert!(acc.apply(&notification));
        }
        let session = acc.snapshot();
        assert_eq!(session.last_seq, 6);
        assert_eq!(session.transcript(MessageRole::Agent), "a.txt says hello");
        assert_json_snapshot!(serde_json::to_value(&session).expect("serialize"), @r###"
        {
          "lastSeq": 6,
          "messages": [
            {
              "content": {
                "text": "read a.txt",
                "type": "text"
              },
              "role": "user"
            },
            {
              "content": {
                "text": "a.txt says ",
                "type": "text"
              },
              "role": "agent"
            },
            {
              "content": {
                "text": "hello",
                "type": "text"
              },
              "role": "agent"
            }
          ],
          "plan": [],
          "sessionId": "session_1",
          "toolCalls": {
            "call_1": {
              "content": [
                {
                  "content": {
                    "text": "hello",
                    "type": "text"
                  },
                  "type": "content"
                }
              ],
              "kind": "read",
              "rawOutput": "hello",
              "status": "completed",
              "title": "read_file",
              "toolCallId": "call_1"
            }
          }
        }
        "###);
    }

    #[test]
    fn replaying_an_applied_prefix_is_a_no_op() {
        let notifications = stream();
        let mut acc = SessionAccumulator::new(SessionId::from("session_1"));
        for notification in &notifications {
            acc.apply(notification);
        }
        let before = acc.snapshot();
        for notification in &notifications[..4] {
            assert!(!acc.apply(notification));
        }
        assert_eq!(acc.snapshot(), before);
    }

    #[test]
    fn terminal_status_is_never_regressed() {
        let mut acc = SessionAccumulator::new(SessionId::from("session_1"));
        acc.apply(&note(None, status("call_1", ToolCallStatus::Cancelled)));
        acc.apply(&note(None, status("call_1", ToolCallStatus::InProgress)));
        acc.apply(&note(
            None,
            SessionUpdate::ToolCall(ToolCall::new(
                ToolCallId::from("call_1"),
                ToolKind::Execute,
                "again",
            )),
        ));
        let session = acc.snapshot();
        let call = &session.tool_calls[&ToolCallId::from("call_1")];
        assert_eq!(call.status, ToolCallStatus::Cancelled);
        assert_eq!(call.title, "again");
    }

    #[test]
    fn update_for_unknown_call_creates_it_with_defaults() {
        let mut acc = SessionAccumulator::new(SessionId::from("session_1"));
        acc.apply(&note(None, status("call_9", ToolCallStatus::InProgress)));
        let session = acc.snapshot();
        let call = &session.tool_calls[&ToolCallId::from("call_9")];
        assert_eq!(call.kind, ToolKind::Other);
        assert_eq!(call.status, ToolCallStatus::InProgress);
        assert!(call.title.is_empty());
    }

    #[test]
    fn plan_replaces_or_merges_by_identity() {
        let mut acc = SessionAccumulator::new(SessionId::from("session_1"));
        acc.apply(&note(
            None,
            SessionUpdate::Plan {
                entries: vec![PlanEntry::new("read"), PlanEntry::new("count")],
                merge: false,
            },
        ));
        let mut done = PlanEntry::new("read");
        done.status = PlanEntryStatus::Completed;
        acc.apply(&note(
            None,
            SessionUpdate::Plan {
                entries: vec![done, PlanEntry::new("report")],
                merge: true,
            },
        ));
        let plan = acc.snapshot().plan;
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].status, PlanEntryStatus::Completed);
        assert_eq!(plan[2].content, "report");

        acc.apply(&note(
            None,
            SessionUpdate::Plan {
                entries: vec![PlanEntry::new("only")],
                merge: false,
            },
        ));
        assert_eq!(acc.snapshot().plan, vec![PlanEntry::new("only")]);
    }

    #[tokio::test]
    async fn store_resumes_from_snapshot_and_broadcasts() {
        let store = SessionStore::new();
        let mut updates = Box::pin(store.subscribe());
        let notifications = stream();
        for notification in notifications.iter().take(3).cloned() {
            store.apply(notification).await;
        }
        let id = SessionId::from("session_1");
        let snapshot = store.snapshot(&id).await.expect("snapshot");
        assert_eq!(snapshot.last_seq, 3);

        // Reconnect: a fresh store picks up from the snapshot and replays everything.
        let resumed = SessionStore::new();
        resumed.insert_snapshot(snapshot).await;
        let mut applied = 0;
        for notification in notifications.iter().cloned() {
            if resumed.apply(notification).await {
                applied += 1;
            }
        }
        assert_eq!(applied, 3);
        assert_eq!(
            resumed.snapshot(&id).await.expect("resumed"),
            {
                let mut acc = SessionAccumulator::new(id.clone());
                for notification in &notifications {
                    acc.apply(notification);
                }
                acc.snapshot()
            }
        );

        let first = updates.next().await.expect("first update");
        assert_eq!(first.seq, Some(1));
        assert!(store.remove(&id).await.is_some());
        assert!(store.snapshot(&id).await.is_none());
    }
}

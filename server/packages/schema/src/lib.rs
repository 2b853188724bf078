use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod methods;
pub mod protocol;

pub use protocol::*;

/// JSON Schema document covering every message that crosses the wire.
pub fn wire_schema() -> Value {
    let mut generator = schemars::gen::SchemaSettings::draft07().into_generator();
    generator.subschema_for::<SessionNotification>();
    generator.subschema_for::<Session>();
    generator.subschema_for::<InitializeRequest>();
    generator.subschema_for::<InitializeResponse>();
    generator.subschema_for::<NewSessionRequest>();
    generator.subschema_for::<NewSessionResponse>();
    generator.subschema_for::<PromptRequest>();
    generator.subschema_for::<PromptResponse>();
    generator.subschema_for::<CancelNotification>();
    generator.subschema_for::<RequestPermissionRequest>();
    generator.subschema_for::<RequestPermissionResponse>();
    generator.subschema_for::<ReadTextFileRequest>();
    generator.subschema_for::<ReadTextFileResponse>();
    generator.subschema_for::<WriteTextFileRequest>();
    generator.subschema_for::<CreateTerminalRequest>();
    generator.subschema_for::<CreateTerminalResponse>();
    generator.subschema_for::<TerminalRequest>();
    generator.subschema_for::<TerminalOutputResponse>();
    generator.subschema_for::<TerminalExitStatus>();
    generator.subschema_for::<DiscoverToolsResponse>();
    generator.subschema_for::<CallToolRequest>();
    generator.subschema_for::<CallToolResponse>();
    generator.subschema_for::<ExternalCallDescriptor>();
    generator.subschema_for::<ResumeRequest>();
    let definitions = generator.take_definitions();
    serde_json::json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "acp-bridge wire protocol",
        "definitions": definitions,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(pub String);

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct ToolCallId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(SessionId);
string_id!(ToolCallId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Write,
    Execute,
    Search,
    #[default]
    Other,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
            Self::Search => "search",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Statuses only move forward along `pending -> in_progress -> terminal`.
    /// A call may be cancelled or failed straight from `pending`, but nothing
    /// leaves a terminal status.
    pub fn can_transition_to(&self, next: ToolCallStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Pending => false,
            Self::InProgress => *self == Self::Pending,
            Self::Completed => *self == Self::InProgress,
            Self::Failed | Self::Cancelled => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallLocation {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl ToolCallLocation {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ResourceLink { uri: String, name: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::ResourceLink { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    Content {
        content: ContentBlock,
    },
    #[serde(rename_all = "camelCase")]
    Diff {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_text: Option<String>,
        new_text: String,
    },
    #[serde(rename_all = "camelCase")]
    Terminal { terminal_id: String },
}

impl ToolCallContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Content {
            content: ContentBlock::text(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: ToolCallId,
    #[serde(default)]
    pub kind: ToolKind,
    #[serde(default)]
    pub status: ToolCallStatus,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ToolCallLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ToolCallContent>,
}

impl ToolCall {
    pub fn new(id: ToolCallId, kind: ToolKind, title: impl Into<String>) -> Self {
        Self {
            tool_call_id: id,
            kind,
            status: ToolCallStatus::Pending,
            title: title.into(),
            locations: Vec::new(),
            raw_input: None,
            raw_output: None,
            content: Vec::new(),
        }
    }

    /// Builds a call from an update for an id the consumer has not seen yet.
    pub fn from_update(update: &ToolCallUpdate) -> Self {
        let mut call = Self::new(update.tool_call_id.clone(), ToolKind::Other, "");
        call.apply_update(update);
        call
    }

    /// Overwrites only the fields present on the update.
    pub fn apply_update(&mut self, update: &ToolCallUpdate) {
        if let Some(kind) = update.kind {
            self.kind = kind;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(title) = &update.title {
            self.title = title.clone();
        }
        if let Some(locations) = &update.locations {
            self.locations = locations.clone();
        }
        if let Some(raw_input) = &update.raw_input {
            self.raw_input = Some(raw_input.clone());
        }
        if let Some(raw_output) = &update.raw_output {
            self.raw_output = Some(raw_output.clone());
        }
        if let Some(content) = &update.content {
            self.content = content.clone();
        }
    }

    pub fn to_update(&self) -> ToolCallUpdate {
        ToolCallUpdate {
            tool_call_id: self.tool_call_id.clone(),
            kind: Some(self.kind),
            status: Some(self.status),
            title: Some(self.title.clone()),
            locations: Some(self.locations.clone()),
            raw_input: self.raw_input.clone(),
            raw_output: self.raw_output.clone(),
            content: Some(self.content.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    pub tool_call_id: ToolCallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ToolCallLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ToolCallContent>>,
}

impl ToolCallUpdate {
    pub fn new(id: ToolCallId) -> Self {
        Self {
            tool_call_id: id,
            ..Self::default()
        }
    }

    pub fn status(mut self, status: ToolCallStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn content(mut self, content: Vec<ToolCallContent>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn raw_output(mut self, raw_output: Value) -> Self {
        self.raw_output = Some(raw_output);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryPriority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub priority: PlanEntryPriority,
    #[serde(default)]
    pub status: PlanEntryStatus,
}

impl PlanEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            priority: PlanEntryPriority::default(),
            status: PlanEntryStatus::default(),
        }
    }

    /// Entries are matched by `id` when present, otherwise by content.
    pub fn identity(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    UserMessageChunk { content: ContentBlock },
    AgentMessageChunk { content: ContentBlock },
    AgentThoughtChunk { content: ContentBlock },
    ToolCall(ToolCall),
    ToolCallUpdate(ToolCallUpdate),
    Plan {
        entries: Vec<PlanEntry>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        merge: bool,
    },
}

impl SessionUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessageChunk { .. } => "user_message_chunk",
            Self::AgentMessageChunk { .. } => "agent_message_chunk",
            Self::AgentThoughtChunk { .. } => "agent_thought_chunk",
            Self::ToolCall(_) => "tool_call",
            Self::ToolCallUpdate(_) => "tool_call_update",
            Self::Plan { .. } => "plan",
        }
    }

    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::AgentMessageChunk {
            content: ContentBlock::text(text),
        }
    }

    pub fn tool_call_id(&self) -> Option<&ToolCallId> {
        match self {
            Self::ToolCall(call) => Some(&call.tool_call_id),
            Self::ToolCallUpdate(update) => Some(&update.tool_call_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub update: SessionUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
    Thought,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageChunk {
    pub role: MessageRole,
    pub content: ContentBlock,
}

/// Canonical session state rebuilt from `session/update` notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    #[serde(default)]
    pub messages: Vec<MessageChunk>,
    #[serde(default)]
    pub tool_calls: BTreeMap<ToolCallId, ToolCall>,
    #[serde(default)]
    pub plan: Vec<PlanEntry>,
    #[serde(default)]
    pub last_seq: u64,
}

impl Session {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            messages: Vec::new(),
            tool_calls: BTreeMap::new(),
            plan: Vec::new(),
            last_seq: 0,
        }
    }

    /// Concatenated text of every chunk with the given role.
    pub fn transcript(&self, role: MessageRole) -> String {
        self.messages
            .iter()
            .filter(|chunk| chunk.role == role)
            .filter_map(|chunk| chunk.content.as_text())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_transitions_only_move_forward() {
        use ToolCallStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, InProgress, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn session_update_wire_shape() {
        let mut call = ToolCall::new(ToolCallId::from("call_1"), ToolKind::Read, "Read a.txt");
        call.locations.push(ToolCallLocation::path("a.txt"));
        let notification = SessionNotification {
            session_id: SessionId::from("sess_1"),
            seq: Some(3),
            update: SessionUpdate::ToolCall(call),
        };
        let value = serde_json::to_value(&notification).expect("serialize");
        assert_eq!(
            value,
            json!({
                "sessionId": "sess_1",
                "seq": 3,
                "update": {
                    "sessionUpdate": "tool_call",
                    "toolCallId": "call_1",
                    "kind": "read",
                    "status": "pending",
                    "title": "Read a.txt",
                    "locations": [{"path": "a.txt"}]
                }
            })
        );

        let back: SessionNotification = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, notification);
    }

    #[test]
    fn update_overwrites_only_present_fields() {
        let mut call = ToolCall::new(ToolCallId::from("call_2"), ToolKind::Execute, "Run ls");
        call.raw_input = Some(json!({"command": "ls"}));
        let update = ToolCallUpdate::new(ToolCallId::from("call_2"))
            .status(ToolCallStatus::InProgress)
            .content(vec![ToolCallContent::text("partial")]);
        call.apply_update(&update);

        assert_eq!(call.status, ToolCallStatus::InProgress);
        assert_eq!(call.title, "Run ls");
        assert_eq!(call.raw_input, Some(json!({"command": "ls"})));
        assert_eq!(call.content, vec![ToolCallContent::text("partial")]);
    }

    #[test]
    fn bare_update_carries_only_the_id() {
        let update = ToolCallUpdate::new(ToolCallId::from("call_3"));
        assert_eq!(
            serde_json::to_value(&update).expect("serialize"),
            json!({"toolCallId": "call_3"})
        );
        assert_eq!(ToolCallUpdate::default().tool_call_id, ToolCallId::default());

        let mut call = ToolCall::new(ToolCallId::from("call_3"), ToolKind::Read, "Read a.txt");
        let before = call.clone();
        call.apply_update(&update);
        assert_eq!(call, before);
    }

    #[test]
    fn wire_schema_lists_core_types() {
        let schema = wire_schema();
        let definitions = schema["definitions"].as_object().expect("definitions");
        for name in ["SessionNotification", "ToolCall", "ResumeRequest", "PermissionOption"] {
            assert!(definitions.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn plan_entry_identity_prefers_id() {
        let mut entry = PlanEntry::new("write tests");
        assert_eq!(entry.identity(), "write tests");
        entry.id = Some("step-1".to_string());
        assert_eq!(entry.identity(), "step-1");
    }
}

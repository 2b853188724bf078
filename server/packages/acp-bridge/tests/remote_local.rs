use std::sync::Arc;
use std::time::Duration;

use acp_bridge::{
    Agent, BridgeClient, BridgeConfig, CommandStub, DirectivePlanner, LocalCapabilities,
    PermissionMode, PermissionPrompter,
};
use acp_bridge_schema::{MessageRole, Session, SessionId, StopReason, ToolCallStatus};
use acp_bridge_wire::{Connection, ConnectionOptions};

const HELLO_PROMPT: &str = r#"```python
x = read_file("a.txt")
y = run_command("wc", ["-l", "a.txt"])
print(x + y)
```"#;

fn options(label: &str) -> ConnectionOptions {
    ConnectionOptions {
        request_timeout: Duration::from_secs(10),
        label: label.to_string(),
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    _agent: Connection,
    client: Arc<BridgeClient>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("a.txt"), "hello").expect("write a.txt");
    let local = LocalCapabilities::new(dir.path())
        .expect("local capabilities")
        .with_stub("wc -l a.txt", CommandStub::success("1"));

    let config = BridgeConfig {
        permission_mode: PermissionMode::Interactive,
        ..BridgeConfig::default()
    };
    let (agent_io, client_io) = tokio::io::duplex(64 * 1024);
    let (agent_read, agent_write) = tokio::io::split(agent_io);
    let (client_read, client_write) = tokio::io::split(client_io);

    let agent = Agent::serve(agent_read, agent_write, Arc::new(DirectivePlanner), config);
    let client = BridgeClient::connect(
        client_read,
        client_write,
        Arc::new(local),
        PermissionPrompter::Auto,
        options("client"),
    );
    Harness {
        _dir: dir,
        _agent: agent,
        client: Arc::new(client),
    }
}

async fn open_session(client: &BridgeClient) -> SessionId {
    let response = client.initialize().await.expect("initialize");
    assert!(response.agent_capabilities.code_mode);
    client
        .new_session(client.local().root().display().to_string())
        .await
        .expect("new session")
}

fn agent_transcript(session: &Session) -> String {
    session
        .messages
        .iter()
        .filter(|chunk| chunk.role == MessageRole::Agent)
        .filter_map(|chunk| chunk.content.as_text())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn code_mode_prompt_runs_against_client_capabilities() {
    let harness = harness();
    let client = &harness.client;
    let session_id = open_session(client).await;

    let stop_reason = client.prompt(&session_id, HELLO_PROMPT).await.expect("prompt");
    assert_eq!(stop_reason, StopReason::EndTurn);

    let session = client.snapshot(&session_id).await.expect("session snapshot");
    let titles: Vec<&str> = session.tool_calls.values().map(|call| call.title.as_str()).collect();
    assert_eq!(titles, vec!["Run code", "Read a.txt", "Run `wc -l a.txt`"]);
    assert!(session
        .tool_calls
        .values()
        .all(|call| call.status == ToolCallStatus::Completed));
    assert!(agent_transcript(&session).contains("hello1"));
    assert_eq!(
        session.messages.first().and_then(|chunk| chunk.content.as_text()),
        Some(HELLO_PROMPT)
    );

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_tool_call_round_trips_through_the_client() {
    let harness = harness();
    let client = &harness.client;
    let session_id = open_session(client).await;

    let stop_reason = client
        .prompt(&session_id, "/tool read_file {\"path\": \"a.txt\"}")
        .await
        .expect("prompt");
    assert_eq!(stop_reason, StopReason::EndTurn);

    let session = client.snapshot(&session_id).await.expect("session snapshot");
    assert_eq!(session.tool_calls.len(), 1);
    let call = session.tool_calls.values().next().expect("tool call");
    assert_eq!(call.title, "Read a.txt");
    assert_eq!(call.status, ToolCallStatus::Completed);
    assert_eq!(agent_transcript(&session), "hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_session_is_rejected() {
    let harness = harness();
    let client = &harness.client;
    client.initialize().await.expect("initialize");
    let result = client.prompt(&SessionId::from("session_404"), "hi").await;
    assert!(result.is_err());
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_a_running_command() {
    let harness = harness();
    let client = harness.client.clone();
    let session_id = open_session(&client).await;

    let prompt = {
        let client = client.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            client
                .prompt(
                    &session_id,
                    r#"/tool run_command {"command": "sleep", "args": ["5"]}"#,
                )
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let running = client.snapshot(&session_id).await.is_some_and(|session| {
                session
                    .tool_calls
                    .values()
                    .any(|call| call.status == ToolCallStatus::InProgress)
            });
            if running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("command never started");

    client.cancel(&session_id).await.expect("cancel");
    let stop_reason = tokio::time::timeout(Duration::from_secs(3), prompt)
        .await
        .expect("prompt did not stop")
        .expect("join")
        .expect("prompt");
    assert_eq!(stop_reason, StopReason::Cancelled);

    let session = client.snapshot(&session_id).await.expect("session snapshot");
    let call = session.tool_calls.values().next().expect("tool call");
    assert_eq!(call.status, ToolCallStatus::Cancelled);
}

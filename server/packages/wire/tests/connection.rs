use std::sync::Arc;
use std::time::Duration;

use acp_bridge_error::{
    BridgeError, ProtocolError, METHOD_NOT_FOUND, PARSE_ERROR, SERVER_NOT_INITIALIZED,
};
use acp_bridge_wire::{Connection, ConnectionOptions, MessageHandler, WireError};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        match method {
            "initialize" => Ok(json!({"protocolVersion": 1})),
            "echo" => Ok(params),
            other => Err(ProtocolError::MethodNotFound {
                method: other.to_string(),
            }
            .into()),
        }
    }
}

fn options(label: &str, timeout: Duration) -> ConnectionOptions {
    ConnectionOptions {
        request_timeout: timeout,
        label: label.to_string(),
    }
}

fn connected_pair() -> (Connection, Connection) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    let client = Connection::start(
        left_read,
        left_write,
        options("client", Duration::from_secs(5)),
        |_| Arc::new(Echo),
    );
    let agent = Connection::start(
        right_read,
        right_write,
        options("agent", Duration::from_secs(5)),
        |_| Arc::new(Echo),
    );
    (client, agent)
}

#[tokio::test]
async fn requests_require_initialize_first() {
    let (client, agent) = connected_pair();

    let err = client
        .request("echo", json!({"text": "early"}))
        .await
        .expect_err("not initialized yet");
    match err {
        WireError::Rpc(error) => assert_eq!(error.code, SERVER_NOT_INITIALIZED),
        other => panic!("unexpected error: {other:?}"),
    }

    client
        .request("initialize", json!({"protocolVersion": 1}))
        .await
        .expect("initialize");
    assert!(client.is_initialized());
    assert!(agent.is_initialized());

    let echoed = client
        .request("echo", json!({"text": "hello"}))
        .await
        .expect("echo");
    assert_eq!(echoed, json!({"text": "hello"}));

    // Initialization in either direction unlocks both sides.
    let back = agent.request("echo", json!([1, 2])).await.expect("reverse echo");
    assert_eq!(back, json!([1, 2]));
}

#[tokio::test]
async fn malformed_frames_are_answered_and_connection_survives() {
    let (raw, peer) = tokio::io::duplex(64 * 1024);
    let (peer_read, peer_write) = tokio::io::split(peer);
    let _connection = Connection::start(
        peer_read,
        peer_write,
        options("agent", Duration::from_secs(5)),
        |_| Arc::new(Echo),
    );
    let (raw_read, mut raw_write) = tokio::io::split(raw);
    let mut lines = BufReader::new(raw_read).lines();

    async fn next(
        lines: &mut tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    ) -> Value {
        let line = lines.next_line().await.expect("read").expect("line");
        serde_json::from_str(&line).expect("json")
    }

    raw_write.write_all(b"this is not json\n").await.expect("write");
    let reply = next(&mut lines).await;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["error"]["code"], PARSE_ERROR);

    raw_write
        .write_all(b"{\"jsonrpc\":\"1.0\",\"id\":7,\"method\":\"echo\"}\n")
        .await
        .expect("write");
    let reply = next(&mut lines).await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["error"]["code"], -32600);

    raw_write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n")
        .await
        .expect("write");
    let reply = next(&mut lines).await;
    assert_eq!(reply["result"]["protocolVersion"], 1);

    raw_write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"fs/delete\"}\n")
        .await
        .expect("write");
    let reply = next(&mut lines).await;
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    assert_eq!(reply["error"]["message"], "method not found: fs/delete");
    assert_eq!(reply["error"]["data"]["details"]["method"], "fs/delete");

    raw_write
        .write_all(
            concat!(
                r#"{"jsonrpc":"2.0","id":"three","method":"echo","params":{"ok":true}}"#,
                "\n"
            )
            .as_bytes(),
        )
        .await
        .expect("write");
    let reply = next(&mut lines).await;
    assert_eq!(reply["id"], "three");
    assert_eq!(reply["result"], json!({"ok": true}));
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (raw, peer) = tokio::io::duplex(64 * 1024);
    let (peer_read, peer_write) = tokio::io::split(peer);
    let connection = Connection::start(
        peer_read,
        peer_write,
        options("client", Duration::from_millis(50)),
        |_| Arc::new(Echo),
    );
    // Keep the raw end open but never answer.
    let _raw = raw;

    let err = connection
        .request("session/prompt", json!({}))
        .await
        .expect_err("timeout");
    assert!(matches!(err, WireError::Timeout { ref method } if method == "session/prompt"));
}

#[tokio::test]
async fn closing_the_stream_fails_pending_requests() {
    let (raw, peer) = tokio::io::duplex(64 * 1024);
    let (peer_read, peer_write) = tokio::io::split(peer);
    let connection = Connection::start(
        peer_read,
        peer_write,
        options("client", Duration::from_secs(5)),
        |_| Arc::new(Echo),
    );
    let (raw_read, raw_write) = tokio::io::split(raw);
    let mut lines = BufReader::new(raw_read).lines();

    let pending = tokio::spawn({
        let connection = connection.clone();
        async move { connection.request("echo", json!({})).await }
    });

    // Wait until the request is on the wire, then hang up.
    let line = lines.next_line().await.expect("read").expect("line");
    assert!(line.contains("\"echo\""));
    drop(lines);
    drop(raw_write);

    let result = pending.await.expect("join");
    assert!(matches!(result, Err(WireError::Closed)));
    tokio::time::timeout(Duration::from_secs(1), connection.closed())
        .await
        .expect("closed resolves");
    assert!(connection.is_closed());
}

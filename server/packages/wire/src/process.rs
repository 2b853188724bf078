use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::connection::{Connection, ConnectionOptions, MessageHandler, WireError};

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: HashMap::new(),
        }
    }

    fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(self.program.to_string_lossy().as_ref()));
        for arg in &self.args {
            parts.push(shell_quote(arg));
        }
        parts.join(" ")
    }
}

/// Spawns `launch` and speaks JSON-RPC over its stdin/stdout. Stderr lines are
/// logged. The child is killed on [`Connection::shutdown`] or when dropped.
pub async fn spawn_connection<F, H>(
    launch: LaunchSpec,
    options: ConnectionOptions,
    make_handler: F,
) -> Result<Connection, WireError>
where
    F: FnOnce(Connection) -> Arc<H>,
    H: MessageHandler,
{
    let spawn_start = Instant::now();

    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &launch.env {
        command.env(key, value);
    }

    tracing::info!(
        program = ?launch.program,
        args = ?launch.args,
        "spawning peer process"
    );

    let mut child = command.spawn().map_err(|err| {
        tracing::error!(
            program = ?launch.program,
            error = %err,
            "failed to spawn peer process"
        );
        WireError::Spawn {
            command: launch.display(),
            error: err,
        }
    })?;

    tracing::info!(
        pid = child.id().unwrap_or(0),
        elapsed_ms = spawn_start.elapsed().as_millis() as u64,
        "peer process spawned"
    );

    let stdin = child
        .stdin
        .take()
        .ok_or(WireError::MissingStdio { stream: "stdin" })?;
    let stdout = child
        .stdout
        .take()
        .ok_or(WireError::MissingStdio { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(WireError::MissingStdio { stream: "stderr" })?;

    let label = options.label.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut line_count: u64 = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            line_count += 1;
            tracing::info!(
                label = %label,
                line_number = line_count,
                age_ms = spawn_start.elapsed().as_millis() as u64,
                "peer stderr: {}",
                line
            );
        }
        tracing::debug!(label = %label, total_lines = line_count, "peer stderr: stream ended");
    });

    let connection = Connection::start(stdout, stdin, options, make_handler);
    connection.attach_child(child).await;
    Ok(connection)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_arguments() {
        let launch = LaunchSpec::new("acp-bridge", vec!["agent".to_string(), "it's".to_string()]);
        assert_eq!(launch.display(), "'acp-bridge' 'agent' 'it'\\''s'");
    }
}

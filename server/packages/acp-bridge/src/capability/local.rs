use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use acp_bridge_error::CapabilityError;
use acp_bridge_schema::{
    CreateTerminalRequest, RequestPermissionOutcome, RequestPermissionRequest, SessionId,
    SessionNotification, TerminalExitStatus, TerminalOutputResponse, ToolDescriptor,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::CapabilitySurface;

const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Canned result for a command line, returned instead of spawning a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStub {
    pub output: String,
    pub exit_code: i32,
}

impl CommandStub {
    pub fn new(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            exit_code,
        }
    }

    pub fn success(output: impl Into<String>) -> Self {
        Self::new(output, 0)
    }
}

#[derive(Debug)]
struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Keeps the newest `limit` bytes, cutting on a character boundary.
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.truncated = true;
    }
}

type SharedOutput = Arc<std::sync::Mutex<OutputBuffer>>;

fn append(output: &SharedOutput, chunk: &str) {
    let mut buffer = output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    buffer.push(chunk);
}

#[derive(Debug)]
struct Terminal {
    command_line: String,
    output: SharedOutput,
    exit: watch::Receiver<Option<TerminalExitStatus>>,
    /// Dropping the sender also kills the process.
    kill: Option<oneshot::Sender<()>>,
}

impl Terminal {
    fn exit_status(&self) -> Option<TerminalExitStatus> {
        self.exit.borrow().clone()
    }

    fn snapshot(&self) -> TerminalOutputResponse {
        let buffer = self
            .output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        TerminalOutputResponse {
            output: buffer.text.clone(),
            truncated: buffer.truncated,
            exit_status: self.exit_status(),
        }
    }

    fn request_kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

type TerminalKey = (SessionId, String);

/// Capabilities backed by this machine: a workspace directory and local
/// processes. Permission requests are approved with their first option.
#[derive(Debug)]
pub struct LocalCapabilities {
    root: PathBuf,
    output_limit: usize,
    stubs: HashMap<String, CommandStub>,
    terminals: Mutex<HashMap<TerminalKey, Terminal>>,
    next_terminal: AtomicU64,
    updates: broadcast::Sender<SessionNotification>,
}

impl LocalCapabilities {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CapabilityError> {
        let root = root.into();
        let display = root.display().to_string();
        let root = std::fs::canonicalize(&root).map_err(|err| CapabilityError::io(&display, err))?;
        if !root.is_dir() {
            return Err(CapabilityError::Io {
                message: format!("{display}: workspace root is not a directory"),
            });
        }
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Ok(Self {
            root,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            stubs: HashMap::new(),
            terminals: Mutex::new(HashMap::new()),
            next_terminal: AtomicU64::new(1),
            updates,
        })
    }

    /// Answers `command_line` (command and arguments joined by spaces) with `stub`.
    pub fn with_stub(mut self, command_line: impl Into<String>, stub: CommandStub) -> Self {
        self.stubs.insert(command_line.into(), stub);
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.updates.subscribe()
    }

    async fn resolve_path(
        &self,
        input: &str,
        must_exist: bool,
    ) -> Result<PathBuf, CapabilityError> {
        let input_path = Path::new(input);
        if input_path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(CapabilityError::PathOutsideRoot {
                path: input.to_string(),
            });
        }

        let joined = if input_path.is_absolute() {
            input_path.to_path_buf()
        } else {
            self.root.join(input_path)
        };
        let normalized = normalize_path(&joined);
        let resolved = if must_exist {
            tokio::fs::canonicalize(&normalized)
                .await
                .map_err(|err| CapabilityError::io(input, err))?
        } else {
            canonicalize_existing_prefix(&normalized, input).await?
        };

        if !resolved.starts_with(&self.root) {
            return Err(CapabilityError::PathOutsideRoot {
                path: input.to_string(),
            });
        }
        Ok(resolved)
    }

    fn next_terminal_id(&self) -> String {
        format!("term_{}", self.next_terminal.fetch_add(1, Ordering::SeqCst))
    }

    fn unknown(terminal_id: &str) -> CapabilityError {
        CapabilityError::UnknownTerminal {
            terminal_id: terminal_id.to_string(),
        }
    }

    fn stub_terminal(command_line: String, stub: &CommandStub, limit: usize) -> Terminal {
        let mut buffer = OutputBuffer::new(limit);
        buffer.push(&stub.output);
        let (_exit_tx, exit) = watch::channel(Some(TerminalExitStatus::code(stub.exit_code)));
        Terminal {
            command_line,
            output: Arc::new(std::sync::Mutex::new(buffer)),
            exit,
            kill: None,
        }
    }

    async fn spawn_terminal(
        &self,
        request: &CreateTerminalRequest,
        command_line: String,
        limit: usize,
    ) -> Result<Terminal, CapabilityError> {
        let cwd = match &request.cwd {
            Some(cwd) => self.resolve_path(cwd, true).await?,
            None => self.root.clone(),
        };

        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            tracing::warn!(command = %command_line, error = %err, "failed to spawn terminal");
            CapabilityError::io(&request.command, err)
        })?;

        let output: SharedOutput = Arc::new(std::sync::Mutex::new(OutputBuffer::new(limit)));
        let stdout = child.stdout.take().map(|stdout| pump(stdout, output.clone()));
        let stderr = child.stderr.take().map(|stderr| pump(stderr, output.clone()));

        let (exit_tx, exit) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let label = command_line.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(command = %label, error = %err, "failed to kill terminal");
                    }
                    child.wait().await
                }
            };
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            let status = exit_status(status);
            tracing::debug!(
                command = %label,
                exit_code = ?status.exit_code,
                signal = ?status.signal,
                "terminal exited"
            );
            exit_tx.send_replace(Some(status));
        });

        Ok(Terminal {
            command_line,
            output,
            exit,
            kill: Some(kill_tx),
        })
    }
}

fn pump<R>(mut reader: R, output: SharedOutput) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        let mut carry = Vec::new();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    carry.extend_from_slice(&buf[..read]);
                    let text = take_utf8(&mut carry);
                    if !text.is_empty() {
                        append(&output, &text);
                    }
                }
            }
        }
        if !carry.is_empty() {
            append(&output, &String::from_utf8_lossy(&carry));
        }
    })
}

/// Drains the decodable prefix of `carry`, leaving an incomplete trailing
/// character for the next read.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let rest = carry.split_off(err.valid_up_to());
            let text = String::from_utf8_lossy(carry).into_owned();
            *carry = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

fn exit_status(status: std::io::Result<ExitStatus>) -> TerminalExitStatus {
    match status {
        Ok(status) => TerminalExitStatus {
            exit_code: status.code(),
            signal: signal_name(&status),
        },
        Err(err) => {
            tracing::warn!(error = %err, "failed to collect terminal exit status");
            TerminalExitStatus::default()
        }
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|signal| match signal {
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGHUP => "SIGHUP".to_string(),
        other => format!("signal {other}"),
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

/// Resolves symlinks in the longest existing prefix of `path`, then
/// reattaches the components that do not exist yet.
async fn canonicalize_existing_prefix(
    path: &Path,
    input: &str,
) -> Result<PathBuf, CapabilityError> {
    let mut missing = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        let err = match tokio::fs::canonicalize(&current).await {
            Ok(real) => {
                return Ok(missing
                    .iter()
                    .rev()
                    .fold(real, |resolved, part| resolved.join(part)));
            }
            Err(err) => err,
        };
        // A dangling link would be followed on write to wherever it points.
        if tokio::fs::symlink_metadata(&current).await.is_ok() {
            return Err(CapabilityError::PathOutsideRoot {
                path: input.to_string(),
            });
        }
        let Some(name) = current.file_name().map(|name| name.to_os_string()) else {
            return Err(CapabilityError::io(input, err));
        };
        missing.push(name);
        current.pop();
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(value) => normalized.push(value),
        }
    }
    normalized
}

/// `line` is 1-based. Line endings are kept as they are in the file.
fn slice_lines(content: &str, line: Option<u32>, limit: Option<u32>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }
    let skip = line.map(|line| line.saturating_sub(1) as usize).unwrap_or(0);
    let take = limit.map(|limit| limit as usize).unwrap_or(usize::MAX);
    content.split_inclusive('\n').skip(skip).take(take).collect()
}

#[async_trait]
impl CapabilitySurface for LocalCapabilities {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn read_text_file(
        &self,
        _session_id: &SessionId,
        path: &str,
        line: Option<u32>,
        limit: Option<u32>,
    ) -> Result<String, CapabilityError> {
        let resolved = self.resolve_path(path, true).await?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|err| CapabilityError::io(path, err))?;
        Ok(slice_lines(&content, line, limit))
    }

    async fn write_text_file(
        &self,
        _session_id: &SessionId,
        path: &str,
        content: &str,
    ) -> Result<(), CapabilityError> {
        let resolved = self.resolve_path(path, false).await?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| CapabilityError::io(path, err))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|err| CapabilityError::io(path, err))
    }

    async fn create_terminal(
        &self,
        request: CreateTerminalRequest,
    ) -> Result<String, CapabilityError> {
        let command_line = request.command_line();
        let limit = request.output_byte_limit.unwrap_or(self.output_limit);
        let terminal = match self.stubs.get(&command_line) {
            Some(stub) => {
                tracing::debug!(command = %command_line, "answering terminal from stub");
                Self::stub_terminal(command_line, stub, limit)
            }
            None => self.spawn_terminal(&request, command_line, limit).await?,
        };
        let terminal_id = self.next_terminal_id();
        tracing::info!(
            session_id = %request.session_id,
            terminal_id = %terminal_id,
            command = %terminal.command_line,
            "terminal created"
        );
        self.terminals
            .lock()
            .await
            .insert((request.session_id, terminal_id.clone()), terminal);
        Ok(terminal_id)
    }

    async fn terminal_output(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<TerminalOutputResponse, CapabilityError> {
        let terminals = self.terminals.lock().await;
        terminals
            .get(&(session_id.clone(), terminal_id.to_string()))
            .map(Terminal::snapshot)
            .ok_or_else(|| Self::unknown(terminal_id))
    }

    async fn wait_for_terminal_exit(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<TerminalExitStatus, CapabilityError> {
        let mut exit = {
            let terminals = self.terminals.lock().await;
            terminals
                .get(&(session_id.clone(), terminal_id.to_string()))
                .map(|terminal| terminal.exit.clone())
                .ok_or_else(|| Self::unknown(terminal_id))?
        };
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CapabilityError::Io {
                message: format!("terminal {terminal_id} stopped reporting"),
            })?;
        Ok(status.clone().unwrap_or_default())
    }

    async fn kill_terminal(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<(), CapabilityError> {
        let mut terminals = self.terminals.lock().await;
        let terminal = terminals
            .get_mut(&(session_id.clone(), terminal_id.to_string()))
            .ok_or_else(|| Self::unknown(terminal_id))?;
        if terminal.exit_status().is_some() {
            return Err(CapabilityError::TerminalExited {
                terminal_id: terminal_id.to_string(),
            });
        }
        if terminal.request_kill() {
            tracing::info!(terminal_id, command = %terminal.command_line, "terminal killed");
        }
        Ok(())
    }

    async fn release_terminal(
        &self,
        session_id: &SessionId,
        terminal_id: &str,
    ) -> Result<(), CapabilityError> {
        let mut terminal = self
            .terminals
            .lock()
            .await
            .remove(&(session_id.clone(), terminal_id.to_string()))
            .ok_or_else(|| Self::unknown(terminal_id))?;
        terminal.request_kill();
        tracing::debug!(terminal_id, "terminal released");
        Ok(())
    }

    async fn request_permission(
        &self,
        request: RequestPermissionRequest,
    ) -> Result<RequestPermissionOutcome, CapabilityError> {
        match request.options.first() {
            Some(option) => {
                tracing::debug!(
                    tool_call_id = %request.tool_call.tool_call_id,
                    option = %option.option_id,
                    "auto-approving permission request"
                );
                Ok(RequestPermissionOutcome::Selected {
                    option_id: option.option_id.clone(),
                })
            }
            None => Err(CapabilityError::PermissionDenied {
                message: "no permission options offered".to_string(),
            }),
        }
    }

    async fn session_update(&self, notification: SessionNotification) {
        // No subscribers is fine for headless runs.
        let _ = self.updates.send(notification);
    }

    async fn discover_tools(
        &self,
        _session_id: &SessionId,
    ) -> Result<Vec<ToolDescriptor>, CapabilityError> {
        Ok(Vec::new())
    }

    async fn call_tool(
        &self,
        _session_id: &SessionId,
        name: &str,
        _arguments: Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unsupported {
            message: format!("no tool named `{name}`"),
        })
    }

    async fn release_session(&self, session_id: &SessionId) {
        let mut terminals = self.terminals.lock().await;
        let owned: Vec<TerminalKey> = terminals
            .keys()
            .filter(|(owner, _)| owner == session_id)
            .cloned()
            .collect();
        for key in &owned {
            if let Some(mut terminal) = terminals.remove(key) {
                terminal.request_kill();
            }
        }
        if !owned.is_empty() {
            tracing::info!(
                session_id = %session_id,
                terminals = owned.len(),
                "released session terminals"
            );
        }
    }
}

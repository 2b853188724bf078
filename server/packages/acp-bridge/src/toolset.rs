//! Functions a Code Mode script (or a single tool call) may invoke.

use std::collections::BTreeMap;

use acp_bridge_error::CapabilityError;
use acp_bridge_sandbox::{ExternalFunction, ExternalParam};
use acp_bridge_schema::{
    ClientCapabilities, CreateTerminalRequest, SessionId, ToolCallLocation, ToolDescriptor,
    ToolKind, ToolParameter,
};
use serde_json::{json, Map, Value};

use crate::capability::SharedCapabilities;

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const RUN_COMMAND: &str = "run_command";

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown function `{function}`")]
    UnknownFunction { function: String },
    #[error("invalid arguments for {function}: {message}")]
    InvalidArguments { function: String, message: String },
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("command `{command}` exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Builtin,
    Discovered,
}

#[derive(Debug, Clone)]
struct Registered {
    descriptor: ToolDescriptor,
    source: Source,
}

/// The named functions available in one session, bound to its capability surface.
pub struct ExternalFunctionRegistry {
    surface: SharedCapabilities,
    session_id: SessionId,
    output_limit: usize,
    functions: BTreeMap<String, Registered>,
}

impl std::fmt::Debug for ExternalFunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalFunctionRegistry")
            .field("session_id", &self.session_id)
            .field("surface", &self.surface.kind())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn builtin_descriptors(capabilities: &ClientCapabilities) -> Vec<ToolDescriptor> {
    let mut tools = Vec::new();
    if capabilities.fs.read_text_file {
        tools.push(ToolDescriptor {
            name: READ_FILE.to_string(),
            description: "Read a text file from the workspace. `line` is 1-based.".to_string(),
            parameters: vec![
                ToolParameter::required("path"),
                ToolParameter::optional("line", Value::Null),
                ToolParameter::optional("limit", Value::Null),
            ],
            kind: ToolKind::Read,
            requires_permission: false,
        });
    }
    if capabilities.fs.write_text_file {
        tools.push(ToolDescriptor {
            name: WRITE_FILE.to_string(),
            description: "Replace the contents of a text file in the workspace.".to_string(),
            parameters: vec![ToolParameter::required("path"), ToolParameter::required("content")],
            kind: ToolKind::Write,
            requires_permission: true,
        });
    }
    if capabilities.terminal {
        tools.push(ToolDescriptor {
            name: RUN_COMMAND.to_string(),
            description: "Run a command to completion and return its output.".to_string(),
            parameters: vec![
                ToolParameter::required("command"),
                ToolParameter::optional("args", json!([])),
                ToolParameter::optional("cwd", Value::Null),
            ],
            kind: ToolKind::Execute,
            requires_permission: true,
        });
    }
    tools
}

impl ExternalFunctionRegistry {
    /// Registers the builtins the client supports plus whatever the surface
    /// discovers. Builtins win on a name clash.
    pub async fn from_capabilities(
        surface: SharedCapabilities,
        session_id: SessionId,
        capabilities: &ClientCapabilities,
        output_limit: usize,
    ) -> Self {
        let mut functions = BTreeMap::new();
        for descriptor in builtin_descriptors(capabilities) {
            functions.insert(
                descriptor.name.clone(),
                Registered {
                    descriptor,
                    source: Source::Builtin,
                },
            );
        }

        match surface.discover_tools(&session_id).await {
            Ok(discovered) => {
                for descriptor in discovered {
                    if functions.contains_key(&descriptor.name) {
                        tracing::warn!(
                            tool = %descriptor.name,
                            "discovered tool shadows a builtin; ignored"
                        );
                        continue;
                    }
                    functions.insert(
                        descriptor.name.clone(),
                        Registered {
                            descriptor,
                            source: Source::Discovered,
                        },
                    );
                }
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "tool discovery failed");
            }
        }

        tracing::debug!(
            session_id = %session_id,
            surface = surface.kind(),
            count = functions.len(),
            "registered external functions"
        );
        Self {
            surface,
            session_id,
            output_limit,
            functions,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.functions.get(name).map(|registered| &registered.descriptor)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Declarations handed to the script runner.
    pub fn external_functions(&self) -> Vec<ExternalFunction> {
        self.functions
            .values()
            .map(|registered| external_function(&registered.descriptor))
            .collect()
    }

    /// One line per function, for the model prompt.
    pub fn describe(&self) -> String {
        self.functions
            .values()
            .map(|registered| {
                let signature = external_function(&registered.descriptor).signature();
                if registered.descriptor.description.is_empty() {
                    format!("- {signature}")
                } else {
                    format!("- {signature}: {}", registered.descriptor.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Title shown for the tool call of `name` with these arguments.
    pub fn title(&self, name: &str, arguments: &Map<String, Value>) -> String {
        let path = arguments.get("path").and_then(Value::as_str);
        match (name, path) {
            (READ_FILE, Some(path)) => format!("Read {path}"),
            (WRITE_FILE, Some(path)) => format!("Write {path}"),
            (RUN_COMMAND, _) => match command_line(arguments) {
                Some(line) => format!("Run `{line}`"),
                None => "Run command".to_string(),
            },
            _ => name.to_string(),
        }
    }

    pub fn locations(&self, name: &str, arguments: &Map<String, Value>) -> Vec<ToolCallLocation> {
        match name {
            READ_FILE | WRITE_FILE => arguments
                .get("path")
                .and_then(Value::as_str)
                .map(|path| vec![ToolCallLocation::path(path)])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub async fn invoke(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let Some(registered) = self.functions.get(name) else {
            return Err(ToolError::UnknownFunction {
                function: name.to_string(),
            });
        };
        if registered.source == Source::Discovered {
            return Ok(self.surface.call_tool(&self.session_id, name, arguments).await?);
        }
        match name {
            READ_FILE => self.read_file(&arguments).await,
            WRITE_FILE => self.write_file(&arguments).await,
            RUN_COMMAND => self.run_command(&arguments).await,
            other => Err(ToolError::UnknownFunction {
                function: other.to_string(),
            }),
        }
    }

    async fn read_file(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let path = string_arg(READ_FILE, arguments, "path")?;
        let line = optional_u32(READ_FILE, arguments, "line")?;
        let limit = optional_u32(READ_FILE, arguments, "limit")?;
        let content = self
            .surface
            .read_text_file(&self.session_id, path, line, limit)
            .await?;
        Ok(Value::String(content))
    }

    async fn write_file(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let path = string_arg(WRITE_FILE, arguments, "path")?;
        let content = string_arg(WRITE_FILE, arguments, "content")?;
        self.surface
            .write_text_file(&self.session_id, path, content)
            .await?;
        Ok(Value::Null)
    }

    async fn run_command(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let command = string_arg(RUN_COMMAND, arguments, "command")?;
        let args = string_list(RUN_COMMAND, arguments, "args")?;
        let mut request = CreateTerminalRequest::new(self.session_id.clone(), command, args);
        request.cwd = match arguments.get("cwd") {
            None | Some(Value::Null) => None,
            Some(Value::String(cwd)) => Some(cwd.clone()),
            Some(_) => return Err(invalid(RUN_COMMAND, "`cwd` must be a string")),
        };
        request.output_byte_limit = Some(self.output_limit);
        let command_line = request.command_line();

        let terminal_id = self.surface.create_terminal(request).await?;
        let result = self.drive_terminal(&terminal_id).await;
        if let Err(err) = self
            .surface
            .release_terminal(&self.session_id, &terminal_id)
            .await
        {
            tracing::warn!(terminal_id = %terminal_id, error = %err, "failed to release terminal");
        }

        let (status, output) = result?;
        if status.success() {
            return Ok(Value::String(output));
        }
        let status = match (status.exit_code, status.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown status".to_string(),
        };
        Err(ToolError::CommandFailed {
            command: command_line,
            status,
            output,
        })
    }

    async fn drive_terminal(
        &self,
        terminal_id: &str,
    ) -> Result<(acp_bridge_schema::TerminalExitStatus, String), ToolError> {
        let status = self
            .surface
            .wait_for_terminal_exit(&self.session_id, terminal_id)
            .await?;
        let output = self
            .surface
            .terminal_output(&self.session_id, terminal_id)
            .await?;
        Ok((status, output.output))
    }
}

fn external_function(descriptor: &ToolDescriptor) -> ExternalFunction {
    let params = descriptor
        .parameters
        .iter()
        .map(|param| {
            if param.required {
                ExternalParam::required(param.name.clone())
            } else {
                ExternalParam::optional(param.name.clone(), param.default.clone())
            }
        })
        .collect();
    ExternalFunction::new(descriptor.name.clone(), params)
}

fn command_line(arguments: &Map<String, Value>) -> Option<String> {
    let command = arguments.get("command")?.as_str()?;
    let args = arguments
        .get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .map(|arg| arg.as_str().map(str::to_string).unwrap_or_else(|| arg.to_string()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Some(
        std::iter::once(command.to_string())
            .chain(args)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn invalid(function: &str, message: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        function: function.to_string(),
        message: message.into(),
    }
}

fn string_arg<'a>(
    function: &str,
    arguments: &'a Map<String, Value>,
    name: &str,
) -> Result<&'a str, ToolError> {
    match arguments.get(name) {
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(invalid(function, format!("`{name}` must be a string"))),
        None => Err(invalid(function, format!("missing `{name}`"))),
    }
}

fn optional_u32(
    function: &str,
    arguments: &Map<String, Value>,
    name: &str,
) -> Result<Option<u32>, ToolError> {
    match arguments.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|value| u32::try_from(value).ok())
            .map(Some)
            .ok_or_else(|| invalid(function, format!("`{name}` must be a non-negative integer"))),
    }
}

fn string_list(
    function: &str,
    arguments: &Map<String, Value>,
    name: &str,
) -> Result<Vec<String>, ToolError> {
    match arguments.get(name) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(function, format!("`{name}` must be a list of strings")))
            })
            .collect(),
        Some(_) => Err(invalid(function, format!("`{name}` must be a list of strings"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::capability::{CommandStub, LocalCapabilities};
    use acp_bridge_schema::FileSystemCapability;

    async fn registry(
        dir: &std::path::Path,
        capabilities: &ClientCapabilities,
    ) -> ExternalFunctionRegistry {
        let local = LocalCapabilities::new(dir)
            .expect("local")
            .with_stub("wc -l a.txt", CommandStub::success("1"))
            .with_stub("false", CommandStub::new("boom", 1));
        ExternalFunctionRegistry::from_capabilities(
            Arc::new(local),
            SessionId::from("session_1"),
            capabilities,
            1024,
        )
        .await
    }

    #[tokio::test]
    async fn describes_builtin_signatures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path(), &ClientCapabilities::full()).await;
        insta::assert_snapshot!(registry.describe(), @r###"
        - read_file(path, line=None, limit=None): Read a text file from the workspace. `line` is 1-based.
        - run_command(command, args=[], cwd=None): Run a command to completion and return its output.
        - write_file(path, content): Replace the contents of a text file in the workspace.
        "###);
    }

    #[tokio::test]
    async fn skips_functions_the_client_cannot_serve() {
        let dir = tempfile::tempdir().expect("tempdir");
        let capabilities = ClientCapabilities {
            fs: FileSystemCapability {
                read_text_file: true,
                write_text_file: false,
            },
            terminal: false,
        };
        let registry = registry(dir.path(), &capabilities).await;
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![READ_FILE]);
        assert!(matches!(
            registry.invoke(RUN_COMMAND, Map::new()).await,
            Err(ToolError::UnknownFunction { .. })
        ));
    }

    #[tokio::test]
    async fn invokes_file_and_command_builtins() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), "hello").expect("write");
        let registry = registry(dir.path(), &ClientCapabilities::full()).await;

        let args = json!({"path": "a.txt", "line": null, "limit": null});
        let read = registry
            .invoke(READ_FILE, args.as_object().cloned().unwrap_or_default())
            .await
            .expect("read");
        assert_eq!(read, json!("hello"));

        let args = json!({"command": "wc", "args": ["-l", "a.txt"], "cwd": null});
        let args = args.as_object().cloned().unwrap_or_default();
        assert_eq!(registry.title(RUN_COMMAND, &args), "Run `wc -l a.txt`");
        let ran = registry.invoke(RUN_COMMAND, args).await.expect("run");
        assert_eq!(ran, json!("1"));

        let args = json!({"path": "b.txt", "content": "new"});
        registry
            .invoke(WRITE_FILE, args.as_object().cloned().unwrap_or_default())
            .await
            .expect("write");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).expect("read back"), "new");
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path(), &ClientCapabilities::full()).await;
        let args = json!({"command": "false"});
        let err = registry
            .invoke(RUN_COMMAND, args.as_object().cloned().unwrap_or_default())
            .await
            .expect_err("non-zero exit");
        match err {
            ToolError::CommandFailed { command, status, output } => {
                assert_eq!(command, "false");
                assert_eq!(status, "exit code 1");
                assert_eq!(output, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rejects_malformed_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(dir.path(), &ClientCapabilities::full()).await;
        let args = json!({"path": "a.txt", "line": -1});
        assert!(matches!(
            registry
                .invoke(READ_FILE, args.as_object().cloned().unwrap_or_default())
                .await,
            Err(ToolError::InvalidArguments { .. })
        ));
        assert!(matches!(
            registry.invoke(WRITE_FILE, Map::new()).await,
            Err(ToolError::InvalidArguments { .. })
        ));
    }
}

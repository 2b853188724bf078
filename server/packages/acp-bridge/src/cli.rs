use std::path::PathBuf;
use std::sync::Arc;

use acp_bridge_error::{BridgeError, CapabilityError};
use acp_bridge_schema::{wire_schema, SessionId};
use acp_bridge_wire::{ConnectionOptions, LaunchSpec};
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::agent::{Agent, DirectivePlanner};
use crate::capability::{CommandStub, LocalCapabilities, SharedCapabilities};
use crate::client::{BridgeClient, PermissionPrompter};
use crate::config::{BridgeConfig, ConfigError, PermissionMode};
use crate::executor::CancelSignal;
use crate::permission::AutoApprove;
use crate::runtime::SessionRuntime;

#[derive(Parser, Debug)]
#[command(name = "acp-bridge", bin_name = "acp-bridge", version)]
#[command(about = "Bridge ACP agents to client capabilities, with a sandboxed Code Mode runner")]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the agent protocol over stdin/stdout.
    Agent,
    /// Launch an agent, send one prompt and print the resulting session.
    Client(ClientArgs),
    /// Run a Code Mode script against the local workspace.
    Run(RunArgs),
    /// Print the JSON Schema of the wire types.
    Schema,
}

/// Overrides applied on top of defaults and `ACP_BRIDGE_*` variables.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    permission_timeout_ms: Option<u64>,
    #[arg(long, global = true, value_enum)]
    permission_mode: Option<PermissionMode>,
    #[arg(long, global = true)]
    max_steps: Option<u64>,
    #[arg(long, global = true)]
    max_duration_ms: Option<u64>,
    #[arg(long, global = true)]
    max_output_bytes: Option<usize>,
    #[arg(long, global = true)]
    terminal_output_limit: Option<usize>,
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    max_turn_requests: Option<u64>,
}

impl ConfigArgs {
    pub fn apply(&self, mut config: BridgeConfig) -> BridgeConfig {
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(ms) = self.permission_timeout_ms {
            config.permission_timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(mode) = self.permission_mode {
            config.permission_mode = mode;
        }
        if let Some(steps) = self.max_steps {
            config.sandbox.max_steps = steps;
        }
        if let Some(ms) = self.max_duration_ms {
            config.sandbox.max_duration_ms = ms;
        }
        if let Some(bytes) = self.max_output_bytes {
            config.sandbox.max_output_bytes = bytes;
        }
        if let Some(bytes) = self.terminal_output_limit {
            config.terminal_output_limit = bytes;
        }
        if let Some(count) = self.max_turn_requests {
            config.max_turn_requests = usize::try_from(count).unwrap_or(usize::MAX);
        }
        config
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Agent program to launch.
    #[arg(long)]
    agent: PathBuf,
    /// Arguments passed to the agent program.
    #[arg(last = true)]
    agent_args: Vec<String>,
    #[arg(long, short = 'p')]
    prompt: String,
    /// Workspace served to the agent.
    #[arg(long, default_value = ".")]
    cwd: PathBuf,
    /// Approve every permission request without asking.
    #[arg(long, short = 'y')]
    yes: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script file to run.
    script: PathBuf,
    /// Workspace the script's file and command functions operate on.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Canned command result as `command line=output`. Repeatable.
    #[arg(long = "stub")]
    stubs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stub `{0}`: expected `command line=output`")]
    InvalidStub(String),
    #[error("script did not complete")]
    ScriptFailed,
}

pub fn run_acp_bridge() -> Result<(), CliError> {
    let cli = Cli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    let config = cli.config.apply(BridgeConfig::from_env()?);
    tracing::debug!(config = ?config, "configuration loaded");
    run_command(cli.command, config)
}

/// Logs go to stderr; stdout carries the protocol.
pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: Command, config: BridgeConfig) -> Result<(), CliError> {
    match command {
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&wire_schema())?);
            Ok(())
        }
        other => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                match other {
                    Command::Agent => run_agent(config).await,
                    Command::Client(args) => run_client(args, config).await,
                    Command::Run(args) => run_script(args, config).await,
                    Command::Schema => Ok(()),
                }
            })
        }
    }
}

async fn run_agent(config: BridgeConfig) -> Result<(), CliError> {
    tracing::info!(permission_mode = config.permission_mode.as_str(), "serving agent on stdio");
    let connection = Agent::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        Arc::new(DirectivePlanner),
        config,
    );
    connection.closed().await;
    Ok(())
}

async fn run_client(args: ClientArgs, config: BridgeConfig) -> Result<(), CliError> {
    let local = Arc::new(
        LocalCapabilities::new(&args.cwd)?.with_output_limit(config.terminal_output_limit),
    );
    let prompter = if args.yes {
        PermissionPrompter::Auto
    } else {
        PermissionPrompter::Stdin
    };
    let options = ConnectionOptions {
        request_timeout: config.request_timeout,
        label: "client".to_string(),
    };
    let launch = LaunchSpec::new(&args.agent, args.agent_args.clone());
    let client = BridgeClient::spawn(launch, local.clone(), prompter, options).await?;

    let outcome = async {
        client.initialize().await?;
        let session_id = client.new_session(local.root().display().to_string()).await?;
        let stop_reason = client.prompt(&session_id, args.prompt.clone()).await?;
        tracing::info!(session_id = %session_id, stop_reason = ?stop_reason, "prompt finished");
        Ok::<SessionId, CliError>(session_id)
    }
    .await;
    let result = match outcome {
        Ok(session_id) => {
            let snapshot = client.snapshot(&session_id).await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Err(err) => Err(err),
    };
    client.shutdown().await;
    result
}

fn parse_stub(raw: &str) -> Result<(String, CommandStub), CliError> {
    let Some((command_line, output)) = raw.split_once('=') else {
        return Err(CliError::InvalidStub(raw.to_string()));
    };
    let command_line = command_line.trim();
    if command_line.is_empty() {
        return Err(CliError::InvalidStub(raw.to_string()));
    }
    Ok((command_line.to_string(), CommandStub::success(output)))
}

async fn run_script(args: RunArgs, config: BridgeConfig) -> Result<(), CliError> {
    let code = tokio::fs::read_to_string(&args.script).await?;
    let mut local =
        LocalCapabilities::new(&args.root)?.with_output_limit(config.terminal_output_limit);
    for raw in &args.stubs {
        let (command_line, stub) = parse_stub(raw)?;
        local = local.with_stub(command_line, stub);
    }
    let surface: SharedCapabilities = Arc::new(local);
    let runtime = SessionRuntime::with_policy(
        SessionId::from("headless"),
        surface,
        &config,
        &acp_bridge_schema::ClientCapabilities::full(),
        Arc::new(AutoApprove),
    )
    .await;

    let report = runtime.code_mode.run(&code, &CancelSignal::new()).await?;
    runtime.teardown().await;
    print!("{}", report.to_text());
    if report.is_success() {
        Ok(())
    } else {
        Err(CliError::ScriptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stubs_split_on_first_equals() {
        let (command_line, stub) = parse_stub("wc -l a.txt=1").expect("stub");
        assert_eq!(command_line, "wc -l a.txt");
        assert_eq!(stub, CommandStub::success("1"));

        let (_, stub) = parse_stub("echo a=b").expect("stub");
        assert_eq!(stub.output, "b");
        assert!(matches!(parse_stub("no separator"), Err(CliError::InvalidStub(_))));
        assert!(matches!(parse_stub("=x"), Err(CliError::InvalidStub(_))));
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "acp-bridge",
            "--permission-mode",
            "auto",
            "--max-steps",
            "10",
            "run",
            "script.py",
            "--stub",
            "ls=a",
        ]);
        let config = cli.config.apply(BridgeConfig::default());
        assert_eq!(config.permission_mode, PermissionMode::Auto);
        assert_eq!(config.sandbox.max_steps, 10);
        let Command::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        assert_eq!(args.stubs, vec!["ls=a".to_string()]);
        assert_eq!(args.root, PathBuf::from("."));
    }

    #[test]
    fn client_takes_trailing_agent_args() {
        let cli = Cli::parse_from([
            "acp-bridge",
            "client",
            "--agent",
            "acp-bridge",
            "--prompt",
            "hi",
            "--yes",
            "--",
            "agent",
        ]);
        let Command::Client(args) = cli.command else {
            panic!("expected the client command");
        };
        assert_eq!(args.agent, PathBuf::from("acp-bridge"));
        assert_eq!(args.agent_args, vec!["agent".to_string()]);
        assert!(args.yes);
    }
}

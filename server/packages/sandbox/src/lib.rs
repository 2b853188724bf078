//! Restricted script interpreter for Code Mode.
//!
//! Scripts are validated against an allow-list, compiled to bytecode and run
//! on a step-counted VM. Calls to registered external functions suspend the
//! VM; the host performs the call and resumes it with the result.

mod ast;
mod builtins;
mod compiler;
mod format;
mod json;
mod lexer;
mod methods;
mod parser;
mod runner;
mod validate;
mod value;
mod vm;

pub use acp_bridge_error::{SandboxError, Violation};
pub use runner::{
    CancelHandle, ExternalCall, ExternalFunction, ExternalParam, RunnerState, SandboxConfig,
    ScriptRunner,
};
pub use validate::BANNED_BUILTINS;

/// Checks `source` without compiling or running it.
pub fn check(source: &str, allowed_modules: &[String]) -> Result<(), SandboxError> {
    validate::validate(source, allowed_modules).map(|_| ())
}

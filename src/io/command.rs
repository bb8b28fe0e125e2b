//! External helper invocation.
//!
//! Every piece of binary inspection and link editing goes through an
//! external tool; this module runs one and captures its textual output.

use std::ffi::OsStr;
use std::io;
use std::process::Command;

/// Captured result of one helper invocation.
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Run a helper tool, capturing stdout and stderr.
///
/// Spawn failure surfaces as `Err`; a nonzero exit is a normal outcome
/// decoded into [`CommandOutput::success`].
pub fn run_tool<I, S>(program: impl AsRef<OsStr>, args: I) -> io::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program).args(args).output()?;
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
    })
}

/// Stdout of a successful run, or `None` when the tool could not be spawned
/// or exited nonzero.
pub fn tool_stdout<I, S>(program: impl AsRef<OsStr>, args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    match run_tool(program, args) {
        Ok(out) if out.success => Some(out.stdout),
        _ => None,
    }
}

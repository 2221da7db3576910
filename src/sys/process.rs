use crate::core::ReplicationError;
use anyhow::{Context as _, Result};
use std::process::{Command, ExitStatus, Output, Stdio};

/// Fold a finished command into the replication error vocabulary. The
/// tool's stderr is the operator-facing detail, and a nonzero exit is a
/// verdict from the tool itself rather than transport trouble, so it
/// surfaces terminal. Spawn and wire failures never pass through here;
/// they keep their `std::io::Error` class and stay retryable.
pub fn verdict(name: &str, status: ExitStatus, stderr: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let stderr = stderr.trim_end();
    let detail = if stderr.is_empty() {
        match status.code() {
            Some(code) => format!("{} exited with code {} and no stderr output", name, code),
            None => format!("{} terminated by signal", name),
        }
    } else {
        format!("{}: {}", name, stderr)
    };
    Err(ReplicationError::Terminal(detail).into())
}

fn capture(name: &str, result: std::io::Result<Output>) -> Result<String> {
    let output = result.with_context(|| format!("failed to run {}", name))?;
    verdict(name, output.status, &String::from_utf8_lossy(&output.stderr))?;
    String::from_utf8(output.stdout).with_context(|| format!("{} produced non-utf8 output", name))
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

#[cfg_attr(test, mockall::automock)]
pub mod double {
    use super::*;
    use std::io::Write as _;

    pub fn run_command_as_result(mut command: Command) -> Result<String> {
        let name = program_name(&command);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        capture(&name, command.output())
    }

    pub fn run_command_with_input(mut command: Command, input: &str) -> Result<String> {
        let name = program_name(&command);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let mut child = command.spawn().with_context(|| format!("failed to spawn {}", name))?;
        child
            .stdin
            .take()
            .expect("stdin is piped")
            .write_all(input.as_bytes())
            .with_context(|| format!("failed to write {} input", name))?;
        capture(&name, child.wait_with_output())
    }
}

use crate::core::ReplicationError;
use anyhow::{ensure, Result};
#[mockall_double::double]
use crate::sys::process::double as process_double;
use std::process::Command;

/// Capability to run a command somewhere and capture its stdout. One
/// shell instance is used exclusively by the runner for one side of a
/// task.
#[cfg_attr(test, mockall::automock)]
pub trait Shell: Send + Sync {
    fn exec(&self, argv: &[String]) -> Result<String>;

    /// Run a command with data on its stdin. Used to stage key material
    /// without it ever appearing on a command line.
    fn exec_with_input(&self, argv: &[String], input: &str) -> Result<String>;

    /// Tear down any persistent session state. Called before a retry when
    /// a recoverable failure may have left the connection unusable.
    fn close(&self);
}

#[derive(Debug, Default)]
pub struct LocalShell;

impl Shell for LocalShell {
    fn exec(&self, argv: &[String]) -> Result<String> {
        ensure!(!argv.is_empty(), "empty command line");
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        process_double::run_command_as_result(command)
    }

    fn exec_with_input(&self, argv: &[String], input: &str) -> Result<String> {
        ensure!(!argv.is_empty(), "empty command line");
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        process_double::run_command_with_input(command, input)
    }

    fn close(&self) {}
}

/// Remote command execution over an ssh child process. BatchMode keeps
/// ssh from ever prompting; failures classify into the recoverable or
/// terminal replication error by stderr content.
#[derive(Debug)]
pub struct SshShell {
    connect_args: Vec<String>,
}

impl SshShell {
    pub fn new(connect_args: Vec<String>) -> Self {
        Self { connect_args }
    }

    pub fn connect_args(&self) -> &[String] {
        &self.connect_args
    }
}

impl Shell for SshShell {
    fn exec(&self, argv: &[String]) -> Result<String> {
        ensure!(!argv.is_empty(), "empty command line");
        let mut command = Command::new("ssh");
        command.arg("-o").arg("BatchMode=yes");
        command.args(&self.connect_args);
        command.arg(shell_join(argv));
        process_double::run_command_as_result(command).map_err(classify_ssh_error)
    }

    fn exec_with_input(&self, argv: &[String], input: &str) -> Result<String> {
        ensure!(!argv.is_empty(), "empty command line");
        let mut command = Command::new("ssh");
        command.arg("-o").arg("BatchMode=yes");
        command.args(&self.connect_args);
        command.arg(shell_join(argv));
        process_double::run_command_with_input(command, input).map_err(classify_ssh_error)
    }

    fn close(&self) {
        // Each exec is its own ssh session; nothing persists between them.
    }
}

/// Auth, host key, proxy and configuration failures will not get better
/// on their own; everything else (timeouts, resets, closed channels) is
/// worth retrying.
pub(crate) fn classify_ssh_error(error: anyhow::Error) -> anyhow::Error {
    const TERMINAL_MARKERS: &[&str] = &[
        "permission denied",
        "authentication failed",
        "host key verification failed",
        "no matching host key type",
        "bad owner or permissions",
        "proxycommand",
        "bad configuration option",
    ];

    let message = format!("{:#}", error);
    let lower = message.to_lowercase();
    if TERMINAL_MARKERS.iter().any(|marker| lower.contains(marker)) {
        anyhow::Error::new(ReplicationError::Terminal(message))
    } else {
        anyhow::Error::new(ReplicationError::Recoverable(message))
    }
}

pub fn shell_join(argv: &[String]) -> String {
    argv.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%_-+=:,./".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::prelude::*;
    use anyhow::anyhow;

    #[test]
    #[serial(fakecmd)]
    fn local_shell_returns_stdout() {
        let ctx = process_double::run_command_as_result_context();
        ctx.expect().returning(|_| Ok("tank/data\n".to_string()));

        let output = LocalShell::default()
            .exec(&[String::from("zfs"), String::from("list")])
            .unwrap();
        assert_eq!(output, "tank/data\n");
    }

    #[test]
    #[serial(fakecmd)]
    fn ssh_auth_failures_are_terminal() {
        let ctx = process_double::run_command_as_result_context();
        ctx.expect()
            .returning(|_| Err(anyhow!("root@backup: Permission denied (publickey).")));

        let shell = SshShell::new(vec![String::from("root@backup")]);
        let error = shell.exec(&[String::from("zfs"), String::from("list")]).unwrap_err();
        match error.downcast_ref::<ReplicationError>() {
            Some(ReplicationError::Terminal(_)) => {}
            other => panic!("expected terminal error, got {:?}", other),
        }
    }

    #[test]
    #[serial(fakecmd)]
    fn ssh_timeouts_are_recoverable() {
        let ctx = process_double::run_command_as_result_context();
        ctx.expect()
            .returning(|_| Err(anyhow!("ssh: connect to host backup port 22: Connection timed out")));

        let shell = SshShell::new(vec![String::from("root@backup")]);
        let error = shell.exec(&[String::from("zfs"), String::from("list")]).unwrap_err();
        match error.downcast_ref::<ReplicationError>() {
            Some(ReplicationError::Recoverable(_)) => {}
            other => panic!("expected recoverable error, got {:?}", other),
        }
    }

    #[test]
    fn quoting_preserves_plain_and_wraps_special() {
        assert_eq!(
            shell_join(&[String::from("zfs"), String::from("list"), String::from("tank/data")]),
            "zfs list tank/data"
        );
        assert_eq!(
            shell_join(&[String::from("echo"), String::from("it's a snap")]),
            r#"echo 'it'\''s a snap'"#
        );
    }
}

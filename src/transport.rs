//! Remote command execution on the appliance
//!
//! All appliance access goes through the [`RemoteShell`] trait:
//!
//! - `exec` runs a command as the login user
//! - `run_privileged` runs it through `sudo`
//!
//! The production implementation, [`SshShell`], drives the system `ssh`
//! binary. The sudo password is written to the child's stdin and never
//! appears in a command line or a log record.

use crate::config::Settings;
use crate::error::{ReconcileError, Result};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit status; -1 when the process was killed by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Quote `s` for a POSIX shell
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run a local process, feeding `stdin` if given, and kill it once `timeout`
/// elapses.
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let out_reader = drain(child.stdout.take());
    let err_reader = drain(child.stderr.take());

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A child that exits without reading closes the pipe; not an error here
        let _ = pipe.write_all(input.as_bytes());
    }

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ReconcileError::Transport(format!(
                "command timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    let stdout = out_reader
        .join()
        .map_err(|_| ReconcileError::Transport("stdout reader panicked".into()))?;
    let stderr = err_reader
        .join()
        .map_err(|_| ReconcileError::Transport("stderr reader panicked".into()))?;

    Ok(CommandOutput {
        status: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

/// Command execution on the appliance
pub trait RemoteShell {
    /// Run `command` as the login user
    fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Run `command` with root privileges
    fn run_privileged(&self, command: &str) -> Result<CommandOutput>;

    /// `exec`, treating a non-zero exit status as an error
    fn check(&self, command: &str) -> Result<String> {
        require_success(command, self.exec(command)?)
    }

    /// `run_privileged`, treating a non-zero exit status as an error
    fn check_privileged(&self, command: &str) -> Result<String> {
        require_success(command, self.run_privileged(command)?)
    }

    /// Read a file, retrying with privileges when the plain read fails
    fn read_file(&self, path: &str) -> Result<String> {
        let command = format!("cat {}", quote(path));
        let plain = self.exec(&command)?;
        if plain.success() {
            return Ok(plain.stdout);
        }
        log::debug!("Unprivileged read of {} failed, retrying with sudo", path);
        self.check_privileged(&command)
    }
}

fn require_success(command: &str, output: CommandOutput) -> Result<String> {
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(ReconcileError::Command {
            command: command.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// [`RemoteShell`] over the system `ssh` client
pub struct SshShell {
    program: String,
    host: String,
    port: u16,
    user: String,
    password: String,
    password_auth: bool,
    timeout: Duration,
}

impl SshShell {
    pub fn new(settings: &Settings) -> Self {
        SshShell {
            program: settings.ssh_program.clone(),
            host: settings.host.clone(),
            port: settings.ssh_port,
            user: settings.credentials.username.clone(),
            password: settings.credentials.secret.clone(),
            password_auth: settings.ssh_password_auth,
            timeout: settings.command_timeout,
        }
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = if self.password_auth {
            let mut cmd = Command::new("sshpass");
            // Only the child sees the password
            cmd.env("SSHPASS", &self.password).arg("-e").arg(&self.program);
            cmd
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.args(["-o", "BatchMode=yes"]);
            cmd
        };
        cmd.args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ConnectTimeout=10"])
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, self.host))
            .arg("--")
            .arg(remote);
        cmd
    }

    fn run(&self, remote: &str, stdin: Option<&str>) -> Result<CommandOutput> {
        let output = run_with_timeout(self.command(remote), stdin, self.timeout).map_err(|e| {
            ReconcileError::Transport(format!("ssh {}@{}: {}", self.user, self.host, e))
        })?;
        // ssh reserves 255 for its own failures
        if output.status == 255 {
            return Err(ReconcileError::Transport(format!(
                "ssh {}@{}: {}",
                self.user,
                self.host,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}

impl RemoteShell for SshShell {
    fn exec(&self, command: &str) -> Result<CommandOutput> {
        log::debug!("[{}] $ {}", self.host, command);
        self.run(command, None)
    }

    fn run_privileged(&self, command: &str) -> Result<CommandOutput> {
        log::debug!("[{}] # {}", self.host, command);
        let wrapped = format!("sudo -S -p '' sh -c {}", quote(command));
        let password = format!("{}\n", self.password);
        self.run(&wrapped, Some(&password))
    }
}

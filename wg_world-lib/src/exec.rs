use std::fmt;
use std::io::Write;
use std::process::{Child, Command, Stdio};

use thiserror::Error;

use crate::netns::NetNs;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command failed [status: {status}]: {cmd}")]
    CommandFailed { cmd: String, status: i32 },
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    FromUtf8Error(#[from] std::string::FromUtf8Error),
}

/// One intent for an external subsystem, scoped to a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    ns: NetNs,
    argv: Vec<String>,
    stdin: Option<String>,
}

impl CommandLine {
    pub fn new(ns: NetNs, argv: Vec<String>) -> Self {
        CommandLine { ns, argv, stdin: None }
    }

    /// Payload fed to the process on stdin (used for `ipset restore` dumps).
    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn scoped_argv(&self) -> Vec<String> {
        self.ns.wrap(&self.argv)
    }

    pub fn render(&self) -> String {
        self.scoped_argv().join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Executes command intents. The production implementation shells out;
/// the test suite records and scripts them.
pub trait Runner: fmt::Debug + Send + Sync {
    fn run(&self, cmd: &CommandLine) -> Result<(), Error>;
    fn output(&self, cmd: &CommandLine) -> Result<String, Error>;
    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn ChildProcess>, Error>;
}

/// A spawned long-running helper tracked by a supervisor.
pub trait ChildProcess: Send {
    fn is_running(&mut self) -> bool;
    fn terminate(&mut self) -> Result<(), Error>;
    fn id(&self) -> u32;
}

#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn execute(&self, cmd: &CommandLine) -> Result<std::process::Output, Error> {
        let argv = cmd.scoped_argv();
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);

        let output = match cmd.stdin() {
            Some(payload) => {
                let mut child = command
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()?;
                if let Some(stdin) = child.stdin.as_mut() {
                    stdin.write_all(payload.as_bytes())?
                }
                child.wait_with_output()?
            }
            None => command.output()?,
        };
        Ok(output)
    }

    fn check(&self, cmd: &CommandLine, output: &std::process::Output) -> Result<(), Error> {
        if output.status.success() {
            if !output.stderr.is_empty() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::debug!(cmd = %cmd, %stderr, "non empty stderr on successful command");
            }
            Ok(())
        } else {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let status = output.status.code().unwrap_or_default();
            tracing::error!(cmd = %cmd, status, %stdout, %stderr, "error executing command");
            Err(Error::CommandFailed { cmd: cmd.render(), status })
        }
    }
}

impl Runner for SystemRunner {
    fn run(&self, cmd: &CommandLine) -> Result<(), Error> {
        let output = self.execute(cmd)?;
        self.check(cmd, &output)
    }

    fn output(&self, cmd: &CommandLine) -> Result<String, Error> {
        let output = self.execute(cmd)?;
        self.check(cmd, &output)?;
        let stdout = String::from_utf8(output.stdout)?;
        Ok(stdout.trim().to_string())
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn ChildProcess>, Error> {
        let argv = cmd.scoped_argv();
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        let child = command.spawn()?;
        tracing::debug!(cmd = %cmd, pid = child.id(), "spawned helper");
        Ok(Box::new(SystemChild { child }))
    }
}

#[derive(Debug)]
struct SystemChild {
    child: Child,
}

impl ChildProcess for SystemChild {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> Result<(), Error> {
        if let Err(e) = self.child.kill() {
            // already exited
            tracing::debug!(error = ?e, pid = self.child.id(), "kill on finished helper");
        }
        self.child.wait()?;
        Ok(())
    }

    fn id(&self) -> u32 {
        self.child.id()
    }
}

// src/remote/mod.rs

//! Remote-session collaborator: file transfer and interactive shells on the
//! allocated hosts.
//!
//! The lifecycle only sees the [`RemoteConnector`] and [`RemoteSession`]
//! traits; [`ssh::SshConnector`] is the production implementation.

pub mod ssh;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{ExprunError, Result};
use crate::provision::BoxFuture;

pub use ssh::SshConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub local: PathBuf,
    /// Path on the remote host, relative to the login directory unless
    /// absolute.
    pub remote: String,
}

impl Transfer {
    pub fn upload(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Upload,
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub fn download(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self {
            direction: TransferDirection::Download,
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// Output gathered during one read cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadCycle {
    pub output: Vec<String>,
    /// Exit status of the running command once the shell is back at its
    /// prompt; `None` if the cycle timed out first.
    pub exit_code: Option<i32>,
}

/// An interactive shell on one host, private to one lifecycle.
pub trait RemoteSession: Send {
    fn send_command<'a>(&'a mut self, command: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Read until the running command finishes or `timeout` elapses.
    fn read_cycle(&mut self, timeout: Duration) -> BoxFuture<'_, Result<ReadCycle>>;

    /// Interrupt the running command (Ctrl-C).
    fn interrupt(&mut self) -> BoxFuture<'_, Result<()>>;

    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

pub trait RemoteConnector: Send + Sync {
    /// Copy one file; returns the transfer program's exit code.
    fn transfer<'a>(&'a self, host: &'a str, transfer: &'a Transfer) -> BoxFuture<'a, Result<i32>>;

    fn open<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Box<dyn RemoteSession>>>;
}

#[derive(Debug, Error)]
#[error("command `{command}` exited with status {status}")]
pub struct CommandFailed {
    pub command: String,
    pub status: i32,
}

/// Run `commands` one after another, each bounded by `timeout` per read
/// cycle. A command still running after a cycle is interrupted and given
/// one more cycle to return; the first non-zero exit status fails the
/// sequence.
pub async fn run_sequence(
    session: &mut dyn RemoteSession,
    commands: &[String],
    timeout: Duration,
) -> Result<()> {
    for command in commands {
        debug!("$ {command}");
        session.send_command(command).await?;

        let mut interrupted = false;
        let status = loop {
            let cycle = session.read_cycle(timeout).await?;
            log_output(&cycle.output);
            match cycle.exit_code {
                Some(status) => break status,
                None if !interrupted => {
                    warn!("command `{command}` timed out after {timeout:?}; interrupting");
                    session.interrupt().await?;
                    interrupted = true;
                }
                None => {
                    return Err(anyhow!("command `{command}` did not stop after an interrupt").into());
                }
            }
        };

        if status != 0 {
            return Err(ExprunError::Other(
                CommandFailed {
                    command: command.clone(),
                    status,
                }
                .into(),
            ));
        }
    }
    Ok(())
}

/// Run a long command, streaming its output at debug level in read cycles
/// of `cycle`, until the shell returns to its prompt. Returns the exit
/// status.
pub async fn stream_command(
    session: &mut dyn RemoteSession,
    command: &str,
    cycle: Duration,
) -> Result<i32> {
    debug!("$ {command}");
    session.send_command(command).await?;
    loop {
        let read = session.read_cycle(cycle).await?;
        log_output(&read.output);
        if let Some(status) = read.exit_code {
            return Ok(status);
        }
    }
}

fn log_output(lines: &[String]) {
    for line in lines {
        debug!("{line}");
    }
}

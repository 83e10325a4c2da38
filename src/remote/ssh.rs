// src/remote/ssh.rs

//! `ssh`/`scp` subprocess implementation of the remote collaborator.
//!
//! Sessions run `ssh -tt` with piped stdio. Each command is sent on one line
//! followed by an `echo` of an end marker carrying `$?`, so the end of a
//! command and its exit status can be read back without prompt detection.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{anyhow, Context};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::provision::BoxFuture;

use super::{ReadCycle, RemoteConnector, RemoteSession, Transfer, TransferDirection};

static END_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__EXPRUN_DONE_(\d+)__ (\d+)").expect("valid end marker pattern"));

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SshConnector {
    username: String,
    cert: PathBuf,
}

impl SshConnector {
    pub fn new(username: impl Into<String>, cert: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            cert: cert.into(),
        }
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-i".to_string(),
            self.cert.display().to_string(),
        ]
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.username, host)
    }

    async fn run_scp(&self, host: &str, transfer: &Transfer) -> Result<i32> {
        let remote = format!("{}:{}", self.destination(host), transfer.remote);
        let local = transfer.local.display().to_string();
        let (from, to) = match transfer.direction {
            TransferDirection::Upload => (local, remote),
            TransferDirection::Download => (remote, local),
        };
        debug!("scp {from} {to}");

        let output = Command::new("scp")
            .args(self.common_args())
            .arg(&from)
            .arg(&to)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning scp to {host}"))?;

        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            debug!(
                "scp exited with status {code}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(code)
    }

    async fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>> {
        let mut child = Command::new("ssh")
            .arg("-tt")
            .args(self.common_args())
            .arg(self.destination(host))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning ssh to {host}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ssh stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ssh stdout unavailable"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line.trim_end_matches('\r').to_string()).is_err() {
                    break;
                }
            }
        });

        if let Some(stderr) = child.stderr.take() {
            let host = host.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%host, "ssh stderr: {line}");
                }
            });
        }

        let mut session = SshSession {
            child,
            stdin,
            lines: rx,
            next_marker: 0,
            pending_marker: None,
        };

        // The first marker coming back proves the shell is up and reading.
        session.send("stty -echo").await?;
        let ready = session.read(READY_TIMEOUT).await?;
        if ready.exit_code.is_none() {
            let _ = session.shutdown().await;
            return Err(anyhow!("shell on {host} did not become ready within {READY_TIMEOUT:?}").into());
        }

        Ok(Box::new(session))
    }
}

impl RemoteConnector for SshConnector {
    fn transfer<'a>(&'a self, host: &'a str, transfer: &'a Transfer) -> BoxFuture<'a, Result<i32>> {
        Box::pin(self.run_scp(host, transfer))
    }

    fn open<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Box<dyn RemoteSession>>> {
        Box::pin(self.open_session(host))
    }
}

struct SshSession {
    child: Child,
    stdin: ChildStdin,
    lines: mpsc::UnboundedReceiver<String>,
    next_marker: u64,
    pending_marker: Option<u64>,
}

impl SshSession {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .context("writing to remote shell")?;
        self.stdin.flush().await.context("flushing remote shell input")?;
        Ok(())
    }

    fn marker_echo(marker: u64) -> String {
        format!("echo \"__EXPRUN_DONE_{marker}__ $?\"")
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let marker = self.next_marker;
        self.next_marker += 1;
        self.pending_marker = Some(marker);
        self.write_line(&format!("{command}; {}", Self::marker_echo(marker)))
            .await
    }

    async fn read(&mut self, timeout: Duration) -> Result<ReadCycle> {
        let deadline = Instant::now() + timeout;
        let mut cycle = ReadCycle::default();

        loop {
            let line = match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                Err(_) => return Ok(cycle),
                Ok(None) => return Err(anyhow!("remote session closed").into()),
                Ok(Some(line)) => line,
            };

            if let Some(caps) = END_MARKER.captures(&line) {
                let marker = caps[1].parse::<u64>().ok();
                if marker.is_some() && marker == self.pending_marker {
                    self.pending_marker = None;
                    cycle.exit_code = Some(caps[2].parse().unwrap_or(-1));
                    return Ok(cycle);
                }
            }
            cycle.output.push(line);
        }
    }

    async fn interrupt_running(&mut self) -> Result<()> {
        self.stdin
            .write_all(b"\x03")
            .await
            .context("interrupting remote command")?;
        self.stdin.flush().await.context("flushing remote shell input")?;
        // Ctrl-C also discards the queued marker echo; ask for it again.
        if let Some(marker) = self.pending_marker {
            self.write_line(&Self::marker_echo(marker)).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Err(err) = self.write_line("exit").await {
            debug!("could not send exit to remote shell: {err:#}");
        }
        match tokio::time::timeout(CLOSE_TIMEOUT, self.child.wait()).await {
            Ok(status) => {
                status.context("waiting for ssh to exit")?;
            }
            Err(_) => {
                warn!("ssh did not exit within {CLOSE_TIMEOUT:?}; killing it");
                self.child.kill().await.context("killing ssh")?;
            }
        }
        Ok(())
    }
}

impl RemoteSession for SshSession {
    fn send_command<'a>(&'a mut self, command: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send(command))
    }

    fn read_cycle(&mut self, timeout: Duration) -> BoxFuture<'_, Result<ReadCycle>> {
        Box::pin(self.read(timeout))
    }

    fn interrupt(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.interrupt_running())
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.shutdown())
    }
}

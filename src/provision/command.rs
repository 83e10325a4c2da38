// src/provision/command.rs

//! Portal driver backed by an external helper program.
//!
//! The helper does the actual portal automation. It is invoked once per
//! operation as `<command> <subcommand> [args...]` with the account
//! credentials in the environment:
//!
//! | subcommand                                         | stdout                          |
//! |----------------------------------------------------|---------------------------------|
//! | `sign-in`                                          | ignored                         |
//! | `instantiate --profile P [--name N] --hours H`     | `uuid=<id>` and `name=<label>`  |
//! | `status <uuid>`                                    | status word on the first line   |
//! | `error-text <uuid>`                                | error text, empty if none       |
//! | `hosts <uuid>`                                     | one host or ssh command per line|
//! | `terminate <uuid>`                                 | ignored                         |
//!
//! Exit status 0 is success, [`EXIT_AUTH`] means the credentials were
//! rejected or the portal session expired, anything else is a failure
//! whose stderr becomes the error message.

use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{anyhow, Context};
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{ExprunError, Result};

use super::portal::{AllocationStatus, PendingAllocation, PortalDriver};
use super::BoxFuture;

/// Helper exit status for an authentication problem.
pub const EXIT_AUTH: i32 = 2;

pub const ENV_USERNAME: &str = "EXPRUN_PORTAL_USERNAME";
pub const ENV_PASSWORD: &str = "EXPRUN_PORTAL_PASSWORD";
pub const ENV_HEADLESS: &str = "EXPRUN_PORTAL_HEADLESS";

static SSH_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ssh -p [0-9]+ \S+@(\S+)").expect("valid ssh command pattern"));

#[derive(Debug, Clone)]
pub struct CommandPortalDriver {
    program: String,
    username: String,
    password: String,
    headless: bool,
}

impl CommandPortalDriver {
    pub fn new(
        program: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        headless: bool,
    ) -> Self {
        Self {
            program: program.into(),
            username: username.into(),
            password: password.into(),
            headless,
        }
    }

    async fn invoke(&self, args: &[&str]) -> Result<String> {
        debug!(program = %self.program, ?args, "invoking portal helper");

        let output = Command::new(&self.program)
            .args(args)
            .env(ENV_USERNAME, &self.username)
            .env(ENV_PASSWORD, &self.password)
            .env(ENV_HEADLESS, if self.headless { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running portal helper '{}'", self.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let subcommand = args.first().copied().unwrap_or_default();
        match output.status.code() {
            Some(EXIT_AUTH) => Err(ExprunError::AuthError(if stderr.is_empty() {
                format!("portal rejected '{subcommand}'")
            } else {
                stderr
            })),
            code => Err(anyhow!(
                "portal helper '{subcommand}' failed (exit {}): {stderr}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string())
            )
            .into()),
        }
    }
}

/// Parse `key=value` lines of the `instantiate` reply.
pub fn parse_pending(stdout: &str) -> Result<PendingAllocation> {
    let mut uuid = None;
    let mut name = None;
    for line in stdout.lines() {
        match line.trim().split_once('=') {
            Some(("uuid", value)) => uuid = Some(value.trim().to_string()),
            Some(("name", value)) => name = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let uuid = uuid
        .filter(|u| !u.is_empty())
        .ok_or_else(|| anyhow!("portal helper did not report an allocation uuid"))?;
    let name = name.unwrap_or_else(|| uuid.clone());
    Ok(PendingAllocation { uuid, name })
}

/// Host addresses from `hosts` output. Lines that look like ssh commands
/// contribute their host part; other non-empty lines are taken verbatim.
pub fn parse_hosts(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            if line.starts_with("ssh ") {
                SSH_COMMAND
                    .captures(line)
                    .map(|caps| caps[1].to_string())
            } else {
                Some(line.to_string())
            }
        })
        .collect()
}

impl PortalDriver for CommandPortalDriver {
    fn sign_in(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.invoke(&["sign-in"]).await?;
            Ok(())
        })
    }

    fn instantiate<'a>(
        &'a mut self,
        profile: &'a str,
        name: Option<&'a str>,
        expires_in_hours: u32,
    ) -> BoxFuture<'a, Result<PendingAllocation>> {
        Box::pin(async move {
            let hours = expires_in_hours.to_string();
            let mut args = vec!["instantiate", "--profile", profile];
            if let Some(name) = name {
                args.extend(["--name", name]);
            }
            args.extend(["--hours", hours.as_str()]);
            let stdout = self.invoke(&args).await?;
            parse_pending(&stdout)
        })
    }

    fn status<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<AllocationStatus>> {
        Box::pin(async move {
            let stdout = self.invoke(&["status", uuid]).await?;
            let line = stdout.lines().map(str::trim).find(|l| !l.is_empty());
            Ok(AllocationStatus::parse(line.unwrap_or_default()))
        })
    }

    fn error_text<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let stdout = self.invoke(&["error-text", uuid]).await?;
            let text = stdout.trim();
            Ok((!text.is_empty()).then(|| format!("(portal error:\n{text})")))
        })
    }

    fn hosts<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let stdout = self.invoke(&["hosts", uuid]).await?;
            Ok(parse_hosts(&stdout))
        })
    }

    fn terminate<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.invoke(&["terminate", uuid]).await?;
            Ok(())
        })
    }
}

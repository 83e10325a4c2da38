//! Scripted stand-ins for the external collaborators.
//!
//! Every fake keeps its state behind an `Arc<Mutex<..>>` so a test can keep a
//! clone for assertions after handing the fake to the code under test.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use exprun::engine::{ConductOutcome, Conductor};
use exprun::errors::{ExprunError, Result};
use exprun::expand::TestReplica;
use exprun::lifecycle::LifecycleState;
use exprun::logging::UnitLogger;
use exprun::provision::{
    Allocation, AllocationStatus, BoxFuture, PendingAllocation, PortalDriver, Provisioner,
};
use exprun::remote::{ReadCycle, RemoteConnector, RemoteSession, Transfer};
use exprun::retry::RetryCursor;

// ---------------------------------------------------------------------------
// Portal driver
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PortalState {
    reject_credentials: bool,
    sign_in_failures: u32,
    sign_ins: usize,
    /// One status script per instantiation; the last script is reused.
    scripts: Vec<Vec<AllocationStatus>>,
    cursors: HashMap<String, usize>,
    script_of: HashMap<String, usize>,
    error_text: Option<String>,
    hosts: Vec<String>,
    instantiated: Vec<(String, Option<String>)>,
    terminated: Vec<String>,
    status_polls: usize,
}

/// Portal driver replaying scripted allocation statuses.
#[derive(Debug, Clone)]
pub struct FakePortal {
    state: Arc<Mutex<PortalState>>,
}

impl FakePortal {
    /// Every allocation goes straight to `ready` with three hosts.
    pub fn new() -> Self {
        let state = PortalState {
            scripts: vec![vec![AllocationStatus::Ready]],
            hosts: vec!["exec.host".into(), "node1.host".into(), "node2.host".into()],
            ..PortalState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Status sequence for every allocation; the last status repeats.
    pub fn with_statuses(self, statuses: &[&str]) -> Self {
        self.with_attempt_statuses(&[statuses])
    }

    /// Status sequence per instantiation, in order.
    pub fn with_attempt_statuses(self, scripts: &[&[&str]]) -> Self {
        self.state.lock().unwrap().scripts = scripts
            .iter()
            .map(|script| script.iter().map(|s| AllocationStatus::parse(s)).collect())
            .collect();
        self
    }

    pub fn with_hosts(self, hosts: &[&str]) -> Self {
        self.state.lock().unwrap().hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_error_text(self, text: &str) -> Self {
        self.state.lock().unwrap().error_text = Some(text.to_string());
        self
    }

    pub fn rejecting_credentials(self) -> Self {
        self.state.lock().unwrap().reject_credentials = true;
        self
    }

    /// Fail the first `n` sign-ins with a transient error.
    pub fn with_sign_in_failures(self, n: u32) -> Self {
        self.state.lock().unwrap().sign_in_failures = n;
        self
    }

    pub fn sign_ins(&self) -> usize {
        self.state.lock().unwrap().sign_ins
    }

    pub fn instantiated(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().unwrap().instantiated.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn status_polls(&self) -> usize {
        self.state.lock().unwrap().status_polls
    }
}

impl Default for FakePortal {
    fn default() -> Self {
        Self::new()
    }
}

impl PortalDriver for FakePortal {
    fn sign_in(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.sign_ins += 1;
            if state.reject_credentials {
                return Err(ExprunError::AuthError("invalid credentials".into()));
            }
            if state.sign_in_failures > 0 {
                state.sign_in_failures -= 1;
                return Err(anyhow::anyhow!("login page did not load").into());
            }
            Ok(())
        })
    }

    fn instantiate<'a>(
        &'a mut self,
        profile: &'a str,
        name: Option<&'a str>,
        _expires_in_hours: u32,
    ) -> BoxFuture<'a, Result<PendingAllocation>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let n = state.instantiated.len();
            state
                .instantiated
                .push((profile.to_string(), name.map(str::to_string)));
            let uuid = format!("uuid-{n}");
            let script = n.min(state.scripts.len().saturating_sub(1));
            state.script_of.insert(uuid.clone(), script);
            state.cursors.insert(uuid.clone(), 0);
            Ok(PendingAllocation {
                name: name.map(str::to_string).unwrap_or_else(|| format!("exp-{n}")),
                uuid,
            })
        })
    }

    fn status<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<AllocationStatus>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.status_polls += 1;
            let script_index = state.script_of.get(uuid).copied().unwrap_or(0);
            let position = state.cursors.get(uuid).copied().unwrap_or(0);
            let script = &state.scripts[script_index];
            let status = script[position.min(script.len() - 1)].clone();
            state.cursors.insert(uuid.to_string(), position + 1);
            Ok(status)
        })
    }

    fn error_text<'a>(&'a mut self, _uuid: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.state.lock().unwrap().error_text.clone()) })
    }

    fn hosts<'a>(&'a mut self, _uuid: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move { Ok(self.state.lock().unwrap().hosts.clone()) })
    }

    fn terminate<'a>(&'a mut self, uuid: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.lock().unwrap().terminated.push(uuid.to_string());
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionCall {
    Login,
    Provision { profile: String, name: Option<String> },
    Terminate { uuid: String },
}

#[derive(Debug, Default)]
struct ProvisionerState {
    calls: Vec<ProvisionCall>,
    /// Unit of the logger installed when each call was made.
    call_units: Vec<Option<String>>,
    installed_unit: Option<String>,
    provision_failures: u32,
    fail_terminate: bool,
    hosts: Vec<String>,
    delay: Duration,
    active: usize,
    max_active: usize,
}

/// Provisioner recording every call and the logger installed for it.
#[derive(Debug, Clone)]
pub struct FakeProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
    logger: UnitLogger,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        let state = ProvisionerState {
            hosts: vec!["exec.host".into(), "node1.host".into(), "node2.host".into()],
            ..ProvisionerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            logger: UnitLogger::global(),
        }
    }

    /// Fail the first `n` provision calls.
    pub fn with_provision_failures(self, n: u32) -> Self {
        self.state.lock().unwrap().provision_failures = n;
        self
    }

    pub fn failing_terminate(self) -> Self {
        self.state.lock().unwrap().fail_terminate = true;
        self
    }

    pub fn with_hosts(self, hosts: &[&str]) -> Self {
        self.state.lock().unwrap().hosts = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    /// Make every call take `delay` (tokio time).
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<ProvisionCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_units(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().call_units.clone()
    }

    pub fn installed_unit(&self) -> Option<String> {
        self.state.lock().unwrap().installed_unit.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProvisionCall::Terminate { uuid } => Some(uuid),
                _ => None,
            })
            .collect()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    fn enter(&self, call: ProvisionCall) -> Duration {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state.call_units.push(self.logger.unit().map(str::to_string));
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        state.delay
    }

    fn exit(&self) {
        self.state.lock().unwrap().active -= 1;
    }
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner for FakeProvisioner {
    fn login(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let delay = self.enter(ProvisionCall::Login);
            tokio::time::sleep(delay).await;
            self.exit();
            Ok(())
        })
    }

    fn provision<'a>(
        &'a mut self,
        profile: &'a str,
        name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Allocation>> {
        Box::pin(async move {
            let delay = self.enter(ProvisionCall::Provision {
                profile: profile.to_string(),
                name: name.map(str::to_string),
            });
            tokio::time::sleep(delay).await;
            self.exit();

            let mut state = self.state.lock().unwrap();
            if state.provision_failures > 0 {
                state.provision_failures -= 1;
                return Err(ExprunError::OperationFailed {
                    task: "provision experiment on the portal".into(),
                    attempts: "after 5 attempts".into(),
                });
            }
            let n = state.calls.len();
            Ok(Allocation::new(
                format!("uuid-{n}"),
                name.unwrap_or("exp").to_string(),
                state.hosts.clone(),
            ))
        })
    }

    fn terminate<'a>(&'a mut self, allocation: &'a Allocation) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let delay = self.enter(ProvisionCall::Terminate {
                uuid: allocation.uuid.clone(),
            });
            tokio::time::sleep(delay).await;
            self.exit();

            if self.state.lock().unwrap().fail_terminate {
                return Err(ExprunError::OperationFailed {
                    task: format!("terminate experiment {allocation} on the portal"),
                    attempts: "after 5 attempts".into(),
                });
            }
            Ok(())
        })
    }

    fn set_logger(&mut self, logger: UnitLogger) -> UnitLogger {
        self.state.lock().unwrap().installed_unit = logger.unit().map(str::to_string);
        std::mem::replace(&mut self.logger, logger)
    }
}

// ---------------------------------------------------------------------------
// Remote connector
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ConnectorState {
    transfers: Vec<(String, Transfer)>,
    /// Exit codes returned by successive transfers; 0 once exhausted.
    transfer_codes: VecDeque<i32>,
    open_failures: u32,
    open_attempts: usize,
    opened: usize,
    closed: usize,
    commands: Vec<String>,
    /// Command substring → remaining failures.
    failing_commands: Vec<(String, u32)>,
    /// Number of upcoming reads that report a dropped session.
    dropped_reads: u32,
    /// Read cycles a command matching the key stays silent before finishing.
    slow_commands: Vec<(String, u32)>,
    interrupts: usize,
}

/// Connector whose sessions succeed unless told otherwise.
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transfer_codes(self, codes: &[i32]) -> Self {
        self.state.lock().unwrap().transfer_codes = codes.iter().copied().collect();
        self
    }

    pub fn with_open_failures(self, n: u32) -> Self {
        self.state.lock().unwrap().open_failures = n;
        self
    }

    /// Commands containing `needle` exit with status 1, `times` times.
    pub fn failing_command(self, needle: &str, times: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_commands
            .push((needle.to_string(), times));
        self
    }

    /// The next `n` reads fail as if the connection dropped.
    pub fn with_dropped_reads(self, n: u32) -> Self {
        self.state.lock().unwrap().dropped_reads = n;
        self
    }

    /// Commands containing `needle` need `cycles` timed-out reads first.
    pub fn slow_command(self, needle: &str, cycles: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .slow_commands
            .push((needle.to_string(), cycles));
        self
    }

    pub fn transfers(&self) -> Vec<(String, Transfer)> {
        self.state.lock().unwrap().transfers.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    /// Every call to `open`, failed or not.
    pub fn open_attempts(&self) -> usize {
        self.state.lock().unwrap().open_attempts
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn interrupts(&self) -> usize {
        self.state.lock().unwrap().interrupts
    }
}

impl RemoteConnector for FakeConnector {
    fn transfer<'a>(&'a self, host: &'a str, transfer: &'a Transfer) -> BoxFuture<'a, Result<i32>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.transfers.push((host.to_string(), transfer.clone()));
            Ok(state.transfer_codes.pop_front().unwrap_or(0))
        })
    }

    fn open<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, Result<Box<dyn RemoteSession>>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.open_attempts += 1;
            if state.open_failures > 0 {
                state.open_failures -= 1;
                return Err(anyhow::anyhow!("connection refused").into());
            }
            state.opened += 1;
            let session: Box<dyn RemoteSession> = Box::new(FakeSession {
                state: Arc::clone(&self.state),
                pending: None,
            });
            Ok(session)
        })
    }
}

struct PendingCommand {
    status: i32,
    silent_cycles: u32,
    interrupted: bool,
}

struct FakeSession {
    state: Arc<Mutex<ConnectorState>>,
    pending: Option<PendingCommand>,
}

impl RemoteSession for FakeSession {
    fn send_command<'a>(&'a mut self, command: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.commands.push(command.to_string());

            let mut status = 0;
            for (needle, remaining) in state.failing_commands.iter_mut() {
                if *remaining > 0 && command.contains(needle.as_str()) {
                    *remaining -= 1;
                    status = 1;
                }
            }
            let mut silent_cycles = 0;
            for (needle, cycles) in state.slow_commands.iter() {
                if command.contains(needle.as_str()) {
                    silent_cycles = *cycles;
                }
            }
            self.pending = Some(PendingCommand {
                status,
                silent_cycles,
                interrupted: false,
            });
            Ok(())
        })
    }

    fn read_cycle(&mut self, _timeout: Duration) -> BoxFuture<'_, Result<ReadCycle>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                if state.dropped_reads > 0 {
                    state.dropped_reads -= 1;
                    return Err(anyhow::anyhow!("remote session closed").into());
                }
            }
            let Some(pending) = self.pending.as_mut() else {
                return Ok(ReadCycle::default());
            };
            if pending.interrupted {
                self.pending = None;
                return Ok(ReadCycle {
                    output: vec!["^C".to_string()],
                    exit_code: Some(130),
                });
            }
            if pending.silent_cycles > 0 {
                pending.silent_cycles -= 1;
                return Ok(ReadCycle {
                    output: vec!["working...".to_string()],
                    exit_code: None,
                });
            }
            let status = pending.status;
            self.pending = None;
            Ok(ReadCycle {
                output: vec!["ok".to_string()],
                exit_code: Some(status),
            })
        })
    }

    fn interrupt(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.state.lock().unwrap().interrupts += 1;
            if let Some(pending) = self.pending.as_mut() {
                pending.interrupted = true;
            }
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.state.lock().unwrap().closed += 1;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Conductor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Retry,
    Skip,
    Error,
}

#[derive(Debug, Default)]
struct ConductorState {
    scripts: HashMap<String, VecDeque<Scripted>>,
    conducted: Vec<String>,
    running: usize,
    max_running: usize,
    finished: Vec<String>,
}

/// Conductor that "runs" every replica as a timed sleep and tracks how many
/// are running at once.
#[derive(Debug, Clone)]
pub struct FakeConductor {
    state: Arc<Mutex<ConductorState>>,
    run_time: Duration,
}

impl FakeConductor {
    pub fn new(run_time: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConductorState::default())),
            run_time,
        }
    }

    /// Queue scripted outcomes for `id`; once used up the replica starts.
    pub fn script(self, id: &str, outcomes: &[Scripted]) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(id.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
        self
    }

    /// Replica ids in the order `conduct` was called.
    pub fn conducted(&self) -> Vec<String> {
        self.state.lock().unwrap().conducted.clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.state.lock().unwrap().finished.clone()
    }

    pub fn max_running(&self) -> usize {
        self.state.lock().unwrap().max_running
    }

    pub fn running(&self) -> usize {
        self.state.lock().unwrap().running
    }
}

impl Conductor for FakeConductor {
    fn conduct<'a>(
        &'a self,
        replica: &'a TestReplica,
        cursor: &'a mut RetryCursor,
        _logger: UnitLogger,
    ) -> BoxFuture<'a, Result<ConductOutcome>> {
        Box::pin(async move {
            let scripted = {
                let mut state = self.state.lock().unwrap();
                state.conducted.push(replica.id.clone());
                state
                    .scripts
                    .get_mut(&replica.id)
                    .and_then(VecDeque::pop_front)
            };

            match scripted {
                Some(Scripted::Retry) => {
                    cursor.failed("scripted provisioning failure");
                    return Ok(ConductOutcome::Retry);
                }
                Some(Scripted::Skip) => return Ok(ConductOutcome::Skipped),
                Some(Scripted::Error) => {
                    return Err(ExprunError::ConfigError(format!(
                        "scripted error for {}",
                        replica.id
                    )));
                }
                None => {}
            }

            {
                let mut state = self.state.lock().unwrap();
                state.running += 1;
                state.max_running = state.max_running.max(state.running);
            }

            let state = Arc::clone(&self.state);
            let run_time = self.run_time;
            let id = replica.id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(run_time).await;
                let mut state = state.lock().unwrap();
                state.running -= 1;
                state.finished.push(id);
                LifecycleState::Done
            });
            Ok(ConductOutcome::Started(handle))
        })
    }
}

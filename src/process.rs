use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, WrapErr};
use futures::StreamExt;
use indexmap::IndexMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::config::ServiceKind;
use crate::environment::Environment;
use crate::error::{ExitDescription, HarnessError};
use crate::logging::{LogSink, Severity};

use super::Result;

/// Longest output line forwarded to the log sink; longer lines are dropped.
pub const OUTPUT_LINE_CEILING: usize = 42 * 1024 * 1024;

/// How long a finished one-shot process gets to flush its remaining output.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Slot holding the first fatal fault raised by a foreground service.
pub type FaultSlot = Arc<watch::Sender<Option<HarnessError>>>;

/// Program, argv and environment resolved from a service's config.
#[derive(Debug, Clone)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Environment,
}

impl Launch {
    /// Resolves program, argv and environment for a service kind.
    ///
    /// `executable` services get only their configured environment; every
    /// other process kind inherits the harness environment.
    ///
    /// # Returns
    /// * `Some(Launch)` - For kinds that run an OS process
    /// * `None` - For `mock origin`
    pub fn for_kind(kind: &ServiceKind) -> Option<Self> {
        match kind {
            ServiceKind::Executable(spec) => Some(Self {
                program: spec.path.clone(),
                args: spec.args.to_argv(),
                env: Environment::for_service(&spec.env, false),
            }),
            ServiceKind::AsyncProcess(spec) | ServiceKind::SyncProcess(spec) => Some(Self {
                program: spec.path.clone(),
                args: spec.args.to_argv(),
                env: Environment::for_service(&spec.env, true),
            }),
            ServiceKind::Other(spec) => Some(Self {
                program: spec.executable.clone(),
                args: spec.args.clone(),
                env: Environment::for_service(&spec.env, true),
            }),
            ServiceKind::MockOrigin(_) => None,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);

        // Own process group, so a kill reaches anything the service forks.
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        command.env_clear();
        command.envs(self.env.iter());
        command
    }

    /// Spawns the process and starts forwarding its output.
    ///
    /// # Arguments
    /// * `name` - Service name, used as the prefix of every forwarded line
    /// * `log` - Sink receiving stdout at DEBUG and stderr at WARN
    ///
    /// # Returns
    /// * `Result<(Child, Pid, JoinHandle<()>)>` - The child, its pid (also
    ///   its process group id) and the output forwarding task
    pub fn spawn(&self, name: &str, log: &LogSink) -> Result<(Child, Pid, JoinHandle<()>)> {
        log.info(format!(
            "Spawn {}: {} {}",
            name,
            self.program.display(),
            self.args.join(" ")
        ));

        let mut child = self
            .command()
            .spawn()
            .wrap_err_with(|| format!("Failed to spawn {} ({})", name, self.program.display()))?;

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre!("Failed to get process ID for {}", name)),
        };

        let output = pipe_output(name, &mut child, log);
        log.debug(format!("{} spawned with pid={}", name, pid));
        Ok((child, pid, output))
    }
}

/// Forwards stdout at DEBUG and stderr at WARN, one message per line.
fn pipe_output(name: &str, child: &mut Child, log: &LogSink) -> JoinHandle<()> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let name = name.to_string();
    let log = log.clone();

    tokio::spawn(async move {
        let out = async {
            if let Some(stdout) = stdout {
                forward_lines(&name, stdout, Severity::Debug, &log).await;
            }
        };
        let err = async {
            if let Some(stderr) = stderr {
                forward_lines(&name, stderr, Severity::Warn, &log).await;
            }
        };
        tokio::join!(out, err);
    })
}

async fn forward_lines<R>(name: &str, stream: R, severity: Severity, log: &LogSink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(OUTPUT_LINE_CEILING));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => log.log(severity, format!("{}: {}", name, line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                log.warn(format!("{}: output line over {} bytes dropped", name, OUTPUT_LINE_CEILING));
            }
            Err(LinesCodecError::Io(e)) => {
                log.debug(format!("{}: output closed: {}", name, e));
                break;
            }
        }
    }
}

/// Lifecycle of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Termination was requested; the exit that follows is not a fault.
    Terminating,
}

/// Runtime handle for a spawned service, owned by a [`ProcessRegistry`].
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub name: String,
    pub pid: Pid,
    /// Foreground services abort the harness when they fail.
    pub foreground: bool,
    pub state: ProcessState,
}

impl ManagedProcess {
    pub fn new(name: impl Into<String>, pid: Pid, foreground: bool) -> Self {
        Self {
            name: name.into(),
            pid,
            foreground,
            state: ProcessState::Running,
        }
    }
}

/// Live processes of one supervisor, keyed by service name.
///
/// Entries disappear the moment their exit is observed.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Mutex<IndexMap<String, ManagedProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, process: ManagedProcess) {
        self.processes.lock().insert(process.name.clone(), process);
    }

    pub fn remove(&self, name: &str) -> Option<ManagedProcess> {
        self.processes.lock().shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<ManagedProcess> {
        self.processes.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.processes.lock().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    pub fn clear(&self) {
        self.processes.lock().clear();
    }

    /// SIGKILLs every registered process group and marks it terminating.
    ///
    /// Entries stay until their exit is observed.
    ///
    /// # Returns
    /// * `Vec<ManagedProcess>` - Snapshot of the processes that were signalled
    pub fn terminate_all(&self) -> Vec<ManagedProcess> {
        let mut processes = self.processes.lock();
        terminate(processes.values_mut())
    }

    /// Like [`ProcessRegistry::terminate_all`] but gives up instead of
    /// blocking when the registry is busy. Used from exit paths.
    pub fn try_terminate_all(&self, wait: Duration) -> Option<Vec<ManagedProcess>> {
        let mut processes = self.processes.try_lock_for(wait)?;
        Some(terminate(processes.values_mut()))
    }
}

fn terminate<'a>(processes: impl Iterator<Item = &'a mut ManagedProcess>) -> Vec<ManagedProcess> {
    processes
        .map(|process| {
            process.state = ProcessState::Terminating;
            // ESRCH: already gone, the observer will catch up.
            let _ = kill(Pid::from_raw(-process.pid.as_raw()), Signal::SIGKILL);
            process.clone()
        })
        .collect()
}

/// Waits for `child` to exit, deregisters it and reports how it ended.
///
/// A foreground service that dies without being asked to records a
/// [`HarnessError::ProcessFault`] in `faults`.
pub async fn observe_exit(
    name: String,
    mut child: Child,
    registry: Arc<ProcessRegistry>,
    faults: FaultSlot,
    log: LogSink,
) {
    let pid = child.id();
    let status = child.wait().await;
    let entry = registry.remove(&name);
    let requested = entry
        .as_ref()
        .map(|p| p.state == ProcessState::Terminating)
        .unwrap_or(true);
    let foreground = entry.map(|p| p.foreground).unwrap_or(false);
    let pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());

    match status {
        Ok(status) if status.success() => {
            log.info(format!("{} exited: code=0, pid={}", name, pid));
        }
        Ok(status) if requested => {
            log.info(format!("{} stopped: {}, pid={}", name, ExitDescription::from(status), pid));
        }
        Ok(status) => {
            let status = ExitDescription::from(status);
            log.error(format!("{} exited: {}, pid={}", name, status, pid));
            if foreground {
                faults.send_if_modified(|slot| {
                    if slot.is_some() {
                        return false;
                    }
                    *slot = Some(HarnessError::ProcessFault {
                        service: name.clone(),
                        status,
                    });
                    true
                });
            }
        }
        Err(e) => log.error(format!("Error waiting for {} (pid={}): {}", name, pid, e)),
    }
}

/// Runs a one-shot process to completion, keeping it registered while it
/// runs so the exit guard can reach it.
///
/// # Arguments
/// * `name` - Service name
/// * `launch` - What to run
/// * `registry` - Registry the process is listed in while it runs
/// * `log` - Sink for output and the exit line
///
/// # Returns
/// * `Result<ExitStatus>` - The exit status; a non-zero exit is not an error
pub async fn run_to_completion(
    name: &str,
    launch: &Launch,
    registry: &ProcessRegistry,
    log: &LogSink,
) -> Result<ExitStatus> {
    let (mut child, pid, output) = launch.spawn(name, log)?;
    registry.insert(ManagedProcess::new(name, pid, false));

    let status = child.wait().await;
    registry.remove(name);
    let status = status.wrap_err_with(|| format!("Failed to wait for {}", name))?;

    // A grandchild may still hold the pipes open.
    let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, output).await;

    if status.success() {
        log.info(format!("{} exited: code=0, pid={}", name, pid));
    } else {
        log.warn(format!("{} exited: {}, pid={}", name, ExitDescription::from(status), pid));
    }
    Ok(status)
}

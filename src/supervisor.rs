use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{HarnessConfig, ServiceConfig, ServiceKind};
use crate::error::HarnessError;
use crate::exit_guard;
use crate::logging::LogSink;
use crate::origin::MockOriginServer;
use crate::process::{self, FaultSlot, Launch, ManagedProcess, ProcessRegistry};
use crate::readiness::{self, Polarity, ReadinessTarget};

use super::Result;

/// Upper bound on waiting for a SIGKILLed child to be reaped during stop.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How a successful [`ProcessSupervisor::start`] ended.
#[derive(Debug)]
pub enum StartOutcome {
    /// Every declared endpoint accepts connections.
    Ready,
    /// A `sync process` ran to completion; later services were not started.
    Completed { service: String, status: ExitStatus },
}

/// Brings a declared set of services up and down.
///
/// Owns the registry of spawned processes and the running mock origins.
/// Nothing is shared with other supervisors except the weak link the exit
/// guard keeps to the registry.
pub struct ProcessSupervisor {
    config: HarnessConfig,
    log: LogSink,
    registry: Arc<ProcessRegistry>,
    origins: IndexMap<String, MockOriginServer>,
    observers: Vec<JoinHandle<()>>,
    /// Endpoints of everything dispatched by the last start.
    endpoints: Vec<ReadinessTarget>,
    faults: FaultSlot,
    /// Set by start, cleared by stop.
    started: bool,
}

impl ProcessSupervisor {
    /// Validates `config`; nothing is started yet.
    ///
    /// # Arguments
    /// * `config` - The services to manage and the readiness policy
    ///
    /// # Errors
    /// * [`HarnessError::Config`] - The config failed validation
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let (faults, _) = watch::channel(None);

        Ok(Self {
            config,
            log: LogSink::discard(),
            registry: Arc::new(ProcessRegistry::new()),
            origins: IndexMap::new(),
            observers: Vec::new(),
            endpoints: Vec::new(),
            faults: Arc::new(faults),
            started: false,
        })
    }

    /// Routes every harness event to `log`. The default discards them.
    pub fn with_log(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Names of processes that are still registered.
    pub fn running(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn process(&self, name: &str) -> Option<ManagedProcess> {
        self.registry.get(name)
    }

    /// Names of live mock origins.
    pub fn origins(&self) -> Vec<String> {
        self.origins.keys().cloned().collect()
    }

    /// What [`ProcessSupervisor::start`] will wait for.
    pub fn readiness_targets(&self) -> Vec<ReadinessTarget> {
        self.config.readiness_targets()
    }

    /// First fatal fault of a foreground service since the last start.
    pub fn fault(&self) -> Option<HarnessError> {
        self.faults.borrow().clone()
    }

    /// Launches every service with `spawn` enabled, in declaration order,
    /// and returns once all their endpoints accept connections.
    ///
    /// On a readiness timeout the error is returned as is: services that
    /// were already launched stay registered until [`ProcessSupervisor::stop`],
    /// drop, or the exit guard.
    ///
    /// # Returns
    /// * `Ok(StartOutcome::Ready)` - Every endpoint accepts connections
    /// * `Ok(StartOutcome::Completed { .. })` - A `sync process` ran to the end
    ///
    /// # Errors
    /// * [`HarnessError::Config`] - Called again without an intervening stop
    /// * [`HarnessError::ReadinessTimeout`] - An endpoint never opened
    /// * [`HarnessError::ProcessFault`] - A foreground service died while waiting
    /// * Any spawn or bind failure
    pub async fn start(&mut self) -> Result<StartOutcome> {
        if self.started {
            return Err(HarnessError::config("supervisor already started, stop it first").into());
        }
        self.started = true;

        exit_guard::install();
        exit_guard::register(&self.registry);
        self.faults.send_replace(None);

        let retries = self.config.readiness.retries;
        let servers = self.config.servers.clone();
        let mut targets = Vec::new();

        for (name, service) in &servers {
            if !service.spawn {
                self.log.debug(format!("Not spawning {}", name));
                continue;
            }

            let service_targets = service.readiness_targets(retries);

            match service.kind {
                ServiceKind::Executable(_) | ServiceKind::Other(_) => {
                    self.launch(name, service, true)?;
                }
                ServiceKind::AsyncProcess(_) => {
                    self.launch(name, service, false)?;
                }
                ServiceKind::SyncProcess(_) => {
                    self.await_ready(std::mem::take(&mut targets)).await?;
                    let status = self.run_sync(name, service).await?;
                    return Ok(StartOutcome::Completed {
                        service: name.clone(),
                        status,
                    });
                }
                ServiceKind::MockOrigin(_) => {
                    let server = MockOriginServer::from_service(name, service, self.log.clone()).await?;
                    self.origins.insert(name.clone(), server);
                }
            }

            // Only what was actually launched is waited on at stop.
            self.endpoints.extend(service_targets.iter().cloned());
            targets.extend(service_targets);
        }

        self.await_ready(targets).await?;
        self.log.info("All services ready");
        Ok(StartOutcome::Ready)
    }

    /// Kills every process, closes every mock origin and returns once all
    /// previously declared endpoints refuse connections.
    ///
    /// A foreground fault recorded since start is returned after teardown.
    /// Safe to call any number of times, including after a failed start.
    ///
    /// # Errors
    /// * [`HarnessError::ReadinessTimeout`] - A port stayed open
    /// * [`HarnessError::ProcessFault`] - A foreground service had died on its own
    pub async fn stop(&mut self) -> Result<()> {
        self.started = false;

        for process in self.registry.terminate_all() {
            self.log
                .debug(format!("Stopping process: {} pid={}", process.name, process.pid));
        }

        for (name, origin) in self.origins.drain(..) {
            self.log.debug(format!("Closing mock origin: {}", name));
            origin.stop().await;
        }

        for observer in self.observers.drain(..) {
            if timeout(REAP_TIMEOUT, observer).await.is_err() {
                self.log.warn("Timed out waiting for a killed process to exit");
            }
        }
        self.registry.clear();

        let targets = std::mem::take(&mut self.endpoints);
        readiness::poll(targets, Polarity::WaitForClosed, self.config.readiness.backoff(), &self.log)
            .await?;

        match self.faults.send_replace(None) {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    fn launch(&mut self, name: &str, service: &ServiceConfig, foreground: bool) -> Result<()> {
        let launch = launch_for(name, service)?;
        let (child, pid, _output) = launch.spawn(name, &self.log)?;
        self.registry.insert(ManagedProcess::new(name, pid, foreground));

        self.observers.push(tokio::spawn(process::observe_exit(
            name.to_string(),
            child,
            self.registry.clone(),
            self.faults.clone(),
            self.log.clone(),
        )));
        Ok(())
    }

    async fn run_sync(&mut self, name: &str, service: &ServiceConfig) -> Result<ExitStatus> {
        let launch = launch_for(name, service)?;
        process::run_to_completion(name, &launch, &self.registry, &self.log).await
    }

    /// Polls for open ports, giving up early if a foreground service dies.
    async fn await_ready(&self, targets: Vec<ReadinessTarget>) -> Result<()> {
        let backoff = self.config.readiness.backoff();
        let mut faults = self.faults.subscribe();

        tokio::select! {
            polled = readiness::poll(targets, Polarity::WaitForOpen, backoff, &self.log) => polled,
            fault = next_fault(&mut faults) => Err(fault.into()),
        }
    }
}

fn launch_for(name: &str, service: &ServiceConfig) -> Result<Launch> {
    Launch::for_kind(&service.kind).ok_or_else(|| {
        HarnessError::config(format!("service '{}' does not run a process", name)).into()
    })
}

async fn next_fault(faults: &mut watch::Receiver<Option<HarnessError>>) -> HarnessError {
    loop {
        let current = faults.borrow_and_update().clone();
        if let Some(fault) = current {
            return fault;
        }
        if faults.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Emergency cleanup when dropped without stop().
        let terminated = self.registry.terminate_all();
        if !terminated.is_empty() {
            self.log.warn(format!(
                "Supervisor dropped with {} running process(es), killed",
                terminated.len()
            ));
        }
    }
}

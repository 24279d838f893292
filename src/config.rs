use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::WrapErr;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::HarnessError;
use crate::origin::ActionTable;
use crate::readiness::ReadinessTarget;

use super::Result;

/// Retry budget used when the config does not set one.
pub const DEFAULT_RETRIES: u32 = 1000;

/// Pause between two connect attempts on the same target.
pub const DEFAULT_BACKOFF_MILLIS: u64 = 100;

/// Top-level harness configuration.
///
/// `servers` keeps declaration order: services are dispatched, and their
/// endpoints polled, in the order they appear.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub readiness: ReadinessPolicy,
    #[serde(default)]
    pub servers: IndexMap<String, ServiceConfig>,
}

impl HarnessConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HarnessConfig = serde_json::from_str(json)
            .map_err(|e| HarnessError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&json)
            .wrap_err_with(|| format!("Failed to load config file {}", path.display()))
    }

    /// Adds a service, keeping insertion order.
    pub fn with_service(mut self, name: impl Into<String>, service: ServiceConfig) -> Self {
        self.servers.insert(name.into(), service);
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Checks everything that can be checked before a process is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.readiness.retries == 0 {
            return Err(HarnessError::config("readiness.retries must be positive").into());
        }

        for (name, service) in &self.servers {
            service.validate(name)?;
        }
        Ok(())
    }

    /// Targets a `start` would poll: declared endpoints of spawned services.
    pub fn readiness_targets(&self) -> Vec<ReadinessTarget> {
        self.servers
            .values()
            .filter(|service| service.spawn)
            .flat_map(|service| service.readiness_targets(self.readiness.retries))
            .collect()
    }
}

/// Connect-retry budget shared by every target of a start or stop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessPolicy {
    pub retries: u32,
    pub backoff_millis: u64,
}

impl ReadinessPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_millis)
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            backoff_millis: DEFAULT_BACKOFF_MILLIS,
        }
    }
}

/// One declared service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// When false the service is declared but neither launched nor polled.
    #[serde(default = "default_spawn")]
    pub spawn: bool,
    #[serde(default)]
    pub endpoints: IndexMap<String, Endpoint>,
    #[serde(flatten)]
    pub kind: ServiceKind,
}

fn default_spawn() -> bool {
    true
}

/// What kind of thing a service is, with the fields that kind needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceKind {
    /// Foreground binary; sees only the configured environment.
    #[serde(rename = "executable")]
    Executable(ProcessSpec),
    /// Foreground binary with positional arguments and inherited environment.
    #[serde(rename = "other")]
    Other(OtherSpec),
    /// Background binary whose failure is logged but not fatal.
    #[serde(rename = "async process")]
    AsyncProcess(ProcessSpec),
    /// One-shot binary that `start` runs to completion.
    #[serde(rename = "sync process")]
    SyncProcess(ProcessSpec),
    /// In-process mock HTTP origin.
    #[serde(rename = "mock origin")]
    MockOrigin(OriginSpec),
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Executable(_) => "executable",
            ServiceKind::Other(_) => "other",
            ServiceKind::AsyncProcess(_) => "async process",
            ServiceKind::SyncProcess(_) => "sync process",
            ServiceKind::MockOrigin(_) => "mock origin",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub args: ArgList,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtherSpec {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OriginSpec {
    #[serde(default)]
    pub actions: ActionTable,
}

/// A listening socket a service is expected to open.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    /// Protocol tag, informational only.
    #[serde(rename = "type", default = "default_protocol")]
    pub protocol: String,
    #[serde(alias = "host", default = "default_hostname")]
    pub hostname: String,
    pub port: Option<u16>,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

impl Endpoint {
    pub fn http(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: default_protocol(),
            hostname: hostname.into(),
            port: Some(port),
        }
    }
}

/// Scalar value of a command-line flag.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(x) => write!(f, "{}", x),
            ArgValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Text(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Text(s)
    }
}

impl From<i64> for ArgValue {
    fn from(i: i64) -> Self {
        ArgValue::Int(i)
    }
}

impl From<u16> for ArgValue {
    fn from(i: u16) -> Self {
        ArgValue::Int(i.into())
    }
}

/// Ordered `flag -> value` pairs; a `null` value is a bare flag.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct ArgList(IndexMap<String, Option<ArgValue>>);

impl ArgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, flag: impl Into<String>, value: impl Into<ArgValue>) {
        self.0.insert(flag.into(), Some(value.into()));
    }

    pub fn set_flag(&mut self, flag: impl Into<String>) {
        self.0.insert(flag.into(), None);
    }

    /// Flattens to argv: each flag followed by its value, if any.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.0.len() * 2);
        for (flag, value) in &self.0 {
            argv.push(flag.clone());
            if let Some(value) = value {
                argv.push(value.to_string());
            }
        }
        argv
    }
}

impl ServiceConfig {
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            spawn: true,
            endpoints: IndexMap::new(),
            kind,
        }
    }

    pub fn executable(path: impl Into<PathBuf>) -> Self {
        Self::new(ServiceKind::Executable(ProcessSpec {
            path: path.into(),
            ..Default::default()
        }))
    }

    pub fn async_process(path: impl Into<PathBuf>) -> Self {
        Self::new(ServiceKind::AsyncProcess(ProcessSpec {
            path: path.into(),
            ..Default::default()
        }))
    }

    pub fn sync_process(path: impl Into<PathBuf>) -> Self {
        Self::new(ServiceKind::SyncProcess(ProcessSpec {
            path: path.into(),
            ..Default::default()
        }))
    }

    pub fn other<I, S>(executable: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ServiceKind::Other(OtherSpec {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: IndexMap::new(),
        }))
    }

    pub fn mock_origin(actions: ActionTable) -> Self {
        Self::new(ServiceKind::MockOrigin(OriginSpec { actions }))
    }

    pub fn with_spawn(mut self, spawn: bool) -> Self {
        self.spawn = spawn;
        self
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, endpoint: Endpoint) -> Self {
        self.endpoints.insert(name.into(), endpoint);
        self
    }

    /// Adds `flag value` to a process service's argv. Ignored for other kinds.
    pub fn with_arg(mut self, flag: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        if let Some(spec) = self.process_spec_mut() {
            spec.args.set(flag, value);
        }
        self
    }

    /// Adds a bare `flag` to a process service's argv. Ignored for other kinds.
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        if let Some(spec) = self.process_spec_mut() {
            spec.args.set_flag(flag);
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match self.kind {
            ServiceKind::Executable(ref mut spec)
            | ServiceKind::AsyncProcess(ref mut spec)
            | ServiceKind::SyncProcess(ref mut spec) => {
                spec.env.insert(key.into(), value.into());
            }
            ServiceKind::Other(ref mut spec) => {
                spec.env.insert(key.into(), value.into());
            }
            ServiceKind::MockOrigin(_) => {}
        }
        self
    }

    fn process_spec_mut(&mut self) -> Option<&mut ProcessSpec> {
        match self.kind {
            ServiceKind::Executable(ref mut spec)
            | ServiceKind::AsyncProcess(ref mut spec)
            | ServiceKind::SyncProcess(ref mut spec) => Some(spec),
            ServiceKind::Other(_) | ServiceKind::MockOrigin(_) => None,
        }
    }

    /// The endpoint a mock origin listens on: `http` if declared, else the
    /// only endpoint.
    pub fn origin_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints.get("http").or_else(|| {
            if self.endpoints.len() == 1 {
                self.endpoints.values().next()
            } else {
                None
            }
        })
    }

    pub fn readiness_targets(&self, retries: u32) -> Vec<ReadinessTarget> {
        self.endpoints
            .values()
            .filter_map(|endpoint| {
                endpoint
                    .port
                    .map(|port| ReadinessTarget::new(endpoint.hostname.clone(), port, retries))
            })
            .collect()
    }

    fn validate(&self, name: &str) -> Result<()> {
        let invalid = |message: String| -> eyre::Report {
            HarnessError::config(format!("service '{}': {}", name, message)).into()
        };

        if name.is_empty() {
            return Err(HarnessError::config("service names must not be empty").into());
        }

        for (endpoint_name, endpoint) in &self.endpoints {
            if endpoint.hostname.is_empty() {
                return Err(invalid(format!("endpoint '{}' has no hostname", endpoint_name)));
            }
            match endpoint.port {
                Some(0) | None if self.spawn => {
                    return Err(invalid(format!("endpoint '{}' has no port", endpoint_name)));
                }
                _ => {}
            }
        }

        match self.kind {
            ServiceKind::Executable(ref spec)
            | ServiceKind::AsyncProcess(ref spec)
            | ServiceKind::SyncProcess(ref spec) => {
                if spec.path.as_os_str().is_empty() {
                    return Err(invalid("missing path".to_string()));
                }
            }
            ServiceKind::Other(ref spec) => {
                if spec.executable.as_os_str().is_empty() {
                    return Err(invalid("missing executable".to_string()));
                }
            }
            ServiceKind::MockOrigin(_) => {
                if self.origin_endpoint().and_then(|e| e.port).is_none() {
                    return Err(invalid("mock origin needs an http endpoint with a port".to_string()));
                }
            }
        }
        Ok(())
    }
}

//! Integration-test harness for multi-process network stacks.
//!
//! A [`ProcessSupervisor`] takes a declarative [`HarnessConfig`], launches
//! external binaries and in-process [`MockOriginServer`]s, and gates
//! [`ProcessSupervisor::start`] on every declared endpoint accepting TCP
//! connections. [`ProcessSupervisor::stop`] tears everything down and waits
//! for the same endpoints to close.
//!
//! ```no_run
//! use stagehand::{HarnessConfig, LogSink, ProcessSupervisor};
//!
//! # async fn run() -> stagehand::Result<()> {
//! let config = HarnessConfig::from_path("harness.json")?;
//! let mut supervisor = ProcessSupervisor::new(config)?.with_log(LogSink::tracing());
//! supervisor.start().await?;
//! // exercise the system
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod config;
pub mod environment;
pub mod error;
pub mod exit_guard;
pub mod logging;
pub mod origin;
pub mod process;
pub mod readiness;
pub mod supervisor;

pub use config::{Endpoint, HarnessConfig, ReadinessPolicy, ServiceConfig, ServiceKind};
pub use error::HarnessError;
pub use logging::{LogSink, Severity};
pub use origin::{ActionConfig, ActionTable, MockOriginServer};
pub use readiness::{Polarity, ReadinessTarget};
pub use supervisor::{ProcessSupervisor, StartOutcome};

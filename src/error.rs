use std::fmt;

use crate::readiness::Polarity;

/// Fatal harness conditions.
///
/// These travel inside an `eyre::Report`; callers that need to tell the
/// categories apart use `report.downcast_ref::<HarnessError>()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HarnessError {
    /// Invalid or incomplete configuration, detected before anything runs.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A readiness target used up its retry budget.
    #[error("{polarity}: gave up on {host}:{port} after exhausting the retry budget")]
    ReadinessTimeout {
        host: String,
        port: u16,
        polarity: Polarity,
    },

    /// A foreground service exited without being asked to.
    #[error("service '{service}' exited unexpectedly: {status}")]
    ProcessFault { service: String, status: ExitDescription },
}

impl HarnessError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Printable summary of how a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDescription {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl From<std::process::ExitStatus> for ExitDescription {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal),
            (None, None) => Self::Unknown,
        }
    }
}

impl fmt::Display for ExitDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "code={}", code),
            Self::Signal(signal) => write!(f, "signal={}", signal),
            Self::Unknown => f.write_str("unknown status"),
        }
    }
}

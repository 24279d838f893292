use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::error::HarnessError;
use crate::logging::LogSink;

use super::Result;

/// Upper bound on a single connect attempt, so a blackholed address costs
/// one backoff rather than the OS connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Failed attempts between two "still waiting" log lines.
const LOG_EVERY: u32 = 27;

/// Which state a target has to reach before the poller moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Startup: wait until the port accepts connections.
    WaitForOpen,
    /// Shutdown: wait until the port refuses connections.
    WaitForClosed,
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Polarity::WaitForOpen => "waiting for open",
            Polarity::WaitForClosed => "waiting for closed",
        })
    }
}

/// One endpoint plus what is left of its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessTarget {
    pub host: String,
    pub port: u16,
    pub retries_remaining: u32,
}

impl ReadinessTarget {
    pub fn new(host: impl Into<String>, port: u16, retries: u32) -> Self {
        Self {
            host: host.into(),
            port,
            retries_remaining: retries,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Drives connect attempts over `targets`, strictly in order, until each one
/// satisfies `polarity`.
///
/// Returns as soon as the last target is satisfied, or immediately when
/// there are none. A target that runs out of retries aborts the whole poll
/// with [`HarnessError::ReadinessTimeout`].
pub async fn poll(
    targets: Vec<ReadinessTarget>,
    polarity: Polarity,
    backoff: Duration,
    log: &LogSink,
) -> Result<()> {
    for mut target in targets {
        log.debug(format!("Checking: {} ({})", target.address(), polarity));

        loop {
            let open = probe(&target).await;
            let satisfied = match polarity {
                Polarity::WaitForOpen => open,
                Polarity::WaitForClosed => !open,
            };

            if satisfied {
                log.debug(format!(
                    "{}: {}",
                    if open { "Connected to" } else { "Closed" },
                    target.address()
                ));
                break;
            }

            target.retries_remaining = target.retries_remaining.saturating_sub(1);

            if target.retries_remaining % LOG_EVERY == 0 {
                log.debug(format!(
                    "Still {} on {} ({} retries left)",
                    polarity,
                    target.address(),
                    target.retries_remaining
                ));
            }

            if target.retries_remaining == 0 {
                return Err(HarnessError::ReadinessTimeout {
                    host: target.host,
                    port: target.port,
                    polarity,
                }
                .into());
            }

            sleep(backoff).await;
        }
    }

    Ok(())
}

/// True when something accepted a TCP connection on the target.
///
/// Every failure (refused, unresolvable, timed out) counts as "not open".
async fn probe(target: &ReadinessTarget) -> bool {
    matches!(
        timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((target.host.as_str(), target.port))
        )
        .await,
        Ok(Ok(_))
    )
}

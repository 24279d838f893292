use std::fmt;
use std::sync::Arc;

/// Severity attached to every harness log message.
///
/// The harness never filters on it; whether a DEBUG line is shown is the
/// sink's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        })
    }
}

type SinkFn = dyn Fn(Severity, &str) + Send + Sync;

/// Destination for spawn, exit, output and polling events.
///
/// Cloning is cheap; all clones share the same callback.
#[derive(Clone)]
pub struct LogSink(Option<Arc<SinkFn>>);

impl LogSink {
    /// Wraps an arbitrary callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Severity, &str) + Send + Sync + 'static,
    {
        Self(Some(Arc::new(callback)))
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self(None)
    }

    /// Forwards messages to `tracing`, leaving filtering to the subscriber.
    pub fn tracing() -> Self {
        Self::new(|severity, message| match severity {
            Severity::Debug => tracing::debug!("{}", message),
            Severity::Info => tracing::info!("{}", message),
            Severity::Warn => tracing::warn!("{}", message),
            Severity::Error => tracing::error!("{}", message),
        })
    }

    pub fn log(&self, severity: Severity, message: impl AsRef<str>) {
        if let Some(ref callback) = self.0 {
            callback(severity, message.as_ref());
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(Severity::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Severity::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(Severity::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Severity::Error, message);
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::discard()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogSink")
            .field(&if self.0.is_some() { "callback" } else { "discard" })
            .finish()
    }
}

//! Store configuration.

use std::sync::Arc;
use std::time::Duration;

/// A log record produced by a user-script failure.
///
/// Script exceptions never fail queries; they are delivered here instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// The document being mapped, or empty for reduce failures.
    pub doc_id: String,
    /// The exception message.
    pub message: String,
}

/// Sink for script-failure log records, supplied by the driver.
pub type LogSink = Arc<dyn Fn(LogRecord) + Send + Sync>;

/// Configuration for opening a store.
#[derive(Clone)]
pub struct Config {
    /// Number of changes applied per indexer transaction.
    pub indexer_batch: usize,

    /// Maximum number of concurrently live script interpreters.
    pub sandbox_pool_size: usize,

    /// How long a longpoll changes feed waits for a commit.
    pub longpoll_timeout: Duration,

    /// Where user-script failures are reported.
    pub log_sink: Option<LogSink>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            indexer_batch: 100,
            sandbox_pool_size: 4,
            longpoll_timeout: Duration::from_secs(60),
            log_sink: None,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the indexer batch size.
    #[must_use]
    pub const fn indexer_batch(mut self, n: usize) -> Self {
        self.indexer_batch = n;
        self
    }

    /// Sets the sandbox pool capacity.
    #[must_use]
    pub const fn sandbox_pool_size(mut self, n: usize) -> Self {
        self.sandbox_pool_size = n;
        self
    }

    /// Sets the longpoll timeout.
    #[must_use]
    pub const fn longpoll_timeout(mut self, timeout: Duration) -> Self {
        self.longpoll_timeout = timeout;
        self
    }

    /// Sets the script-failure log sink.
    #[must_use]
    pub fn log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("indexer_batch", &self.indexer_batch)
            .field("sandbox_pool_size", &self.sandbox_pool_size)
            .field("longpoll_timeout", &self.longpoll_timeout)
            .field("log_sink", &self.log_sink.is_some())
            .finish()
    }
}

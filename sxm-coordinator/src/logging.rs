//! Structured logging setup for the coordinator.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

impl LoggingConfig {
    /// Initialize the global tracing subscriber from this configuration.
    /// Safe to call more than once per process; later calls are no-ops.
    ///
    /// When `log_dir` is set, logs are written to a daily-rotated file
    /// under that directory instead of stderr. The returned `WorkerGuard`
    /// flushes the non-blocking writer on drop — the caller must hold
    /// onto it for the life of the process, not let it drop immediately.
    pub fn init(&self) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.clone()));

        let guard = match &self.log_dir {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(dir, "sxm-coordinator.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_level(true)
                    .with_writer(non_blocking)
                    .with_ansi(false);

                let _ = if self.json_format {
                    subscriber.json().try_init()
                } else {
                    subscriber.try_init()
                };
                Some(guard)
            }
            None => {
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_level(true);

                let _ = if self.json_format {
                    subscriber.json().try_init()
                } else {
                    subscriber.try_init()
                };
                None
            }
        };

        tracing::info!(level = %self.level, log_dir = ?self.log_dir, "sxm-coordinator logging initialized");
        Ok(guard)
    }
}
